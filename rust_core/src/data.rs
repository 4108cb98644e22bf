use std::path::Path;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Parameters of the line the synthetic data is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrueParams {
    pub m: f64,
    pub b: f64,
    pub s: f64,
}

impl Default for TrueParams {
    fn default() -> Self {
        Self {
            m: -0.4,
            b: 0.03,
            s: 0.1,
        }
    }
}

impl TrueParams {
    /// `[m, b, log_s]`, the unconstrained parameterization.
    pub fn unconstrained(&self) -> [f64; 3] {
        [self.m, self.b, self.s.ln()]
    }
}

/// Paired observations. The noise scale is not stored; it is a parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Row {
    x: f64,
    y: f64,
}

impl Dataset {
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Result<Self> {
        if x.len() != y.len() {
            return Err(Error::Dimension {
                expected: x.len(),
                found: y.len(),
            });
        }
        if let Some(&bad) = x.iter().chain(y.iter()).find(|v| !v.is_finite()) {
            return Err(Error::NonFinite {
                what: "observation",
                value: bad,
            });
        }
        Ok(Self { x, y })
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut wtr = csv::Writer::from_path(path)?;
        for (&x, &y) in self.x.iter().zip(&self.y) {
            wtr.serialize(Row { x, y })?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut x = Vec::new();
        let mut y = Vec::new();
        for row in rdr.deserialize() {
            let row: Row = row?;
            x.push(row.x);
            y.push(row.y);
        }
        Self::new(x, y)
    }
}

/// Draw `n` points with `x ~ U(-1, 1)` (sorted) and
/// `y = m x + b + s ε`, `ε ~ N(0, 1)`.
pub fn simulate(truth: &TrueParams, n: usize, seed: u64) -> Dataset {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut x: Vec<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
    x.sort_unstable_by(|a, b| a.total_cmp(b));
    let y = x
        .iter()
        .map(|&xi| {
            let eps: f64 = StandardNormal.sample(&mut rng);
            truth.m * xi + truth.b + truth.s * eps
        })
        .collect();
    Dataset { x, y }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulate_is_reproducible_and_sorted() {
        let truth = TrueParams::default();
        let a = simulate(&truth, 50, 42);
        let b = simulate(&truth, 50, 42);
        assert_eq!(a, b);
        assert_eq!(a.len(), 50);
        assert!(a.x.windows(2).all(|w| w[0] <= w[1]));
        assert!(a.x.iter().all(|&x| (-1.0..1.0).contains(&x)));
        assert_ne!(a, simulate(&truth, 50, 43));
    }

    #[test]
    fn residuals_look_like_the_noise() {
        let truth = TrueParams::default();
        let d = simulate(&truth, 2000, 7);
        let resid: Vec<f64> = d
            .x
            .iter()
            .zip(&d.y)
            .map(|(x, y)| y - truth.m * x - truth.b)
            .collect();
        let mean = resid.iter().sum::<f64>() / resid.len() as f64;
        let sd = (resid.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / resid.len() as f64).sqrt();
        assert!(mean.abs() < 0.01, "mean {}", mean);
        assert!((sd - truth.s).abs() < 0.01, "sd {}", sd);
    }

    #[test]
    fn new_validates() {
        assert!(Dataset::new(vec![1.0], vec![]).is_err());
        assert!(Dataset::new(vec![f64::NAN], vec![1.0]).is_err());
        assert!(Dataset::new(vec![1.0], vec![2.0]).is_ok());
    }
}
