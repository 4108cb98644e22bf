use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Diagonal mass matrix for Hamiltonian samplers, stored as the inverse
/// mass (the posterior variance estimate) and its reciprocal square root.
#[derive(Debug, Clone)]
pub struct DiagonalMetric {
    inv_mass: Vec<f64>,
    mass_sqrt: Vec<f64>,
}

impl DiagonalMetric {
    /// Unit metric.
    pub fn identity(dim: usize) -> Self {
        Self {
            inv_mass: vec![1.0; dim],
            mass_sqrt: vec![1.0; dim],
        }
    }

    /// Metric with the given per-coordinate variances.
    pub fn from_variance(variance: &[f64]) -> Self {
        let mut metric = Self::identity(variance.len());
        metric.set_variance(variance);
        metric
    }

    pub fn dim(&self) -> usize {
        self.inv_mass.len()
    }

    pub fn variance(&self) -> &[f64] {
        &self.inv_mass
    }

    /// Replace the variances; non-positive or non-finite entries are left
    /// untouched.
    pub fn set_variance(&mut self, variance: &[f64]) {
        for (i, &v) in variance.iter().enumerate().take(self.dim()) {
            if v.is_finite() && v > 1e-12 {
                self.inv_mass[i] = v;
                self.mass_sqrt[i] = 1.0 / v.sqrt();
            }
        }
    }

    pub fn sample_momentum<R: Rng + ?Sized>(&self, rng: &mut R, p: &mut [f64]) {
        for (pi, &ms) in p.iter_mut().zip(&self.mass_sqrt) {
            let z: f64 = StandardNormal.sample(rng);
            *pi = z * ms;
        }
    }

    pub fn kinetic_energy(&self, p: &[f64]) -> f64 {
        p.iter()
            .zip(&self.inv_mass)
            .map(|(&pi, &im)| 0.5 * pi * pi * im)
            .sum()
    }

    /// `M⁻¹ p`.
    pub fn velocity(&self, p: &[f64], out: &mut [f64]) {
        for ((o, &pi), &im) in out.iter_mut().zip(p).zip(&self.inv_mass) {
            *o = pi * im;
        }
    }
}

/// Running mean/variance (Welford) of warmup draws.
#[derive(Debug, Clone)]
pub struct WelfordVariance {
    count: usize,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl WelfordVariance {
    pub fn new(dim: usize) -> Self {
        Self {
            count: 0,
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
        }
    }

    pub fn add(&mut self, x: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        for i in 0..self.mean.len() {
            let delta = x[i] - self.mean[i];
            self.mean[i] += delta / n;
            self.m2[i] += delta * (x[i] - self.mean[i]);
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Sample variance shrunk toward `1e-3`, as in Stan's windowed
    /// adaptation: `(n / (n + 5)) var + 1e-3 (5 / (n + 5))`.
    pub fn regularized_variance(&self) -> Vec<f64> {
        let n = self.count as f64;
        self.m2
            .iter()
            .map(|&m2| {
                let var = if self.count > 1 { m2 / (n - 1.0) } else { 1.0 };
                (n / (n + 5.0)) * var + 1e-3 * (5.0 / (n + 5.0))
            })
            .collect()
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.mean.iter_mut().for_each(|v| *v = 0.0);
        self.m2.iter_mut().for_each(|v| *v = 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn kinetic_energy_and_velocity_use_inverse_mass() {
        let metric = DiagonalMetric::from_variance(&[4.0, 0.25]);
        let p = [1.0, 2.0];
        assert_relative_eq!(metric.kinetic_energy(&p), 0.5 * 4.0 + 0.5 * 4.0 * 0.25);
        let mut v = [0.0; 2];
        metric.velocity(&p, &mut v);
        assert_eq!(v, [4.0, 0.5]);
    }

    #[test]
    fn momentum_has_mass_covariance() {
        let metric = DiagonalMetric::from_variance(&[4.0]);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut p = [0.0];
        let n = 20_000;
        let mut sum_sq = 0.0;
        for _ in 0..n {
            metric.sample_momentum(&mut rng, &mut p);
            sum_sq += p[0] * p[0];
        }
        // mass = 1 / variance = 0.25
        assert_relative_eq!(sum_sq / n as f64, 0.25, max_relative = 0.05);
    }

    #[test]
    fn welford_matches_two_pass_variance() {
        let xs = [1.0, 4.0, 2.0, 8.0, 5.0, 7.0];
        let mut w = WelfordVariance::new(1);
        for &x in &xs {
            w.add(&[x]);
        }
        let mean = xs.iter().sum::<f64>() / 6.0;
        let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / 5.0;
        let n = 6.0;
        let expected = (n / (n + 5.0)) * var + 1e-3 * (5.0 / (n + 5.0));
        assert_relative_eq!(w.regularized_variance()[0], expected, max_relative = 1e-12);
        w.reset();
        assert_eq!(w.count(), 0);
    }

    #[test]
    fn invalid_variances_are_ignored() {
        let mut m = DiagonalMetric::identity(2);
        m.set_variance(&[f64::NAN, 0.0]);
        assert_eq!(m.variance(), &[1.0, 1.0]);
    }
}
