//! Run configuration.
//!
//! Every section has a `Default` matching the tutorial's settings, so a
//! JSON file only needs the fields it wants to change.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::data::TrueParams;
use crate::ensemble::EnsembleConfig;
use crate::error::{Error, Result};
use crate::hmc::HmcConfig;
use crate::nuts::NutsConfig;
use crate::optimize::OptimOptions;
use crate::sampler::SamplerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub truth: TrueParams,
    pub n_points: usize,
    pub seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            truth: TrueParams::default(),
            n_points: 50,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub data: DataConfig,
    pub optim: OptimOptions,
    pub ensemble: EnsembleConfig,
    pub sampler: SamplerConfig,
    pub nuts: NutsConfig,
    pub hmc: HmcConfig,
}

impl RunConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: RunConfig = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data.n_points < 3 {
            return Err(Error::InvalidConfig {
                field: "data.n_points",
                reason: format!("need at least 3 points, got {}", self.data.n_points),
            });
        }
        if !(self.data.truth.s > 0.0) {
            return Err(Error::InvalidConfig {
                field: "data.truth.s",
                reason: format!("noise scale must be positive, got {}", self.data.truth.s),
            });
        }
        self.optim.validate()?;
        self.ensemble.validate()?;
        self.sampler.validate()?;
        self.nuts.validate()?;
        self.hmc.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        RunConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: RunConfig =
            serde_json::from_str(r#"{ "data": { "n_points": 80 }, "nuts": { "num_draws": 200 } }"#)
                .unwrap();
        assert_eq!(cfg.data.n_points, 80);
        assert_eq!(cfg.data.seed, 42);
        assert_eq!(cfg.nuts.num_draws, 200);
        assert_eq!(cfg.nuts.max_tree_depth, 10);
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_bad_noise_scale() {
        let mut cfg = RunConfig::default();
        cfg.data.truth.s = 0.0;
        assert!(matches!(
            cfg.validate(),
            Err(Error::InvalidConfig { field: "data.truth.s", .. })
        ));
    }
}
