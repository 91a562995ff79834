//! Calibration parameters.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CalibError;
use crate::quality::QualityThresholds;

/// Tunable parameters of a calibration job.
///
/// All fields have defaults, so a TOML file only needs to list the ones it changes:
/// ```toml
/// min_points = 20
/// match_dist = 0.0005
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CalibConfig {
    /// Catalog magnitudes with an error at or above this value are not used.
    pub max_cat_err: f64,
    /// A fit is good only with a smaller outlier fraction.
    pub max_outlier_fraction: f64,
    /// A fit is good only with at least this many stars.
    pub min_points: usize,
    /// A fit is good only with a smaller scatter.
    pub min_precision: f64,
    /// Observed magnitudes at or above this value are unreliable.
    pub good_max_mag: f64,
    /// Cross-match radius in degrees.
    pub match_dist: f64,
    /// Error ceiling for stars entering a color-term fit.
    pub color_max_err: f64,
    /// Time budget of one cross-match query in seconds.
    pub query_timeout_secs: f64,
    /// Retries of a query failing with a transient backend error.
    pub max_retries: u32,
    /// Backoff before the first retry in milliseconds; doubled on every further retry.
    pub retry_backoff_ms: u64,
}

impl Default for CalibConfig {
    fn default() -> Self {
        Self {
            max_cat_err: 0.1,
            max_outlier_fraction: 0.3,
            min_points: 10,
            min_precision: 0.1,
            good_max_mag: 99.,
            match_dist: 2. / 3600.,
            color_max_err: 0.5,
            query_timeout_secs: 60.,
            max_retries: 0,
            retry_backoff_ms: 500,
        }
    }
}

impl CalibConfig {
    /// Parse from TOML.
    pub fn from_toml_str(toml: &str) -> Result<Self, CalibError> {
        let config: Self = toml::from_str(toml)
            .map_err(|e| CalibError::Config(format!("invalid calibration config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CalibError> {
        let path = path.as_ref();
        let toml = std::fs::read_to_string(path).map_err(|source| CalibError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&toml)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), CalibError> {
        let positive = [
            ("max_cat_err", self.max_cat_err),
            ("max_outlier_fraction", self.max_outlier_fraction),
            ("min_precision", self.min_precision),
            ("match_dist", self.match_dist),
            ("color_max_err", self.color_max_err),
            ("query_timeout_secs", self.query_timeout_secs),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.) {
                return Err(CalibError::Config(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if self.good_max_mag.is_nan() {
            return Err(CalibError::Config("good_max_mag is NaN".into()));
        }
        Ok(())
    }

    /// Quality thresholds of a fit.
    pub fn thresholds(&self) -> QualityThresholds {
        QualityThresholds {
            max_outlier_fraction: self.max_outlier_fraction,
            min_points: self.min_points,
            min_precision: self.min_precision,
        }
    }

    /// Time budget of one query.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.query_timeout_secs)
    }

    /// Backoff before retry number `attempt`, counting from zero.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(1 << attempt.min(16)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml() {
        let config = CalibConfig::from_toml_str("min_points = 25\nmatch_dist = 0.001").unwrap();
        assert_eq!(config.min_points, 25);
        assert_eq!(config.match_dist, 0.001);
        assert_eq!(config.max_cat_err, CalibConfig::default().max_cat_err);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(CalibConfig::from_toml_str("match_dist = -1.0").is_err());
        assert!(CalibConfig::from_toml_str("min_precison = 0.1").is_err());
        assert!(CalibConfig::default().validate().is_ok());
    }

    #[test]
    fn backoff_doubles() {
        let config = CalibConfig::default();
        assert_eq!(config.retry_backoff(0), Duration::from_millis(500));
        assert_eq!(config.retry_backoff(2), Duration::from_millis(2000));
        assert_eq!(config.query_timeout(), Duration::from_secs(60));
    }
}
