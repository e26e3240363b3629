use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::executor::default_workers;
use crate::{Error, ExecutorConfig, InterpolationConfig, Result, Scheme, StopCriterion};

/// Every tunable knob in one place. Durations are in seconds. Fields missing from the JSON take
/// their default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub workers: usize,
    pub timeout_seconds: Option<f64>,
    pub force_kill: bool,
    pub interpolation_interval: f64,
    pub interpolation_gap_threshold: f64,
    pub interpolation_scheme: Scheme,
    pub random_walk_step: f64,
    pub seed: u64,
    pub stop_speed_threshold: f64,
    pub stop_duration_threshold: f64,
}

impl Default for Config {
    fn default() -> Self {
        let interpolation = InterpolationConfig::default();
        let stop = StopCriterion::default();
        Self {
            workers: default_workers(),
            timeout_seconds: None,
            force_kill: false,
            interpolation_interval: interpolation.interval.num_seconds() as f64,
            interpolation_gap_threshold: interpolation.gap_threshold.num_seconds() as f64,
            interpolation_scheme: interpolation.scheme,
            random_walk_step: interpolation.random_walk_step,
            seed: interpolation.seed,
            stop_speed_threshold: stop.speed_threshold,
            stop_duration_threshold: stop.min_duration.num_seconds() as f64,
        }
    }
}

impl Config {
    pub fn from_json(raw: &str) -> Result<Config> {
        serde_json::from_str(raw).map_err(|err| Error::InvalidConfig {
            op: "Config::from_json",
            reason: err.to_string(),
        })
    }

    pub fn load<R: std::io::Read>(reader: R) -> Result<Config> {
        serde_json::from_reader(reader).map_err(|err| Error::InvalidConfig {
            op: "Config::load",
            reason: err.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| Error::Io {
            op: "Config::to_json",
            reason: err.to_string(),
        })
    }

    pub fn executor(&self) -> Result<ExecutorConfig> {
        let timeout = match self.timeout_seconds {
            Some(secs) => {
                if !(secs.is_finite() && secs > 0.0) {
                    return Err(Error::InvalidConfig {
                        op: "Config::executor",
                        reason: format!("timeout must be positive, not {secs}"),
                    });
                }
                Some(std::time::Duration::from_secs_f64(secs))
            }
            None => None,
        };
        Ok(ExecutorConfig {
            workers: self.workers,
            timeout,
            force_kill: self.force_kill,
        })
    }

    pub fn interpolation(&self) -> Result<InterpolationConfig> {
        let op = "Config::interpolation";
        let config = InterpolationConfig {
            scheme: self.interpolation_scheme,
            interval: seconds(op, "interpolation_interval", self.interpolation_interval)?,
            gap_threshold: seconds(
                op,
                "interpolation_gap_threshold",
                self.interpolation_gap_threshold,
            )?,
            random_walk_step: self.random_walk_step,
            seed: self.seed,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn stop_criterion(&self) -> Result<StopCriterion> {
        Ok(StopCriterion {
            speed_threshold: self.stop_speed_threshold,
            min_duration: seconds(
                "Config::stop_criterion",
                "stop_duration_threshold",
                self.stop_duration_threshold,
            )?,
        })
    }
}

fn seconds(op: &'static str, field: &str, secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(Error::InvalidConfig {
            op,
            reason: format!("{field} must be a non-negative number of seconds, not {secs}"),
        });
    }
    Ok(Duration::nanoseconds((secs * 1e9).round() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json() {
        let config = Config::from_json(
            r#"{"workers": 3, "interpolation_scheme": "random-walk", "timeout_seconds": 1.5}"#,
        )
        .unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.interpolation_scheme, Scheme::RandomWalk);
        assert_eq!(config.seed, Config::default().seed);

        let executor = config.executor().unwrap();
        assert_eq!(executor.timeout, Some(std::time::Duration::from_millis(1500)));
        assert!(!executor.force_kill);
    }

    #[test]
    fn conversions() {
        let config = Config {
            interpolation_interval: 0.5,
            stop_duration_threshold: 90.0,
            ..Default::default()
        };
        assert_eq!(
            config.interpolation().unwrap().interval,
            Duration::milliseconds(500)
        );
        assert_eq!(
            config.stop_criterion().unwrap().min_duration,
            Duration::seconds(90)
        );
        assert_eq!(Config::from_json(&config.to_json().unwrap()).unwrap(), config);
    }

    #[test]
    fn rejects_nonsense() {
        for raw in [
            r#"{"interpolation_scheme": "teleport"}"#,
            r#"{"wokers": 2}"#,
            r#"{"workers": -1}"#,
        ] {
            assert!(
                matches!(Config::from_json(raw), Err(Error::InvalidConfig { .. })),
                "{raw}"
            );
        }

        let config = Config {
            interpolation_interval: 0.0,
            ..Default::default()
        };
        assert!(config.interpolation().is_err());
        let config = Config {
            timeout_seconds: Some(-3.0),
            ..Default::default()
        };
        assert!(config.executor().is_err());
    }
}
