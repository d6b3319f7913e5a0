//! Pipeline configuration.
//!
//! [`PipelineConfig`] makes every runtime limit explicit and validated, and
//! can be populated from the process environment with a test-friendly
//! key-lookup function.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use stratum_core::QueueType;

use crate::error::{Error, Result};
use crate::splitter::{SplitBounds, DEFAULT_HIGH_BOUND, DEFAULT_LOW_BOUND};

const ENV_QUEUE_TYPE: &str = "STRATUM_QUEUE_TYPE";
const ENV_MAX_IN_FLIGHT: &str = "STRATUM_MAX_IN_FLIGHT";
const ENV_CHECK_FREQUENCY_SECS: &str = "STRATUM_CHECK_FREQUENCY_SECS";
const ENV_HEARTBEAT_TIMEOUT_SECS: &str = "STRATUM_HEARTBEAT_TIMEOUT_SECS";
const ENV_LOW_BOUND: &str = "STRATUM_LOW_BOUND";
const ENV_HIGH_BOUND: &str = "STRATUM_HIGH_BOUND";
const ENV_PATIENTS_PER_JOB: &str = "STRATUM_PATIENTS_PER_PROCESSING_JOB";
const ENV_INITIAL_INTERVAL_SECS: &str = "STRATUM_INITIAL_ORCHESTRATION_INTERVAL_SECS";
const ENV_INCREMENTAL_INTERVAL_SECS: &str = "STRATUM_INCREMENTAL_ORCHESTRATION_INTERVAL_SECS";
const ENV_WINDOW_LAG_SECS: &str = "STRATUM_WINDOW_LAG_SECS";

const DEFAULT_MAX_IN_FLIGHT: usize = 10;
const DEFAULT_CHECK_FREQUENCY_SECS: u64 = 10;
const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u32 = 30;
const DEFAULT_PATIENTS_PER_JOB: usize = 100;
const DEFAULT_INITIAL_INTERVAL_SECS: u64 = 60;
const DEFAULT_INCREMENTAL_INTERVAL_SECS: u64 = 600;
const DEFAULT_WINDOW_LAG_SECS: u64 = 120;
const DEFAULT_MAX_WINDOW_SECS: u64 = 24 * 60 * 60;

/// What the pipeline extracts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "scope")]
pub enum FilterScope {
    /// Time-window extraction across resource types.
    System {
        /// The resource types to extract, walked in this order.
        resource_types: Vec<String>,
    },
    /// Patient-compartment extraction for one group.
    Group {
        /// The upstream group resource id.
        group_id: String,
    },
}

/// The full configuration surface of one pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Namespace separating this pipeline from others on the same backends.
    pub queue_type: QueueType,
    /// Extraction scope.
    pub filter_scope: FilterScope,
    /// Maximum processing jobs in flight per orchestrator.
    pub max_in_flight: usize,
    /// How long the orchestrator sleeps between completion polls.
    pub check_frequency: Duration,
    /// Lease duration granted on dequeue.
    pub heartbeat_timeout_sec: u32,
    /// Minimum resources per sub-job.
    pub low_bound: u64,
    /// Exclusive maximum resources per sub-job.
    pub high_bound: u64,
    /// Patients per group-scope processing job.
    pub number_of_patients_per_processing_job: usize,
    /// Scheduler cadence before the first window completes.
    pub initial_orchestration_interval: Duration,
    /// Scheduler cadence for incremental windows.
    pub incremental_orchestration_interval: Duration,
    /// How far behind `now` the window end stays, absorbing upstream
    /// ingestion delay.
    pub window_lag: Duration,
    /// Cap on window growth per trigger; `None` for unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_window: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_type: QueueType::new(0),
            filter_scope: FilterScope::System {
                resource_types: vec!["Patient".to_string()],
            },
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            check_frequency: Duration::from_secs(DEFAULT_CHECK_FREQUENCY_SECS),
            heartbeat_timeout_sec: DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            low_bound: DEFAULT_LOW_BOUND,
            high_bound: DEFAULT_HIGH_BOUND,
            number_of_patients_per_processing_job: DEFAULT_PATIENTS_PER_JOB,
            initial_orchestration_interval: Duration::from_secs(DEFAULT_INITIAL_INTERVAL_SECS),
            incremental_orchestration_interval: Duration::from_secs(
                DEFAULT_INCREMENTAL_INTERVAL_SECS,
            ),
            window_lag: Duration::from_secs(DEFAULT_WINDOW_LAG_SECS),
            max_window: Some(Duration::from_secs(DEFAULT_MAX_WINDOW_SECS)),
        }
    }
}

impl PipelineConfig {
    /// Loads configuration from the process environment with strict
    /// validation, falling back to defaults for unset keys.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value does not parse or the
    /// resulting configuration fails [`Self::validate`].
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// This entry point is test-friendly and accepts a key lookup function.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value does not parse or the
    /// resulting configuration fails [`Self::validate`].
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            queue_type: QueueType::new(parse_env(&get_env, ENV_QUEUE_TYPE, 0u8)?),
            filter_scope: defaults.filter_scope,
            max_in_flight: parse_env(&get_env, ENV_MAX_IN_FLIGHT, DEFAULT_MAX_IN_FLIGHT)?,
            check_frequency: Duration::from_secs(parse_env(
                &get_env,
                ENV_CHECK_FREQUENCY_SECS,
                DEFAULT_CHECK_FREQUENCY_SECS,
            )?),
            heartbeat_timeout_sec: parse_env(
                &get_env,
                ENV_HEARTBEAT_TIMEOUT_SECS,
                DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            )?,
            low_bound: parse_env(&get_env, ENV_LOW_BOUND, DEFAULT_LOW_BOUND)?,
            high_bound: parse_env(&get_env, ENV_HIGH_BOUND, DEFAULT_HIGH_BOUND)?,
            number_of_patients_per_processing_job: parse_env(
                &get_env,
                ENV_PATIENTS_PER_JOB,
                DEFAULT_PATIENTS_PER_JOB,
            )?,
            initial_orchestration_interval: Duration::from_secs(parse_env(
                &get_env,
                ENV_INITIAL_INTERVAL_SECS,
                DEFAULT_INITIAL_INTERVAL_SECS,
            )?),
            incremental_orchestration_interval: Duration::from_secs(parse_env(
                &get_env,
                ENV_INCREMENTAL_INTERVAL_SECS,
                DEFAULT_INCREMENTAL_INTERVAL_SECS,
            )?),
            window_lag: Duration::from_secs(parse_env(
                &get_env,
                ENV_WINDOW_LAG_SECS,
                DEFAULT_WINDOW_LAG_SECS,
            )?),
            max_window: defaults.max_window,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first violation.
    pub fn validate(&self) -> Result<()> {
        self.split_bounds()?;
        if self.max_in_flight == 0 {
            return Err(Error::Configuration {
                message: "maxInFlight must be positive".into(),
            });
        }
        if self.heartbeat_timeout_sec == 0 {
            return Err(Error::Configuration {
                message: "heartbeatTimeoutSec must be positive".into(),
            });
        }
        if self.check_frequency.is_zero() {
            return Err(Error::Configuration {
                message: "checkFrequency must be positive".into(),
            });
        }
        if self.number_of_patients_per_processing_job == 0 {
            return Err(Error::Configuration {
                message: "numberOfPatientsPerProcessingJob must be positive".into(),
            });
        }
        if let FilterScope::System { resource_types } = &self.filter_scope {
            if resource_types.is_empty() {
                return Err(Error::Configuration {
                    message: "system scope requires at least one resource type".into(),
                });
            }
        }
        Ok(())
    }

    /// Returns the validated splitter band.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an inverted or zero band.
    pub fn split_bounds(&self) -> Result<SplitBounds> {
        SplitBounds::new(self.low_bound, self.high_bound)
    }
}

fn parse_env<F, V>(get_env: &F, key: &str, default: V) -> Result<V>
where
    F: Fn(&str) -> Option<String>,
    V: std::str::FromStr,
    V::Err: std::fmt::Display,
{
    match get_env(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e| Error::Configuration {
            message: format!("{key}={raw} did not parse: {e}"),
        }),
    }
}
