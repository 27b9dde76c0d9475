use std::time::Duration;

use rexrender::settings::{SettingsError, WorkerSettings};
use thiserror::Error;

const HOST: &str = "REXRENDER_HOST";
const SECRET: &str = "REXRENDER_SECRET";
const NAME: &str = "REXRENDER_NAME";
const RENDER_COMMAND: &str = "REXRENDER_RENDER_COMMAND";
const TAG_SELECTOR: &str = "REXRENDER_TAG_SELECTOR";
const EXIT_ON_EMPTY_QUEUE: &str = "REXRENDER_EXIT_ON_EMPTY_QUEUE";
const STOP_ON_ERROR: &str = "REXRENDER_STOP_ON_ERROR";
const STOP_AT_TIME: &str = "REXRENDER_STOP_AT_TIME";
const STOP_DAYS: &str = "REXRENDER_STOP_DAYS";
const WAIT_BETWEEN_JOBS: &str = "REXRENDER_WAIT_BETWEEN_JOBS";

const DEFAULT_HOST: &str = "http://localhost:3050";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("Invalid value {value:?} for {variable}")]
    Invalid {
        variable: &'static str,
        value: String,
    },
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Everything the worker binary reads from its environment.
///
/// Polling, pickup timeout, empty queue tolerance and the lock file name are read by the
/// library itself when the worker starts.
#[derive(Debug)]
pub struct WorkerConfig {
    pub host: String,
    pub secret: Option<String>,
    pub program: String,
    pub args: Vec<String>,
    pub settings: WorkerSettings,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|variable| std::env::var(variable).ok())
    }

    fn from_lookup(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let command = env(RENDER_COMMAND).ok_or(ConfigError::Missing(RENDER_COMMAND))?;
        let mut command = command.split_whitespace().map(ToOwned::to_owned);
        let program = command.next().ok_or(ConfigError::Missing(RENDER_COMMAND))?;

        let mut settings = WorkerSettings::default()
            .with_handle_interruption(true)
            .with_exit_on_empty_queue(flag(&env, EXIT_ON_EMPTY_QUEUE)?)
            .with_stop_on_error(flag(&env, STOP_ON_ERROR)?);
        if let Some(name) = env(NAME) {
            settings = settings.with_name(name);
        }
        if let Some(selector) = env(TAG_SELECTOR) {
            settings = settings.with_tag_selector(selector);
        }
        if let Some(at) = env(STOP_AT_TIME) {
            settings = settings.with_stop_at_time(at.parse()?);
        }
        if let Some(days) = env(STOP_DAYS) {
            settings = settings.with_stop_days(days.parse()?);
        }
        if let Some(wait) = env(WAIT_BETWEEN_JOBS) {
            let millis = wait.trim().parse().map_err(|_| ConfigError::Invalid {
                variable: WAIT_BETWEEN_JOBS,
                value: wait,
            })?;
            settings = settings.with_wait_between_jobs(Duration::from_millis(millis));
        }

        Ok(Self {
            host: env(HOST).unwrap_or_else(|| DEFAULT_HOST.to_owned()),
            secret: env(SECRET),
            program,
            args: command.collect(),
            settings,
        })
    }
}

fn flag(env: &impl Fn(&str) -> Option<String>, variable: &'static str) -> Result<bool, ConfigError> {
    match env(variable).as_deref().map(str::trim) {
        None | Some("") | Some("0") | Some("false") => Ok(false),
        Some("1") | Some("true") => Ok(true),
        Some(value) => Err(ConfigError::Invalid {
            variable,
            value: value.to_owned(),
        }),
    }
}
