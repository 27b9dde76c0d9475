//! Worker configuration.
//!
//! [`WorkerSettings`] is what callers build. Every option is optional; when the worker
//! starts the settings are resolved into [`ResolvedSettings`], falling back to the process
//! environment and then to built in defaults:
//!
//! | option | environment variable | default |
//! |---|---|---|
//! | polling | `REXRENDER_API_POLLING` (ms) | 30 seconds |
//! | pickup timeout | `REXRENDER_PICKUP_TIMEOUT` (ms) | 60 seconds |
//! | tolerated empty queues | `REXRENDER_TOLERATE_EMPTY_QUEUES` | 0 |
//! | lock file | `REXRENDER_LOCK_FILE_NAME`, next to the executable | `.rexrender-worker.lock` |
//!
//! # Example
//!
//! ```
//! # use rexrender::prelude::*;
//! # use std::time::Duration;
//! let settings = WorkerSettings::default()
//!     .with_polling(Duration::from_secs(5))
//!     .with_tag_selector("gpu,fast")
//!     .with_exit_on_empty_queue(true)
//!     .with_tolerate_empty_queues(3)
//!     .with_stop_at_time("22:30".parse().unwrap())
//!     .with_stop_days("1,2,3,4,5".parse().unwrap());
//!
//! let resolved = settings.resolve_with(|_| None).unwrap();
//! assert_eq!(resolved.tag_selector.as_deref(), Some("gpu,fast"));
//! assert_eq!(resolved.tolerate_empty_queues, 3);
//! ```
use std::{path::PathBuf, str::FromStr, time::Duration};

use chrono::Weekday;
use thiserror::Error;

use crate::backoff::Backoff;

pub const DEFAULT_POLLING: Duration = Duration::from_secs(30);
pub const DEFAULT_PICKUP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_LOCK_FILE_NAME: &str = ".rexrender-worker.lock";

pub const ENV_POLLING: &str = "REXRENDER_API_POLLING";
pub const ENV_PICKUP_TIMEOUT: &str = "REXRENDER_PICKUP_TIMEOUT";
pub const ENV_TOLERATE_EMPTY_QUEUES: &str = "REXRENDER_TOLERATE_EMPTY_QUEUES";
pub const ENV_LOCK_FILE_NAME: &str = "REXRENDER_LOCK_FILE_NAME";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Invalid stop time {0:?}, expected HH:MM")]
    InvalidStopTime(String),
    #[error("Invalid stop days {0:?}, expected a comma separated list of 0 (Sunday) to 6")]
    InvalidStopDays(String),
    #[error("Invalid value {value:?} for {variable}")]
    InvalidEnvironment {
        variable: &'static str,
        value: String,
    },
}

/// The time of day at which a worker should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopTime {
    pub hour: u32,
    pub minute: u32,
}

impl StopTime {
    pub const fn new(hour: u32, minute: u32) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self { hour, minute })
        } else {
            None
        }
    }
}

impl FromStr for StopTime {
    type Err = SettingsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || SettingsError::InvalidStopTime(value.to_owned());
        let (hour, minute) = value.trim().split_once(':').ok_or_else(invalid)?;
        let hour = hour.parse().map_err(|_| invalid())?;
        let minute = minute.parse().map_err(|_| invalid())?;
        Self::new(hour, minute).ok_or_else(invalid)
    }
}

/// The weekdays on which a scheduled stop may happen.
///
/// Parsed from a comma separated list of day numbers where `0` is Sunday and `6` is Saturday.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopDays(Vec<Weekday>);

impl StopDays {
    pub fn contains(&self, weekday: Weekday) -> bool {
        self.0.contains(&weekday)
    }
}

impl FromStr for StopDays {
    type Err = SettingsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || SettingsError::InvalidStopDays(value.to_owned());
        let days = value
            .split(',')
            .map(|day| match day.trim().parse::<u8>().map_err(|_| invalid())? {
                0 => Ok(Weekday::Sun),
                1 => Ok(Weekday::Mon),
                2 => Ok(Weekday::Tue),
                3 => Ok(Weekday::Wed),
                4 => Ok(Weekday::Thu),
                5 => Ok(Weekday::Fri),
                6 => Ok(Weekday::Sat),
                _ => Err(invalid()),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(days))
    }
}

impl From<Vec<Weekday>> for StopDays {
    fn from(value: Vec<Weekday>) -> Self {
        Self(value)
    }
}

/// Options controlling how a worker polls, renders, and stops.
#[derive(Debug, Clone, Default)]
pub struct WorkerSettings {
    pub name: Option<String>,
    pub polling: Option<Duration>,
    pub poll_backoff: Option<Backoff>,
    pub pickup_timeout: Option<Duration>,
    pub tag_selector: Option<String>,
    pub tolerate_empty_queues: Option<u32>,
    pub exit_on_empty_queue: bool,
    pub stop_on_error: bool,
    pub stop_at_time: Option<StopTime>,
    pub stop_days: Option<StopDays>,
    pub handle_interruption: bool,
    pub wait_between_jobs: Option<Duration>,
    pub lock_file: Option<PathBuf>,
}

impl WorkerSettings {
    /// The name the worker reports to the queue service.
    pub fn with_name(mut self, name: impl ToString) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Delay between acquisition attempts that did not yield a job.
    pub fn with_polling(mut self, polling: Duration) -> Self {
        self.polling = Some(polling);
        self
    }

    /// Replaces the constant polling delay with a custom [`Backoff`].
    ///
    /// The backoff attempt is the number of consecutive polls without a job.
    pub fn with_poll_backoff(mut self, backoff: Backoff) -> Self {
        self.poll_backoff = Some(backoff);
        self
    }

    /// Maximum time to wait for the queue service to answer an acquisition request.
    pub fn with_pickup_timeout(mut self, timeout: Duration) -> Self {
        self.pickup_timeout = Some(timeout);
        self
    }

    /// Only acquire jobs carrying all of the given comma separated tags.
    pub fn with_tag_selector(mut self, selector: impl ToString) -> Self {
        self.tag_selector = Some(selector.to_string());
        self
    }

    pub fn with_tolerate_empty_queues(mut self, tolerate: u32) -> Self {
        self.tolerate_empty_queues = Some(tolerate);
        self
    }

    /// Deactivate once more than the tolerated number of consecutive empty polls occurred.
    pub fn with_exit_on_empty_queue(mut self, exit: bool) -> Self {
        self.exit_on_empty_queue = exit;
        self
    }

    /// Turn every recoverable failure into one that stops the worker.
    pub fn with_stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    pub fn with_stop_at_time(mut self, at: StopTime) -> Self {
        self.stop_at_time = Some(at);
        self
    }

    pub fn with_stop_days(mut self, days: StopDays) -> Self {
        self.stop_days = Some(days);
        self
    }

    /// Hand the current job back to the queue when the process receives SIGINT or SIGTERM.
    ///
    /// The worker stops listening when it exits, but the signal handlers it installed stay
    /// registered with tokio for the rest of the process. From then on SIGINT and SIGTERM no
    /// longer terminate the process by default, so a program that keeps running after the
    /// worker returns has to handle them itself.
    pub fn with_handle_interruption(mut self, handle: bool) -> Self {
        self.handle_interruption = handle;
        self
    }

    pub fn with_wait_between_jobs(mut self, wait: Duration) -> Self {
        self.wait_between_jobs = Some(wait);
        self
    }

    /// Path of the graceful stop marker. Defaults to a file next to the running executable.
    pub fn with_lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_file = Some(path.into());
        self
    }

    /// Resolves the settings against the process environment.
    pub fn resolve(self) -> Result<ResolvedSettings, SettingsError> {
        self.resolve_with(|variable| std::env::var(variable).ok())
    }

    /// Resolves the settings using `env` to look up environment variables.
    pub fn resolve_with(
        self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<ResolvedSettings, SettingsError> {
        let polling = match self.polling {
            Some(polling) => polling,
            None => env_millis(&env, ENV_POLLING)?.unwrap_or(DEFAULT_POLLING),
        };
        let pickup_timeout = match self.pickup_timeout {
            Some(timeout) => timeout,
            None => env_millis(&env, ENV_PICKUP_TIMEOUT)?.unwrap_or(DEFAULT_PICKUP_TIMEOUT),
        };
        let tolerate_empty_queues = match self.tolerate_empty_queues {
            Some(tolerate) => tolerate,
            None => env_parse(&env, ENV_TOLERATE_EMPTY_QUEUES)?.unwrap_or(0),
        };
        let lock_file = self.lock_file.or_else(|| {
            let name = env(ENV_LOCK_FILE_NAME).unwrap_or_else(|| DEFAULT_LOCK_FILE_NAME.to_owned());
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
        });

        Ok(ResolvedSettings {
            name: self.name,
            polling,
            poll_backoff: self.poll_backoff.unwrap_or(Backoff::constant(polling)),
            pickup_timeout,
            tag_selector: self.tag_selector.as_deref().and_then(normalize_tag_selector),
            tolerate_empty_queues,
            exit_on_empty_queue: self.exit_on_empty_queue,
            stop_on_error: self.stop_on_error,
            stop_at_time: self.stop_at_time,
            stop_days: self.stop_days,
            handle_interruption: self.handle_interruption,
            wait_between_jobs: self.wait_between_jobs.filter(|wait| !wait.is_zero()),
            lock_file,
        })
    }
}

/// [`WorkerSettings`] with every default applied, as used by a running worker.
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub name: Option<String>,
    pub polling: Duration,
    pub poll_backoff: Backoff,
    pub pickup_timeout: Duration,
    pub tag_selector: Option<String>,
    pub tolerate_empty_queues: u32,
    pub exit_on_empty_queue: bool,
    pub stop_on_error: bool,
    pub stop_at_time: Option<StopTime>,
    pub stop_days: Option<StopDays>,
    pub handle_interruption: bool,
    pub wait_between_jobs: Option<Duration>,
    pub lock_file: Option<PathBuf>,
}

impl Default for ResolvedSettings {
    fn default() -> Self {
        Self {
            name: None,
            polling: DEFAULT_POLLING,
            poll_backoff: Backoff::constant(DEFAULT_POLLING),
            pickup_timeout: DEFAULT_PICKUP_TIMEOUT,
            tag_selector: None,
            tolerate_empty_queues: 0,
            exit_on_empty_queue: false,
            stop_on_error: false,
            stop_at_time: None,
            stop_days: None,
            handle_interruption: false,
            wait_between_jobs: None,
            lock_file: None,
        }
    }
}

/// Strips everything but ASCII letters, digits, commas and spaces from a tag selector.
///
/// Returns [`None`] when nothing usable is left.
pub fn normalize_tag_selector(selector: &str) -> Option<String> {
    let normalized = selector
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ',' || *c == ' ')
        .collect::<String>();
    (!normalized.trim().is_empty()).then_some(normalized)
}

fn env_parse<T: FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    variable: &'static str,
) -> Result<Option<T>, SettingsError> {
    env(variable)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| SettingsError::InvalidEnvironment { variable, value })
        })
        .transpose()
}

fn env_millis(
    env: &impl Fn(&str) -> Option<String>,
    variable: &'static str,
) -> Result<Option<Duration>, SettingsError> {
    Ok(env_parse(env, variable)?.map(Duration::from_millis))
}
