//! Deciding when a worker should stop taking new jobs.
//!
//! A worker deactivates when any of the following holds:
//!
//! - the configured stop time has been reached (see [`ShutdownSchedule`]),
//! - somebody asked for a graceful stop by creating the lock file (see [`LockFile`]), or
//! - the worker is configured to exit on an empty queue and has seen more consecutive empty
//!   polls than it tolerates.
use std::{io::ErrorKind, path::PathBuf};

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};

use crate::settings::{ResolvedSettings, StopDays, StopTime};

// A schedule restricted to weekdays always finds a match within a week. The extra days cover
// dates skipped because the stop time does not exist on them (daylight saving gaps).
const MAX_SCHEDULE_DAYS: usize = 14;

/// The instant at which a worker stops acquiring jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSchedule {
    stop_at: DateTime<Utc>,
}

impl ShutdownSchedule {
    pub fn at(stop_at: DateTime<Utc>) -> Self {
        Self { stop_at }
    }

    /// Computes the next occurrence of `at` strictly after `now`, in `now`'s time zone.
    ///
    /// When `days` is given the occurrence is moved forward a day at a time until it falls on
    /// one of those weekdays.
    ///
    /// ```
    /// # use rexrender::prelude::*;
    /// # use chrono::{TimeZone, Utc};
    /// // Wednesday
    /// let now = Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap();
    ///
    /// let schedule = ShutdownSchedule::next(&now, StopTime::new(10, 0).unwrap(), None).unwrap();
    /// assert_eq!(schedule.stop_at(), Utc.with_ymd_and_hms(2024, 1, 4, 10, 0, 0).unwrap());
    ///
    /// let mondays: StopDays = "1".parse().unwrap();
    /// let schedule = ShutdownSchedule::next(&now, StopTime::new(14, 0).unwrap(), Some(&mondays)).unwrap();
    /// assert_eq!(schedule.stop_at(), Utc.with_ymd_and_hms(2024, 1, 8, 14, 0, 0).unwrap());
    /// ```
    pub fn next<Tz: TimeZone>(
        now: &DateTime<Tz>,
        at: StopTime,
        days: Option<&StopDays>,
    ) -> Option<Self> {
        let time = NaiveTime::from_hms_opt(at.hour, at.minute, 0)?;
        let timezone = now.timezone();
        let mut date = now.date_naive();

        let today = Self::local(&timezone, date, time);
        if today.map_or(true, |stop_at| stop_at <= *now) {
            date = date.succ_opt()?;
        }

        for _ in 0..MAX_SCHEDULE_DAYS {
            if days.map_or(true, |days| days.contains(date.weekday())) {
                if let Some(stop_at) = Self::local(&timezone, date, time) {
                    return Some(Self::at(stop_at.with_timezone(&Utc)));
                }
            }
            date = date.succ_opt()?;
        }
        None
    }

    fn local<Tz: TimeZone>(timezone: &Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Tz>> {
        timezone.from_local_datetime(&date.and_time(time)).earliest()
    }

    pub fn stop_at(&self) -> DateTime<Utc> {
        self.stop_at
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.stop_at
    }
}

/// An external request for the worker to stop after its current operation.
pub trait StopSignal: Send + Sync {
    /// Returns `true` if a stop was requested, consuming the request.
    fn take(&self) -> bool;
}

impl<S: StopSignal + ?Sized> StopSignal for Box<S> {
    fn take(&self) -> bool {
        (**self).take()
    }
}

/// A [`StopSignal`] raised by creating a file at a well known path.
///
/// Observing the file removes it, so each file triggers exactly one stop.
#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl StopSignal for LockFile {
    fn take(&self) -> bool {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(
                    path = %self.path.display(),
                    "Lock file detected, initiating graceful shutdown"
                );
                true
            }
            Err(error) if error.kind() == ErrorKind::NotFound => false,
            Err(error) => {
                tracing::error!(
                    ?error,
                    path = %self.path.display(),
                    "Error handling lock file {}: {error}",
                    self.path.display()
                );
                false
            }
        }
    }
}

/// Decides whether the worker loop should stop.
pub struct ShutdownPolicy {
    schedule: Option<ShutdownSchedule>,
    stop_signal: Option<Box<dyn StopSignal>>,
    exit_on_empty_queue: bool,
    tolerate_empty_queues: u32,
}

impl ShutdownPolicy {
    pub fn new(settings: &ResolvedSettings, schedule: Option<ShutdownSchedule>) -> Self {
        Self {
            schedule,
            stop_signal: settings.lock_file.clone().map(|path| {
                let lock_file = LockFile::new(path);
                tracing::debug!(path = %lock_file.path().display(), "Watching for lock file");
                Box::new(lock_file) as Box<dyn StopSignal>
            }),
            exit_on_empty_queue: settings.exit_on_empty_queue,
            tolerate_empty_queues: settings.tolerate_empty_queues,
        }
    }

    /// Replace the lock file derived from the settings with another stop signal.
    pub fn with_stop_signal(mut self, stop_signal: impl StopSignal + 'static) -> Self {
        self.stop_signal = Some(Box::new(stop_signal));
        self
    }

    pub fn schedule(&self) -> Option<&ShutdownSchedule> {
        self.schedule.as_ref()
    }

    /// Whether the worker should stop, given the time and the number of consecutive empty
    /// polls.
    ///
    /// The checks short circuit in order (schedule, stop signal, empty queue), so a pending
    /// stop signal is only consumed when the schedule has not already decided.
    pub fn should_stop(&self, now: DateTime<Utc>, empty_polls: u32) -> bool {
        self.schedule_elapsed(now) || self.stop_requested() || self.empty_queue_exhausted(empty_polls)
    }

    pub fn schedule_elapsed(&self, now: DateTime<Utc>) -> bool {
        let elapsed = self.schedule.is_some_and(|schedule| schedule.is_due(now));
        if elapsed {
            tracing::info!("Scheduled stop time reached, deactivating worker");
        }
        elapsed
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_signal.as_ref().is_some_and(|signal| signal.take())
    }

    pub fn empty_queue_exhausted(&self, empty_polls: u32) -> bool {
        self.exit_on_empty_queue && empty_polls > self.tolerate_empty_queues
    }
}
