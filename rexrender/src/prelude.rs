//! The purpose of this module is to alleviate the need to import many of the `[rexrender]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use rexrender::prelude::*;
//! ```
pub use crate::backoff::{Backoff, Jitter};
pub use crate::job::{Job, JobState, JobUid, RenderingStatus};
pub use crate::queue::{QueueClient, QueueError};
pub use crate::render::{
    JobPreparer, NoHooks, RenderError, RenderErrorKind, RenderReporter, Renderer, WorkerHooks,
};
pub use crate::settings::{StopDays, StopTime, WorkerSettings};
pub use crate::shutdown::{LockFile, ShutdownSchedule, StopSignal};
pub use crate::{Worker, WorkerError, WorkerExit, WorkerHandle};
