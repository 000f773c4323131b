//! Blunder - error capture and reporting client
//!
//! Captures errors and panics, normalizes them into notices and delivers
//! them to a Blunder collector over HTTP, tolerating offline periods,
//! duplicate noise and collector-side rate limiting.
//!
//! # Architecture
//!
//! ```text
//! notify / wrap / panic hook ──► Client ──► Processor ──► FilterChain ──► Reporters
//!                                  │                                        │
//!                                  └─► OfflineBuffer (while offline)        └─► Deferred
//! ```
//!
//! Processors, filters and reporters are pluggable via traits.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod client;
pub mod config;
pub mod deferred;
pub mod error;
pub mod filter;
pub mod historian;
pub mod metrics;
pub mod notice;
pub mod offline;
pub mod processor;
pub mod report;
pub mod wrap;

pub use client::{Client, Notification};
pub use config::{LogConfig, LogFormat, Options, User};
pub use deferred::{Deferred, Outcome};
pub use error::{BlunderError, NotifyError, Result};
pub use filter::{Filter, FilterFn};
pub use historian::{Breadcrumb, BreadcrumbLayer, Historian};
pub use notice::{ErrorRecord, Frame, Notice};
pub use processor::{CapturedError, Processor};
pub use report::{Reporter, ReporterFn, ReporterKind, ReporterSpec};
pub use wrap::{Arg, Callable};
