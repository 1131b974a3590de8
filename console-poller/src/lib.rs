//! # console-poller
//!
//! Adaptive polling for the Frank!Framework admin console.
//!
//! Views register a resource key with a [`PollerRegistry`]; the registry owns
//! one [`PollerStream`] per key that fetches the resource through a
//! [`Fetcher`], delivers each payload to a callback, adapts its cadence to the
//! observed response latency and gives up after sustained failures.
//!
//! ```rust,ignore
//! use console_poller::{HttpFetcher, PollerConfig, PollerRegistry};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = PollerConfig::from_app_constants(&app_constants);
//! let registry = PollerRegistry::new(config.clone())?;
//! let api = Arc::new(HttpFetcher::<serde_json::Value>::new(
//!     "http://localhost/iaf/api/",
//!     config.request_timeout,
//! )?);
//!
//! registry.add(
//!     "server/warnings",
//!     Arc::clone(&api),
//!     |warnings| println!("{warnings}"),
//!     true,
//!     Some(Duration::from_secs(60)),
//! );
//!
//! // user went idle / came back
//! registry.enter_idle();
//! registry.leave_idle();
//!
//! // logout
//! registry.get_all().remove();
//! ```

mod config;
mod error;
mod fetch;
mod history;
pub mod logging;
mod registry;
mod stream;
mod timer;

pub use config::*;
pub use error::*;
pub use fetch::{fetch_fn, Fetcher, FnFetcher, HttpFetcher};
pub use history::{ErrorHistory, ErrorRecord, LatencySampler};
pub use registry::{AllStreams, PollerRegistry, RegistryStats};
pub use stream::{PollMode, PollerStream, StreamControl, StreamStats, SuccessCallback};
pub use timer::{Timer, TimerKind};
