//! The core, UI-agnostic library for the `byte0` disk wiping utility.
//!
//! `byte0-core` is designed to be used as a library by any front-end, whether it's
//! a command-line interface (like `byte0`) or a graphical user interface. It
//! finds physical drives, refuses to touch the one the OS booted from, releases
//! OS locks on the target, and overwrites it with zeros through an external `dd`
//! process while reporting progress.
//!
//! The library is structured into several key modules:
//! - [`device`]: The immutable [`DeviceDescriptor`] snapshot and its confirmation token.
//! - [`platform`]: Platform-specific discovery and unlocking of block devices.
//! - [`guard`]: Validation of wipe requests before anything destructive happens.
//! - [`progress`]: Parsing of the zero-fill tool's output into byte counts.
//! - [`orchestrator`]: The per-job worker that drives the tool.
//! - [`events`]: The channel through which workers report to callers.
//!
//! The primary entry point is [`Engine`]. Jobs run on background threads and
//! report through events, so the calling thread never blocks on device I/O.
//!
//! ## Example: Wiping a Device with Progress Reporting
//!
//! ```rust,no_run
//! use byte0_core::{Engine, EngineConfig};
//!
//! fn main() -> Result<(), byte0_core::WipeError> {
//!     let engine = Engine::new(EngineConfig::default());
//!     let candidates = engine.wipe_candidates()?;
//!     let target = candidates.first().expect("No wipeable devices found.");
//!
//!     // The token proves the user confirmed exactly this device.
//!     let token = target.confirmation_token();
//!     let job = engine.start_wipe(&target.index, &token)?;
//!
//!     engine.subscribe(
//!         &job,
//!         |p| println!("{} bytes written ({:?}%)", p.bytes_written, p.percent),
//!         |l| println!("[{}] {}", l.severity, l.message),
//!         |r| println!("finished: {}", r.state()),
//!     );
//!
//!     let report = job.wait();
//!     println!("Wipe ended in state {}", report.state());
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
mod engine;
pub mod error;
pub mod events;
pub mod guard;
pub mod job;
pub mod orchestrator;
pub mod platform;
pub mod progress;

pub use config::EngineConfig;
pub use device::{Availability, ConfirmationToken, DeviceDescriptor, DeviceId, ListedDevice};
pub use engine::Engine;
pub use error::{Result, Severity, Violation, WipeError};
pub use events::{LogEvent, ProgressEvent, StateEvent, WipeEvent, WipeReport};
pub use job::{CancelToken, JobId, JobState, WipeJob};
pub use orchestrator::{JobHandle, WipeOrchestrator};
pub use platform::Platform;
