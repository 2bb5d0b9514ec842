//! Lifecycle of one isolated interpreter instance.
//!
//! A [`Sandbox`] boots a [`Runtime`] inside a short trust window, loads the
//! packages it can resolve, copies workload sources into the runtime's own
//! filesystem and then serves encoded requests from a dedicated input channel,
//! writing encoded results to a separate output channel.

pub mod admin;
pub mod channel;
pub mod config;
pub mod error;
pub mod fs;
pub mod logging;
pub mod resolver;
pub mod runtime;
pub mod sandbox;

pub use pybox_marshal as marshal;

pub const TRACE_TARGET_SANDBOX: &str = "pybox::sandbox";

pub use admin::{AdminMode, BootstrapCapabilities, Outbound, Shims, Timer, TimerHandle};
pub use channel::{InputChannel, MemoryInput, MemoryOutput, OutputChannel, ReadInput, WriteOutput};
pub use config::SandboxConfig;
pub use error::{BoxError, Error, FsError, Result};
pub use fs::{MemFs, VirtualFs};
pub use logging::LogBuffer;
pub use resolver::{Manifest, PackageRecord, Resolution};
pub use runtime::Runtime;
pub use sandbox::{RunSummary, Sandbox, SandboxState};
