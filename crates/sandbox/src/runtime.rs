use pybox_marshal::Value;

use crate::{
    admin::BootstrapCapabilities, error::BoxError, fs::VirtualFs, logging::LogBuffer,
    resolver::PackageRecord,
};

/// The embedded interpreter a [`Sandbox`](crate::Sandbox) drives.
///
/// Implementations are single-threaded from the host's point of view: the
/// sandbox never calls into a runtime from more than one thread at a time.
pub trait Runtime: Send {
    /// The runtime's private filesystem.
    fn fs(&mut self) -> &mut dyn VirtualFs;

    fn set_env(&mut self, key: &str, value: &str);

    /// Run trusted bootstrap code. `caps` is only honoured for the duration
    /// of this call; holding on to it afterwards yields isolation errors.
    ///
    /// # Errors
    /// Any error aborts sandbox start.
    fn bootstrap(&mut self, caps: &BootstrapCapabilities) -> Result<(), BoxError>;

    /// # Errors
    /// A failed load is logged and the package skipped.
    fn load_package(&mut self, package: &PackageRecord) -> Result<(), BoxError>;

    /// Handle one decoded request. Text output goes to `log`; `Ok(None)` means
    /// there is nothing to send back.
    ///
    /// # Errors
    /// Workload failures are logged; they never reach the data channel.
    fn execute(&mut self, request: Value, log: &mut LogBuffer) -> Result<Option<Value>, BoxError>;

    /// Release interpreter resources. Called once, after the input channel
    /// has been detached.
    fn shutdown(&mut self) {}
}
