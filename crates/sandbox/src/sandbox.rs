use std::path::Path;

use pybox_marshal::{Marshaller, Unmarshaller, Value};
use tracing::{debug, error, info, info_span, warn};

use crate::{
    TRACE_TARGET_SANDBOX,
    admin::{AdminMode, BootstrapCapabilities, Timer, Timers},
    channel::{InputChannel, OutputChannel, SharedOutput, shared_output},
    config::SandboxConfig,
    error::{BoxError, Error, Result},
    fs,
    logging::LogBuffer,
    resolver::{self, PackageRecord},
    runtime::Runtime,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxState {
    Uninitialized,
    Initializing,
    Ready,
    Running,
    ShuttingDown,
    Stopped,
}

/// Counters for one pass of the run loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub requests: usize,
    pub responses: usize,
    /// Requests that failed to decode or execute.
    pub failures: usize,
}

/// Owns and drives exactly one runtime instance.
///
/// A sandbox is not meant for concurrent callers; one request is in flight at
/// a time and the host enforces that by construction.
pub struct Sandbox<R: Runtime> {
    config: SandboxConfig,
    state: SandboxState,
    admin: AdminMode,
    timers: Timers,
    runtime: Option<R>,
    input: Option<Box<dyn InputChannel>>,
    output: SharedOutput,
    listing: Vec<String>,
    loaded: Vec<PackageRecord>,
    decoder: Unmarshaller,
    log: LogBuffer,
    summary: RunSummary,
}

impl<R: Runtime> Sandbox<R> {
    pub fn new(
        config: SandboxConfig,
        input: impl InputChannel + 'static,
        output: impl OutputChannel + 'static,
    ) -> Self {
        let decoder = Unmarshaller::new(config.unmarshal);
        Self {
            config,
            state: SandboxState::Uninitialized,
            admin: AdminMode::default(),
            timers: Timers::default(),
            runtime: None,
            input: Some(Box::new(input)),
            output: shared_output(output),
            listing: Vec::new(),
            loaded: Vec::new(),
            decoder,
            log: LogBuffer::new(),
            summary: RunSummary::default(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> SandboxState {
        self.state
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.admin.is_active()
    }

    /// Timer primitive bound to this sandbox's admin flag.
    #[must_use]
    pub fn timer(&self) -> Timer {
        Timer::new(self.admin.clone(), self.timers.clone())
    }

    #[must_use]
    pub fn loaded_packages(&self) -> &[PackageRecord] {
        &self.loaded
    }

    #[must_use]
    pub const fn runtime(&self) -> Option<&R> {
        self.runtime.as_ref()
    }

    #[must_use]
    pub const fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Create and bootstrap the runtime.
    ///
    /// Bootstrap code runs with admin mode active and receives the privileged
    /// capabilities; admin mode is revoked as soon as it returns, whatever
    /// the outcome.
    ///
    /// # Errors
    /// A missing interpreter, a failed bootstrap or an unreadable package
    /// directory abort start and leave the sandbox stopped.
    pub fn start<F>(&mut self, factory: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<R, BoxError>,
    {
        self.expect_state(SandboxState::Uninitialized)?;
        let span = info_span!(target: TRACE_TARGET_SANDBOX, "sandbox.start");
        let _enter = span.enter();

        self.state = SandboxState::Initializing;
        self.admin = AdminMode::enter();
        let result = self.initialize(factory);
        self.admin.revoke();

        match result {
            Ok(()) => {
                self.state = SandboxState::Ready;
                info!(target: TRACE_TARGET_SANDBOX, "sandbox ready");
                Ok(())
            }
            Err(err) => {
                error!(target: TRACE_TARGET_SANDBOX, %err, "sandbox start failed");
                self.shutdown();
                Err(err)
            }
        }
    }

    fn initialize<F>(&mut self, factory: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<R, BoxError>,
    {
        let interpreter = &self.config.interpreter;
        std::fs::metadata(interpreter).map_err(|source| Error::MissingInterpreter {
            path: interpreter.clone(),
            source,
        })?;

        let runtime = self
            .runtime
            .insert(factory(interpreter).map_err(Error::Bootstrap)?);
        for (key, value) in self.config.runtime_env() {
            runtime.set_env(&key, &value);
        }

        let caps = BootstrapCapabilities::new(
            &self.admin,
            &self.timers,
            &self.output,
            self.config.shims.clone(),
        );
        runtime.bootstrap(&caps).map_err(Error::Bootstrap)?;

        let package_dir = &self.config.package_dir;
        self.listing = resolver::list_dir(package_dir).map_err(|source| Error::PackageDir {
            path: package_dir.clone(),
            source,
        })?;
        Ok(())
    }

    /// Load packages, bring in workload sources and serve requests until the
    /// input channel closes. The sandbox is shut down afterwards.
    ///
    /// # Errors
    /// Fails if the sandbox is not ready, the sources cannot be copied, the
    /// input channel fails or a response cannot be written in full. Workload
    /// errors are only logged.
    pub fn load_and_run(&mut self) -> Result<RunSummary> {
        self.expect_state(SandboxState::Ready)?;
        self.state = SandboxState::Running;

        let result = self.prepare().and_then(|()| self.run());
        self.shutdown();
        result
    }

    fn prepare(&mut self) -> Result<()> {
        let span = info_span!(target: TRACE_TARGET_SANDBOX, "sandbox.prepare");
        let _enter = span.enter();
        let Some(runtime) = self.runtime.as_mut() else {
            return Err(self.invalid_state(SandboxState::Running));
        };

        let resolution = resolver::resolve(
            &self.config.manifest,
            &self.config.package_dir,
            &self.listing,
        );
        for record in &resolution.missing {
            warn!(
                target: TRACE_TARGET_SANDBOX,
                package = %record.name,
                version = %record.version,
                "package not found; skipping"
            );
        }
        for record in resolution.available {
            match runtime.load_package(&record) {
                Ok(()) => {
                    debug!(
                        target: TRACE_TARGET_SANDBOX,
                        package = %record.name,
                        "package loaded"
                    );
                    self.loaded.push(record);
                }
                Err(err) => {
                    warn!(
                        target: TRACE_TARGET_SANDBOX,
                        package = %record.name,
                        %err,
                        "package failed to load; skipping"
                    );
                }
            }
        }

        if let Some(source) = &self.config.source_dir {
            fs::bridge_source(
                runtime.fs(),
                source,
                &self.config.staging_path,
                &self.config.work_path,
            )?;
        }
        if let Some(imports) = &self.config.import_dir
            && let Err(err) = fs::mount_imports(runtime.fs(), imports, &self.config.import_path)
        {
            warn!(
                target: TRACE_TARGET_SANDBOX,
                dir = %imports.display(),
                %err,
                "import directory unavailable"
            );
        }
        Ok(())
    }

    fn run(&mut self) -> Result<RunSummary> {
        let span = info_span!(target: TRACE_TARGET_SANDBOX, "sandbox.run");
        let _enter = span.enter();

        let served = loop {
            match self.serve_once() {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        if let Err(err) = self.decoder.finish() {
            self.summary.failures += 1;
            self.log.error(format!("malformed request: {err}"));
        }
        self.log.flush();
        served?;

        info!(
            target: TRACE_TARGET_SANDBOX,
            requests = self.summary.requests,
            responses = self.summary.responses,
            failures = self.summary.failures,
            "run loop finished"
        );
        Ok(self.summary)
    }

    /// Read one chunk and handle every request it completes. Returns `false`
    /// once the input channel reports end of stream.
    fn serve_once(&mut self) -> Result<bool> {
        let Some(input) = self.input.as_mut() else {
            return Ok(false);
        };
        let Some(chunk) = input.read()? else {
            return Ok(false);
        };
        self.decoder.push(&chunk);

        loop {
            match self.decoder.next_value() {
                Ok(Some(request)) => self.dispatch(request)?,
                Ok(None) => break,
                Err(err) => {
                    self.summary.failures += 1;
                    self.log.error(format!("malformed request: {err}"));
                }
            }
        }
        self.log.flush();
        Ok(true)
    }

    fn dispatch(&mut self, request: Value) -> Result<()> {
        self.summary.requests += 1;
        let Some(runtime) = self.runtime.as_mut() else {
            return Err(self.invalid_state(SandboxState::Running));
        };

        let response = match runtime.execute(request, &mut self.log) {
            Ok(Some(response)) => response,
            Ok(None) => return Ok(()),
            Err(err) => {
                self.summary.failures += 1;
                self.log.error(err);
                return Ok(());
            }
        };

        let mut encoder = Marshaller::new(self.config.marshal);
        if let Err(err) = encoder.write_value(&response) {
            self.summary.failures += 1;
            self.log.error(format!("unencodable response: {err}"));
            return Ok(());
        }
        self.output.lock().write_frame(&encoder.finish())?;
        self.summary.responses += 1;
        Ok(())
    }

    /// Tear the sandbox down. Safe to call more than once.
    ///
    /// The input channel is detached first, then timers left over from
    /// bootstrap are cancelled and joined, then the runtime is released.
    pub fn shutdown(&mut self) {
        if self.state == SandboxState::Stopped {
            return;
        }
        self.state = SandboxState::ShuttingDown;

        if let Some(mut input) = self.input.take() {
            input.detach();
        }
        let cancelled = self.timers.cancel_all();
        if cancelled > 0 {
            debug!(target: TRACE_TARGET_SANDBOX, cancelled, "pending timers cancelled");
        }
        if let Some(mut runtime) = self.runtime.take() {
            runtime.shutdown();
        }
        if let Err(err) = self.output.lock().flush() {
            warn!(target: TRACE_TARGET_SANDBOX, %err, "failed to flush output channel");
        }
        self.admin.revoke();
        self.state = SandboxState::Stopped;
        debug!(target: TRACE_TARGET_SANDBOX, "sandbox stopped");
    }

    fn expect_state(&self, expected: SandboxState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.invalid_state(expected))
        }
    }

    const fn invalid_state(&self, expected: SandboxState) -> Error {
        Error::InvalidState {
            expected,
            actual: self.state,
        }
    }
}

impl<R: Runtime> Drop for Sandbox<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
