use std::path::{Path, PathBuf};

use pybox_marshal::{MarshalOptions, UnmarshalOptions};

use crate::{TRACE_TARGET_SANDBOX, admin::Shims, resolver::Manifest};

/// Host directory exposed to the workload as importable code.
pub const ENV_IMPORT_DIR: &str = "PYBOX_IMPORT_DIR";
/// Transport marker communicated to workload code.
pub const ENV_TRANSPORT: &str = "PYBOX_TRANSPORT";

pub const DEFAULT_TRANSPORT: &str = "fd";
pub const DEFAULT_STAGING_PATH: &str = "/tmp/pybox-staging";
pub const DEFAULT_WORK_PATH: &str = "/home/sandbox";
pub const DEFAULT_IMPORT_PATH: &str = "/imports";

/// Settings for one sandbox instance.
#[derive(Clone, Debug)]
pub struct SandboxConfig {
    pub(crate) interpreter: PathBuf,
    pub(crate) package_dir: PathBuf,
    pub(crate) manifest: Manifest,
    pub(crate) source_dir: Option<PathBuf>,
    pub(crate) staging_path: String,
    pub(crate) work_path: String,
    pub(crate) import_dir: Option<PathBuf>,
    pub(crate) import_path: String,
    pub(crate) transport: String,
    pub(crate) marshal: MarshalOptions,
    pub(crate) unmarshal: UnmarshalOptions,
    pub(crate) shims: Shims,
    pub(crate) env: Vec<(String, String)>,
}

impl SandboxConfig {
    pub fn new(interpreter: impl Into<PathBuf>, package_dir: impl Into<PathBuf>) -> Self {
        let marshal = MarshalOptions::default();
        Self {
            interpreter: interpreter.into(),
            package_dir: package_dir.into(),
            manifest: Manifest::new(),
            source_dir: None,
            staging_path: DEFAULT_STAGING_PATH.to_string(),
            work_path: DEFAULT_WORK_PATH.to_string(),
            import_dir: None,
            import_path: DEFAULT_IMPORT_PATH.to_string(),
            transport: DEFAULT_TRANSPORT.to_string(),
            marshal,
            unmarshal: UnmarshalOptions::paired_with(&marshal),
            shims: Shims::new(),
            env: Vec::new(),
        }
    }

    pub fn manifest(&mut self, manifest: Manifest) -> &mut Self {
        self.manifest = manifest;
        self
    }

    /// Host directory whose contents are copied into the runtime before the
    /// run loop starts.
    pub fn source_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.source_dir = Some(dir.into());
        self
    }

    pub fn staging_path(&mut self, path: impl Into<String>) -> &mut Self {
        self.staging_path = path.into();
        self
    }

    /// Writable path inside the runtime that receives the copied sources.
    pub fn work_path(&mut self, path: impl Into<String>) -> &mut Self {
        self.work_path = path.into();
        self
    }

    pub fn import_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.import_dir = Some(dir.into());
        self
    }

    pub fn import_path(&mut self, path: impl Into<String>) -> &mut Self {
        self.import_path = path.into();
        self
    }

    pub fn transport(&mut self, transport: impl Into<String>) -> &mut Self {
        self.transport = transport.into();
        self
    }

    /// Encode policy for responses. The decode policy for requests is reset
    /// to match it.
    pub fn marshal(&mut self, options: MarshalOptions) -> &mut Self {
        self.marshal = options;
        self.unmarshal = UnmarshalOptions::paired_with(&options);
        self
    }

    pub const fn unmarshal(&mut self, options: UnmarshalOptions) -> &mut Self {
        self.unmarshal = options;
        self
    }

    pub fn shim(&mut self, name: impl Into<String>) -> &mut Self {
        self.shims.insert(name);
        self
    }

    /// Add an environment variable for the runtime.
    ///
    /// If the same key is set multiple times, the last value wins.
    pub fn env(&mut self, k: impl AsRef<str>, v: impl AsRef<str>) -> &mut Self {
        let (k, v) = (k.as_ref(), v.as_ref());
        if let Some(existing) = self.env.iter_mut().find(|(key, _)| key == k) {
            existing.1 = v.to_string();
        } else {
            self.env.push((k.to_string(), v.to_string()));
        }
        self
    }

    /// Read overrides from the process environment.
    pub fn apply_env(&mut self) -> &mut Self {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`. Empty values are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> &mut Self {
        match lookup(ENV_IMPORT_DIR) {
            Some(value) if value.trim().is_empty() => {}
            Some(value) => {
                tracing::debug!(
                    target: TRACE_TARGET_SANDBOX,
                    import_dir = %value,
                    "import directory from env"
                );
                self.import_dir = Some(PathBuf::from(value));
            }
            None => {}
        }
        match lookup(ENV_TRANSPORT) {
            Some(value) if value.trim().is_empty() => {
                tracing::warn!(
                    target: TRACE_TARGET_SANDBOX,
                    "Empty {ENV_TRANSPORT}; keeping {}",
                    self.transport
                );
            }
            Some(value) => self.transport = value,
            None => {}
        }
        self
    }

    /// Variables exported into the runtime: user entries first, then the
    /// transport marker and import location.
    #[must_use]
    pub fn runtime_env(&self) -> Vec<(String, String)> {
        let mut env = self.env.clone();
        let mut set = |k: &str, v: &str| {
            if let Some(existing) = env.iter_mut().find(|(key, _)| key == k) {
                existing.1 = v.to_string();
            } else {
                env.push((k.to_string(), v.to_string()));
            }
        };
        set(ENV_TRANSPORT, &self.transport);
        if self.import_dir.is_some() {
            set(ENV_IMPORT_DIR, &self.import_path);
        }
        env
    }

    #[must_use]
    pub fn interpreter_path(&self) -> &Path {
        &self.interpreter
    }

    #[must_use]
    pub fn package_dir_path(&self) -> &Path {
        &self.package_dir
    }

    #[must_use]
    pub const fn marshal_options(&self) -> MarshalOptions {
        self.marshal
    }

    #[must_use]
    pub const fn unmarshal_options(&self) -> UnmarshalOptions {
        self.unmarshal
    }
}
