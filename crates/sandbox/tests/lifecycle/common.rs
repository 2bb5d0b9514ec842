use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use pybox::{
    BootstrapCapabilities, BoxError, InputChannel, LogBuffer, MemFs, MemoryInput, MemoryOutput,
    PackageRecord, Runtime, Sandbox, SandboxConfig, VirtualFs,
    marshal::{MarshalOptions, Marshaller, UnmarshalOptions, Unmarshaller, Value},
};
use tempfile::TempDir;
use tracing::{
    Level, Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{Layer, Registry, layer::SubscriberExt};

pub(crate) type Journal = Arc<Mutex<Vec<String>>>;

/// Runtime that interprets `{"op": ..., "arg": ...}` requests.
pub(crate) struct ScriptedRuntime {
    fs: MemFs,
    journal: Journal,
    env: Vec<(String, String)>,
    loaded: Vec<String>,
    caps: Arc<Mutex<Option<BootstrapCapabilities>>>,
    announce: Option<Bytes>,
    late_timer: Option<Arc<AtomicBool>>,
    fail_bootstrap: bool,
}

impl ScriptedRuntime {
    pub(crate) fn new(journal: Journal) -> Self {
        Self {
            fs: MemFs::new(),
            journal,
            env: Vec::new(),
            loaded: Vec::new(),
            caps: Arc::default(),
            announce: None,
            late_timer: None,
            fail_bootstrap: false,
        }
    }

    /// Keep the bootstrap capabilities reachable after start.
    pub(crate) fn leak_caps(mut self, slot: Arc<Mutex<Option<BootstrapCapabilities>>>) -> Self {
        self.caps = slot;
        self
    }

    pub(crate) fn announce(mut self, frame: &'static [u8]) -> Self {
        self.announce = Some(Bytes::from_static(frame));
        self
    }

    /// Schedule a timer from bootstrap that sets `flag` after 200ms, and
    /// forget its handle.
    pub(crate) fn late_timer(mut self, flag: Arc<AtomicBool>) -> Self {
        self.late_timer = Some(flag);
        self
    }

    pub(crate) const fn fail_bootstrap(mut self) -> Self {
        self.fail_bootstrap = true;
        self
    }

    fn record(&self, entry: impl Into<String>) {
        self.journal.lock().push(entry.into());
    }
}

impl Runtime for ScriptedRuntime {
    fn fs(&mut self) -> &mut dyn VirtualFs {
        &mut self.fs
    }

    fn set_env(&mut self, key: &str, value: &str) {
        self.env.push((key.to_string(), value.to_string()));
    }

    fn bootstrap(&mut self, caps: &BootstrapCapabilities) -> std::result::Result<(), BoxError> {
        self.record("bootstrap");
        *self.caps.lock() = Some(caps.clone());

        let journal = Arc::clone(&self.journal);
        let handle = caps.timer.set_timeout(Duration::from_millis(1), move || {
            journal.lock().push("timer fired".to_string());
        })?;
        if !handle.join() {
            return Err("bootstrap timer did not fire".into());
        }
        if let Some(flag) = &self.late_timer {
            let flag = Arc::clone(flag);
            drop(caps.timer.set_timeout(Duration::from_millis(200), move || {
                flag.store(true, Ordering::Release);
            })?);
        }
        if let Some(frame) = &self.announce {
            caps.outbound.send(frame)?;
        }
        if self.fail_bootstrap {
            return Err("bootstrap script raised".into());
        }
        Ok(())
    }

    fn load_package(&mut self, package: &PackageRecord) -> std::result::Result<(), BoxError> {
        self.record(format!("load:{}", package.name));
        if package.name == "broken" {
            return Err(format!("corrupt archive {:?}", package.file_name).into());
        }
        self.loaded.push(package.name.clone());
        Ok(())
    }

    fn execute(
        &mut self,
        request: Value,
        log: &mut LogBuffer,
    ) -> std::result::Result<Option<Value>, BoxError> {
        let op = request.get("op").and_then(Value::as_str).unwrap_or_default();
        let arg = request.get("arg").cloned().unwrap_or_default();
        let text = arg.as_str().unwrap_or_default().to_string();
        match op {
            "echo" => Ok(Some(arg)),
            "print" => {
                log.write_str(&text);
                log.write_str("\n");
                Ok(None)
            }
            "fail" => Err(text.into()),
            "read" => Ok(Some(Value::Bytes(self.fs.read_file(&text)?))),
            "exists" => Ok(Some(Value::Bool(self.fs.exists(&text)))),
            "packages" => Ok(Some(Value::List(
                self.loaded.iter().map(|n| Value::from(n.as_str())).collect(),
            ))),
            "env" => Ok(Some(
                self.env
                    .iter()
                    .rev()
                    .find(|(k, _)| *k == text)
                    .map_or(Value::None, |(_, v)| Value::from(v.as_str())),
            )),
            "timer" => {
                let caps = self.caps.lock().clone().ok_or("no capabilities")?;
                caps.timer.set_timeout(Duration::ZERO, || {})?;
                Ok(Some(Value::from("timer accepted")))
            }
            other => Err(format!("unknown op {other:?}").into()),
        }
    }

    fn shutdown(&mut self) {
        self.record("runtime.shutdown");
    }
}

/// Input channel that records when it is detached.
pub(crate) struct JournalInput {
    inner: MemoryInput,
    journal: Journal,
}

impl JournalInput {
    pub(crate) fn new(chunks: Vec<Bytes>, journal: Journal) -> Self {
        Self {
            inner: MemoryInput::with_chunks(chunks),
            journal,
        }
    }
}

impl InputChannel for JournalInput {
    fn read(&mut self) -> std::io::Result<Option<Bytes>> {
        self.inner.read()
    }

    fn detach(&mut self) {
        self.journal.lock().push("input.detach".to_string());
        self.inner.detach();
    }
}

pub(crate) fn request(op: &str, arg: impl Into<Value>) -> Bytes {
    let value = Value::dict([
        (Value::from("op"), Value::from(op)),
        (Value::from("arg"), arg.into()),
    ]);
    let mut m = Marshaller::new(MarshalOptions::default());
    m.write_value(&value).expect("encode request");
    m.finish()
}

pub(crate) fn responses(output: &MemoryOutput) -> Result<Vec<Value>> {
    let mut de = Unmarshaller::new(UnmarshalOptions::default());
    de.push(output.take());
    let values = de.drain().collect::<pybox::marshal::Result<Vec<_>>>()?;
    de.finish().context("response stream ended mid-value")?;
    Ok(values)
}

/// Host-side directories for one sandbox.
pub(crate) struct Fixture {
    pub(crate) dir: TempDir,
}

impl Fixture {
    pub(crate) fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        std::fs::write(root.join("interpreter.bin"), b"\0asm")?;

        let packages = root.join("packages");
        std::fs::create_dir(&packages)?;
        for file in [
            "foo-1.0-abc.ext",
            "typing_extensions-4.2-py3.ext",
            "dup-2.0-a.ext",
            "dup-2.0-b.ext",
            "broken-0.1-x.ext",
        ] {
            std::fs::write(packages.join(file), b"")?;
        }

        let source = root.join("source");
        std::fs::create_dir_all(source.join("sub"))?;
        std::fs::write(source.join("main.py"), b"print('main')")?;
        std::fs::write(source.join("sub/util.py"), b"VALUE = 1")?;

        let imports = root.join("imports");
        std::fs::create_dir(&imports)?;
        std::fs::write(imports.join("helpers.py"), b"def help(): pass")?;

        Ok(Self { dir })
    }

    pub(crate) fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub(crate) fn config(&self) -> SandboxConfig {
        SandboxConfig::new(self.path("interpreter.bin"), self.path("packages"))
    }
}

pub(crate) fn scripted(
    journal: &Journal,
) -> impl FnOnce(&Path) -> std::result::Result<ScriptedRuntime, BoxError> {
    let journal = Arc::clone(journal);
    move |_: &Path| Ok(ScriptedRuntime::new(journal))
}

pub(crate) fn sandbox(
    config: SandboxConfig,
    chunks: Vec<Bytes>,
    journal: &Journal,
) -> (Sandbox<ScriptedRuntime>, MemoryOutput) {
    let output = MemoryOutput::unbounded();
    let input = JournalInput::new(chunks, Arc::clone(journal));
    (Sandbox::new(config, input, output.clone()), output)
}

#[derive(Clone, Debug)]
pub(crate) struct CapturedEvent {
    pub(crate) level: Level,
    pub(crate) target: String,
    pub(crate) message: String,
    pub(crate) fields: Vec<(String, String)>,
}

impl CapturedEvent {
    pub(crate) fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Layer that keeps every event it sees.
#[derive(Clone, Default)]
pub(crate) struct Capture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl Capture {
    pub(crate) fn install(&self) -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(Registry::default().with(self.clone()))
    }

    pub(crate) fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn messages(&self, level: Level) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.level == level)
            .map(|e| e.message)
            .collect()
    }
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl Visit for EventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .push((field.name().to_string(), format!("{value:?}")));
        }
    }
}

impl<S: Subscriber> Layer<S> for Capture {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);
        self.events.lock().push(CapturedEvent {
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}
