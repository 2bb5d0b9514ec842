use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use parking_lot::Mutex;
use pybox::{
    Error, MemoryInput, MemoryOutput, Sandbox, SandboxState,
    config::{DEFAULT_TRANSPORT, ENV_IMPORT_DIR, ENV_TRANSPORT},
    marshal::Value,
};
use tracing::Level;

use super::common::{
    Capture, Fixture, Journal, ScriptedRuntime, request, responses, sandbox, scripted,
};

#[test]
fn admin_window_closes_after_bootstrap() -> Result<()> {
    let fixture = Fixture::new()?;
    let journal = Journal::default();
    let slot = Arc::new(Mutex::new(None));
    let (mut sandbox, _output) = sandbox(fixture.config(), vec![], &journal);

    let leaked = Arc::clone(&slot);
    let boot_journal = Arc::clone(&journal);
    sandbox.start(move |_| Ok(ScriptedRuntime::new(boot_journal).leak_caps(leaked)))?;

    assert_eq!(sandbox.state(), SandboxState::Ready);
    assert!(!sandbox.is_admin());
    assert_eq!(*journal.lock(), ["bootstrap", "timer fired"]);

    let caps = slot.lock().clone().expect("bootstrap saw capabilities");
    for _ in 0..3 {
        assert!(matches!(
            caps.timer.set_timeout(Duration::ZERO, || {}),
            Err(Error::IsolationViolation("timer"))
        ));
        assert!(matches!(
            sandbox.timer().set_timeout(Duration::ZERO, || {}),
            Err(Error::IsolationViolation("timer"))
        ));
    }
    assert!(matches!(
        caps.outbound.send(b"late"),
        Err(Error::IsolationViolation(_))
    ));
    assert!(matches!(
        caps.shims(),
        Err(Error::IsolationViolation("shims"))
    ));
    Ok(())
}

#[test]
fn shutdown_cancels_bootstrap_timers() -> Result<()> {
    let fixture = Fixture::new()?;
    let journal = Journal::default();
    let fired = Arc::new(AtomicBool::new(false));
    let (mut sandbox, _output) = sandbox(fixture.config(), vec![], &journal);

    let flag = Arc::clone(&fired);
    let boot_journal = Arc::clone(&journal);
    sandbox.start(move |_| Ok(ScriptedRuntime::new(boot_journal).late_timer(flag)))?;
    sandbox.shutdown();
    assert_eq!(sandbox.state(), SandboxState::Stopped);
    drop(sandbox);

    std::thread::sleep(Duration::from_millis(400));
    assert!(!fired.load(Ordering::Acquire));
    Ok(())
}

#[test]
fn workload_cannot_use_the_timer() -> Result<()> {
    let fixture = Fixture::new()?;
    let journal = Journal::default();
    let capture = Capture::default();
    let _guard = capture.install();

    let slot = Arc::new(Mutex::new(None));
    let (mut sandbox, output) = sandbox(
        fixture.config(),
        vec![request("timer", Value::None)],
        &journal,
    );
    let leaked = Arc::clone(&slot);
    let boot_journal = Arc::clone(&journal);
    sandbox.start(move |_| Ok(ScriptedRuntime::new(boot_journal).leak_caps(leaked)))?;
    let summary = sandbox.load_and_run()?;

    assert_eq!(summary.failures, 1);
    assert!(responses(&output)?.is_empty());
    let errors = capture.messages(Level::ERROR);
    assert!(
        errors
            .iter()
            .any(|m| m == "[sandbox] privileged timer used outside bootstrap"),
        "errors: {errors:?}"
    );
    Ok(())
}

#[test]
fn outbound_reaches_output_during_bootstrap() -> Result<()> {
    let fixture = Fixture::new()?;
    let journal = Journal::default();
    let (mut sandbox, output) = sandbox(fixture.config(), vec![], &journal);

    let boot_journal = Arc::clone(&journal);
    sandbox.start(move |_| Ok(ScriptedRuntime::new(boot_journal).announce(b"N")))?;
    assert_eq!(responses(&output)?, [Value::None]);
    Ok(())
}

#[test]
fn missing_interpreter_is_fatal() -> Result<()> {
    let fixture = Fixture::new()?;
    let journal = Journal::default();
    let config = pybox::SandboxConfig::new(fixture.path("absent.bin"), fixture.path("packages"));
    let (mut sandbox, _output) = sandbox(config, vec![], &journal);

    let err = sandbox.start(scripted(&journal)).unwrap_err();
    assert!(
        matches!(err, Error::MissingInterpreter { ref path, .. } if path.ends_with("absent.bin"))
    );
    assert!(err.to_string().contains("absent.bin"));
    assert_eq!(sandbox.state(), SandboxState::Stopped);
    assert!(!sandbox.is_admin());
    assert_eq!(*journal.lock(), ["input.detach"]);
    Ok(())
}

#[test]
fn unreadable_package_dir_is_fatal() -> Result<()> {
    let fixture = Fixture::new()?;
    let journal = Journal::default();
    let config = pybox::SandboxConfig::new(fixture.path("interpreter.bin"), fixture.path("nope"));
    let (mut sandbox, _output) = sandbox(config, vec![], &journal);

    let err = sandbox.start(scripted(&journal)).unwrap_err();
    assert!(matches!(err, Error::PackageDir { .. }), "{err}");
    assert_eq!(sandbox.state(), SandboxState::Stopped);
    assert!(sandbox.runtime().is_none());
    assert_eq!(
        *journal.lock(),
        ["bootstrap", "timer fired", "input.detach", "runtime.shutdown"]
    );
    Ok(())
}

#[test]
fn bootstrap_failure_still_revokes_admin() -> Result<()> {
    let fixture = Fixture::new()?;
    let journal = Journal::default();
    let slot = Arc::new(Mutex::new(None));
    let (mut sandbox, _output) = sandbox(fixture.config(), vec![], &journal);

    let leaked = Arc::clone(&slot);
    let boot_journal = Arc::clone(&journal);
    let err = sandbox
        .start(move |_| {
            Ok(ScriptedRuntime::new(boot_journal)
                .leak_caps(leaked)
                .fail_bootstrap())
        })
        .unwrap_err();
    assert!(matches!(err, Error::Bootstrap(_)));
    assert_eq!(sandbox.state(), SandboxState::Stopped);

    let caps = slot.lock().clone().expect("bootstrap saw capabilities");
    assert!(caps.timer.set_timeout(Duration::ZERO, || {}).is_err());
    Ok(())
}

#[test]
fn factory_failure_is_a_bootstrap_error() -> Result<()> {
    let fixture = Fixture::new()?;
    let mut sandbox = Sandbox::<ScriptedRuntime>::new(
        fixture.config(),
        MemoryInput::new(),
        MemoryOutput::unbounded(),
    );
    let err = sandbox
        .start(|_| Err("interpreter image is corrupt".into()))
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "bootstrap failed: interpreter image is corrupt"
    );
    assert_eq!(sandbox.state(), SandboxState::Stopped);
    Ok(())
}

#[test]
fn environment_reaches_the_runtime() -> Result<()> {
    let fixture = Fixture::new()?;
    let journal = Journal::default();
    let mut config = fixture.config();
    let imports = fixture.path("imports");
    config.env("LANG", "C.UTF-8").apply_env_from(|key| {
        (key == ENV_IMPORT_DIR).then(|| imports.display().to_string())
    });

    let (mut sandbox, output) = sandbox(
        config,
        vec![
            request("env", ENV_TRANSPORT),
            request("env", ENV_IMPORT_DIR),
            request("env", "LANG"),
            request("exists", "/imports/helpers.py"),
        ],
        &journal,
    );
    sandbox.start(scripted(&journal))?;
    sandbox.load_and_run()?;

    assert_eq!(
        responses(&output)?,
        [
            Value::from(DEFAULT_TRANSPORT),
            Value::from("/imports"),
            Value::from("C.UTF-8"),
            Value::Bool(true),
        ]
    );
    Ok(())
}

#[test]
fn sandboxes_do_not_share_admin_state() -> Result<()> {
    let fixture = Fixture::new()?;
    let journal = Journal::default();
    let (mut first, _) = sandbox(fixture.config(), vec![], &journal);
    let (second, _) = sandbox(fixture.config(), vec![], &journal);

    first.start(scripted(&journal))?;
    assert!(!first.is_admin());
    assert!(!second.is_admin());
    assert_eq!(second.state(), SandboxState::Uninitialized);
    Ok(())
}
