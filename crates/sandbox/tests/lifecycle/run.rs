use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use pybox::{
    Error, Manifest, MemoryOutput, RunSummary, Sandbox, SandboxState, TRACE_TARGET_SANDBOX,
    marshal::Value,
};
use tracing::Level;

use super::common::{
    Capture, Fixture, Journal, JournalInput, ScriptedRuntime, request, responses, sandbox,
    scripted,
};

#[test]
fn package_misses_are_only_logged() -> Result<()> {
    let fixture = Fixture::new()?;
    let journal = Journal::default();
    let capture = Capture::default();
    let _guard = capture.install();

    let mut config = fixture.config();
    config.manifest(
        [
            ("foo", "1.0"),
            ("typing-extensions", "4.2"),
            ("dup", "2.0"),
            ("absent", "9.9"),
            ("broken", "0.1"),
        ]
        .into_iter()
        .collect::<Manifest>(),
    );
    let (mut sandbox, output) = sandbox(config, vec![request("packages", Value::None)], &journal);
    sandbox.start(scripted(&journal))?;
    let summary = sandbox.load_and_run()?;

    assert_eq!(summary.failures, 0);
    assert_eq!(
        responses(&output)?,
        [Value::List(vec![
            Value::from("foo"),
            Value::from("typing-extensions"),
        ])]
    );
    assert_eq!(
        sandbox
            .loaded_packages()
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>(),
        ["foo", "typing-extensions"]
    );

    let skipped: Vec<_> = capture
        .events()
        .into_iter()
        .filter(|e| e.level == Level::WARN && e.target == TRACE_TARGET_SANDBOX)
        .filter_map(|e| e.field("package").map(str::to_string))
        .collect();
    assert_eq!(skipped, ["dup", "absent", "broken"]);
    assert!(capture.messages(Level::ERROR).is_empty());
    Ok(())
}

#[test]
fn sources_are_copied_into_the_work_path() -> Result<()> {
    let fixture = Fixture::new()?;
    let journal = Journal::default();
    let mut config = fixture.config();
    config.source_dir(fixture.path("source"));

    let (mut sandbox, output) = sandbox(
        config,
        vec![
            request("read", "/home/sandbox/sub/util.py"),
            request("exists", "/home/sandbox/main.py"),
            request("exists", "/tmp/pybox-staging"),
        ],
        &journal,
    );
    sandbox.start(scripted(&journal))?;
    sandbox.load_and_run()?;

    assert_eq!(
        responses(&output)?,
        [
            Value::from("VALUE = 1"),
            Value::Bool(true),
            Value::Bool(false),
        ]
    );
    Ok(())
}

#[test]
fn missing_source_dir_aborts_the_run() -> Result<()> {
    let fixture = Fixture::new()?;
    let journal = Journal::default();
    let mut config = fixture.config();
    config.source_dir(fixture.path("no-such-source"));

    let (mut sandbox, output) = sandbox(config, vec![request("echo", 1)], &journal);
    sandbox.start(scripted(&journal))?;
    assert!(matches!(sandbox.load_and_run(), Err(Error::Fs(_))));
    assert_eq!(sandbox.state(), SandboxState::Stopped);
    assert!(output.is_empty());
    Ok(())
}

#[test]
fn workload_errors_stay_off_the_data_channel() -> Result<()> {
    let fixture = Fixture::new()?;
    let journal = Journal::default();
    let capture = Capture::default();
    let _guard = capture.install();

    let (mut sandbox, output) = sandbox(
        fixture.config(),
        vec![
            request("fail", "boom"),
            request("echo", 1),
            request("print", "hello"),
            request("mystery", Value::None),
            request("echo", "still alive"),
        ],
        &journal,
    );
    sandbox.start(scripted(&journal))?;
    let summary = sandbox.load_and_run()?;

    assert_eq!(
        summary,
        RunSummary {
            requests: 5,
            responses: 2,
            failures: 2,
        }
    );
    assert_eq!(
        responses(&output)?,
        [Value::Int(1), Value::from("still alive")]
    );
    assert_eq!(
        capture.messages(Level::ERROR),
        ["[sandbox] boom", "[sandbox] unknown op \"mystery\""]
    );
    assert!(
        capture
            .messages(Level::INFO)
            .contains(&"[sandbox] hello".to_string())
    );
    Ok(())
}

#[test]
fn malformed_input_does_not_stop_the_loop() -> Result<()> {
    let fixture = Fixture::new()?;
    let journal = Journal::default();
    let capture = Capture::default();
    let _guard = capture.install();

    let tail = request("echo", "tail");
    let (mut sandbox, output) = sandbox(
        fixture.config(),
        vec![
            Bytes::from_static(b"Z"),
            request("echo", "after"),
            tail.slice(..3),
        ],
        &journal,
    );
    sandbox.start(scripted(&journal))?;
    let summary = sandbox.load_and_run()?;

    assert_eq!(summary.failures, 2);
    assert_eq!(responses(&output)?, [Value::from("after")]);
    let errors = capture.messages(Level::ERROR);
    assert_eq!(errors.len(), 2, "errors: {errors:?}");
    assert!(errors[0].contains("unknown tag 0x5a"), "{}", errors[0]);
    assert!(errors[1].contains("unexpected end"), "{}", errors[1]);
    Ok(())
}

#[test]
fn requests_may_span_chunks() -> Result<()> {
    let fixture = Fixture::new()?;
    let journal = Journal::default();

    let mut stream = request("echo", "split").to_vec();
    stream.extend_from_slice(&request("echo", 42));
    let chunks = stream
        .chunks(3)
        .map(Bytes::copy_from_slice)
        .collect::<Vec<_>>();

    let (mut sandbox, output) = sandbox(fixture.config(), chunks, &journal);
    sandbox.start(scripted(&journal))?;
    let summary = sandbox.load_and_run()?;

    assert_eq!(summary.requests, 2);
    assert_eq!(responses(&output)?, [Value::from("split"), Value::Int(42)]);
    Ok(())
}

#[test]
fn teardown_detaches_input_first() -> Result<()> {
    let fixture = Fixture::new()?;
    let journal = Journal::default();
    let (mut sandbox, _output) = sandbox(fixture.config(), vec![request("echo", 1)], &journal);
    sandbox.start(scripted(&journal))?;
    sandbox.load_and_run()?;

    assert_eq!(sandbox.state(), SandboxState::Stopped);
    assert_eq!(
        *journal.lock(),
        ["bootstrap", "timer fired", "input.detach", "runtime.shutdown"]
    );

    sandbox.shutdown();
    assert_eq!(journal.lock().len(), 4);
    Ok(())
}

#[test]
fn dropping_a_ready_sandbox_tears_it_down() -> Result<()> {
    let fixture = Fixture::new()?;
    let journal = Journal::default();
    {
        let (mut sandbox, _output) = sandbox(fixture.config(), vec![], &journal);
        sandbox.start(scripted(&journal))?;
    }
    assert_eq!(
        journal.lock()[2..],
        ["input.detach".to_string(), "runtime.shutdown".to_string()]
    );
    Ok(())
}

#[test]
fn partial_write_is_fatal() -> Result<()> {
    let fixture = Fixture::new()?;
    let journal = Journal::default();
    let output = MemoryOutput::new(8);
    let mut sandbox = Sandbox::<ScriptedRuntime>::new(
        fixture.config(),
        JournalInput::new(
            vec![
                request("echo", "a response longer than eight bytes"),
                request("echo", 1),
            ],
            Arc::clone(&journal),
        ),
        output.clone(),
    );
    sandbox.start(scripted(&journal))?;

    let err = sandbox.load_and_run().unwrap_err();
    assert!(
        matches!(err, Error::PartialWrite { written: 8, expected } if expected > 8),
        "{err}"
    );
    assert_eq!(sandbox.state(), SandboxState::Stopped);
    assert_eq!(output.len(), 8);
    Ok(())
}

#[test]
fn state_transitions_are_enforced() -> Result<()> {
    let fixture = Fixture::new()?;
    let journal = Journal::default();
    let (mut sandbox, _output) = sandbox(fixture.config(), vec![], &journal);

    assert!(matches!(
        sandbox.load_and_run(),
        Err(Error::InvalidState {
            expected: SandboxState::Ready,
            actual: SandboxState::Uninitialized,
        })
    ));

    sandbox.start(scripted(&journal))?;
    assert!(matches!(
        sandbox.start(|_| Ok(ScriptedRuntime::new(Journal::default()))),
        Err(Error::InvalidState {
            expected: SandboxState::Uninitialized,
            actual: SandboxState::Ready,
        })
    ));

    assert_eq!(sandbox.load_and_run()?, RunSummary::default());
    assert!(matches!(
        sandbox.load_and_run(),
        Err(Error::InvalidState {
            actual: SandboxState::Stopped,
            ..
        })
    ));
    Ok(())
}
