//! Capabilities available only while bootstrap code runs.
//!
//! Each sandbox owns its own [`AdminMode`] flag. It starts active when the
//! sandbox begins initializing and is revoked for good once bootstrap ends;
//! every privileged capability checks it on use.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use pybox_marshal::Value;

use crate::{
    TRACE_TARGET_SANDBOX,
    channel::SharedOutput,
    error::{Error, Result},
};

/// One-way trust flag: active, then revoked forever.
#[derive(Clone, Debug, Default)]
pub struct AdminMode(Arc<AtomicBool>);

impl AdminMode {
    pub(crate) fn enter() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn revoke(&self) {
        if self.0.swap(false, Ordering::AcqRel) {
            tracing::debug!(target: TRACE_TARGET_SANDBOX, "admin mode revoked");
        }
    }

    /// # Errors
    /// Returns [`Error::IsolationViolation`] naming `what` once revoked.
    pub fn check(&self, what: &'static str) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::IsolationViolation(what))
        }
    }
}

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug)]
struct TimerSlot {
    state: AtomicU8,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerSlot {
    fn cancel(&self) {
        let _ = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire);
        if let Some(thread) = &*self.thread.lock() {
            thread.thread().unpark();
        }
    }

    fn join(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            tracing::warn!(target: TRACE_TARGET_SANDBOX, "timer callback panicked");
        }
    }

    fn fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }
}

/// Timer threads started by one sandbox.
#[derive(Clone, Debug, Default)]
pub(crate) struct Timers(Arc<Mutex<Vec<Arc<TimerSlot>>>>);

impl Timers {
    fn track(&self, slot: &Arc<TimerSlot>) {
        let mut slots = self.0.lock();
        slots.retain(|s| {
            s.thread
                .lock()
                .as_ref()
                .is_some_and(|thread| !thread.is_finished())
        });
        slots.push(Arc::clone(slot));
    }

    /// Cancel every pending timer and wait for its thread to exit. A callback
    /// already running is allowed to finish.
    pub(crate) fn cancel_all(&self) -> usize {
        let slots = std::mem::take(&mut *self.0.lock());
        for slot in &slots {
            slot.cancel();
        }
        let cancelled = slots
            .iter()
            .filter(|s| s.state.load(Ordering::Acquire) == CANCELLED)
            .count();
        for slot in &slots {
            slot.join();
        }
        cancelled
    }
}

/// Unrestricted timer primitive.
#[derive(Clone, Debug)]
pub struct Timer {
    admin: AdminMode,
    timers: Timers,
}

impl Timer {
    pub(crate) const fn new(admin: AdminMode, timers: Timers) -> Self {
        Self { admin, timers }
    }

    /// Run `f` on a background thread after `delay`.
    ///
    /// The thread belongs to the sandbox: tearing the sandbox down cancels
    /// it even if the returned handle was dropped.
    ///
    /// # Errors
    /// Returns [`Error::IsolationViolation`] outside bootstrap, or an I/O
    /// error if the timer thread cannot be spawned.
    pub fn set_timeout<F>(&self, delay: Duration, f: F) -> Result<TimerHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.admin.check("timer")?;

        let slot = Arc::new(TimerSlot {
            state: AtomicU8::new(PENDING),
            thread: Mutex::new(None),
        });
        let deadline = Instant::now() + delay;

        // Hold the slot lock until the handle is stored so a fast `cancel`
        // always finds the thread to unpark.
        let mut thread_slot = slot.thread.lock();
        let thread = {
            let slot = Arc::clone(&slot);
            std::thread::Builder::new()
                .name("pybox-timer".to_string())
                .spawn(move || {
                    loop {
                        if slot.state.load(Ordering::Acquire) != PENDING {
                            return;
                        }
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        std::thread::park_timeout(deadline - now);
                    }
                    if slot
                        .state
                        .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        f();
                    }
                })?
        };
        *thread_slot = Some(thread);
        drop(thread_slot);

        self.timers.track(&slot);
        Ok(TimerHandle { slot })
    }
}

#[derive(Debug)]
pub struct TimerHandle {
    slot: Arc<TimerSlot>,
}

impl TimerHandle {
    /// Prevent the callback from running if it has not started yet.
    pub fn cancel(&self) {
        self.slot.cancel();
    }

    /// Wait for the timer thread and report whether the callback ran.
    #[must_use]
    pub fn join(self) -> bool {
        self.slot.join();
        self.slot.fired()
    }
}

/// Bootstrap-only callback writing raw frames to the output channel.
#[derive(Clone)]
pub struct Outbound {
    admin: AdminMode,
    output: SharedOutput,
}

impl Outbound {
    pub(crate) const fn new(admin: AdminMode, output: SharedOutput) -> Self {
        Self { admin, output }
    }

    /// # Errors
    /// Returns [`Error::IsolationViolation`] outside bootstrap, or the output
    /// channel's error.
    pub fn send(&self, frame: &[u8]) -> Result<()> {
        self.admin.check("outbound channel")?;
        self.output.lock().write_frame(frame)
    }
}

/// Placeholder globals bootstrap code expects to find.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Shims(BTreeMap<String, Value>);

impl Shims {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a benign placeholder under `name`.
    pub fn insert(&mut self, name: impl Into<String>) {
        self.0.insert(name.into(), Value::None);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for Shims {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut shims = Self::new();
        for name in iter {
            shims.insert(name);
        }
        shims
    }
}

/// Everything bootstrap code is allowed to use, handed over explicitly.
#[derive(Clone)]
pub struct BootstrapCapabilities {
    pub timer: Timer,
    pub outbound: Outbound,
    shims: Shims,
    admin: AdminMode,
}

impl BootstrapCapabilities {
    pub(crate) fn new(
        admin: &AdminMode,
        timers: &Timers,
        output: &SharedOutput,
        shims: Shims,
    ) -> Self {
        Self {
            timer: Timer::new(admin.clone(), timers.clone()),
            outbound: Outbound::new(admin.clone(), Arc::clone(output)),
            shims,
            admin: admin.clone(),
        }
    }

    /// Placeholder globals, readable only while bootstrap runs.
    ///
    /// # Errors
    /// Returns [`Error::IsolationViolation`] once admin mode is revoked.
    pub fn shims(&self) -> Result<&Shims> {
        self.admin.check("shims")?;
        Ok(&self.shims)
    }
}
