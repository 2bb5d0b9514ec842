//! Line-oriented forwarding of runtime text output to `tracing`.

use std::borrow::Cow;

use smallvec::SmallVec;

use crate::TRACE_TARGET_SANDBOX;

/// Tag prepended to every forwarded line.
pub const LOG_PREFIX: &str = "[sandbox]";

const MAX_UTF8_BYTES: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Level {
    Info,
    Error,
}

/// Collects text written by the runtime and forwards it line by line.
///
/// Bytes may arrive split anywhere, including inside a multi-byte character;
/// incomplete sequences are held until the rest arrives.
#[derive(Debug, Default)]
pub struct LogBuffer {
    line: String,
    partial: SmallVec<[u8; MAX_UTF8_BYTES]>,
    pending: Vec<(Level, String)>,
}

impl LogBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_str(&mut self, s: &str) {
        if !self.partial.is_empty() {
            // A dangling sequence followed by text can never complete.
            self.line.push(char::REPLACEMENT_CHARACTER);
            self.partial.clear();
        }
        self.append(s);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.partial.is_empty() {
            let (s, rest) = decode_utf8(bytes);
            self.append(&s);
            self.partial = rest;
        } else {
            let mut buf = Vec::with_capacity(self.partial.len() + bytes.len());
            buf.extend_from_slice(&self.partial);
            buf.extend_from_slice(bytes);
            let (s, rest) = decode_utf8(&buf);
            self.append(&s);
            self.partial = rest;
        }
    }

    /// Record an error report as its own entry.
    pub fn error(&mut self, message: impl std::fmt::Display) {
        self.take_line();
        for line in message.to_string().lines() {
            self.pending.push((Level::Error, line.to_string()));
        }
    }

    /// Forward everything collected so far, including an unterminated last
    /// line, and return the prefixed lines.
    pub fn flush(&mut self) -> Vec<String> {
        if !self.partial.is_empty() {
            self.line.push_str(&String::from_utf8_lossy(&self.partial));
            self.partial.clear();
        }
        self.take_line();

        self.pending
            .drain(..)
            .map(|(level, line)| {
                match level {
                    Level::Info => {
                        tracing::info!(target: TRACE_TARGET_SANDBOX, "{LOG_PREFIX} {line}");
                    }
                    Level::Error => {
                        tracing::error!(target: TRACE_TARGET_SANDBOX, "{LOG_PREFIX} {line}");
                    }
                }
                format!("{LOG_PREFIX} {line}")
            })
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.line.is_empty() && self.partial.is_empty() && self.pending.is_empty()
    }

    fn append(&mut self, s: &str) {
        let mut rest = s;
        while let Some(pos) = rest.find('\n') {
            let (head, tail) = rest.split_at(pos);
            self.line.push_str(head.strip_suffix('\r').unwrap_or(head));
            let line = std::mem::take(&mut self.line);
            self.pending.push((Level::Info, line));
            rest = &tail[1..];
        }
        self.line.push_str(rest);
    }

    fn take_line(&mut self) {
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            self.pending.push((Level::Info, line));
        }
    }
}

/// Decode as much valid UTF-8 as possible, returning the decoded text and any
/// trailing bytes of an incomplete multi-byte sequence.
fn decode_utf8(buf: &[u8]) -> (Cow<'_, str>, SmallVec<[u8; MAX_UTF8_BYTES]>) {
    match std::str::from_utf8(buf) {
        Ok(s) => (s.into(), SmallVec::new_const()),
        Err(error) if error.error_len().is_none() => {
            let (valid, rest) = buf.split_at(error.valid_up_to());
            (String::from_utf8_lossy(valid), SmallVec::from_slice(rest))
        }
        Err(_) => (String::from_utf8_lossy(buf), SmallVec::new_const()),
    }
}
