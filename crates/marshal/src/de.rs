use bytes::{Buf, Bytes, BytesMut};

use crate::{Error, MarshalOptions, Result, Value, tag};

/// Largest integer magnitude a binary64 float represents exactly.
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

const MAX_DEPTH: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnmarshalOptions {
    /// Decode string payloads as text. Payloads that are not valid UTF-8
    /// stay as bytes.
    pub buffer_to_string: bool,
    /// Keep 64-bit integers beyond [`MAX_SAFE_INTEGER`] as [`Value::Int`]
    /// instead of their decimal string form.
    pub exact_int64: bool,
}

impl Default for UnmarshalOptions {
    fn default() -> Self {
        Self {
            buffer_to_string: true,
            exact_int64: false,
        }
    }
}

impl UnmarshalOptions {
    /// Decoding policy that mirrors an encoding policy.
    #[must_use]
    pub fn paired_with(options: &MarshalOptions) -> Self {
        Self {
            buffer_to_string: options.string_to_buffer,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn buffer_to_string(mut self, buffer_to_string: bool) -> Self {
        self.buffer_to_string = buffer_to_string;
        self
    }

    #[must_use]
    pub const fn exact_int64(mut self, exact_int64: bool) -> Self {
        self.exact_int64 = exact_int64;
        self
    }
}

/// Incremental decoder.
///
/// Bytes are [`push`](Self::push)ed as they arrive; complete top-level values
/// are pulled with [`next_value`](Self::next_value) or [`drain`](Self::drain).
/// A value that is still missing bytes stays buffered until more arrive.
///
/// The intern table lives as long as this decoder and is never shared. It
/// only grows when a top-level value decodes completely, so a partial or
/// failed value leaves it as it was after the last good value.
#[derive(Debug, Default)]
pub struct Unmarshaller {
    pending: BytesMut,
    scan: Scan,
    interned: Vec<Bytes>,
    options: UnmarshalOptions,
}

enum Step {
    Incomplete,
    Failed(Error),
}

impl From<Error> for Step {
    fn from(value: Error) -> Self {
        Self::Failed(value)
    }
}

type StepResult<T> = core::result::Result<T, Step>;

impl Unmarshaller {
    #[must_use]
    pub fn new(options: UnmarshalOptions) -> Self {
        Self {
            pending: BytesMut::new(),
            scan: Scan::default(),
            interned: Vec::new(),
            options,
        }
    }

    #[must_use]
    pub const fn options(&self) -> &UnmarshalOptions {
        &self.options
    }

    pub fn push(&mut self, chunk: impl AsRef<[u8]>) {
        self.pending.extend_from_slice(chunk.as_ref());
    }

    /// Number of buffered bytes not yet consumed by a complete value.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn intern_table(&self) -> &[Bytes] {
        &self.interned
    }

    /// Decode the next complete top-level value, if one is buffered.
    ///
    /// # Errors
    /// Returns an error for malformed input. The bytes of the offending value
    /// are discarded; the intern table keeps its previous contents.
    pub fn next_value(&mut self) -> Result<Option<Value>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        if let Progress::Pending = self.scan.advance(&self.pending) {
            return Ok(None);
        }
        self.scan = Scan::default();

        let checkpoint = self.interned.len();
        let mut reader = Reader {
            data: &self.pending,
            pos: 0,
            interned: &mut self.interned,
            options: self.options,
        };
        match reader.value(0) {
            Ok(value) => {
                let consumed = reader.pos;
                self.pending.advance(consumed);
                Ok(Some(value))
            }
            Err(Step::Incomplete) => {
                self.interned.truncate(checkpoint);
                Ok(None)
            }
            Err(Step::Failed(e)) => {
                self.interned.truncate(checkpoint);
                self.pending.clear();
                Err(e)
            }
        }
    }

    /// Iterate over every complete value currently buffered.
    pub fn drain(&mut self) -> Drain<'_> {
        Drain { inner: self }
    }

    /// Close the stream.
    ///
    /// # Errors
    /// Returns [`Error::UnexpectedEof`] if a partial value is still buffered.
    pub fn finish(&mut self) -> Result<()> {
        self.scan = Scan::default();
        if self.pending.is_empty() {
            Ok(())
        } else {
            self.pending.clear();
            Err(Error::UnexpectedEof)
        }
    }
}

pub struct Drain<'a> {
    inner: &'a mut Unmarshaller,
}

impl Iterator for Drain<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next_value().transpose()
    }
}

/// Decode exactly one value from a complete buffer.
///
/// # Errors
/// Returns [`Error::UnexpectedEof`] if `data` ends mid-value and
/// [`Error::TrailingBytes`] if anything follows the value.
pub fn from_bytes(data: &[u8], options: UnmarshalOptions) -> Result<Value> {
    let mut de = Unmarshaller::new(options);
    de.push(data);
    let value = de.next_value()?.ok_or(Error::UnexpectedEof)?;
    if de.buffered() > 0 {
        return Err(Error::TrailingBytes);
    }
    Ok(value)
}

enum Progress {
    Pending,
    Ready,
}

#[derive(Debug)]
enum Open {
    /// Elements still expected.
    List(u32),
    Dict { key_done: bool },
}

/// Resumable completeness check for the value at the front of the buffer.
///
/// Walks tags and length prefixes without building anything and remembers
/// where it stopped, so each buffered byte is inspected once however the
/// input is chunked. The full decode only runs once the value is complete or
/// the scan meets a byte it cannot judge, in which case the decode reports
/// the error.
#[derive(Debug, Default)]
struct Scan {
    pos: usize,
    open: Vec<Open>,
}

fn u32_at(data: &[u8], at: usize) -> Option<u32> {
    let raw = data.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes(raw.try_into().ok()?))
}

impl Scan {
    fn advance(&mut self, data: &[u8]) -> Progress {
        loop {
            let Some(&byte) = data.get(self.pos) else {
                return Progress::Pending;
            };
            if byte == tag::DICT_END
                && matches!(self.open.last(), Some(Open::Dict { key_done: false }))
            {
                self.pos += 1;
                self.open.pop();
                if self.close_item() {
                    return Progress::Ready;
                }
                continue;
            }
            if self.open.len() > MAX_DEPTH {
                return Progress::Ready;
            }

            let len = match byte {
                tag::NONE | tag::TRUE | tag::FALSE | tag::DICT => 1,
                tag::INT32 | tag::REF | tag::LIST => 5,
                tag::INT64 | tag::FLOAT_BINARY => 9,
                tag::FLOAT_TEXT | tag::STRING | tag::INTERNED => {
                    let Some(n) = u32_at(data, self.pos + 1) else {
                        return Progress::Pending;
                    };
                    5_usize.saturating_add(n as usize)
                }
                _ => return Progress::Ready,
            };
            let Some(end) = self.pos.checked_add(len).filter(|&end| end <= data.len()) else {
                return Progress::Pending;
            };

            match byte {
                tag::LIST => match u32_at(data, self.pos + 1) {
                    Some(count) if count > 0 => {
                        self.pos = end;
                        self.open.push(Open::List(count));
                        continue;
                    }
                    _ => self.pos = end,
                },
                tag::DICT => {
                    self.pos = end;
                    self.open.push(Open::Dict { key_done: false });
                    continue;
                }
                _ => self.pos = end,
            }
            if self.close_item() {
                return Progress::Ready;
            }
        }
    }

    /// Account for one finished value. Returns `true` once the top-level
    /// value is complete.
    fn close_item(&mut self) -> bool {
        loop {
            match self.open.last_mut() {
                None => return true,
                Some(Open::List(remaining)) => {
                    *remaining -= 1;
                    if *remaining > 0 {
                        return false;
                    }
                    self.open.pop();
                }
                Some(Open::Dict { key_done }) => {
                    *key_done = !*key_done;
                    return false;
                }
            }
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    interned: &'a mut Vec<Bytes>,
    options: UnmarshalOptions,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> StepResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(Step::Incomplete)?;
        let slice = self.data.get(self.pos..end).ok_or(Step::Incomplete)?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> StepResult<[u8; N]> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> StepResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> StepResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn peek(&self) -> StepResult<u8> {
        self.data.get(self.pos).copied().ok_or(Step::Incomplete)
    }

    fn sized(&mut self) -> StepResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&self, raw: Bytes) -> Value {
        if !self.options.buffer_to_string {
            return Value::Bytes(raw);
        }
        match String::from_utf8(raw.to_vec()) {
            Ok(s) => Value::Str(s),
            Err(_) => Value::Bytes(raw),
        }
    }

    fn int64(&mut self) -> StepResult<Value> {
        let lo = u32::from_le_bytes(self.array()?);
        let hi = i32::from_le_bytes(self.array()?);
        let v = (i64::from(hi) << 32) | i64::from(lo);
        if !self.options.exact_int64 && v.unsigned_abs() > MAX_SAFE_INTEGER.unsigned_abs() {
            return Ok(Value::Str(v.to_string()));
        }
        Ok(Value::Int(v))
    }

    fn value(&mut self, depth: usize) -> StepResult<Value> {
        if depth > MAX_DEPTH {
            return Err(Error::DepthExceeded(MAX_DEPTH).into());
        }

        let byte = self.u8()?;
        Ok(match byte {
            tag::NONE => Value::None,
            tag::TRUE => Value::Bool(true),
            tag::FALSE => Value::Bool(false),
            tag::INT32 => Value::Int(i32::from_le_bytes(self.array()?).into()),
            tag::INT64 => self.int64()?,
            tag::FLOAT_TEXT => {
                let raw = self.sized()?;
                let text = String::from_utf8_lossy(raw);
                let v = text
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| Error::InvalidFloat(text.to_string()))?;
                Value::Float(v)
            }
            tag::FLOAT_BINARY => Value::Float(f64::from_le_bytes(self.array()?)),
            tag::STRING => {
                let raw = Bytes::copy_from_slice(self.sized()?);
                self.string(raw)
            }
            tag::INTERNED => {
                let raw = Bytes::copy_from_slice(self.sized()?);
                self.interned.push(raw.clone());
                self.string(raw)
            }
            tag::REF => {
                let index = self.u32()?;
                let raw = self
                    .interned
                    .get(index as usize)
                    .cloned()
                    .ok_or(Error::InvalidBackReference {
                        index,
                        len: self.interned.len(),
                    })?;
                self.string(raw)
            }
            tag::LIST => {
                let count = self.u32()? as usize;
                // Every element takes at least one byte.
                let mut items = Vec::with_capacity(count.min(self.data.len() - self.pos));
                for _ in 0..count {
                    items.push(self.value(depth + 1)?);
                }
                Value::List(items)
            }
            tag::DICT => {
                let mut entries = Vec::new();
                while self.peek()? != tag::DICT_END {
                    let key = self.value(depth + 1)?;
                    let value = self.value(depth + 1)?;
                    entries.push((key, value));
                }
                self.pos += 1;
                Value::Dict(entries)
            }
            other => return Err(Error::UnknownTag { tag: other }.into()),
        })
    }
}
