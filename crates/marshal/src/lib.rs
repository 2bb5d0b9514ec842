//! Tagged binary codec for values exchanged with a sandboxed interpreter.
//!
//! Every value starts with a one-byte tag followed by a little-endian payload
//! (see [`tag`]). [`Marshaller`] writes values, [`Unmarshaller`] reads them
//! back from arbitrarily chunked input.

pub mod buffer;
pub mod de;
pub mod ser;
pub mod value;

use thiserror::Error;

pub use buffer::MemBuffer;
pub use de::{MAX_SAFE_INTEGER, UnmarshalOptions, Unmarshaller, from_bytes};
pub use ser::{MarshalOptions, Marshaller, to_bytes};
pub use value::Value;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Wire tags. Each encoded value begins with exactly one of these bytes.
pub mod tag {
    pub const NONE: u8 = b'N';
    pub const TRUE: u8 = b'T';
    pub const FALSE: u8 = b'F';
    pub const INT32: u8 = b'i';
    pub const INT64: u8 = b'I';
    pub const FLOAT_TEXT: u8 = b'f';
    pub const FLOAT_BINARY: u8 = b'g';
    pub const STRING: u8 = b's';
    pub const INTERNED: u8 = b't';
    pub const REF: u8 = b'R';
    pub const LIST: u8 = b'[';
    pub const DICT: u8 = b'{';
    pub const DICT_END: u8 = b'0';
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown tag {tag:#04x}")]
    UnknownTag { tag: u8 },
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("invalid back-reference {index} (intern table holds {len})")]
    InvalidBackReference { index: u32, len: usize },
    #[error("int64 exceeds representable range")]
    IntOutOfRange,
    #[error("invalid float text {0:?}")]
    InvalidFloat(String),
    #[error("length {0} does not fit the 32-bit length prefix")]
    LengthOverflow(usize),
    #[error("nesting deeper than {0} levels")]
    DepthExceeded(usize),
    #[error("trailing bytes after value")]
    TrailingBytes,
    #[error("UTF-8 encoding error")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("JSON serialization error")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Custom(String),
}

impl serde::ser::Error for Error {
    fn custom<T: core::fmt::Display>(msg: T) -> Self {
        Self::Custom(msg.to_string())
    }
}

/// Decode a value into any deserializable type.
///
/// Goes through the JSON view of the value, so byte strings arrive as
/// base64 text and non-string dict keys as their JSON rendering.
///
/// # Errors
/// Returns an error if the value does not match the shape of `T`.
pub fn from_value<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T> {
    Ok(serde_json::from_value(value.to_json_value())?)
}
