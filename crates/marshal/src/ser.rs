use bytes::Bytes;
use serde::{Serialize, ser};

use crate::{Error, MemBuffer, Result, Value, tag};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarshalOptions {
    /// Strings are sent as byte buffers. The wire form is identical either
    /// way; the decoding side mirrors this through
    /// [`UnmarshalOptions::paired_with`](crate::UnmarshalOptions::paired_with).
    pub string_to_buffer: bool,
    /// Format version. `0` writes floats as decimal text, `2` and above as
    /// IEEE-754 binary64.
    pub version: u8,
}

impl Default for MarshalOptions {
    fn default() -> Self {
        Self {
            string_to_buffer: true,
            version: 2,
        }
    }
}

impl MarshalOptions {
    #[must_use]
    pub const fn version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub const fn string_to_buffer(mut self, string_to_buffer: bool) -> Self {
        self.string_to_buffer = string_to_buffer;
        self
    }

    #[must_use]
    pub const fn binary_floats(&self) -> bool {
        self.version >= 2
    }
}

/// Writes tagged values into a [`MemBuffer`].
///
/// Strings are never interned implicitly. Callers that want the compact
/// form use [`Marshaller::define_interned`] and [`Marshaller::interned_ref`].
#[derive(Debug, Default)]
pub struct Marshaller {
    buf: MemBuffer,
    options: MarshalOptions,
    interned: u32,
}

impl Marshaller {
    #[must_use]
    pub fn new(options: MarshalOptions) -> Self {
        Self {
            buf: MemBuffer::new(),
            options,
            interned: 0,
        }
    }

    #[must_use]
    pub const fn options(&self) -> &MarshalOptions {
        &self.options
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn write_none(&mut self) {
        self.buf.push_u8(tag::NONE);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push_u8(if v { tag::TRUE } else { tag::FALSE });
    }

    pub fn write_int(&mut self, v: i64) {
        if let Ok(small) = i32::try_from(v) {
            self.buf.push_u8(tag::INT32);
            self.buf.push_i32_le(small);
        } else {
            self.buf.push_u8(tag::INT64);
            self.buf.push_i64_le(v);
        }
    }

    /// # Errors
    /// Returns [`Error::IntOutOfRange`] if `v` does not fit in an `i64`.
    pub fn write_wide_int(&mut self, v: i128) -> Result<()> {
        let v = i64::try_from(v).map_err(|_| Error::IntOutOfRange)?;
        self.write_int(v);
        Ok(())
    }

    /// # Errors
    /// Returns an error if the text form is longer than a length prefix allows.
    pub fn write_float(&mut self, v: f64) -> Result<()> {
        if self.options.binary_floats() {
            self.buf.push_u8(tag::FLOAT_BINARY);
            self.buf.push_f64_le(v);
            Ok(())
        } else {
            // Debug formatting is the shortest text that parses back exactly.
            let text = format!("{v:?}");
            self.write_sized(tag::FLOAT_TEXT, text.as_bytes())
        }
    }

    /// # Errors
    /// Returns an error if `v` is longer than a length prefix allows.
    pub fn write_str(&mut self, v: &str) -> Result<()> {
        self.write_sized(tag::STRING, v.as_bytes())
    }

    /// # Errors
    /// Returns an error if `v` is longer than a length prefix allows.
    pub fn write_bytes(&mut self, v: &[u8]) -> Result<()> {
        self.write_sized(tag::STRING, v)
    }

    /// Write `v` as an interned string and return the index later
    /// [`Marshaller::interned_ref`] calls can refer to.
    ///
    /// # Errors
    /// Returns an error if `v` is longer than a length prefix allows.
    pub fn define_interned(&mut self, v: &str) -> Result<u32> {
        self.write_sized(tag::INTERNED, v.as_bytes())?;
        let index = self.interned;
        self.interned += 1;
        Ok(index)
    }

    /// # Errors
    /// Returns [`Error::InvalidBackReference`] if `index` was never defined by
    /// this marshaller.
    pub fn interned_ref(&mut self, index: u32) -> Result<()> {
        if index >= self.interned {
            return Err(Error::InvalidBackReference {
                index,
                len: self.interned as usize,
            });
        }
        self.buf.push_u8(tag::REF);
        self.buf.push_u32_le(index);
        Ok(())
    }

    /// Start a list of exactly `len` values.
    ///
    /// # Errors
    /// Returns an error if `len` does not fit the count prefix.
    pub fn begin_list(&mut self, len: usize) -> Result<()> {
        let len = u32::try_from(len).map_err(|_| Error::LengthOverflow(len))?;
        self.buf.push_u8(tag::LIST);
        self.buf.push_u32_le(len);
        Ok(())
    }

    pub fn begin_dict(&mut self) {
        self.buf.push_u8(tag::DICT);
    }

    pub fn end_dict(&mut self) {
        self.buf.push_u8(tag::DICT_END);
    }

    /// # Errors
    /// Returns an error if a string or container is too large to encode.
    pub fn write_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::None => self.write_none(),
            Value::Bool(b) => self.write_bool(*b),
            Value::Int(i) => self.write_int(*i),
            Value::Float(f) => self.write_float(*f)?,
            Value::Str(s) => self.write_str(s)?,
            Value::Bytes(b) => self.write_bytes(b)?,
            Value::List(items) => {
                self.begin_list(items.len())?;
                for item in items {
                    self.write_value(item)?;
                }
            }
            Value::Dict(entries) => {
                self.begin_dict();
                for (k, v) in entries {
                    self.write_value(k)?;
                    self.write_value(v)?;
                }
                self.end_dict();
            }
        }
        Ok(())
    }

    fn write_sized(&mut self, tag: u8, payload: &[u8]) -> Result<()> {
        let len =
            u32::try_from(payload.len()).map_err(|_| Error::LengthOverflow(payload.len()))?;
        self.buf.push_u8(tag);
        self.buf.push_u32_le(len);
        self.buf.push_slice(payload);
        Ok(())
    }

    fn begin_deferred_list(&mut self) -> usize {
        self.buf.push_u8(tag::LIST);
        self.buf.reserve_u32()
    }

    fn end_deferred_list(&mut self, offset: usize, count: usize) -> Result<()> {
        let count = u32::try_from(count).map_err(|_| Error::LengthOverflow(count))?;
        self.buf.patch_u32_le(offset, count);
        Ok(())
    }
}

/// Encode any serializable value.
///
/// # Errors
/// Returns an error if an integer exceeds the `i64` range or a string or
/// container is too large to encode.
pub fn to_bytes<T: Serialize + ?Sized>(value: &T, options: MarshalOptions) -> Result<Bytes> {
    let mut marshaller = Marshaller::new(options);
    value.serialize(&mut marshaller)?;
    Ok(marshaller.finish())
}

enum CompoundKind {
    List { offset: usize, count: usize },
    VariantList { offset: usize, count: usize },
    Dict,
    VariantDict,
}

#[doc(hidden)]
pub struct Compound<'a> {
    ser: &'a mut Marshaller,
    kind: CompoundKind,
}

impl<'a> Compound<'a> {
    fn list(ser: &'a mut Marshaller) -> Self {
        let offset = ser.begin_deferred_list();
        Self {
            ser,
            kind: CompoundKind::List { offset, count: 0 },
        }
    }

    fn element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        value.serialize(&mut *self.ser)?;
        if let CompoundKind::List { count, .. } | CompoundKind::VariantList { count, .. } =
            &mut self.kind
        {
            *count += 1;
        }
        Ok(())
    }

    fn field<T: Serialize + ?Sized>(&mut self, key: &'static str, value: &T) -> Result<()> {
        self.ser.write_str(key)?;
        value.serialize(&mut *self.ser)
    }

    fn close(self) -> Result<()> {
        match self.kind {
            CompoundKind::List { offset, count } => self.ser.end_deferred_list(offset, count),
            CompoundKind::VariantList { offset, count } => {
                self.ser.end_deferred_list(offset, count)?;
                self.ser.end_dict();
                Ok(())
            }
            CompoundKind::Dict => {
                self.ser.end_dict();
                Ok(())
            }
            CompoundKind::VariantDict => {
                self.ser.end_dict();
                self.ser.end_dict();
                Ok(())
            }
        }
    }
}

impl<'a> ser::Serializer for &'a mut Marshaller {
    type Ok = ();
    type Error = Error;
    type SerializeSeq = Compound<'a>;
    type SerializeTuple = Compound<'a>;
    type SerializeTupleStruct = Compound<'a>;
    type SerializeTupleVariant = Compound<'a>;
    type SerializeMap = Compound<'a>;
    type SerializeStruct = Compound<'a>;
    type SerializeStructVariant = Compound<'a>;

    fn is_human_readable(&self) -> bool {
        false
    }

    fn serialize_bool(self, v: bool) -> Result<()> {
        self.write_bool(v);
        Ok(())
    }

    fn serialize_i8(self, v: i8) -> Result<()> {
        self.serialize_i64(v.into())
    }

    fn serialize_i16(self, v: i16) -> Result<()> {
        self.serialize_i64(v.into())
    }

    fn serialize_i32(self, v: i32) -> Result<()> {
        self.serialize_i64(v.into())
    }

    fn serialize_i64(self, v: i64) -> Result<()> {
        self.write_int(v);
        Ok(())
    }

    fn serialize_i128(self, v: i128) -> Result<()> {
        self.write_wide_int(v)
    }

    fn serialize_u8(self, v: u8) -> Result<()> {
        self.serialize_i64(v.into())
    }

    fn serialize_u16(self, v: u16) -> Result<()> {
        self.serialize_i64(v.into())
    }

    fn serialize_u32(self, v: u32) -> Result<()> {
        self.serialize_i64(v.into())
    }

    fn serialize_u64(self, v: u64) -> Result<()> {
        self.write_wide_int(v.into())
    }

    fn serialize_u128(self, v: u128) -> Result<()> {
        let v = i128::try_from(v).map_err(|_| Error::IntOutOfRange)?;
        self.write_wide_int(v)
    }

    fn serialize_f32(self, v: f32) -> Result<()> {
        self.write_float(v.into())
    }

    fn serialize_f64(self, v: f64) -> Result<()> {
        self.write_float(v)
    }

    fn serialize_char(self, v: char) -> Result<()> {
        self.write_str(v.encode_utf8(&mut [0; 4]))
    }

    fn serialize_str(self, v: &str) -> Result<()> {
        self.write_str(v)
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<()> {
        self.write_bytes(v)
    }

    fn serialize_none(self) -> Result<()> {
        self.write_none();
        Ok(())
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<()> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<()> {
        self.write_none();
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<()> {
        self.serialize_unit()
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<()> {
        self.write_str(variant)
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<()> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<()> {
        self.begin_dict();
        self.write_str(variant)?;
        value.serialize(&mut *self)?;
        self.end_dict();
        Ok(())
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Compound<'a>> {
        Ok(Compound::list(self))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Compound<'a>> {
        Ok(Compound::list(self))
    }

    fn serialize_tuple_struct(self, _name: &'static str, _len: usize) -> Result<Compound<'a>> {
        Ok(Compound::list(self))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Compound<'a>> {
        self.begin_dict();
        self.write_str(variant)?;
        let offset = self.begin_deferred_list();
        Ok(Compound {
            ser: self,
            kind: CompoundKind::VariantList { offset, count: 0 },
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Compound<'a>> {
        self.begin_dict();
        Ok(Compound {
            ser: self,
            kind: CompoundKind::Dict,
        })
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Compound<'a>> {
        self.serialize_map(None)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Compound<'a>> {
        self.begin_dict();
        self.write_str(variant)?;
        self.begin_dict();
        Ok(Compound {
            ser: self,
            kind: CompoundKind::VariantDict,
        })
    }
}

impl ser::SerializeSeq for Compound<'_> {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.element(value)
    }

    fn end(self) -> Result<()> {
        self.close()
    }
}

impl ser::SerializeTuple for Compound<'_> {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.element(value)
    }

    fn end(self) -> Result<()> {
        self.close()
    }
}

impl ser::SerializeTupleStruct for Compound<'_> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.element(value)
    }

    fn end(self) -> Result<()> {
        self.close()
    }
}

impl ser::SerializeTupleVariant for Compound<'_> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.element(value)
    }

    fn end(self) -> Result<()> {
        self.close()
    }
}

impl ser::SerializeMap for Compound<'_> {
    type Ok = ();
    type Error = Error;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<()> {
        key.serialize(&mut *self.ser)
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        value.serialize(&mut *self.ser)
    }

    fn end(self) -> Result<()> {
        self.close()
    }
}

impl ser::SerializeStruct for Compound<'_> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<()> {
        self.field(key, value)
    }

    fn end(self) -> Result<()> {
        self.close()
    }
}

impl ser::SerializeStructVariant for Compound<'_> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<()> {
        self.field(key, value)
    }

    fn end(self) -> Result<()> {
        self.close()
    }
}
