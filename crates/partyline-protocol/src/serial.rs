//! The serialization registry: built-in encodings plus user message codecs.
//!
//! Built-in types are encoded directly (see the crate docs for the layout).
//! User types go through a codec triple registered at startup:
//!
//! ```text
//! [type id: u64][body length: u32][body: byte_len bytes]
//! ```
//!
//! The registry is shared (`Arc<SerialRegistry>`) between a server and all
//! of its connections, so it uses interior locking. Registration is expected
//! during startup; lookups happen on every decoded message parameter.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::bytes::{ByteReader, WriteExt};
use crate::error::ProtocolError;
use crate::types::MessageTypeId;
use crate::value::{Message, MessageValue, TypeTag, Value};

type EncodeFn = Box<dyn Fn(&(dyn Any + Send + Sync), &mut Vec<u8>) -> Result<(), ProtocolError> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&mut ByteReader<'_>) -> Result<Box<dyn Any + Send + Sync>, ProtocolError> + Send + Sync>;
type ByteLenFn = Box<dyn Fn(&(dyn Any + Send + Sync)) -> Result<usize, ProtocolError> + Send + Sync>;

/// One registered user type.
struct MessageCodec {
    name: String,
    encode: EncodeFn,
    decode: DecodeFn,
    byte_len: ByteLenFn,
}

#[derive(Default)]
struct Tables {
    by_id: HashMap<MessageTypeId, Arc<MessageCodec>>,
    by_rust_type: HashMap<TypeId, MessageTypeId>,
}

/// Encodes and decodes [`Value`]s, including registered user types.
#[derive(Default)]
pub struct SerialRegistry {
    tables: RwLock<Tables>,
}

impl SerialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a user type under `name` with an explicit codec triple.
    ///
    /// Fails with [`ProtocolError::DuplicateType`] if `T` is already
    /// registered, or if another type already uses `name`.
    pub fn register<T, E, D, L>(&self, name: &str, encode: E, decode: D, byte_len: L) -> Result<MessageTypeId, ProtocolError>
    where
        T: Any + Send + Sync,
        E: Fn(&T, &mut Vec<u8>) + Send + Sync + 'static,
        D: Fn(&mut ByteReader<'_>) -> Result<T, ProtocolError> + Send + Sync + 'static,
        L: Fn(&T) -> usize + Send + Sync + 'static,
    {
        let id = MessageTypeId::from_name(name);
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if tables.by_rust_type.contains_key(&TypeId::of::<T>()) || tables.by_id.contains_key(&id) {
            return Err(ProtocolError::DuplicateType(name.to_owned()));
        }

        let type_name = name.to_owned();
        let wrong_type = move || ProtocolError::TypeMismatch {
            expected: type_name.clone(),
            found: "another type".to_owned(),
        };
        let wrong_type_len = wrong_type.clone();

        let codec = MessageCodec {
            name: name.to_owned(),
            encode: Box::new(move |value: &(dyn Any + Send + Sync), out: &mut Vec<u8>| {
                let value = value.downcast_ref::<T>().ok_or_else(&wrong_type)?;
                encode(value, out);
                Ok(())
            }),
            decode: Box::new(move |reader: &mut ByteReader<'_>| Ok(Box::new(decode(reader)?) as Box<dyn Any + Send + Sync>)),
            byte_len: Box::new(move |value: &(dyn Any + Send + Sync)| {
                let value = value.downcast_ref::<T>().ok_or_else(&wrong_type_len)?;
                Ok(byte_len(value))
            }),
        };

        tables.by_id.insert(id, Arc::new(codec));
        tables.by_rust_type.insert(TypeId::of::<T>(), id);
        tracing::debug!(name, %id, "registered message type");
        Ok(id)
    }

    /// Registers a [`Message`] type using the codec it declares.
    pub fn register_message<T: Message>(&self) -> Result<MessageTypeId, ProtocolError> {
        self.register::<T, _, _, _>(T::TYPE_NAME, T::encode, T::decode, T::byte_len)
    }

    /// Whether a wire type id has a codec.
    pub fn is_registered(&self, id: MessageTypeId) -> bool {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .contains_key(&id)
    }

    /// The registered name for a wire type id.
    pub fn type_name(&self, id: MessageTypeId) -> Option<String> {
        self.codec(id).map(|codec| codec.name.clone())
    }

    fn codec(&self, id: MessageTypeId) -> Option<Arc<MessageCodec>> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(&id)
            .cloned()
    }

    // -----------------------------------------------------------------------
    // Encoding
    // -----------------------------------------------------------------------

    /// Encodes one value into a fresh buffer.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::new();
        self.encode_into(value, &mut out)?;
        Ok(out)
    }

    /// Appends the encoding of `value` to `out`.
    pub fn encode_into(&self, value: &Value, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match value {
            Value::Bool(v) => out.put_bool(*v),
            Value::I8(v) => out.put_i8(*v),
            Value::U8(v) => out.put_u8(*v),
            Value::I16(v) => out.put_i16(*v),
            Value::U16(v) => out.put_u16(*v),
            Value::I32(v) => out.put_i32(*v),
            Value::U32(v) => out.put_u32(*v),
            Value::I64(v) => out.put_i64(*v),
            Value::U64(v) => out.put_u64(*v),
            Value::U128(v) => out.put_u128(*v),
            Value::F32(v) => out.put_f32(*v),
            Value::F64(v) => out.put_f64(*v),
            Value::String(v) => out.put_str(v),
            Value::Array { elem, items } => {
                out.put_u32(items.len() as u32);
                for item in items {
                    if &item.tag() != elem {
                        return Err(ProtocolError::TypeMismatch {
                            expected: elem.to_string(),
                            found: item.tag().to_string(),
                        });
                    }
                    self.encode_into(item, out)?;
                }
            }
            Value::Message(message) => self.encode_message(message, out)?,
        }
        Ok(())
    }

    fn encode_message(&self, message: &MessageValue, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let id = message.message_type();
        let codec = self.codec(id).ok_or(ProtocolError::UnknownType(id))?;
        let len = (codec.byte_len)(message.as_any())?;

        out.put_u64(id.into_inner());
        out.put_u32(len as u32);
        let start = out.len();
        (codec.encode)(message.as_any(), out)?;

        let written = out.len() - start;
        if written != len {
            return Err(ProtocolError::Malformed(format!(
                "{} encoder wrote {written} bytes but reported {len}",
                codec.name
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Decoding
    // -----------------------------------------------------------------------

    /// Decodes one value of type `tag` from the reader.
    pub fn decode(&self, tag: &TypeTag, reader: &mut ByteReader<'_>) -> Result<Value, ProtocolError> {
        let value = match tag {
            TypeTag::Bool => Value::Bool(reader.read_bool()?),
            TypeTag::I8 => Value::I8(reader.read_i8()?),
            TypeTag::U8 => Value::U8(reader.read_u8()?),
            TypeTag::I16 => Value::I16(reader.read_i16()?),
            TypeTag::U16 => Value::U16(reader.read_u16()?),
            TypeTag::I32 => Value::I32(reader.read_i32()?),
            TypeTag::U32 => Value::U32(reader.read_u32()?),
            TypeTag::I64 => Value::I64(reader.read_i64()?),
            TypeTag::U64 => Value::U64(reader.read_u64()?),
            TypeTag::U128 => Value::U128(reader.read_u128()?),
            TypeTag::F32 => Value::F32(reader.read_f32()?),
            TypeTag::F64 => Value::F64(reader.read_f64()?),
            TypeTag::String => Value::String(reader.read_string()?),
            TypeTag::Array(elem) => {
                let count = reader.read_u32()? as usize;
                // Every element takes at least one byte, so a count larger
                // than what is buffered cannot be satisfied yet.
                if count > reader.remaining() {
                    return Err(ProtocolError::TruncatedFrame {
                        needed: count,
                        remaining: reader.remaining(),
                    });
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.decode(elem, reader)?);
                }
                Value::Array {
                    elem: (**elem).clone(),
                    items,
                }
            }
            TypeTag::Message(expected) => Value::Message(self.decode_message(*expected, reader)?),
        };
        Ok(value)
    }

    fn decode_message(&self, expected: MessageTypeId, reader: &mut ByteReader<'_>) -> Result<MessageValue, ProtocolError> {
        let id = MessageTypeId::new(reader.read_u64()?);
        let codec = self.codec(id).ok_or(ProtocolError::UnknownType(id))?;
        if id != expected {
            return Err(ProtocolError::TypeMismatch {
                expected: expected.to_string(),
                found: codec.name.clone(),
            });
        }

        let len = reader.read_u32()? as usize;
        let mut body = ByteReader::new(reader.read_bytes(len)?);
        // The body is fully buffered, so running short inside it is a bad
        // body, never a reason to wait for more bytes.
        let value = (codec.decode)(&mut body).map_err(|e| match e {
            ProtocolError::TruncatedFrame { needed, remaining } => ProtocolError::Malformed(format!(
                "{} decoder needed {needed} bytes with {remaining} of {len} left",
                codec.name
            )),
            other => other,
        })?;
        if !body.is_empty() {
            return Err(ProtocolError::Malformed(format!(
                "{} decoder left {} of {len} bytes unread",
                codec.name,
                body.remaining()
            )));
        }
        Ok(MessageValue::from_boxed(id, value))
    }
}

impl std::fmt::Debug for SerialRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&str> = tables.by_id.values().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        f.debug_struct("SerialRegistry").field("types", &names).finish()
    }
}
