//! Dynamically typed command arguments and their static adapters.
//!
//! On the wire, a command's arguments are a flat sequence of encoded values
//! with no type information: the receiver knows the types from the command's
//! descriptor. In memory, each decoded argument is a [`Value`] tagged with a
//! [`TypeTag`]. Handlers never see `Value` directly though: the [`Param`]
//! trait converts between `Value` and ordinary Rust types, so a handler
//! declared as `|conn, (name, score): (String, i32)|` gets exactly that.
//!
//! User-defined payloads implement [`Message`]. Every `Message` is
//! automatically a `Param`, carried as a type-erased [`MessageValue`].

use std::any::Any;
use std::fmt;

use crate::bytes::ByteReader;
use crate::error::ProtocolError;
use crate::types::MessageTypeId;

// ---------------------------------------------------------------------------
// TypeTag
// ---------------------------------------------------------------------------

/// The type of one command parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    U128,
    F32,
    F64,
    String,
    /// A `u32`-counted sequence of the element type.
    Array(Box<TypeTag>),
    /// A registered user type.
    Message(MessageTypeId),
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeTag::Bool => f.write_str("bool"),
            TypeTag::I8 => f.write_str("i8"),
            TypeTag::U8 => f.write_str("u8"),
            TypeTag::I16 => f.write_str("i16"),
            TypeTag::U16 => f.write_str("u16"),
            TypeTag::I32 => f.write_str("i32"),
            TypeTag::U32 => f.write_str("u32"),
            TypeTag::I64 => f.write_str("i64"),
            TypeTag::U64 => f.write_str("u64"),
            TypeTag::U128 => f.write_str("u128"),
            TypeTag::F32 => f.write_str("f32"),
            TypeTag::F64 => f.write_str("f64"),
            TypeTag::String => f.write_str("string"),
            TypeTag::Array(elem) => write!(f, "[{elem}]"),
            TypeTag::Message(id) => write!(f, "{id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// One decoded (or about to be encoded) argument.
#[derive(Debug)]
pub enum Value {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    U128(u128),
    F32(f32),
    F64(f64),
    String(String),
    /// The element tag is kept so empty arrays still know their type.
    Array { elem: TypeTag, items: Vec<Value> },
    Message(MessageValue),
}

impl Value {
    /// The tag this value encodes as.
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::Bool(_) => TypeTag::Bool,
            Value::I8(_) => TypeTag::I8,
            Value::U8(_) => TypeTag::U8,
            Value::I16(_) => TypeTag::I16,
            Value::U16(_) => TypeTag::U16,
            Value::I32(_) => TypeTag::I32,
            Value::U32(_) => TypeTag::U32,
            Value::I64(_) => TypeTag::I64,
            Value::U64(_) => TypeTag::U64,
            Value::U128(_) => TypeTag::U128,
            Value::F32(_) => TypeTag::F32,
            Value::F64(_) => TypeTag::F64,
            Value::String(_) => TypeTag::String,
            Value::Array { elem, .. } => TypeTag::Array(Box::new(elem.clone())),
            Value::Message(m) => TypeTag::Message(m.message_type()),
        }
    }
}

/// A decoded user payload with its concrete type erased.
pub struct MessageValue {
    message_type: MessageTypeId,
    value: Box<dyn Any + Send + Sync>,
}

impl MessageValue {
    pub fn new<T: Any + Send + Sync>(message_type: MessageTypeId, value: T) -> Self {
        Self {
            message_type,
            value: Box::new(value),
        }
    }

    pub(crate) fn from_boxed(message_type: MessageTypeId, value: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            message_type,
            value,
        }
    }

    pub fn message_type(&self) -> MessageTypeId {
        self.message_type
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Recovers the concrete value, or gives `self` back on a type mismatch.
    pub fn downcast<T: Any>(self) -> Result<T, Self> {
        let message_type = self.message_type;
        match self.value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(value) => Err(Self {
                message_type,
                value,
            }),
        }
    }

    pub(crate) fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self.value.as_ref()
    }
}

impl fmt::Debug for MessageValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageValue")
            .field("message_type", &self.message_type)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Message: user payload types
// ---------------------------------------------------------------------------

/// A user-defined payload type that can travel as a command parameter.
///
/// The body layout is entirely up to the implementor; the framework only
/// wraps it with the type id and a length prefix. `byte_len` must return
/// exactly the number of bytes `encode` writes, since the length prefix is
/// written before the body.
///
/// ```
/// use partyline_protocol::{ByteReader, Message, ProtocolError, WriteExt};
///
/// struct Position { x: f32, y: f32 }
///
/// impl Message for Position {
///     const TYPE_NAME: &'static str = "Position";
///
///     fn encode(&self, out: &mut Vec<u8>) {
///         out.put_f32(self.x);
///         out.put_f32(self.y);
///     }
///
///     fn decode(reader: &mut ByteReader<'_>) -> Result<Self, ProtocolError> {
///         Ok(Position { x: reader.read_f32()?, y: reader.read_f32()? })
///     }
///
///     fn byte_len(&self) -> usize {
///         8
///     }
/// }
/// ```
pub trait Message: Send + Sync + Sized + 'static {
    /// The registered name. Both peers must use the same one.
    const TYPE_NAME: &'static str;

    fn encode(&self, out: &mut Vec<u8>);

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, ProtocolError>;

    fn byte_len(&self) -> usize;

    /// The wire id derived from [`TYPE_NAME`](Self::TYPE_NAME).
    fn message_type() -> MessageTypeId {
        MessageTypeId::from_name(Self::TYPE_NAME)
    }
}

// ---------------------------------------------------------------------------
// Param: static adapters
// ---------------------------------------------------------------------------

/// A Rust type usable as a command parameter.
pub trait Param: Sized + Send + 'static {
    fn type_tag() -> TypeTag;

    fn into_value(self) -> Value;

    fn from_value(value: Value) -> Result<Self, ProtocolError>;
}

fn mismatch(expected: TypeTag, found: &Value) -> ProtocolError {
    ProtocolError::TypeMismatch {
        expected: expected.to_string(),
        found: found.tag().to_string(),
    }
}

macro_rules! scalar_params {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl Param for $ty {
                fn type_tag() -> TypeTag {
                    TypeTag::$variant
                }

                fn into_value(self) -> Value {
                    Value::$variant(self)
                }

                fn from_value(value: Value) -> Result<Self, ProtocolError> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => Err(mismatch(TypeTag::$variant, &other)),
                    }
                }
            }

            impl Param for Vec<$ty> {
                fn type_tag() -> TypeTag {
                    TypeTag::Array(Box::new(TypeTag::$variant))
                }

                fn into_value(self) -> Value {
                    Value::Array {
                        elem: TypeTag::$variant,
                        items: self.into_iter().map(Value::$variant).collect(),
                    }
                }

                fn from_value(value: Value) -> Result<Self, ProtocolError> {
                    match value {
                        Value::Array { elem: TypeTag::$variant, items } => {
                            items.into_iter().map(<$ty as Param>::from_value).collect()
                        }
                        other => Err(mismatch(Self::type_tag(), &other)),
                    }
                }
            }
        )*
    };
}

scalar_params! {
    bool => Bool,
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    u128 => U128,
    f32 => F32,
    f64 => F64,
    String => String,
}

impl<T: Message> Param for T {
    fn type_tag() -> TypeTag {
        TypeTag::Message(T::message_type())
    }

    fn into_value(self) -> Value {
        Value::Message(MessageValue::new(T::message_type(), self))
    }

    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Message(message) => message.downcast::<T>().map_err(|m| ProtocolError::TypeMismatch {
                expected: T::TYPE_NAME.to_owned(),
                found: m.message_type().to_string(),
            }),
            other => Err(mismatch(Self::type_tag(), &other)),
        }
    }
}
