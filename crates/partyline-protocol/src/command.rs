//! Command registry and dispatcher.
//!
//! A command is an alias (`"order"`), a [`CommandId`] derived from it, and a
//! fixed, ordered [`ParameterDescriptor`]. The descriptor is the only thing
//! that tells the receiver how many arguments follow the id on the wire and
//! how to decode them, so it is immutable once registered.
//!
//! Handlers are stored type-erased as `Fn(&C, Vec<Value>)`. The typed API
//! ([`CommandRegistry::register_command`]) wraps a closure taking a tuple of
//! [`Param`]s, so registering `|conn, (a, b): (i32, String)|` derives the
//! descriptor `[i32, string]` at compile time and the handler is only ever
//! called with values that decoded against that descriptor.
//!
//! `C` is the context handed to every handler. The transport layer uses its
//! connection handle, which lets a handler reply or find out who sent the
//! command.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::bytes::ByteReader;
use crate::error::ProtocolError;
use crate::serial::SerialRegistry;
use crate::types::CommandId;
use crate::value::{Param, TypeTag, Value};

// ---------------------------------------------------------------------------
// ParameterDescriptor
// ---------------------------------------------------------------------------

/// The ordered parameter types of one command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ParameterDescriptor(Vec<TypeTag>);

impl ParameterDescriptor {
    pub fn new(tags: Vec<TypeTag>) -> Self {
        Self(tags)
    }

    /// Number of parameters.
    pub fn arity(&self) -> usize {
        self.0.len()
    }

    pub fn tags(&self) -> &[TypeTag] {
        &self.0
    }

    /// Checks a value list against this descriptor.
    pub fn check(&self, alias: &str, values: &[Value]) -> Result<(), ProtocolError> {
        if values.len() != self.0.len() {
            return Err(ProtocolError::ArgumentMismatch {
                alias: alias.to_owned(),
                reason: format!("expected {} arguments, got {}", self.0.len(), values.len()),
            });
        }
        for (index, (tag, value)) in self.0.iter().zip(values).enumerate() {
            let found = value.tag();
            if &found != tag {
                return Err(ProtocolError::ArgumentMismatch {
                    alias: alias.to_owned(),
                    reason: format!("argument {index}: expected {tag}, got {found}"),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for ParameterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, tag) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{tag}")?;
        }
        f.write_str(")")
    }
}

// ---------------------------------------------------------------------------
// CommandArgs: typed argument tuples
// ---------------------------------------------------------------------------

/// A tuple of [`Param`]s used as a command's argument list.
///
/// Implemented for `()` and tuples of up to eight elements.
pub trait CommandArgs: Sized + Send + 'static {
    fn descriptor() -> ParameterDescriptor;

    fn into_values(self) -> Vec<Value>;

    /// Rebuilds the tuple from values that already matched the descriptor.
    fn from_values(values: Vec<Value>) -> Result<Self, ProtocolError>;
}

macro_rules! command_args {
    ($($ty:ident $var:ident),*) => {
        impl<$($ty: Param),*> CommandArgs for ($($ty,)*) {
            fn descriptor() -> ParameterDescriptor {
                ParameterDescriptor(vec![$($ty::type_tag()),*])
            }

            fn into_values(self) -> Vec<Value> {
                let ($($var,)*) = self;
                vec![$($var.into_value()),*]
            }

            #[allow(unused_mut, unused_variables)]
            fn from_values(values: Vec<Value>) -> Result<Self, ProtocolError> {
                let expected = Self::descriptor().arity();
                if values.len() != expected {
                    return Err(ProtocolError::ArgumentMismatch {
                        alias: String::new(),
                        reason: format!("expected {expected} arguments, got {}", values.len()),
                    });
                }
                let mut values = values.into_iter();
                Ok(($(
                    $ty::from_value(values.next().ok_or_else(|| {
                        ProtocolError::Malformed("argument list ended early".to_owned())
                    })?)?,
                )*))
            }
        }
    };
}

command_args!();
command_args!(A a);
command_args!(A a, B b);
command_args!(A a, B b, C c);
command_args!(A a, B b, C c, D d);
command_args!(A a, B b, C c, D d, E e);
command_args!(A a, B b, C c, D d, E e, F f);
command_args!(A a, B b, C c, D d, E e, F f, G g);
command_args!(A a, B b, C c, D d, E e, F f, G g, H h);

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type Handler<C> = Arc<dyn Fn(&C, Vec<Value>) -> Result<(), ProtocolError> + Send + Sync>;

/// One registered command.
struct CommandEntry<C> {
    alias: String,
    id: CommandId,
    params: ParameterDescriptor,
    handler: Option<Handler<C>>,
}

impl<C> Clone for CommandEntry<C> {
    fn clone(&self) -> Self {
        Self {
            alias: self.alias.clone(),
            id: self.id,
            params: self.params.clone(),
            handler: self.handler.clone(),
        }
    }
}

struct Tables<C> {
    by_id: HashMap<CommandId, Arc<CommandEntry<C>>>,
    by_alias: HashMap<String, CommandId>,
}

/// Maps aliases to ids, descriptors, and handlers.
///
/// Shared as `Arc<CommandRegistry<C>>` between everything that sends or
/// receives on it. Lookups take a read lock and clone an `Arc` of the entry,
/// so a handler never runs while the lock is held and may itself register
/// further commands.
pub struct CommandRegistry<C> {
    tables: RwLock<Tables<C>>,
}

impl<C> Default for CommandRegistry<C> {
    fn default() -> Self {
        Self {
            tables: RwLock::new(Tables {
                by_id: HashMap::new(),
                by_alias: HashMap::new(),
            }),
        }
    }
}

impl<C: 'static> CommandRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `alias` with a typed handler.
    ///
    /// The parameter descriptor comes from the handler's argument tuple:
    ///
    /// ```
    /// # use partyline_protocol::CommandRegistry;
    /// let commands = CommandRegistry::<()>::new();
    /// commands
    ///     .register_command("order", |_ctx, (item, count): (String, u32)| {
    ///         println!("{count} x {item}");
    ///     })
    ///     .unwrap();
    /// ```
    pub fn register_command<A, F>(&self, alias: &str, handler: F) -> Result<CommandId, ProtocolError>
    where
        A: CommandArgs,
        F: Fn(&C, A) + Send + Sync + 'static,
    {
        let handler: Handler<C> = Arc::new(move |ctx: &C, values: Vec<Value>| {
            handler(ctx, A::from_values(values)?);
            Ok(())
        });
        self.insert(alias, A::descriptor(), Some(handler))
    }

    /// Registers `alias` with an explicit descriptor and an untyped handler.
    ///
    /// The handler receives exactly `params.arity()` values, each already
    /// checked against its tag.
    pub fn register_raw<F>(&self, alias: &str, params: ParameterDescriptor, handler: F) -> Result<CommandId, ProtocolError>
    where
        F: Fn(&C, Vec<Value>) + Send + Sync + 'static,
    {
        let handler: Handler<C> = Arc::new(move |ctx: &C, values: Vec<Value>| {
            handler(ctx, values);
            Ok(())
        });
        self.insert(alias, params, Some(handler))
    }

    /// Registers `alias` for sending only.
    ///
    /// A peer that only ever sends a command still needs its descriptor. A
    /// later `register_command` with the same argument types attaches a
    /// handler.
    pub fn register_alias<A: CommandArgs>(&self, alias: &str) -> Result<CommandId, ProtocolError> {
        self.insert(alias, A::descriptor(), None)
    }

    fn insert(&self, alias: &str, params: ParameterDescriptor, handler: Option<Handler<C>>) -> Result<CommandId, ProtocolError> {
        let id = CommandId::from_alias(alias);
        if id.is_reserved() {
            return Err(ProtocolError::ReservedCommandId(alias.to_owned()));
        }

        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = tables.by_id.get(&id).cloned() {
            if existing.alias != alias || existing.params != params {
                return Err(ProtocolError::DescriptorConflict {
                    alias: alias.to_owned(),
                });
            }
            match (&existing.handler, handler) {
                (Some(_), Some(_)) => return Err(ProtocolError::DuplicateCommand(alias.to_owned())),
                (_, None) => return Ok(id),
                (None, Some(handler)) => {
                    let mut entry = CommandEntry::clone(&existing);
                    entry.handler = Some(handler);
                    tables.by_id.insert(id, Arc::new(entry));
                    tracing::debug!(alias, %id, "attached command handler");
                    return Ok(id);
                }
            }
        }

        tracing::debug!(alias, %id, params = %params, "registered command");
        tables.by_alias.insert(alias.to_owned(), id);
        tables.by_id.insert(
            id,
            Arc::new(CommandEntry {
                alias: alias.to_owned(),
                id,
                params,
                handler,
            }),
        );
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Resolves an alias to its id.
    ///
    /// Never falls back to a default: an unknown alias is always an error.
    pub fn resolve_alias(&self, alias: &str) -> Result<CommandId, ProtocolError> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_alias
            .get(alias)
            .copied()
            .ok_or_else(|| ProtocolError::UnregisteredAlias(alias.to_owned()))
    }

    /// The descriptor registered for an id.
    pub fn descriptor(&self, id: CommandId) -> Option<ParameterDescriptor> {
        self.entry(id).map(|entry| entry.params.clone())
    }

    /// The alias registered for an id.
    pub fn alias(&self, id: CommandId) -> Option<String> {
        self.entry(id).map(|entry| entry.alias.clone())
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.resolve_alias(alias).is_ok()
    }

    /// All registered aliases, sorted.
    pub fn aliases(&self) -> Vec<String> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let mut aliases: Vec<String> = tables.by_alias.keys().cloned().collect();
        aliases.sort();
        aliases
    }

    pub fn len(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, id: CommandId) -> Option<Arc<CommandEntry<C>>> {
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

    /// Encodes a complete command frame for a typed argument tuple.
    pub fn encode_command<A: CommandArgs>(&self, alias: &str, args: A, serial: &SerialRegistry) -> Result<Vec<u8>, ProtocolError> {
        self.encode_values(alias, &args.into_values(), serial)
    }

    /// Encodes a complete command frame from raw values.
    ///
    /// The values must match the registered descriptor exactly.
    pub fn encode_values(&self, alias: &str, values: &[Value], serial: &SerialRegistry) -> Result<Vec<u8>, ProtocolError> {
        let id = self.resolve_alias(alias)?;
        let entry = self
            .entry(id)
            .ok_or_else(|| ProtocolError::UnregisteredAlias(alias.to_owned()))?;
        entry.params.check(alias, values)?;

        let mut out = Vec::with_capacity(CommandId::LEN + 8 * values.len());
        out.extend_from_slice(id.as_bytes());
        for value in values {
            serial.encode_into(value, &mut out)?;
        }
        tracing::trace!(alias, %id, bytes = out.len(), "encoded command");
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Decodes exactly the arguments the descriptor for `id` names.
    ///
    /// A zero-arity command consumes no bytes.
    pub fn decode_arguments(&self, id: CommandId, reader: &mut ByteReader<'_>, serial: &SerialRegistry) -> Result<Vec<Value>, ProtocolError> {
        let entry = self.entry(id).ok_or(ProtocolError::UnknownCommand(id))?;
        entry
            .params
            .tags()
            .iter()
            .map(|tag| serial.decode(tag, reader))
            .collect()
    }

    /// Calls the handler for `id` with already decoded values.
    pub fn invoke(&self, id: CommandId, ctx: &C, values: Vec<Value>) -> Result<(), ProtocolError> {
        let entry = self.entry(id).ok_or(ProtocolError::UnknownCommand(id))?;
        let handler = entry
            .handler
            .clone()
            .ok_or_else(|| ProtocolError::NoHandler(entry.alias.clone()))?;
        entry.params.check(&entry.alias, &values)?;
        tracing::trace!(alias = %entry.alias, %id, "dispatching command");
        handler(ctx, values).map_err(|e| match e {
            ProtocolError::ArgumentMismatch { reason, .. } => ProtocolError::ArgumentMismatch {
                alias: entry.alias.clone(),
                reason,
            },
            other => other,
        })
    }

    /// Decodes the arguments for `id` from `reader` and invokes the handler.
    pub fn dispatch(&self, id: CommandId, ctx: &C, reader: &mut ByteReader<'_>, serial: &SerialRegistry) -> Result<(), ProtocolError> {
        let values = self.decode_arguments(id, reader, serial)?;
        self.invoke(id, ctx, values)
    }
}

impl<C> fmt::Debug for CommandRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let mut aliases: Vec<&str> = tables.by_alias.keys().map(String::as_str).collect();
        aliases.sort_unstable();
        f.debug_struct("CommandRegistry")
            .field("aliases", &aliases)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every invocation so tests can inspect what arrived.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    fn decode_frame(registry: &CommandRegistry<Recorder>, bytes: &[u8], serial: &SerialRegistry, ctx: &Recorder) -> usize {
        let mut reader = ByteReader::new(bytes);
        let id = CommandId::from_bytes(reader.read_array().unwrap());
        registry.dispatch(id, ctx, &mut reader, serial).unwrap();
        reader.position()
    }

    // =====================================================================
    // Registration
    // =====================================================================

    #[test]
    fn test_resolve_unregistered_alias_errors() {
        let registry = CommandRegistry::<Recorder>::new();
        assert!(matches!(
            registry.resolve_alias("order"),
            Err(ProtocolError::UnregisteredAlias(alias)) if alias == "order"
        ));
    }

    #[test]
    fn test_encode_unregistered_alias_errors() {
        let registry = CommandRegistry::<Recorder>::new();
        let serial = SerialRegistry::new();
        assert!(matches!(
            registry.encode_command("order", (1i32,), &serial),
            Err(ProtocolError::UnregisteredAlias(_))
        ));
    }

    #[test]
    fn test_register_command_derives_descriptor() {
        let registry = CommandRegistry::<Recorder>::new();
        let id = registry
            .register_command("order", |_: &Recorder, (_item, _count): (String, u32)| {})
            .unwrap();
        assert_eq!(id, CommandId::from_alias("order"));
        assert_eq!(
            registry.descriptor(id).unwrap(),
            ParameterDescriptor::new(vec![TypeTag::String, TypeTag::U32])
        );
        assert_eq!(registry.aliases(), ["order"]);
    }

    #[test]
    fn test_second_handler_is_duplicate() {
        let registry = CommandRegistry::<Recorder>::new();
        registry.register_command("a", |_: &Recorder, (): ()| {}).unwrap();
        assert!(matches!(
            registry.register_command("a", |_: &Recorder, (): ()| {}),
            Err(ProtocolError::DuplicateCommand(_))
        ));
    }

    #[test]
    fn test_conflicting_descriptor_is_rejected() {
        let registry = CommandRegistry::<Recorder>::new();
        registry.register_alias::<(i32,)>("a").unwrap();
        assert!(matches!(
            registry.register_command("a", |_: &Recorder, (_x,): (i64,)| {}),
            Err(ProtocolError::DescriptorConflict { .. })
        ));
    }

    #[test]
    fn test_alias_then_handler_attaches() {
        let registry = CommandRegistry::<Recorder>::new();
        let serial = SerialRegistry::new();
        registry.register_alias::<(i32,)>("score").unwrap();
        registry.register_alias::<(i32,)>("score").unwrap();

        let frame = registry.encode_command("score", (5i32,), &serial).unwrap();
        let ctx = Recorder::default();
        let id = CommandId::from_alias("score");
        let mut reader = ByteReader::new(&frame[CommandId::LEN..]);
        assert!(matches!(
            registry.dispatch(id, &ctx, &mut reader, &serial),
            Err(ProtocolError::NoHandler(_))
        ));

        registry
            .register_command("score", |ctx: &Recorder, (n,): (i32,)| {
                ctx.calls.lock().unwrap().push(n.to_string());
            })
            .unwrap();
        decode_frame(&registry, &frame, &serial, &ctx);
        assert_eq!(*ctx.calls.lock().unwrap(), ["5"]);
    }

    // =====================================================================
    // Dispatch
    // =====================================================================

    #[test]
    fn test_zero_arity_consumes_only_the_id() {
        let registry = CommandRegistry::<Recorder>::new();
        let serial = SerialRegistry::new();
        registry
            .register_command("ping-me", |ctx: &Recorder, (): ()| {
                ctx.calls.lock().unwrap().push("called".into());
            })
            .unwrap();

        let mut frame = registry.encode_command("ping-me", (), &serial).unwrap();
        assert_eq!(frame.len(), CommandId::LEN);
        // Trailing bytes belong to the next frame and must be left alone.
        frame.extend_from_slice(&[9, 9, 9]);

        let ctx = Recorder::default();
        assert_eq!(decode_frame(&registry, &frame, &serial, &ctx), CommandId::LEN);
        assert_eq!(ctx.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_six_mixed_parameters_arrive_in_order() {
        let registry = CommandRegistry::<Recorder>::new();
        let serial = SerialRegistry::new();
        registry
            .register_command(
                "mixed",
                |ctx: &Recorder, (a, b, c, d, e, f): (bool, u8, i16, Vec<u8>, Vec<i32>, String)| {
                    ctx.calls
                        .lock()
                        .unwrap()
                        .push(format!("{a} {b} {c} {d:?} {e:?} {f}"));
                },
            )
            .unwrap();

        let frame = registry
            .encode_command(
                "mixed",
                (true, 7u8, -3i16, vec![1u8, 2], vec![-1i32, 400], "hi".to_string()),
                &serial,
            )
            .unwrap();

        let ctx = Recorder::default();
        assert_eq!(decode_frame(&registry, &frame, &serial, &ctx), frame.len());
        assert_eq!(
            *ctx.calls.lock().unwrap(),
            ["true 7 -3 [1, 2] [-1, 400] hi"]
        );
    }

    #[test]
    fn test_eight_parameters_supported() {
        let registry = CommandRegistry::<Recorder>::new();
        let serial = SerialRegistry::new();
        registry
            .register_command(
                "eight",
                |ctx: &Recorder, (a, b, c, d, e, f, g, h): (u8, u8, u8, u8, u8, u8, u8, u8)| {
                    let sum = [a, b, c, d, e, f, g, h].iter().map(|v| *v as u32).sum::<u32>();
                    ctx.calls.lock().unwrap().push(sum.to_string());
                },
            )
            .unwrap();
        let frame = registry
            .encode_command("eight", (1u8, 2u8, 3u8, 4u8, 5u8, 6u8, 7u8, 8u8), &serial)
            .unwrap();
        let ctx = Recorder::default();
        decode_frame(&registry, &frame, &serial, &ctx);
        assert_eq!(*ctx.calls.lock().unwrap(), ["36"]);
    }

    #[test]
    fn test_raw_handler_receives_values() {
        let registry = CommandRegistry::<Recorder>::new();
        let serial = SerialRegistry::new();
        registry
            .register_raw(
                "raw",
                ParameterDescriptor::new(vec![TypeTag::I64, TypeTag::String]),
                |ctx: &Recorder, values: Vec<Value>| {
                    ctx.calls.lock().unwrap().push(format!("{}", values.len()));
                },
            )
            .unwrap();
        let frame = registry
            .encode_values("raw", &[Value::I64(1), Value::String("x".into())], &serial)
            .unwrap();
        let ctx = Recorder::default();
        decode_frame(&registry, &frame, &serial, &ctx);
        assert_eq!(*ctx.calls.lock().unwrap(), ["2"]);
    }

    #[test]
    fn test_encode_values_checks_descriptor() {
        let registry = CommandRegistry::<Recorder>::new();
        let serial = SerialRegistry::new();
        registry.register_alias::<(i32,)>("a").unwrap();
        assert!(matches!(
            registry.encode_values("a", &[Value::I64(1)], &serial),
            Err(ProtocolError::ArgumentMismatch { .. })
        ));
        assert!(matches!(
            registry.encode_values("a", &[], &serial),
            Err(ProtocolError::ArgumentMismatch { .. })
        ));
    }

    #[test]
    fn test_dispatch_unknown_id() {
        let registry = CommandRegistry::<Recorder>::new();
        let serial = SerialRegistry::new();
        let ctx = Recorder::default();
        let id = CommandId::from_alias("nobody");
        assert!(matches!(
            registry.dispatch(id, &ctx, &mut ByteReader::new(&[]), &serial),
            Err(ProtocolError::UnknownCommand(unknown)) if unknown == id
        ));
    }

    #[test]
    fn test_dispatch_truncated_arguments() {
        let registry = CommandRegistry::<Recorder>::new();
        let serial = SerialRegistry::new();
        registry
            .register_command("pair", |_: &Recorder, (_a, _b): (i32, i32)| {})
            .unwrap();
        let frame = registry.encode_command("pair", (1i32, 2i32), &serial).unwrap();
        let ctx = Recorder::default();
        let id = CommandId::from_alias("pair");
        let mut reader = ByteReader::new(&frame[CommandId::LEN..frame.len() - 1]);
        let err = registry.dispatch(id, &ctx, &mut reader, &serial).unwrap_err();
        assert!(err.is_truncated());
        assert!(ctx.calls.lock().unwrap().is_empty());
    }
}
