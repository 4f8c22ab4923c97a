//! Argument model
//!
//! Arg payloads are opaque blobs with a type tag. On the wire they are
//! [`Value`]s whose body is a tagged variant: either a literal payload or a
//! reference to a KVS key. References are distinguished at arg-decoding time
//! and resolved by the executor before invocation.

use crate::messages::{LatticeType, PayloadType, Value};
use crate::ProtoResult;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A decoded function argument
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    /// An inline payload in the format named by its tag
    Literal { body: Vec<u8>, kind: PayloadType },
    /// A KVS key to be resolved prior to invocation
    Reference {
        key: String,
        deserialize: bool,
        lattice: LatticeType,
    },
}

impl Argument {
    /// The reference key, if this argument is one
    pub fn reference_key(&self) -> Option<&str> {
        match self {
            Argument::Reference { key, .. } => Some(key),
            Argument::Literal { .. } => None,
        }
    }
}

/// Wire form of an argument body
#[derive(Serialize, Deserialize)]
enum WireArg {
    Literal(Vec<u8>),
    Reference {
        key: String,
        deserialize: bool,
        lattice: LatticeType,
    },
}

/// Encode a native value as a literal argument
pub fn literal<T: Serialize>(value: &T) -> ProtoResult<Value> {
    let body = bincode::serialize(value)?;
    encode_arg(&Argument::Literal {
        body,
        kind: PayloadType::Default,
    })
}

/// Encode a KVS reference argument
pub fn reference(key: impl Into<String>) -> ProtoResult<Value> {
    encode_arg(&Argument::Reference {
        key: key.into(),
        deserialize: true,
        lattice: LatticeType::Lww,
    })
}

/// Encode a decoded argument back into its wire [`Value`]
pub fn encode_arg(arg: &Argument) -> ProtoResult<Value> {
    match arg {
        Argument::Literal { body, kind } => Ok(Value {
            body: bincode::serialize(&WireArg::Literal(body.clone()))?,
            r#type: *kind,
        }),
        Argument::Reference {
            key,
            deserialize,
            lattice,
        } => Ok(Value {
            body: bincode::serialize(&WireArg::Reference {
                key: key.clone(),
                deserialize: *deserialize,
                lattice: *lattice,
            })?,
            r#type: PayloadType::Default,
        }),
    }
}

/// Decode one wire [`Value`] into an [`Argument`]
pub fn decode_arg(value: &Value) -> ProtoResult<Argument> {
    match bincode::deserialize::<WireArg>(&value.body)? {
        WireArg::Literal(body) => Ok(Argument::Literal {
            body,
            kind: value.r#type,
        }),
        WireArg::Reference {
            key,
            deserialize,
            lattice,
        } => Ok(Argument::Reference {
            key,
            deserialize,
            lattice,
        }),
    }
}

/// Eagerly decode a whole argument list
pub fn decode_args(values: &[Value]) -> ProtoResult<Vec<Argument>> {
    values.iter().map(decode_arg).collect()
}

/// Decode the native payload of a literal argument
pub fn decode_literal<T: DeserializeOwned>(arg: &Argument) -> ProtoResult<Option<T>> {
    match arg {
        Argument::Literal { body, .. } => Ok(Some(bincode::deserialize(body)?)),
        Argument::Reference { .. } => Ok(None),
    }
}

/// Encode a function result list; a single element is a scalar result, more
/// than one is a tuple
pub fn encode_result(values: &[Value]) -> ProtoResult<Vec<u8>> {
    Ok(bincode::serialize(values)?)
}

/// Decode a persisted or forwarded function result
pub fn decode_result(bytes: &[u8]) -> ProtoResult<Vec<Value>> {
    Ok(bincode::deserialize(bytes)?)
}

/// Build the in-band error tuple that replaces a failed user function's
/// result: `('ERROR: <msg>', error-bytes)`
pub fn error_tuple(msg: &str, error_bytes: Vec<u8>) -> ProtoResult<Vec<Value>> {
    let text = format!("ERROR: {msg}");
    Ok(vec![
        Value {
            body: bincode::serialize(&WireArg::Literal(text.into_bytes()))?,
            r#type: PayloadType::String,
        },
        Value {
            body: bincode::serialize(&WireArg::Literal(error_bytes))?,
            r#type: PayloadType::Default,
        },
    ])
}

/// True when a result list is the in-band error tuple
pub fn is_error_tuple(values: &[Value]) -> bool {
    if values.len() != 2 || values[0].r#type != PayloadType::String {
        return false;
    }
    match bincode::deserialize::<WireArg>(&values[0].body) {
        Ok(WireArg::Literal(body)) => body.starts_with(b"ERROR: "),
        _ => false,
    }
}
