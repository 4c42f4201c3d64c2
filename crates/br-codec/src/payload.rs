//! Tagged payload kinds and their byte encodings.
//!
//! Every kind is one row of [`REGISTRY`]: a mimetype plus an encode/decode
//! pair. Supporting a new kind means adding a variant and a row.

use br_types::{Asset, DecodeError};
use serde::{Deserialize, Serialize};

/// Mimetype reserved for executable run-function payloads.
pub const MIMETYPE_FUNC: &str = "application/vnd.benchrun.func+json";
pub const MIMETYPE_JSON: &str = "application/json";
pub const MIMETYPE_TEXT: &str = "text/plain";
pub const MIMETYPE_BINARY: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadKind {
    RunFunction,
    Json,
    Text,
    Binary,
}

/// Reference to a run function registered under `name`, plus the arguments
/// it is called with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFunctionRef {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl RunFunctionRef {
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// A decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    RunFunction(RunFunctionRef),
    Json(serde_json::Value),
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::RunFunction(_) => PayloadKind::RunFunction,
            Payload::Json(_) => PayloadKind::Json,
            Payload::Text(_) => PayloadKind::Text,
            Payload::Binary(_) => PayloadKind::Binary,
        }
    }

    /// Encode into a named trial input asset.
    pub fn into_asset(self, name: impl Into<String>) -> Result<Asset, DecodeError> {
        let (mimetype, embedded) = serialize(&self)?;
        Ok(Asset::new(name, mimetype, embedded))
    }
}

type EncodeFn = fn(&Payload) -> Result<Vec<u8>, DecodeError>;
type DecodeFn = fn(&[u8]) -> Result<Payload, DecodeError>;

struct KindCodec {
    kind: PayloadKind,
    mimetype: &'static str,
    encode: EncodeFn,
    decode: DecodeFn,
}

static REGISTRY: &[KindCodec] = &[
    KindCodec {
        kind: PayloadKind::RunFunction,
        mimetype: MIMETYPE_FUNC,
        encode: encode_run_function,
        decode: decode_run_function,
    },
    KindCodec {
        kind: PayloadKind::Json,
        mimetype: MIMETYPE_JSON,
        encode: encode_json,
        decode: decode_json,
    },
    KindCodec {
        kind: PayloadKind::Text,
        mimetype: MIMETYPE_TEXT,
        encode: encode_text,
        decode: decode_text,
    },
    KindCodec {
        kind: PayloadKind::Binary,
        mimetype: MIMETYPE_BINARY,
        encode: encode_binary,
        decode: decode_binary,
    },
];

impl PayloadKind {
    pub fn mimetype(self) -> &'static str {
        codec_for_kind(self).mimetype
    }

    pub fn from_mimetype(mimetype: &str) -> Option<Self> {
        REGISTRY.iter().find(|c| c.mimetype == mimetype).map(|c| c.kind)
    }
}

// REGISTRY rows are ordered by PayloadKind discriminant.
fn codec_for_kind(kind: PayloadKind) -> &'static KindCodec {
    &REGISTRY[kind as usize]
}

/// Encode a payload, returning its mimetype tag and bytes.
pub fn serialize(payload: &Payload) -> Result<(&'static str, Vec<u8>), DecodeError> {
    let codec = codec_for_kind(payload.kind());
    let bytes = (codec.encode)(payload)?;
    Ok((codec.mimetype, bytes))
}

/// Decode `bytes` according to `mimetype`.
pub fn deserialize(mimetype: &str, bytes: &[u8]) -> Result<Payload, DecodeError> {
    let codec = REGISTRY
        .iter()
        .find(|c| c.mimetype == mimetype)
        .ok_or_else(|| DecodeError::UnknownMimetype {
            mimetype: mimetype.to_string(),
        })?;
    (codec.decode)(bytes)
}

fn corrupt(mimetype: &str, err: impl std::fmt::Display) -> DecodeError {
    DecodeError::Corrupt {
        mimetype: mimetype.to_string(),
        message: err.to_string(),
    }
}

fn mismatch(expected: PayloadKind, payload: &Payload) -> DecodeError {
    DecodeError::WrongKind {
        expected: expected.mimetype().to_string(),
        actual: payload.kind().mimetype().to_string(),
    }
}

fn encode_run_function(payload: &Payload) -> Result<Vec<u8>, DecodeError> {
    match payload {
        Payload::RunFunction(func) => {
            serde_json::to_vec(func).map_err(|e| corrupt(MIMETYPE_FUNC, e))
        }
        other => Err(mismatch(PayloadKind::RunFunction, other)),
    }
}

fn decode_run_function(bytes: &[u8]) -> Result<Payload, DecodeError> {
    let func: RunFunctionRef =
        serde_json::from_slice(bytes).map_err(|e| corrupt(MIMETYPE_FUNC, e))?;
    if func.name.is_empty() {
        return Err(corrupt(MIMETYPE_FUNC, "empty function name"));
    }
    Ok(Payload::RunFunction(func))
}

fn encode_json(payload: &Payload) -> Result<Vec<u8>, DecodeError> {
    match payload {
        Payload::Json(value) => serde_json::to_vec(value).map_err(|e| corrupt(MIMETYPE_JSON, e)),
        other => Err(mismatch(PayloadKind::Json, other)),
    }
}

fn decode_json(bytes: &[u8]) -> Result<Payload, DecodeError> {
    serde_json::from_slice(bytes)
        .map(Payload::Json)
        .map_err(|e| corrupt(MIMETYPE_JSON, e))
}

fn encode_text(payload: &Payload) -> Result<Vec<u8>, DecodeError> {
    match payload {
        Payload::Text(text) => Ok(text.as_bytes().to_vec()),
        other => Err(mismatch(PayloadKind::Text, other)),
    }
}

fn decode_text(bytes: &[u8]) -> Result<Payload, DecodeError> {
    String::from_utf8(bytes.to_vec())
        .map(Payload::Text)
        .map_err(|e| corrupt(MIMETYPE_TEXT, e))
}

fn encode_binary(payload: &Payload) -> Result<Vec<u8>, DecodeError> {
    match payload {
        Payload::Binary(bytes) => Ok(bytes.clone()),
        other => Err(mismatch(PayloadKind::Binary, other)),
    }
}

fn decode_binary(bytes: &[u8]) -> Result<Payload, DecodeError> {
    Ok(Payload::Binary(bytes.to_vec()))
}
