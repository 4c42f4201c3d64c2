//! # br-codec
//!
//! Converts trial input payloads to and from mimetype-tagged byte blobs, and
//! resolves run-function payloads into callables through a
//! [`FunctionRegistry`].

mod builtins;
mod function;
mod payload;

pub use builtins::{builtin_registry, ENV_EXPERIMENT_ID, ENV_TRIAL_ID};
pub use function::{BoundRunFn, FunctionRegistry, RunFn};
pub use payload::{
    deserialize, serialize, Payload, PayloadKind, RunFunctionRef, MIMETYPE_BINARY, MIMETYPE_FUNC,
    MIMETYPE_JSON, MIMETYPE_TEXT,
};
