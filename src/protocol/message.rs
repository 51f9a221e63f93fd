use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, RpcError};

/// Content type attached to every published request.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Body of a published call: method name plus ordered arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    pub method: String,
    pub args: Vec<Value>,
}

impl RequestBody {
    // ---

    /// Build a request body from any value that serializes as a sequence.
    ///
    /// Tuples, arrays, slices and `Vec`s are accepted; `()` means "no
    /// arguments". Anything else (a map, a bare scalar) is rejected with
    /// [`RpcError::InvalidArguments`].
    pub fn new<A>(method: &str, args: A) -> Result<Self>
    where
        A: Serialize,
    {
        // ---
        let args = match serde_json::to_value(args)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                let msg = format!("expected an ordered sequence, got `{other}`");
                return Err(RpcError::InvalidArguments(msg));
            }
        };

        Ok(Self {
            method: method.to_string(),
            args,
        })
    }

    /// Serialize to the bytes published on the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        // ---
        Ok(serde_json::to_vec(self)?)
    }
}
