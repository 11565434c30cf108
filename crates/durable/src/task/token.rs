//! Opaque tokens identifying one task invocation
//!
//! A token lets code outside the worker complete or heartbeat a task that
//! declared itself asynchronous.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::workflow::Seq;

/// Errors decoding a task token
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("task token is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("task token payload is invalid: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Identifies a task by execution and call number
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskToken {
    pub execution_id: String,
    pub seq: Seq,
}

impl TaskToken {
    pub fn new(execution_id: impl Into<String>, seq: Seq) -> Self {
        Self {
            execution_id: execution_id.into(),
            seq,
        }
    }

    /// URL-safe string form
    pub fn encode(&self) -> String {
        // Serializing a string and an integer cannot fail
        let payload = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(payload)
    }

    pub fn decode(token: &str) -> Result<Self, TokenError> {
        let payload = URL_SAFE_NO_PAD.decode(token.trim())?;
        Ok(serde_json::from_slice(&payload)?)
    }
}

impl std::fmt::Display for TaskToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

impl std::str::FromStr for TaskToken {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}
