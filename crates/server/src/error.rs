//! Errors raised by the tool layer itself, before or after the store is
//! involved. Store errors convert through `kbstore_core::Error`.

use rmcp::model::{ErrorCode, ErrorData as McpError};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// Tool parameters that are well-formed JSON but unusable.
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Tool output could not be encoded.
    #[error("SERIALIZATION_ERROR: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<ToolError> for McpError {
    fn from(err: ToolError) -> Self {
        let code = match &err {
            ToolError::InvalidInput(_) => -32602,
            ToolError::Serialization(_) => -32025,
        };

        McpError { code: ErrorCode(code), message: err.to_string().into(), data: None }
    }
}
