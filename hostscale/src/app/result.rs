//! Result envelope printed by every command

use serde::Serialize;

use crate::errors::OrchestratorError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// `{"success": true, "data": ...}` or `{"success": false, "error": {...}}`
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult<T: Serialize> {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T: Serialize> OperationResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: &OrchestratorError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                kind: error.kind().to_string(),
                message: error.to_string(),
            }),
        }
    }

    /// Exit code for the process
    pub fn exit_code(&self) -> i32 {
        if self.success {
            0
        } else {
            1
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| {
            format!(
                "{{\"success\": false, \"error\": {{\"kind\": \"json\", \"message\": \"{}\"}}}}",
                e
            )
        })
    }
}

impl<T: Serialize> From<Result<T, OrchestratorError>> for OperationResult<T> {
    fn from(result: Result<T, OrchestratorError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(&e),
        }
    }
}
