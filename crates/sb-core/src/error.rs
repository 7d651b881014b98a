use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum BridgeError {
    #[error("unsupported value: {type_name}")]
    UnsupportedValue { type_name: String },
    #[error("function call failed: {message}\nfailed function body: {source_text}")]
    ScriptInvocation {
        message: String,
        source_text: String,
    },
    #[error("not a function: {type_name}")]
    NotCallable { type_name: String },
    #[error("predicate must return a boolean, got {type_name}")]
    NotBoolean { type_name: String },
    #[error("evaluation failed for expression '{expr}': {message}")]
    ExpressionEvaluation { expr: String, message: String },
    #[error("script evaluation failed: {message}")]
    Evaluation { message: String },
    #[error("invalid path '{path}': {message}")]
    InvalidPath { path: String, message: String },
    #[error("unit not found: {path}")]
    UnitNotFound { path: String },
    #[error("failed to access {path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("json error: {message}")]
    Json { message: String },
    #[error("xml error: {message}")]
    Xml { message: String },
    #[error("http error: {message}")]
    Http { message: String },
    #[error("config error: {message}")]
    Config { message: String },
}

impl BridgeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedValue { .. } => "BRIDGE_VALUE_UNSUPPORTED",
            Self::ScriptInvocation { .. } => "BRIDGE_SCRIPT_INVOCATION",
            Self::NotCallable { .. } => "BRIDGE_NOT_CALLABLE",
            Self::NotBoolean { .. } => "BRIDGE_NOT_BOOLEAN",
            Self::ExpressionEvaluation { .. } => "BRIDGE_EXPRESSION_EVALUATION",
            Self::Evaluation { .. } => "BRIDGE_EVAL_ERROR",
            Self::InvalidPath { .. } => "BRIDGE_INVALID_PATH",
            Self::UnitNotFound { .. } => "BRIDGE_UNIT_NOT_FOUND",
            Self::Io { .. } => "BRIDGE_IO",
            Self::Json { .. } => "BRIDGE_JSON",
            Self::Xml { .. } => "BRIDGE_XML",
            Self::Http { .. } => "BRIDGE_HTTP",
            Self::Config { .. } => "BRIDGE_CONFIG",
        }
    }

    pub fn unsupported(type_name: impl Into<String>) -> Self {
        Self::UnsupportedValue {
            type_name: type_name.into(),
        }
    }

    pub fn invocation(message: impl Into<String>, source_text: impl Into<String>) -> Self {
        Self::ScriptInvocation {
            message: message.into(),
            source_text: source_text.into(),
        }
    }

    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation {
            message: message.into(),
        }
    }

    pub fn invalid_path(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, error: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(error: serde_json::Error) -> Self {
        Self::Json {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn invocation_error_names_failing_source() {
        let error = BridgeError::invocation("boom", "|x| x.missing()");
        assert_eq!(error.code(), "BRIDGE_SCRIPT_INVOCATION");
        let text = error.to_string();
        assert!(text.contains("boom"));
        assert!(text.contains("|x| x.missing()"));
    }

    #[test]
    fn json_errors_convert() {
        let parse = serde_json::from_str::<serde_json::Value>("{").expect_err("invalid json");
        assert_eq!(BridgeError::from(parse).code(), "BRIDGE_JSON");
    }
}
