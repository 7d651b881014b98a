use std::fmt::Display;

use sb_core::BridgeError;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub(crate) struct CliError {
    pub(crate) code: String,
    pub(crate) message: String,
}

impl CliError {
    pub(crate) fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<BridgeError> for CliError {
    fn from(error: BridgeError) -> Self {
        Self::new(error.code(), error.to_string())
    }
}

fn map_error(code: &'static str, error: impl Display) -> CliError {
    CliError::new(code, error.to_string())
}

pub(crate) fn emit_error(error: CliError) -> i32 {
    println!("RESULT:ERROR");
    println!("ERROR_CODE:{}", error.code);
    println!("ERROR_MSG_JSON:{}", serde_json::Value::String(error.message));
    1
}

pub(crate) fn map_cli_root_path(error: std::io::Error) -> CliError {
    map_error("CLI_ROOT_PATH", error)
}

pub(crate) fn map_cli_root_scan(error: std::path::StripPrefixError) -> CliError {
    map_error("CLI_ROOT_SCAN", error)
}

#[cfg(test)]
mod error_map_tests {
    use super::*;

    #[test]
    fn emit_error_returns_non_zero_exit_code() {
        let code = emit_error(CliError::new("ERR", "failed"));
        assert_eq!(code, 1);
    }

    #[test]
    fn bridge_errors_keep_their_codes() {
        let error = CliError::from(BridgeError::UnitNotFound {
            path: "auth.feature".to_string(),
        });
        assert_eq!(error.code, "BRIDGE_UNIT_NOT_FOUND");
        assert!(error.message.contains("auth.feature"));
    }

    #[test]
    fn mapping_helpers_keep_error_codes() {
        assert_eq!(
            map_cli_root_path(std::io::Error::other("path")).code,
            "CLI_ROOT_PATH"
        );
        let strip_error = std::path::Path::new("/a")
            .strip_prefix("/b")
            .expect_err("strip prefix");
        assert_eq!(map_cli_root_scan(strip_error).code, "CLI_ROOT_SCAN");
    }
}
