//! The `execute_code_in_sandbox` tool.

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Settings;
use crate::error::SandboxError;
use crate::sandbox::{ExecutionResult, SandboxFactory};

pub const TOOL_NAME: &str = "execute_code_in_sandbox";

/// Tool descriptor returned by `tools/list`.
pub fn tool_definition() -> Value {
    json!({
        "name": TOOL_NAME,
        "description": "Execute the code in a sandbox environment",
        "inputSchema": {
            "type": "object",
            "properties": {
                "language": {
                    "type": "string",
                    "description": "Programming language"
                },
                "code": {
                    "type": "string",
                    "description": "The code to be executed"
                },
                "version": {
                    "type": "string",
                    "description": "Programming language version"
                }
            },
            "required": ["language", "code"]
        }
    })
}

/// Validated tool arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteArgs {
    pub language: String,
    pub code: String,
    pub version: Option<String>,
}

impl ExecuteArgs {
    /// Extracts the arguments. `language` and `code` must be strings;
    /// a non-string `version` is ignored.
    pub fn from_value(args: &Value) -> Result<Self, String> {
        let Some(map) = args.as_object() else {
            return Err("invalid arguments format, expected an object".to_string());
        };
        let language = map
            .get("language")
            .and_then(Value::as_str)
            .ok_or("missing required argument: 'language'")?;
        let code = map
            .get("code")
            .and_then(Value::as_str)
            .ok_or("missing required argument: 'code'")?;
        let version = map
            .get("version")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            language: language.to_string(),
            code: code.to_string(),
            version,
        })
    }
}

/// Resolves, creates and runs one sandbox against `settings`.
pub async fn execute_request(
    settings: &Settings,
    factory: &SandboxFactory,
    args: &ExecuteArgs,
    cancel: &CancellationToken,
) -> Result<ExecutionResult, SandboxError> {
    let config = settings.resolve(&args.language, args.version.as_deref())?;
    info!(
        language = %config.language,
        version = %config.version,
        engine = %settings.runtimes.engine,
        "Executing code"
    );
    let sandbox = factory.create(&settings.runtimes.engine, config).await?;
    sandbox.execute(&args.code, cancel).await
}

/// Tool result for a finished run. Stdout is the text content.
pub fn success_result(result: &ExecutionResult) -> Value {
    json!({
        "content": [{ "type": "text", "text": result.stdout }],
        "structuredContent": {
            "stdout": result.stdout,
            "stderr": result.stderr,
            "exitCode": result.exit_code,
            "durationMs": result.duration.as_millis() as u64,
        },
        "isError": false,
    })
}

/// Tool result for a run that could not produce an [`ExecutionResult`].
pub fn error_result(err: &SandboxError) -> Value {
    json!({
        "content": [{ "type": "text", "text": format!("failed to execute in sandbox: {err}") }],
        "structuredContent": { "error": err.kind(), "message": err.to_string() },
        "isError": true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_args_require_language_and_code() {
        let err = ExecuteArgs::from_value(&json!({"code": "print(1)"})).unwrap_err();
        assert!(err.contains("'language'"));

        let err = ExecuteArgs::from_value(&json!({"language": "python", "code": 5})).unwrap_err();
        assert!(err.contains("'code'"));

        assert!(ExecuteArgs::from_value(&json!(["python"])).is_err());
    }

    #[test]
    fn test_args_version_is_optional() {
        let args =
            ExecuteArgs::from_value(&json!({"language": "go", "code": "package main"})).unwrap();
        assert_eq!(args.version, None);

        let args = ExecuteArgs::from_value(
            &json!({"language": "go", "code": "package main", "version": "1.22"}),
        )
        .unwrap();
        assert_eq!(args.version.as_deref(), Some("1.22"));
    }

    #[test]
    fn test_success_result_shape() {
        let value = success_result(&ExecutionResult {
            stdout: "2\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
            duration: Duration::from_millis(42),
        });
        assert_eq!(value["content"][0]["text"], "2\n");
        assert_eq!(value["structuredContent"]["exitCode"], 0);
        assert_eq!(value["structuredContent"]["durationMs"], 42);
        assert_eq!(value["isError"], false);
    }

    #[test]
    fn test_error_result_shape() {
        let value = error_result(&SandboxError::Configuration("unsupported language 'x'".into()));
        assert_eq!(value["isError"], true);
        assert_eq!(value["structuredContent"]["error"], "configuration");
        assert!(value["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("unsupported language"));
    }

    #[test]
    fn test_tool_definition_lists_required_args() {
        let def = tool_definition();
        assert_eq!(def["name"], TOOL_NAME);
        assert_eq!(def["inputSchema"]["required"], json!(["language", "code"]));
    }
}
