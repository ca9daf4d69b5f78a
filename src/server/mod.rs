//! Stdio tool server.
//!
//! Reads one JSON-RPC message per line, answers `initialize`, `ping`,
//! `tools/list` and `tools/call`, and writes one response per line. Each
//! `tools/call` runs on its own task; all responses go through a single
//! writer task so lines never interleave.

pub mod protocol;
pub mod tool;

use std::io;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConfigManager;
use crate::sandbox::SandboxFactory;

use protocol::{
    Request, Response, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR, PROTOCOL_VERSION,
};
use tool::{ExecuteArgs, TOOL_NAME};

const RESPONSE_CHANNEL_CAPACITY: usize = 64;

/// What the read loop does with one incoming line.
#[derive(Debug)]
enum Dispatch {
    Reply(Response),
    Call { id: Value, args: ExecuteArgs },
    Silent,
}

/// Serves the sandbox tool over a line-delimited transport.
pub struct ToolServer {
    config: Arc<ConfigManager>,
    factory: SandboxFactory,
}

impl ToolServer {
    pub fn new(config: Arc<ConfigManager>, factory: SandboxFactory) -> Self {
        Self { config, factory }
    }

    /// Runs until `reader` hits end of input or `shutdown` fires, then
    /// waits for in-flight calls and flushes their responses.
    ///
    /// In-flight calls observe `shutdown` as cancellation, which tears their
    /// containers down early. End of input lets them finish normally.
    pub async fn serve<R, W>(
        self: Arc<Self>,
        reader: R,
        writer: W,
        shutdown: CancellationToken,
    ) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Response>(RESPONSE_CHANNEL_CAPACITY);
        let writer_task = tokio::spawn(write_responses(writer, rx));

        let mut reader = reader;
        let mut buf = Vec::new();
        let mut calls = JoinSet::new();

        loop {
            // Partial reads stay in `buf`, so losing the race to shutdown is safe.
            let read = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, no longer accepting requests");
                    break;
                }
                read = reader.read_until(b'\n', &mut buf) => read?,
            };
            if read == 0 {
                debug!("Input closed");
                break;
            }
            let raw = std::mem::take(&mut buf);

            let dispatched = match String::from_utf8(raw) {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => self.dispatch(&line),
                Err(e) => {
                    warn!(error = %e, "Rejected message that is not UTF-8");
                    Dispatch::Reply(Response::failure(
                        Value::Null,
                        PARSE_ERROR,
                        format!("Parse error: {e}"),
                    ))
                }
            };

            match dispatched {
                Dispatch::Reply(response) => {
                    if tx.send(response).await.is_err() {
                        warn!("Response writer stopped, dropping reply");
                    }
                }
                Dispatch::Call { id, args } => {
                    let server = Arc::clone(&self);
                    let tx = tx.clone();
                    let cancel = shutdown.child_token();
                    calls.spawn(async move {
                        let result = server.call_tool(&args, &cancel).await;
                        if tx.send(Response::success(id, result)).await.is_err() {
                            warn!("Response writer stopped, dropping tool result");
                        }
                    });
                }
                Dispatch::Silent => {}
            }

            while let Some(joined) = calls.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Tool call task failed");
                }
            }
        }

        if !calls.is_empty() {
            info!(in_flight = calls.len(), "Waiting for in-flight calls");
        }
        while let Some(joined) = calls.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Tool call task failed");
            }
        }

        drop(tx);
        writer_task.await.map_err(io::Error::other)?
    }

    fn dispatch(&self, line: &str) -> Dispatch {
        let request = match protocol::parse_request(line) {
            Ok(request) => request,
            Err(response) => {
                warn!(code = ?response.error.as_ref().map(|e| e.code), "Rejected message");
                return Dispatch::Reply(response);
            }
        };

        let Request {
            id, method, params, ..
        } = request;
        let Some(id) = id else {
            debug!(method = %method, "Notification received");
            return Dispatch::Silent;
        };
        debug!(method = %method, id = %id, "Request received");

        match method.as_str() {
            "initialize" => Dispatch::Reply(Response::success(id, self.initialize(&params))),
            "ping" => Dispatch::Reply(Response::success(id, json!({}))),
            "tools/list" => Dispatch::Reply(Response::success(
                id,
                json!({ "tools": [tool::tool_definition()] }),
            )),
            "tools/call" => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or("");
                if name != TOOL_NAME {
                    return Dispatch::Reply(Response::failure(
                        id,
                        INVALID_PARAMS,
                        format!("Unknown tool '{name}'"),
                    ));
                }
                let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
                match ExecuteArgs::from_value(&arguments) {
                    Ok(args) => Dispatch::Call { id, args },
                    Err(message) => {
                        Dispatch::Reply(Response::failure(id, INVALID_PARAMS, message))
                    }
                }
            }
            other => Dispatch::Reply(Response::failure(
                id,
                METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        }
    }

    fn initialize(&self, params: &Value) -> Value {
        let settings = self.config.snapshot();
        let version = params
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or(PROTOCOL_VERSION);
        json!({
            "protocolVersion": version,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": {
                "name": settings.server.name,
                "version": settings.server.version,
            },
        })
    }

    async fn call_tool(&self, args: &ExecuteArgs, cancel: &CancellationToken) -> Value {
        let settings = self.config.snapshot();
        match tool::execute_request(&settings, &self.factory, args, cancel).await {
            Ok(result) => {
                info!(
                    language = %args.language,
                    exit_code = result.exit_code,
                    duration_ms = result.duration.as_millis() as u64,
                    "Tool call finished"
                );
                tool::success_result(&result)
            }
            Err(e) => {
                warn!(language = %args.language, error = %e, "Tool call failed");
                tool::error_result(&e)
            }
        }
    }
}

async fn write_responses<W>(mut writer: W, mut rx: mpsc::Receiver<Response>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_string(&response).map_err(io::Error::other)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::error::SandboxError;
    use crate::sandbox::{EnvironmentProvider, ExecutionResult, Sandbox, SandboxConfig};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, BufReader};

    struct EchoSandbox;

    #[async_trait]
    impl Sandbox for EchoSandbox {
        async fn execute(
            &self,
            code: &str,
            _cancel: &CancellationToken,
        ) -> Result<ExecutionResult, SandboxError> {
            Ok(ExecutionResult {
                stdout: format!("ran: {code}"),
                stderr: String::new(),
                exit_code: 0,
                duration: Duration::from_millis(5),
            })
        }

        async fn cleanup(&self, _cancel: &CancellationToken) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    struct EchoProvider;

    #[async_trait]
    impl EnvironmentProvider for EchoProvider {
        fn name(&self) -> &str {
            "docker"
        }

        async fn create(&self, _config: SandboxConfig) -> Result<Box<dyn Sandbox>, SandboxError> {
            Ok(Box::new(EchoSandbox))
        }
    }

    fn server() -> Arc<ToolServer> {
        let config = Arc::new(ConfigManager::from_settings(Settings::default()));
        let factory = SandboxFactory::new().with_provider(Arc::new(EchoProvider));
        Arc::new(ToolServer::new(config, factory))
    }

    async fn roundtrip(input: &str) -> Vec<Value> {
        roundtrip_bytes(input.as_bytes()).await
    }

    async fn roundtrip_bytes(input: &[u8]) -> Vec<Value> {
        let (client, server_end) = tokio::io::duplex(64 * 1024);
        server()
            .serve(
                BufReader::new(input),
                server_end,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut output = String::new();
        let mut client = client;
        client.read_to_string(&mut output).await.unwrap();
        output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_initialize_and_list() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-03-26"}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
            "\n",
        );
        let responses = roundtrip(input).await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], 1);
        assert_eq!(responses[0]["result"]["protocolVersion"], "2025-03-26");
        assert_eq!(responses[0]["result"]["serverInfo"]["name"], "code-sandbox");
        assert_eq!(responses[1]["result"]["tools"][0]["name"], TOOL_NAME);
    }

    #[tokio::test]
    async fn test_tools_call_runs_sandbox() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":7,"method":"tools/call","params":{"name":"execute_code_in_sandbox","arguments":{"language":"python","code":"print(1+1)"}}}"#,
            "\n",
        );
        let responses = roundtrip(input).await;

        assert_eq!(responses.len(), 1);
        let result = &responses[0]["result"];
        assert_eq!(result["isError"], false);
        assert_eq!(result["content"][0]["text"], "ran: print(1+1)");
        assert_eq!(result["structuredContent"]["exitCode"], 0);
    }

    #[tokio::test]
    async fn test_tools_call_unknown_language_is_tool_error() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":8,"method":"tools/call","params":{"name":"execute_code_in_sandbox","arguments":{"language":"cobol","code":"x"}}}"#,
            "\n",
        );
        let responses = roundtrip(input).await;

        assert_eq!(responses[0]["result"]["isError"], true);
        assert_eq!(
            responses[0]["result"]["structuredContent"]["error"],
            "configuration"
        );
    }

    #[tokio::test]
    async fn test_error_codes() {
        let input = concat!(
            "not json\n",
            r#"{"jsonrpc":"2.0","id":1,"method":"resources/list"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"execute_code_in_sandbox","arguments":{"code":"x"}}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"rm_rf","arguments":{}}}"#,
            "\n",
            "\n",
            r#"{"jsonrpc":"2.0","id":4,"method":"ping"}"#,
            "\n",
        );
        let responses = roundtrip(input).await;

        let codes: Vec<_> = responses
            .iter()
            .map(|r| r["error"]["code"].as_i64())
            .collect();
        assert_eq!(
            codes,
            vec![Some(-32700), Some(-32601), Some(-32602), Some(-32602), None]
        );
        assert_eq!(responses[4]["result"], json!({}));
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_rejected_and_serving_continues() {
        let mut input = b"\xff\xfe garbage\n".to_vec();
        input.extend_from_slice(br#"{"jsonrpc":"2.0","id":9,"method":"ping"}"#);
        input.push(b'\n');

        let responses = roundtrip_bytes(&input).await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["error"]["code"], -32700);
        assert_eq!(responses[0]["id"], Value::Null);
        assert_eq!(responses[1]["id"], 9);
        assert_eq!(responses[1]["result"], json!({}));
    }

    #[tokio::test]
    async fn test_last_line_without_newline_is_served() {
        let responses = roundtrip(r#"{"jsonrpc":"2.0","id":5,"method":"ping"}"#).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], 5);
    }

    #[tokio::test]
    async fn test_shutdown_stops_reading() {
        let (_keep_open, reader) = tokio::io::duplex(1024);
        let (_client, writer) = tokio::io::duplex(1024);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        server()
            .serve(BufReader::new(reader), writer, shutdown)
            .await
            .unwrap();
    }
}
