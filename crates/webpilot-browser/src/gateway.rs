//! MCP stdio client for a browser automation server.
//!
//! Spawns the configured command (by default a Playwright MCP server) and
//! speaks newline-delimited JSON-RPC 2.0 over its stdin/stdout: `initialize`,
//! `tools/list`, `tools/call`. One request is in flight at a time; the child
//! process is killed when the gateway is dropped.

use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{ContentBlock, GatewayError, ToolBackend, ToolResult, ToolSchema};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Command used to launch the automation server.
    pub command: String,
    pub args: Vec<String>,
    /// Directory where captured images are persisted as a side channel.
    pub output_dir: PathBuf,
    pub request_timeout: Duration,
}

pub struct BrowserGateway {
    config: GatewayConfig,
    process: Mutex<Option<StdioProcess>>,
    request_id: AtomicU64,
}

struct StdioProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Drop for StdioProcess {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

impl BrowserGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            process: Mutex::new(None),
            request_id: AtomicU64::new(1),
        }
    }

    async fn spawn(&self) -> Result<StdioProcess, GatewayError> {
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::Closed("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Closed("failed to capture stdout".to_string()))?;

        debug!(
            "Spawned browser automation server: {} {:?}",
            self.config.command, self.config.args
        );

        Ok(StdioProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn handshake(&self, process: &mut StdioProcess) -> Result<(), GatewayError> {
        let id = self.next_id();
        let params = json!({
            "protocolVersion": "2024-11-05",
            "clientInfo": {
                "name": "webpilot",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {}
        });
        self.request_on(process, id, "initialize", params).await?;

        // The initialized notification has no id and expects no reply
        let notification = json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
        });
        Self::write_frame(process, &notification, self.config.request_timeout).await?;
        Ok(())
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn write_frame(
        process: &mut StdioProcess,
        frame: &Value,
        write_timeout: Duration,
    ) -> Result<(), GatewayError> {
        let mut line = frame.to_string();
        line.push('\n');
        timeout(write_timeout, async {
            process.stdin.write_all(line.as_bytes()).await?;
            process.stdin.flush().await
        })
        .await
        .map_err(|_| GatewayError::Timeout(write_timeout))??;
        Ok(())
    }

    /// Send one request on an already-connected process and wait for the
    /// matching response, skipping any server-initiated notifications.
    async fn request_on(
        &self,
        process: &mut StdioProcess,
        id: u64,
        method: &str,
        params: Value,
    ) -> Result<Value, GatewayError> {
        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        Self::write_frame(process, &frame, self.config.request_timeout).await?;

        loop {
            let mut line = String::new();
            let read = timeout(self.config.request_timeout, process.stdout.read_line(&mut line))
                .await
                .map_err(|_| GatewayError::Timeout(self.config.request_timeout))??;
            if read == 0 {
                return Err(GatewayError::Closed(
                    "automation server closed stdout".to_string(),
                ));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let message: Value = match serde_json::from_str(trimmed) {
                Ok(value) => value,
                Err(e) => {
                    return Err(GatewayError::Protocol(format!(
                        "undecodable frame: {}",
                        e
                    )))
                }
            };
            match message.get("id").and_then(Value::as_u64) {
                Some(message_id) if message_id == id => {
                    if let Some(error) = message.get("error") {
                        return Err(GatewayError::Protocol(error.to_string()));
                    }
                    return Ok(message.get("result").cloned().unwrap_or(Value::Null));
                }
                // Notification or a response to someone else; keep reading
                _ => debug!("Skipping unsolicited frame: {}", trimmed),
            }
        }
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        let mut guard = self.process.lock().await;
        let process = guard.as_mut().ok_or(GatewayError::NotConnected)?;
        let id = self.next_id();
        let result = self.request_on(process, id, method, params).await;
        if matches!(result, Err(GatewayError::Closed(_))) {
            // The child is gone; drop it so the next connect starts clean
            *guard = None;
        }
        result
    }

    /// Persist captured images under the output directory. A side channel
    /// for later inspection; must never fail the primary result path.
    fn persist_images(&self, result: &ToolResult) {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine as _;

        for block in &result.content {
            let ContentBlock::Image { media_type, data } = block else {
                continue;
            };
            if let Err(e) = std::fs::create_dir_all(&self.config.output_dir) {
                warn!("Failed to create output directory: {}", e);
                return;
            }
            let bytes = match BASE64.decode(data) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to decode captured image: {}", e);
                    continue;
                }
            };
            let extension = match media_type.as_str() {
                "image/png" => "png",
                "image/jpeg" => "jpg",
                "image/webp" => "webp",
                "image/gif" => "gif",
                _ => "bin",
            };
            let filename = format!(
                "capture-{}.{}",
                chrono::Utc::now().timestamp_millis(),
                extension
            );
            let path = self.config.output_dir.join(filename);
            match std::fs::write(&path, bytes) {
                Ok(()) => debug!("Saved captured image to {}", path.display()),
                Err(e) => warn!("Failed to save captured image: {}", e),
            }
        }
    }
}

#[async_trait::async_trait]
impl ToolBackend for BrowserGateway {
    async fn connect(&self) -> Result<(), GatewayError> {
        let mut guard = self.process.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let mut process = self.spawn().await?;
        self.handshake(&mut process).await?;
        *guard = Some(process);
        info!("Connected to browser automation server");
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolSchema>, GatewayError> {
        let result = self.send_request("tools/list", json!({})).await?;
        let response: ToolListResponse = serde_json::from_value(result)
            .map_err(|e| GatewayError::Protocol(format!("invalid tool list: {}", e)))?;
        Ok(response
            .tools
            .into_iter()
            .map(|tool| ToolSchema {
                name: tool.name,
                description: tool.description.unwrap_or_default(),
                input_schema: tool.input_schema,
            })
            .collect())
    }

    async fn invoke(&self, name: &str, args: &Value) -> Result<ToolResult, GatewayError> {
        debug!("Invoking tool {} with args {}", name, args);
        let result = self
            .send_request("tools/call", json!({ "name": name, "arguments": args }))
            .await?;
        let response: ToolCallResponse = serde_json::from_value(result)
            .map_err(|e| GatewayError::Protocol(format!("invalid tool call response: {}", e)))?;

        let content = response
            .content
            .into_iter()
            .map(|block| match block {
                WireContent::Text { text } => ContentBlock::Text { text },
                WireContent::Image { data, mime_type } => ContentBlock::Image {
                    media_type: mime_type,
                    data,
                },
            })
            .collect();

        let tool_result = ToolResult {
            content,
            is_error: response.is_error.unwrap_or(false),
        };
        self.persist_images(&tool_result);
        Ok(tool_result)
    }

    async fn close(&self) -> Result<(), GatewayError> {
        let mut guard = self.process.lock().await;
        if let Some(mut process) = guard.take() {
            let _ = process.child.start_kill();
            info!("Closed browser automation server");
        }
        Ok(())
    }

    async fn restart(&self) -> Result<(), GatewayError> {
        info!("Restarting browser automation server");
        self.close().await?;
        self.connect().await
    }
}

#[derive(Debug, Deserialize)]
struct ToolListResponse {
    tools: Vec<WireTool>,
}

#[derive(Debug, Deserialize)]
struct WireTool {
    name: String,
    description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct ToolCallResponse {
    #[serde(default)]
    content: Vec<WireContent>,
    #[serde(rename = "isError")]
    is_error: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}
