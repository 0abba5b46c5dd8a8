//! The built-in `command` provider: any executable that reads a prompt on
//! stdin and writes the completion to stdout.
//!
//! Request parameters reach the program through environment variables:
//!
//! | Variable | Value |
//! |----------|-------|
//! | `PLANFORGE_MODEL` | model identifier |
//! | `PLANFORGE_TEMPERATURE` | sampling temperature |
//! | `PLANFORGE_MAX_TOKENS` | output token ceiling |
//! | `PLANFORGE_STAGE` | stage name |
//! | `PLANFORGE_TEMPLATE` | template id |
//! | `PLANFORGE_API_KEY` | resolved credential, when configured |
//!
//! A non-zero exit is classified from stderr: rate-limit messages (with an
//! optional `retry-after: N`), authentication failures and 5xx statuses map to
//! the matching [`LlmError`] variants.

use std::process::Stdio;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use pipeline::{
    LlmClient, LlmError, LlmRequest, LlmResponse, LlmStream, ResolvedClient, ResponseMetadata,
    StreamEvent,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

const STDERR_TAIL_BYTES: usize = 2048;

/// Runs a local program per request.
#[derive(Debug, Clone)]
pub struct CommandClient {
    program: String,
    args: Vec<String>,
    api_key: Option<String>,
    timeout: Duration,
}

impl CommandClient {
    /// Creates a client for `program` with a five minute timeout.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            api_key: None,
            timeout: Duration::from_secs(300),
        }
    }

    /// Creates a client from a stage's resolved settings.
    pub fn from_resolved(client: &ResolvedClient, api_key: Option<String>) -> Result<Self, LlmError> {
        if client.command.program.trim().is_empty() {
            return Err(LlmError::Misconfiguration(format!(
                "stage {} uses the command provider without a program",
                client.stage
            )));
        }
        Ok(Self {
            program: client.command.program.clone(),
            args: client.command.args.clone(),
            api_key,
            timeout: client.timeout,
        })
    }

    /// Overrides the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn spawn(&self, request: &LlmRequest) -> Result<Child, LlmError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("PLANFORGE_MODEL", &request.model)
            .env("PLANFORGE_TEMPERATURE", request.temperature.to_string())
            .env("PLANFORGE_MAX_TOKENS", request.max_tokens.to_string())
            .env("PLANFORGE_STAGE", request.stage.as_str())
            .env("PLANFORGE_TEMPLATE", request.template.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(key) = &self.api_key {
            command.env("PLANFORGE_API_KEY", key);
        }

        command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LlmError::Misconfiguration(format!("program '{}' not found", self.program))
            } else {
                LlmError::Transport(format!("failed to start '{}': {e}", self.program))
            }
        })
    }
}

#[async_trait]
impl LlmClient for CommandClient {
    fn name(&self) -> &str {
        "command"
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let mut events = self.stream(request);
        let mut response = LlmResponse::default();
        while let Some(event) = events.next().await {
            match event? {
                StreamEvent::Delta(chunk) => response.text.push_str(&chunk),
                StreamEvent::Completed(metadata) => response.metadata = metadata,
            }
        }
        Ok(response)
    }

    fn stream<'a>(&'a self, request: &'a LlmRequest) -> LlmStream<'a> {
        let events = stream! {
            let mut child = match self.spawn(request) {
                Ok(child) => child,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            debug!(program = %self.program, stage = %request.stage, "Spawned command provider");

            // Feed stdin from its own task so a chatty child cannot deadlock on a full pipe.
            if let Some(mut stdin) = child.stdin.take() {
                let prompt = request.prompt.clone().into_bytes();
                tokio::spawn(async move {
                    if let Err(e) = stdin.write_all(&prompt).await {
                        if e.kind() != std::io::ErrorKind::BrokenPipe {
                            warn!(error = %e, "Failed to write prompt to command provider");
                        }
                    }
                });
            }
            let stderr_task = child.stderr.take().map(|mut stderr| {
                tokio::spawn(async move {
                    let mut buffer = String::new();
                    let _ = stderr.read_to_string(&mut buffer).await;
                    buffer
                })
            });
            let Some(stdout) = child.stdout.take() else {
                yield Err(LlmError::Transport("command provider stdout unavailable".into()));
                return;
            };

            let deadline = Instant::now() + self.timeout;
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match tokio::time::timeout_at(deadline, lines.next_line()).await {
                    Err(_) => {
                        yield Err(LlmError::Timeout { after: self.timeout });
                        return;
                    }
                    Ok(Err(e)) => {
                        yield Err(LlmError::Transport(format!("reading command output: {e}")));
                        return;
                    }
                    Ok(Ok(Some(mut line))) => {
                        line.push('\n');
                        yield Ok(StreamEvent::Delta(line));
                    }
                    Ok(Ok(None)) => break,
                }
            }

            let status = match tokio::time::timeout_at(deadline, child.wait()).await {
                Err(_) => {
                    yield Err(LlmError::Timeout { after: self.timeout });
                    return;
                }
                Ok(Err(e)) => {
                    yield Err(LlmError::Transport(format!("waiting for command: {e}")));
                    return;
                }
                Ok(Ok(status)) => status,
            };
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };

            if status.success() {
                yield Ok(StreamEvent::Completed(ResponseMetadata::default()));
            } else {
                yield Err(classify_failure(status.code(), &stderr));
            }
        };
        Box::pin(events)
    }
}

/// Maps a failed exit to an [`LlmError`] using the program's stderr.
pub fn classify_failure(exit_code: Option<i32>, stderr: &str) -> LlmError {
    let tail = stderr_tail(stderr.trim(), STDERR_TAIL_BYTES);
    let lower = tail.to_ascii_lowercase();
    let message = match exit_code {
        Some(code) => format!("exit code {code}: {tail}"),
        None => format!("terminated by signal: {tail}"),
    };
    let status = http_status(&lower);

    if status == Some(429) || lower.contains("rate limit") || lower.contains("too many requests") {
        return LlmError::RateLimited {
            retry_after: retry_after(&lower),
            message,
        };
    }
    if matches!(status, Some(401 | 403))
        || lower.contains("unauthorized")
        || lower.contains("invalid api key")
        || lower.contains("authentication")
    {
        return LlmError::Authentication(message);
    }
    match status {
        Some(code) => LlmError::Provider {
            status: Some(code),
            message,
        },
        None if lower.contains("overloaded") || lower.contains("unavailable") => LlmError::Provider {
            status: Some(503),
            message,
        },
        None => LlmError::InvalidRequest(message),
    }
}

/// First three-digit token in the 4xx/5xx range.
fn http_status(text: &str) -> Option<u16> {
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|token| token.len() == 3)
        .filter_map(|token| token.parse::<u16>().ok())
        .find(|code| (400..600).contains(code))
}

/// Parses `retry-after: N` or `retry-after N` (seconds).
fn retry_after(lower: &str) -> Option<Duration> {
    let start = lower.find("retry-after")? + "retry-after".len();
    let rest = lower[start..].trim_start_matches(|c: char| c == ':' || c == '=' || c.is_whitespace());
    let number: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    number
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn stderr_tail(stderr: &str, max_bytes: usize) -> String {
    if stderr.len() <= max_bytes {
        return stderr.to_string();
    }
    let bytes = stderr.as_bytes();
    String::from_utf8_lossy(&bytes[bytes.len() - max_bytes..]).to_string()
}
