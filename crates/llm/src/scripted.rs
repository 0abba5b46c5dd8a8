//! A client that replays canned replies, for dry runs and tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use pipeline::{
    LlmClient, LlmError, LlmRequest, LlmResponse, LlmStream, ResponseMetadata, Stage, StreamEvent,
};

/// One scripted answer.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    /// Complete text with no metadata.
    Text(String),
    /// Complete response including metadata.
    Response(LlmResponse),
    /// Immediate failure.
    Error(LlmError),
    /// Some chunks, then a failure.
    Partial {
        /// Chunks delivered before the failure.
        chunks: Vec<String>,
        /// Failure ending the stream.
        error: LlmError,
    },
    /// Some chunks, then the stream never completes.
    Stalled(Vec<String>),
}

impl ScriptedReply {
    /// Shorthand for [`ScriptedReply::Text`].
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

#[derive(Debug, Default)]
struct Script {
    by_stage: BTreeMap<Stage, VecDeque<ScriptedReply>>,
    shared: VecDeque<ScriptedReply>,
    fallback: Option<String>,
    calls: BTreeMap<Stage, u32>,
    requests: Vec<LlmRequest>,
}

/// Replays queued replies, preferring the queue of the requesting stage.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    script: Mutex<Script>,
}

impl ScriptedClient {
    /// An empty script. Calls fail until replies are queued or a fallback is set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply for any stage.
    pub fn push(self, reply: ScriptedReply) -> Self {
        self.lock().shared.push_back(reply);
        self
    }

    /// Queues a reply for `stage`.
    pub fn push_for(self, stage: Stage, reply: ScriptedReply) -> Self {
        self.lock().by_stage.entry(stage).or_default().push_back(reply);
        self
    }

    /// Text returned once every queue is empty.
    pub fn with_fallback(self, text: impl Into<String>) -> Self {
        self.lock().fallback = Some(text.into());
        self
    }

    /// Calls made by `stage`.
    pub fn calls(&self, stage: Stage) -> u32 {
        self.lock().calls.get(&stage).copied().unwrap_or(0)
    }

    /// Calls made by all stages.
    pub fn total_calls(&self) -> u32 {
        self.lock().calls.values().sum()
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_reply(&self, request: &LlmRequest) -> ScriptedReply {
        let mut script = self.lock();
        *script.calls.entry(request.stage).or_insert(0) += 1;
        script.requests.push(request.clone());

        let staged = script
            .by_stage
            .get_mut(&request.stage)
            .and_then(VecDeque::pop_front);
        staged
            .or_else(|| script.shared.pop_front())
            .or_else(|| script.fallback.clone().map(ScriptedReply::Text))
            .unwrap_or_else(|| {
                ScriptedReply::Error(LlmError::Misconfiguration(format!(
                    "no scripted reply left for stage {}",
                    request.stage
                )))
            })
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
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
        let reply = self.next_reply(request);
        let events = stream! {
            match reply {
                ScriptedReply::Text(text) => {
                    yield Ok(StreamEvent::Delta(text));
                    yield Ok(StreamEvent::Completed(ResponseMetadata::default()));
                }
                ScriptedReply::Response(response) => {
                    yield Ok(StreamEvent::Delta(response.text));
                    yield Ok(StreamEvent::Completed(response.metadata));
                }
                ScriptedReply::Error(error) => yield Err(error),
                ScriptedReply::Partial { chunks, error } => {
                    for chunk in chunks {
                        yield Ok(StreamEvent::Delta(chunk));
                    }
                    yield Err(error);
                }
                ScriptedReply::Stalled(chunks) => {
                    for chunk in chunks {
                        yield Ok(StreamEvent::Delta(chunk));
                    }
                    futures::future::pending::<()>().await;
                }
            }
        };
        Box::pin(events)
    }
}
