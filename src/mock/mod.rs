//! In-process QMP servers for tests.
//!
//! [`MockServer`] answers commands from a [`MockScript`]; [`ReplayServer`]
//! plays back a recorded [`Transcript`] and checks the client's side of it
//! message by message. Both are available under `cfg(test)` or the `mock`
//! Cargo feature.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio_util::codec::{Framed, LinesCodec};

use crate::{
    cancel::CancelToken,
    error::{Error, Result},
    transport::{self, Endpoint, Listener, QmpStream},
};

/// How a command should be answered by the mock.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum MockReply {
    /// Successful `return` payload.
    Return(Value),

    /// Error response.
    Error {
        /// QMP error class.
        class: String,
        /// QMP error description.
        desc: String,
    },

    /// Send this object verbatim, without adding the request id.
    Raw(Value),

    /// Never answer.
    Silent,
}

impl MockReply {
    fn into_response(self, id: Option<&Value>) -> Option<Value> {
        let mut response = match self {
            MockReply::Return(v) => json!({ "return": v }),
            MockReply::Error { class, desc } => json!({
                "error": {"class": class, "desc": desc}
            }),
            MockReply::Raw(v) => return Some(v),
            MockReply::Silent => return None,
        };

        if let (Some(id), Some(obj)) = (id, response.as_object_mut()) {
            obj.insert("id".to_string(), id.clone());
        }
        Some(response)
    }
}

/// A simple mock script.
#[derive(Debug, Clone)]
pub struct MockScript {
    /// Greeting to send.
    pub greeting: Value,

    /// Whether to expect and answer `qmp_capabilities`.
    pub negotiate: bool,

    /// Map from `execute`/`exec-oob` command name to reply.
    pub replies: HashMap<String, MockReply>,

    /// Events to send once the first command after the handshake arrives.
    pub post_handshake_events: Vec<Value>,

    /// Collect this many commands before answering them, newest first.
    pub reorder: usize,
}

impl MockScript {
    /// A greeting matching a recent QEMU, advertising `oob`.
    #[must_use]
    pub fn default_greeting() -> Value {
        json!({
            "QMP": {
                "version": {
                    "qemu": {"major": 8, "minor": 2, "micro": 0},
                    "package": "mock"
                },
                "capabilities": ["oob"]
            }
        })
    }

    /// Create a script with a default greeting.
    #[must_use]
    pub fn new() -> Self {
        Self {
            greeting: Self::default_greeting(),
            negotiate: true,
            replies: HashMap::new(),
            post_handshake_events: Vec::new(),
            reorder: 1,
        }
    }

    /// Replace the greeting.
    #[must_use]
    pub fn greeting(mut self, greeting: Value) -> Self {
        self.greeting = greeting;
        self
    }

    /// Whether to expect `qmp_capabilities` right after the greeting.
    #[must_use]
    pub fn negotiate(mut self, enabled: bool) -> Self {
        self.negotiate = enabled;
        self
    }

    /// Add a successful reply.
    #[must_use]
    pub fn reply_return(mut self, command: impl Into<String>, value: Value) -> Self {
        self.replies
            .insert(command.into(), MockReply::Return(value));
        self
    }

    /// Add an error reply.
    #[must_use]
    pub fn reply_error(
        mut self,
        command: impl Into<String>,
        class: impl Into<String>,
        desc: impl Into<String>,
    ) -> Self {
        self.replies.insert(
            command.into(),
            MockReply::Error {
                class: class.into(),
                desc: desc.into(),
            },
        );
        self
    }

    /// Answer `command` with `raw`, verbatim.
    #[must_use]
    pub fn reply_raw(mut self, command: impl Into<String>, raw: Value) -> Self {
        self.replies.insert(command.into(), MockReply::Raw(raw));
        self
    }

    /// Never answer `command`.
    #[must_use]
    pub fn silent(mut self, command: impl Into<String>) -> Self {
        self.replies.insert(command.into(), MockReply::Silent);
        self
    }

    /// Add an event to be sent after handshake.
    #[must_use]
    pub fn post_event(mut self, event: Value) -> Self {
        self.post_handshake_events.push(event);
        self
    }

    /// Answer commands in batches of `n`, last received first.
    #[must_use]
    pub fn reorder(mut self, n: usize) -> Self {
        self.reorder = n.max(1);
        self
    }
}

impl Default for MockScript {
    fn default() -> Self {
        Self::new()
    }
}

type Received = Arc<Mutex<Vec<Value>>>;

/// The server side of one connection: CRLF-terminated JSON lines, like QEMU.
struct Wire {
    lines: Framed<QmpStream, LinesCodec>,
}

impl Wire {
    fn new(stream: QmpStream) -> Self {
        Self {
            lines: Framed::new(stream, LinesCodec::new()),
        }
    }

    async fn send(&mut self, msg: &Value) -> Result<()> {
        self.lines.send(format!("{msg}\r")).await?;
        Ok(())
    }

    /// Next client message; [`Error::Disconnected`] once the client hangs up.
    async fn recv(&mut self) -> Result<Value> {
        let line = self.lines.next().await.ok_or(Error::Disconnected)??;
        Ok(serde_json::from_str(&line)?)
    }
}

/// Background task plumbing shared by [`MockServer`] and [`ReplayServer`].
#[derive(Debug)]
struct Task {
    endpoint: Endpoint,
    stop: CancelToken,
    done: tokio::sync::Mutex<Option<oneshot::Receiver<Result<()>>>>,
}

impl Task {
    fn spawn<F>(endpoint: Endpoint, run: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let stop = CancelToken::new();
        let stopped = stop.cancelled();
        let (done_tx, done) = oneshot::channel();

        tokio::spawn(async move {
            let result = tokio::select! {
                r = run => r,
                () = stopped => Ok(()),
            };
            let _ = done_tx.send(result);
        });

        Self {
            endpoint,
            stop,
            done: tokio::sync::Mutex::new(Some(done)),
        }
    }

    async fn join(&self) -> Result<()> {
        match self.done.lock().await.take() {
            Some(done) => done.await.unwrap_or(Ok(())),
            None => Ok(()),
        }
    }

    async fn stop(&self) {
        self.stop.cancel();
        let _ = self.join().await;
    }
}

/// A running mock server.
///
/// Serves the first client to connect, then stops listening.
#[derive(Debug, Clone)]
pub struct MockServer {
    task: Arc<Task>,
    received: Received,
}

impl MockServer {
    /// Listen on 127.0.0.1 with an ephemeral port.
    pub async fn start_tcp(script: MockScript) -> Result<Self> {
        Self::listen(Endpoint::tcp("127.0.0.1", 0), script).await
    }

    /// Listen on a Unix socket at `path`, replacing any stale socket file.
    #[cfg(unix)]
    pub async fn start_unix(path: impl AsRef<Path>, script: MockScript) -> Result<Self> {
        Self::listen(Endpoint::unix(path.as_ref()), script).await
    }

    async fn listen(endpoint: Endpoint, script: MockScript) -> Result<Self> {
        let listener = Listener::bind(endpoint).await?;
        let received = Received::default();
        let log = received.clone();

        let task = Task::spawn(listener.endpoint().clone(), async move {
            let stream = listener.accept().await?;
            serve_script(Wire::new(stream), script, log).await
        });

        Ok(Self {
            task: Arc::new(task),
            received,
        })
    }

    /// Where clients should connect.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.task.endpoint.clone()
    }

    /// Every message received from the client so far, in order.
    #[must_use]
    pub fn received(&self) -> Vec<Value> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop the connection, as if the server had crashed, and wait for it.
    pub async fn shutdown(&self) {
        self.task.stop().await;
    }
}

async fn serve_script(mut wire: Wire, script: MockScript, received: Received) -> Result<()> {
    let record = |v: &Value| {
        received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(v.clone());
    };

    wire.send(&script.greeting).await?;

    if script.negotiate {
        let req = wire.recv().await?;
        record(&req);

        let reply = if req.get("execute").and_then(Value::as_str) == Some("qmp_capabilities") {
            MockReply::Return(json!({}))
        } else {
            MockReply::Error {
                class: "CommandNotFound".to_string(),
                desc: "Expecting capabilities negotiation with 'qmp_capabilities'".to_string(),
            }
        };
        if let Some(resp) = reply.into_response(req.get("id")) {
            wire.send(&resp).await?;
        }
    }

    let mut events = script.post_handshake_events.iter();
    let mut batch = Vec::with_capacity(script.reorder);

    loop {
        let req = match wire.recv().await {
            Ok(v) => v,
            Err(Error::Disconnected) => return Ok(()),
            Err(e) => return Err(e),
        };
        record(&req);

        for ev in events.by_ref() {
            wire.send(ev).await?;
        }

        batch.push(req);
        if batch.len() < script.reorder {
            continue;
        }

        for req in batch.drain(..).rev() {
            let command = req
                .get("execute")
                .or_else(|| req.get("exec-oob"))
                .and_then(Value::as_str)
                .unwrap_or_default();

            let reply = script
                .replies
                .get(command)
                .cloned()
                .unwrap_or_else(|| MockReply::Error {
                    class: "CommandNotFound".to_string(),
                    desc: format!("The command {command} has not been found"),
                });

            if let Some(resp) = reply.into_response(req.get("id")) {
                wire.send(&resp).await?;
            }
        }
    }
}

/// A transcript step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "dir", rename_all = "lowercase")]
pub enum TranscriptStep {
    /// A message sent by the server.
    Server {
        /// Message payload.
        msg: Value,
    },
    /// A message expected from the client.
    Client {
        /// Message payload.
        msg: Value,
    },
}

/// A JSONL transcript, suitable for replay.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    /// Ordered transcript steps.
    pub steps: Vec<TranscriptStep>,
}

impl Transcript {
    /// Parse from JSON Lines content.
    pub fn from_jsonl_str(s: &str) -> Result<Self> {
        let mut steps = Vec::new();
        for (idx, line) in s.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let step: TranscriptStep = serde_json::from_str(line).map_err(|e| {
                Error::protocol(format!("invalid jsonl at line {}: {}", idx + 1, e))
            })?;
            steps.push(step);
        }

        Ok(Self { steps })
    }

    /// Load a transcript from a JSONL file.
    pub fn from_jsonl_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(Error::from)?;
        Self::from_jsonl_str(&data)
    }
}

/// Plays the server side of a [`Transcript`], step by step, then hangs up.
#[derive(Debug)]
pub struct ReplayServer {
    task: Task,
}

impl ReplayServer {
    /// Listen on 127.0.0.1 with an ephemeral port and replay to the first
    /// client.
    pub async fn start_tcp(transcript: Transcript) -> Result<Self> {
        let listener = Listener::bind(Endpoint::tcp("127.0.0.1", 0)).await?;
        let task = Task::spawn(listener.endpoint().clone(), async move {
            let stream = listener.accept().await?;
            replay(Wire::new(stream), transcript).await
        });

        Ok(Self { task })
    }

    /// Dial a client listening at `endpoint` and replay to it.
    pub fn dial(endpoint: Endpoint, transcript: Transcript) -> Self {
        let target = endpoint.clone();
        let task = Task::spawn(endpoint, async move {
            let stream = transport::connect(&target).await?;
            replay(Wire::new(stream), transcript).await
        });

        Self { task }
    }

    /// The listening or dialled address.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.task.endpoint.clone()
    }

    /// Wait for the replay to run to completion.
    ///
    /// Fails if the client deviated from the transcript or hung up early.
    pub async fn finish(&self) -> Result<()> {
        self.task.join().await
    }

    /// Abandon the replay.
    pub async fn shutdown(&self) {
        self.task.stop().await;
    }
}

async fn replay(mut wire: Wire, transcript: Transcript) -> Result<()> {
    for (n, step) in transcript.steps.into_iter().enumerate() {
        match step {
            TranscriptStep::Server { msg } => wire.send(&msg).await?,
            TranscriptStep::Client { msg: expected } => {
                let got = wire.recv().await?;
                if got != expected {
                    return Err(Error::protocol(format!(
                        "transcript step {}: expected {expected}, got {got}",
                        n + 1
                    )));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_parses_and_reports_bad_lines() {
        let t = Transcript::from_jsonl_str(
            "\n{\"dir\":\"server\",\"msg\":{\"QMP\":{\"capabilities\":[]}}}\n\
             {\"dir\":\"client\",\"msg\":{\"execute\":\"qmp_capabilities\"}}\n",
        )
        .unwrap();
        assert_eq!(t.steps.len(), 2);

        let err = Transcript::from_jsonl_str("{\"dir\":\"sideways\",\"msg\":{}}").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn replies_echo_the_request_id() {
        let id = json!("__req#00007");
        let resp = MockReply::Return(json!({"status": "running"}))
            .into_response(Some(&id))
            .unwrap();
        assert_eq!(resp, json!({"return": {"status": "running"}, "id": "__req#00007"}));

        assert!(MockReply::Silent.into_response(Some(&id)).is_none());
        assert_eq!(
            MockReply::Raw(json!({"return": {}})).into_response(Some(&id)),
            Some(json!({"return": {}}))
        );
    }
}
