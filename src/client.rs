//! Asynchronous QMP client.

use std::{
    fmt,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, error, trace, warn};

use crate::{
    cancel::CancelToken,
    codec::DEFAULT_MAX_LINE_LENGTH,
    error::{Error, Result},
    event_stream::{EventHub, EventStream},
    message::{Message, MessageKind},
    pending::{Outcome, PendingTable},
    session::{DisconnectReason, Protocol, Runstate, Session},
    transport::{Connection, Endpoint, Listener},
    types::{CAPABILITY_OOB, ErrorBody, Event, Greeting},
};

/// Prefix of automatically assigned request ids.
///
/// Caller-supplied ids must not contain it.
pub const ID_PREFIX: &str = "__req#";

/// Options controlling session establishment and default call behaviour.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Nickname used in log records.
    pub name: String,

    /// Wait for the server greeting after connecting.
    pub await_greeting: bool,

    /// Perform `qmp_capabilities` negotiation. Implies reading the greeting.
    ///
    /// With both this and `await_greeting` off, the server is assumed to be
    /// past its handshake already.
    pub negotiate: bool,

    /// Default timeout for command calls.
    ///
    /// Individual calls can override this via [`CallOptions`].
    pub default_timeout: Option<Duration>,

    /// Longest accepted line, in bytes.
    pub max_line_length: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            name: "qmp".to_string(),
            await_greeting: true,
            negotiate: true,
            default_timeout: Some(Duration::from_secs(30)),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Options for a single command call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Override the default timeout.
    pub timeout: Option<Duration>,

    /// A cancellation token.
    pub cancel: Option<CancelToken>,

    /// Send as `exec-oob` instead of `execute`.
    ///
    /// Ignored by [`Client::execute_msg`], where the message decides.
    pub out_of_band: bool,
}

/// QMP client builder.
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    options: ConnectOptions,
}

impl ClientBuilder {
    /// Set the log nickname.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = name.into();
        self
    }

    /// Whether to wait for the greeting.
    #[must_use]
    pub fn await_greeting(mut self, enabled: bool) -> Self {
        self.options.await_greeting = enabled;
        self
    }

    /// Whether to negotiate capabilities.
    #[must_use]
    pub fn negotiate(mut self, enabled: bool) -> Self {
        self.options.negotiate = enabled;
        self
    }

    /// Set default command timeout.
    #[must_use]
    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.default_timeout = timeout;
        self
    }

    /// Set the longest accepted line.
    #[must_use]
    pub fn max_line_length(mut self, max: usize) -> Self {
        self.options.max_line_length = max;
        self
    }

    /// Build an idle client.
    #[must_use]
    pub fn build(self) -> Client {
        Client::with_options(self.options)
    }

    /// Build a client, connect and perform the handshake.
    pub async fn connect(self, endpoint: Endpoint) -> Result<Client> {
        let client = self.build();
        client.connect(endpoint).await?;
        Ok(client)
    }
}

/// An async-first QMP client.
///
/// A client owns at most one session at a time. Cloning is cheap; all
/// clones drive the same session. After a disconnect the same client can
/// connect again, which starts a fresh session with its own request ids.
#[derive(Clone)]
pub struct Client {
    session: Session<QmpProtocol>,
    default_timeout: Option<Duration>,
}

/// QMP wire behaviour: handshake, routing and per-session state.
pub(crate) struct QmpProtocol {
    name: String,
    await_greeting: bool,
    negotiate: bool,
    greeting: Mutex<Option<Greeting>>,
    next_id: AtomicU64,
    pending: PendingTable,
    events: EventHub,
}

impl QmpProtocol {
    fn next_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{ID_PREFIX}{n:05}")
    }

    async fn read_greeting(&self, conn: &mut Connection) -> Result<Greeting> {
        debug!(client = %self.name, "awaiting greeting");

        let greeting = async {
            let msg = conn.recv().await?;
            Greeting::from_message(&msg)
        }
        .await
        .map_err(|e| {
            error!(client = %self.name, error = %e, "did not understand greeting");
            Error::greeting(e)
        })?;

        debug!(
            client = %self.name,
            version = ?greeting.qmp.version.as_ref().map(|v| &v.qemu),
            caps = ?greeting.qmp.capabilities,
            "received QMP greeting"
        );
        Ok(greeting)
    }

    async fn negotiate(&self, conn: &mut Connection, greeting: &Greeting) -> Result<()> {
        debug!(client = %self.name, "negotiating capabilities");

        let enable: Vec<&str> = if greeting.supports_oob() {
            vec![CAPABILITY_OOB]
        } else {
            Vec::new()
        };
        let request = Message::command(
            "qmp_capabilities",
            Some(serde_json::json!({ "enable": enable })),
            false,
        );

        async {
            conn.send(request).await?;
            let reply = conn.recv().await?;
            if reply.contains_key("error") || !reply.contains_key("return") {
                return Err(Error::protocol(format!(
                    "unexpected reply to qmp_capabilities: {reply}"
                )));
            }
            Ok(())
        }
        .await
        .map_err(|e| {
            error!(client = %self.name, error = %e, "negotiation failed");
            Error::negotiation(e)
        })
    }
}

impl Protocol for QmpProtocol {
    async fn begin_session(&self, conn: &mut Connection, epoch: u64) -> Result<()> {
        self.next_id.store(0, Ordering::Relaxed);

        if self.await_greeting || self.negotiate {
            let greeting = self.read_greeting(conn).await?;
            if self.negotiate {
                self.negotiate(conn, &greeting).await?;
            }
            *self.greeting.lock().unwrap_or_else(PoisonError::into_inner) = Some(greeting);
        }

        self.pending.open(epoch);
        Ok(())
    }

    fn on_message(&self, msg: Message) -> Result<()> {
        match msg.kind() {
            MessageKind::Event => match Event::from_message(&msg) {
                Ok(event) => {
                    trace!(client = %self.name, event = %event.name, "received QMP event");
                    self.events.publish(&event);
                }
                Err(e) => {
                    warn!(client = %self.name, error = %e, message = %msg, "dropping malformed event");
                }
            },
            // The server could not parse something we sent and cannot tell
            // us what; no recovery is possible.
            MessageKind::Unidentified => return Err(Error::ServerParse { message: msg }),
            MessageKind::Reply { id } => {
                if let Err(msg) = self.pending.resolve(&id, msg) {
                    warn!(client = %self.name, id = %id, "unknown ID, message dropped");
                    debug!(client = %self.name, message = %msg, "unroutable message");
                }
            }
        }
        Ok(())
    }

    fn on_disconnect(&self) {
        let interrupted = self.pending.interrupt_all();
        if interrupted > 0 {
            debug!(client = %self.name, interrupted, "cancelled pending executions");
        }
        self.events.close();
        *self.greeting.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Client {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Create an idle client with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(ConnectOptions::default())
    }

    /// Create an idle client.
    #[must_use]
    pub fn with_options(options: ConnectOptions) -> Self {
        let protocol = QmpProtocol {
            name: options.name.clone(),
            await_greeting: options.await_greeting,
            negotiate: options.negotiate,
            greeting: Mutex::new(None),
            next_id: AtomicU64::new(0),
            pending: PendingTable::default(),
            events: EventHub::default(),
        };

        Self {
            session: Session::new(protocol, options.name, options.max_line_length),
            default_timeout: options.default_timeout,
        }
    }

    /// Connect to `endpoint` and perform the handshake.
    pub async fn connect(&self, endpoint: Endpoint) -> Result<()> {
        self.connect_transport(endpoint).await?;
        self.start_session().await
    }

    /// Accept one connection on `listener` and perform the handshake.
    pub async fn accept(&self, listener: &Listener) -> Result<()> {
        self.accept_transport(listener).await?;
        self.start_session().await
    }

    /// Perform the handshake over an already connected stream.
    pub async fn connect_stream<S>(&self, stream: S) -> Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        self.session.attach(Box::new(stream)).await?;
        self.start_session().await
    }

    /// Open the transport only; the session stays `Connected` until
    /// [`Client::start_session`].
    pub async fn connect_transport(&self, endpoint: Endpoint) -> Result<()> {
        self.session.connect(&endpoint).await
    }

    /// Accept the transport only; see [`Client::connect_transport`].
    pub async fn accept_transport(&self, listener: &Listener) -> Result<()> {
        self.session.accept(listener).await
    }

    /// Run the greeting/negotiation handshake and start background I/O.
    ///
    /// On failure the transport is released and the client is idle again.
    pub async fn start_session(&self) -> Result<()> {
        self.session.start().await
    }

    /// Disconnect, interrupting every outstanding call.
    ///
    /// Idempotent and safe from any state. Returns once the background tasks
    /// have stopped.
    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn runstate(&self) -> Runstate {
        self.session.runstate()
    }

    /// Wait for the next lifecycle transition.
    pub async fn runstate_changed(&self) -> Runstate {
        self.session.runstate_changed().await
    }

    /// Why the most recent session ended, or is ending.
    ///
    /// Reset when a new connection is made.
    #[must_use]
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.session.disconnect_reason()
    }

    /// The greeting of the current session, if one was awaited.
    #[must_use]
    pub fn greeting(&self) -> Option<Greeting> {
        self.session
            .protocol()
            .greeting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Log nickname.
    #[must_use]
    pub fn name(&self) -> &str {
        self.session.name()
    }

    /// Number of calls waiting for a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.session.protocol().pending.len()
    }

    /// Subscribe to QMP events.
    ///
    /// The stream ends when the current (or next) session disconnects.
    #[must_use]
    pub fn events(&self) -> EventStream {
        self.session.protocol().events.subscribe()
    }

    /// Execute a QMP command.
    ///
    /// `args` will be serialized into the `arguments` field.
    ///
    /// The return value is deserialized from the QMP `return` field.
    pub async fn execute<A, R>(&self, command: &str, args: Option<A>) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.execute_with_options(command, args, CallOptions::default())
            .await
    }

    /// Execute a QMP command out-of-band (`exec-oob`).
    pub async fn execute_oob<A, R>(&self, command: &str, args: Option<A>) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let options = CallOptions {
            out_of_band: true,
            ..CallOptions::default()
        };
        self.execute_with_options(command, args, options).await
    }

    /// Execute a QMP command with per-call options.
    pub async fn execute_with_options<A, R>(
        &self,
        command: &str,
        args: Option<A>,
        options: CallOptions,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let arguments = args.map(serde_json::to_value).transpose()?;
        let msg = Message::command(command, arguments, options.out_of_band);
        let value = self.transact(msg, options).await?;
        decode_value(command, value)
    }

    /// Execute a prepared message and return the raw `return` value.
    ///
    /// The message must carry `execute` or `exec-oob`. An `id` already in the
    /// message is used as is (it must be a string that does not contain
    /// [`ID_PREFIX`]); otherwise one is assigned.
    pub async fn execute_msg(&self, msg: Message, options: CallOptions) -> Result<Value> {
        self.transact(msg, options).await
    }

    async fn transact(&self, mut msg: Message, options: CallOptions) -> Result<Value> {
        // Everything below is tied to the session that passed the guard.
        let epoch = self.session.epoch();
        self.session.require(Runstate::Running)?;

        let command = msg
            .command_name()
            .ok_or_else(|| Error::invalid_request("message has no 'execute' or 'exec-oob' member"))?
            .to_string();

        let protocol = self.session.protocol();
        let id = match msg.id() {
            None => {
                let id = protocol.next_id();
                msg.insert("id", Value::from(id.clone()));
                id
            }
            Some(Value::String(id)) if id.contains(ID_PREFIX) => {
                return Err(Error::invalid_request(format!(
                    "request id '{id}' uses the reserved '{ID_PREFIX}' namespace"
                )));
            }
            Some(Value::String(id)) => id.clone(),
            Some(other) => {
                return Err(Error::invalid_request(format!(
                    "request id must be a string, got {other}"
                )));
            }
        };

        // Unregisters the id on every early exit, including the caller
        // dropping this future.
        let mut waiter = protocol.pending.register(&id, epoch)?;

        trace!(client = %self.name(), id = %id, command = %command, "sending QMP request");
        self.session.send(msg.clone(), epoch)?;

        let cancel = options.cancel.unwrap_or_default();
        let wait = async {
            tokio::select! {
                biased;
                outcome = waiter.outcome() => Ok(outcome),
                () = cancel.cancelled() => Err(Error::Cancelled),
            }
        };

        let waited = match options.timeout.or(self.default_timeout) {
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .unwrap_or(Err(Error::Timeout { timeout })),
            None => wait.await,
        };

        let reply = match waited? {
            Outcome::Reply(reply) => reply,
            Outcome::Interrupted => return Err(Error::Interrupted),
        };

        trace!(client = %self.name(), id = %id, command = %command, "received QMP response");

        match decode_reply(&command, &msg, reply) {
            Err(Error::BadReply {
                reason,
                reply,
                sent,
            }) => {
                // The peer is not speaking QMP; the session goes down before
                // the caller hears about it.
                if self
                    .session
                    .fail(epoch, Error::bad_reply(reason.clone(), &reply, &sent))
                {
                    self.session.wait_idle().await;
                }
                Err(Error::BadReply {
                    reason,
                    reply,
                    sent,
                })
            }
            other => other,
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name())
            .field("runstate", &self.runstate())
            .finish_non_exhaustive()
    }
}

/// Interpret a routed reply to `sent`.
fn decode_reply(command: &str, sent: &Message, mut reply: Message) -> Result<Value> {
    if let Some(error) = reply.get("error") {
        let body = match ErrorBody::deserialize(error) {
            Ok(body) => body,
            Err(e) => {
                return Err(Error::bad_reply(
                    format!("QMP error reply is malformed: {e}"),
                    &reply,
                    sent,
                ));
            }
        };
        return Err(Error::Qmp {
            command: command.to_string(),
            class: body.class,
            desc: body.desc,
            sent: sent.clone(),
            received: reply,
        });
    }

    if !reply.contains_key("return") {
        return Err(Error::bad_reply(
            "QMP reply is missing an 'error' or 'return' member",
            &reply,
            sent,
        ));
    }

    Ok(reply.remove("return").unwrap_or(Value::Null))
}

fn decode_value<R: DeserializeOwned>(command: &str, value: Value) -> Result<R> {
    serde_path_to_error::deserialize(value).map_err(|e| Error::Decode {
        command: command.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde::Deserialize;
    use serde_json::json;

    fn sent() -> Message {
        let mut msg = Message::command("query-status", None, false);
        msg.insert("id", json!("__req#00000"));
        msg
    }

    #[test]
    fn ids_are_zero_padded_and_prefixed() {
        let client = Client::new();
        let protocol = client.session.protocol();
        assert_eq!(protocol.next_id(), "__req#00000");
        assert_eq!(protocol.next_id(), "__req#00001");
    }

    #[test]
    fn return_value_is_extracted() {
        let reply = Message::parse(r#"{"return": {"status": "running"}, "id": "__req#00000"}"#)
            .unwrap();
        let value = decode_reply("query-status", &sent(), reply).unwrap();
        assert_eq!(value, json!({"status": "running"}));
    }

    #[test]
    fn error_reply_is_a_command_failure() {
        let reply = Message::parse(
            r#"{"error": {"class": "CommandNotFound", "desc": "no such command"}, "id": "__req#00000"}"#,
        )
        .unwrap();
        let err = decode_reply("query-status", &sent(), reply).unwrap_err();
        match err {
            Error::Qmp {
                class,
                desc,
                sent,
                received,
                ..
            } => {
                assert_eq!(class, "CommandNotFound");
                assert_eq!(desc, "no such command");
                assert_eq!(sent.command_name(), Some("query-status"));
                assert!(received.contains_key("error"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn malformed_replies_carry_both_messages() {
        for line in [
            r#"{"error": {"class": "GenericError"}, "id": "__req#00000"}"#,
            r#"{"error": "oops", "id": "__req#00000"}"#,
            r#"{"id": "__req#00000"}"#,
        ] {
            let reply = Message::parse(line).unwrap();
            let err = decode_reply("query-status", &sent(), reply).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Protocol, "{line}");
            let Error::BadReply { reply, sent, .. } = err else {
                panic!("expected BadReply for {line}");
            };
            assert_eq!(reply.id(), Some(&json!("__req#00000")));
            assert_eq!(sent.command_name(), Some("query-status"));
        }
    }

    #[test]
    fn typed_decode_reports_the_failing_path() {
        #[derive(Debug, Deserialize)]
        struct Status {
            #[allow(dead_code)]
            running: bool,
        }

        let err = decode_value::<Status>("query-status", json!({"running": "yes"})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Json);
        assert!(err.to_string().contains("running"));
    }

    #[tokio::test]
    async fn execute_requires_a_running_session() {
        let client = Client::new();
        let err = client
            .execute::<(), Value>("query-status", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::State {
                expected: Runstate::Running,
                actual: Runstate::Idle
            }
        ));
    }

    #[tokio::test]
    async fn routing_drops_unknown_ids_and_rejects_orphans() {
        let client = Client::new();
        let protocol = client.session.protocol();
        protocol.pending.open(1);
        let mut slot = protocol.pending.register("__req#00000", 1).unwrap();

        let stray = Message::parse(r#"{"return": {}, "id": "X"}"#).unwrap();
        protocol.on_message(stray).unwrap();
        assert_eq!(protocol.pending.len(), 1);

        let orphan = Message::parse(r#"{"error": {"class": "GenericError", "desc": "x"}}"#)
            .unwrap();
        assert!(matches!(
            protocol.on_message(orphan),
            Err(Error::ServerParse { .. })
        ));

        let reply = Message::parse(r#"{"return": 5, "id": "__req#00000"}"#).unwrap();
        protocol.on_message(reply).unwrap();
        assert!(matches!(slot.outcome().await, Outcome::Reply(_)));
    }
}
