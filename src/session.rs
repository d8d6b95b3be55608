//! Session lifecycle.
//!
//! [`Session`] owns the transport and the background tasks of one
//! connection at a time and drives it through
//! `Idle → Connecting → Connected → Running → Disconnecting → Idle`.
//! What is said on the wire belongs to a [`Protocol`] implementation; the
//! session only moves messages and tears everything down when something
//! breaks.
//!
//! Teardown is always performed by exactly one party:
//! - while `Connecting`, the pending connect call;
//! - while `Connected`, whoever takes the staged transport (`start` or
//!   `disconnect`);
//! - while `Running`, the supervisor task, which waits for the stop token,
//!   joins the reader and writer, then lets the protocol release its
//!   per-session state.

use std::{
    fmt,
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::{SinkExt, StreamExt};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, trace, warn};

use crate::{
    cancel::CancelToken,
    error::{Error, Result},
    message::Message,
    transport::{self, Connection, Endpoint, FrameReader, FrameWriter, Listener, QmpStream},
};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Runstate {
    /// No connection.
    Idle,
    /// Opening or accepting the transport.
    Connecting,
    /// Transport is up; the handshake has not completed.
    Connected,
    /// Handshake done; commands may be executed.
    Running,
    /// Tearing down.
    Disconnecting,
}

impl fmt::Display for Runstate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Running => "running",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// Why the last session ended.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    Requested,
    /// A transport or protocol fault tore the session down.
    Failed(Arc<Error>),
}

impl DisconnectReason {
    /// The fault, if the session did not end on request.
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Requested => None,
            Self::Failed(e) => Some(e),
        }
    }
}

/// Wire-level behaviour plugged into a [`Session`].
pub(crate) trait Protocol: Send + Sync + 'static {
    /// Handshake on a freshly opened transport, before any background task
    /// exists. An error aborts session establishment.
    ///
    /// `epoch` identifies the new session; see [`Session::epoch`].
    fn begin_session(
        &self,
        conn: &mut Connection,
        epoch: u64,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Route one incoming message. An error is fatal to the session.
    fn on_message(&self, msg: Message) -> Result<()>;

    /// Release per-session state; called once per session after the
    /// background tasks have stopped.
    fn on_disconnect(&self);
}

pub(crate) struct Session<P> {
    shared: Arc<Shared<P>>,
}

impl<P> Clone for Session<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<P> {
    protocol: P,
    name: String,
    max_line_length: usize,
    state: watch::Sender<Runstate>,
    /// Bumped for every new connection; stale failures are ignored.
    epoch: AtomicU64,
    stop: Mutex<CancelToken>,
    reason: Mutex<Option<DisconnectReason>>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    staged: Mutex<Option<Connection>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<P: Protocol> Session<P> {
    pub(crate) fn new(protocol: P, name: String, max_line_length: usize) -> Self {
        let (state, _) = watch::channel(Runstate::Idle);
        Self {
            shared: Arc::new(Shared {
                protocol,
                name,
                max_line_length,
                state,
                epoch: AtomicU64::new(0),
                stop: Mutex::new(CancelToken::new()),
                reason: Mutex::new(None),
                outgoing: Mutex::new(None),
                staged: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn protocol(&self) -> &P {
        &self.shared.protocol
    }

    pub(crate) fn name(&self) -> &str {
        &self.shared.name
    }

    pub(crate) fn runstate(&self) -> Runstate {
        *self.shared.state.borrow()
    }

    /// Wait for the next state transition and return the new state.
    pub(crate) async fn runstate_changed(&self) -> Runstate {
        let mut rx = self.shared.state.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.changed().await;
        *rx.borrow_and_update()
    }

    pub(crate) fn disconnect_reason(&self) -> Option<DisconnectReason> {
        lock(&self.shared.reason).clone()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }

    /// Guard for operations that are only valid in `expected`.
    pub(crate) fn require(&self, expected: Runstate) -> Result<()> {
        let actual = self.runstate();
        if actual == expected {
            Ok(())
        } else {
            Err(Error::State { expected, actual })
        }
    }

    fn transition(&self, from: Runstate, to: Runstate) -> Result<()> {
        let mut actual = from;
        let changed = self.shared.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                actual = *s;
                false
            }
        });

        if changed {
            debug!(client = %self.name(), %from, %to, "runstate changed");
            Ok(())
        } else {
            Err(Error::State {
                expected: from,
                actual,
            })
        }
    }

    fn set_runstate(&self, to: Runstate) {
        let from = self.shared.state.send_replace(to);
        if from != to {
            debug!(client = %self.name(), %from, %to, "runstate changed");
        }
    }

    fn begin_teardown(&self) {
        let _ = self.transition(Runstate::Running, Runstate::Disconnecting);
    }

    /// Open the transport to `endpoint`.
    pub(crate) async fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        debug!(client = %self.name(), %endpoint, "connecting");
        self.establish(transport::connect(endpoint)).await
    }

    /// Wait for the peer to dial in on `listener`.
    pub(crate) async fn accept(&self, listener: &Listener) -> Result<()> {
        debug!(client = %self.name(), endpoint = %listener.endpoint(), "awaiting connection");
        self.establish(listener.accept()).await
    }

    /// Adopt an already connected stream.
    pub(crate) async fn attach(&self, stream: QmpStream) -> Result<()> {
        self.establish(async move { Ok(stream) }).await
    }

    /// Leave `Idle` for a new session.
    ///
    /// The stop token, cause and epoch are replaced before `Connecting`
    /// becomes visible, so a `disconnect` that observes `Connecting` always
    /// cancels the token of this attempt.
    fn begin_connecting(&self) -> Result<CancelToken> {
        let stop = CancelToken::new();
        let mut actual = Runstate::Idle;
        let changed = self.shared.state.send_if_modified(|s| {
            if *s != Runstate::Idle {
                actual = *s;
                return false;
            }
            *lock(&self.shared.stop) = stop.clone();
            *lock(&self.shared.reason) = None;
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            *s = Runstate::Connecting;
            true
        });

        if !changed {
            return Err(Error::State {
                expected: Runstate::Idle,
                actual,
            });
        }
        debug!(client = %self.name(), from = %Runstate::Idle, to = %Runstate::Connecting, "runstate changed");
        Ok(stop)
    }

    async fn establish<F>(&self, open: F) -> Result<()>
    where
        F: Future<Output = Result<QmpStream>>,
    {
        let stop = self.begin_connecting()?;

        let opened = tokio::select! {
            opened = open => opened,
            () = stop.cancelled() => Err(Error::Interrupted),
        };

        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                debug!(client = %self.name(), error = %e, "connection failed");
                self.set_runstate(Runstate::Idle);
                return Err(e);
            }
        };

        *lock(&self.shared.staged) =
            Some(Connection::new(stream, self.shared.max_line_length));
        self.set_runstate(Runstate::Connected);

        // A disconnect that raced the open has already looked for the
        // staged transport and will not come back for it.
        if stop.is_cancelled() && lock(&self.shared.staged).take().is_some() {
            self.set_runstate(Runstate::Idle);
            return Err(Error::Interrupted);
        }

        Ok(())
    }

    /// Run the handshake and start the reader and writer.
    pub(crate) async fn start(&self) -> Result<()> {
        self.require(Runstate::Connected)?;
        let Some(mut conn) = lock(&self.shared.staged).take() else {
            return Err(Error::State {
                expected: Runstate::Connected,
                actual: self.runstate(),
            });
        };

        let stop = lock(&self.shared.stop).clone();
        let epoch = self.epoch();

        let handshake = tokio::select! {
            res = self.shared.protocol.begin_session(&mut conn, epoch) => res,
            () = stop.cancelled() => Err(Error::Interrupted),
        };

        if let Err(e) = handshake {
            error!(client = %self.name(), error = %e, "failed to establish session");
            drop(conn);
            self.shared.protocol.on_disconnect();
            self.set_runstate(Runstate::Idle);
            return Err(e);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.outgoing) = Some(tx);
        self.set_runstate(Runstate::Running);

        let (reader, writer) = conn.into_split();
        let reader = tokio::spawn(self.clone().read_loop(reader, stop.clone(), epoch));
        let writer = tokio::spawn(self.clone().write_loop(writer, rx, stop.clone(), epoch));
        tokio::spawn(self.clone().supervise(reader, writer, stop));

        Ok(())
    }

    /// Queue `msg` for the writer task of session `epoch`.
    pub(crate) fn send(&self, msg: Message, epoch: u64) -> Result<()> {
        let outgoing = lock(&self.shared.outgoing);
        // The next session's queue is installed under this lock, after the
        // epoch has moved on.
        if self.epoch() != epoch {
            return Err(Error::Interrupted);
        }
        match outgoing.as_ref() {
            Some(tx) => tx.send(msg).map_err(|_| Error::Interrupted),
            None => Err(Error::Interrupted),
        }
    }

    /// Record `error` as the cause and tear the session of `epoch` down.
    ///
    /// The first recorded cause wins. Returns `false` if `epoch` is no longer
    /// the current session.
    pub(crate) fn fail(&self, epoch: u64, error: Error) -> bool {
        if self.epoch() != epoch {
            debug!(client = %self.name(), error = %error, "ignoring failure of a previous session");
            return false;
        }

        {
            let mut reason = lock(&self.shared.reason);
            if reason.is_none() {
                error!(client = %self.name(), error = %error, "session failed");
                *reason = Some(DisconnectReason::Failed(Arc::new(error)));
            } else {
                debug!(client = %self.name(), error = %error, "additional failure during teardown");
            }
        }

        self.begin_teardown();
        lock(&self.shared.stop).cancel();
        true
    }

    /// Tear down whatever phase the session is in and wait for `Idle`.
    ///
    /// Idempotent; safe to call from any state and from several tasks.
    pub(crate) async fn disconnect(&self) {
        let mut rx = self.shared.state.subscribe();
        if *rx.borrow_and_update() == Runstate::Idle {
            return;
        }

        debug!(client = %self.name(), "disconnect requested");
        lock(&self.shared.reason).get_or_insert(DisconnectReason::Requested);
        self.begin_teardown();
        lock(&self.shared.stop).cancel();

        let staged = lock(&self.shared.staged).take();
        if let Some(conn) = staged {
            drop(conn);
            self.shared.protocol.on_disconnect();
            self.set_runstate(Runstate::Idle);
        }

        let _ = rx.wait_for(|s| *s == Runstate::Idle).await;
    }

    pub(crate) async fn wait_idle(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| *s == Runstate::Idle).await;
    }

    async fn read_loop(self, mut reader: FrameReader, stop: CancelToken, epoch: u64) {
        loop {
            let next = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                next = reader.next() => next,
            };

            let msg = match next {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    self.fail(epoch, e);
                    break;
                }
                None => {
                    self.fail(epoch, Error::Disconnected);
                    break;
                }
            };

            trace!(client = %self.name(), message = %msg, "received");
            if let Err(e) = self.shared.protocol.on_message(msg) {
                self.fail(epoch, e);
                break;
            }
        }
        debug!(client = %self.name(), "reader stopped");
    }

    async fn write_loop(
        self,
        mut writer: FrameWriter,
        mut rx: mpsc::UnboundedReceiver<Message>,
        stop: CancelToken,
        epoch: u64,
    ) {
        loop {
            let msg = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                msg = rx.recv() => msg,
            };
            let Some(msg) = msg else { break };

            trace!(client = %self.name(), message = %msg, "sending");
            let sent = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                sent = writer.send(msg) => sent,
            };

            if let Err(e) = sent {
                self.fail(epoch, e);
                return;
            }
        }

        if let Err(e) = writer.close().await {
            debug!(client = %self.name(), error = %e, "error closing transport");
        }
        debug!(client = %self.name(), "writer stopped");
    }

    async fn supervise(self, reader: JoinHandle<()>, writer: JoinHandle<()>, stop: CancelToken) {
        stop.cancelled().await;
        self.begin_teardown();
        lock(&self.shared.outgoing).take();

        if let Err(e) = reader.await {
            warn!(client = %self.name(), error = %e, "reader task panicked");
        }
        if let Err(e) = writer.await {
            warn!(client = %self.name(), error = %e, "writer task panicked");
        }

        self.shared.protocol.on_disconnect();

        match self.disconnect_reason() {
            Some(DisconnectReason::Failed(e)) => {
                debug!(client = %self.name(), error = %e, "disconnected after failure");
            }
            _ => debug!(client = %self.name(), "disconnected"),
        }
        self.set_runstate(Runstate::Idle);
    }
}

impl<P> fmt::Debug for Session<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.shared.name)
            .field("runstate", &*self.shared.state.borrow())
            .finish_non_exhaustive()
    }
}
