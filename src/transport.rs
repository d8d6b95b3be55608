//! Socket transport.

use std::{fmt, path::PathBuf};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    codec::QmpCodec,
    error::{Error, Result},
    message::Message,
};

/// QMP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A Unix domain socket.
    Unix {
        /// Socket path.
        path: PathBuf,
    },

    /// A TCP socket.
    Tcp {
        /// Hostname or IP.
        host: String,
        /// Port.
        port: u16,
    },
}

impl Endpoint {
    /// Create a Unix socket endpoint.
    #[must_use]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Create a TCP endpoint.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path } => write!(f, "unix:{}", path.display()),
            Self::Tcp { host, port } => write!(f, "tcp:{host}:{port}"),
        }
    }
}

/// Trait object representing an async stream that can be used for QMP I/O.
pub trait AsyncQmpStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncQmpStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A connected QMP stream.
///
/// Internally this is a boxed stream so the rest of the crate does not care
/// whether the underlying connection is Unix or TCP.
pub type QmpStream = Box<dyn AsyncQmpStream>;

/// Connect to a QMP endpoint.
pub(crate) async fn connect(endpoint: &Endpoint) -> Result<QmpStream> {
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix { path } => {
            let s = tokio::net::UnixStream::connect(path)
                .await
                .map_err(Error::from)?;
            Ok(Box::new(s))
        }
        #[cfg(not(unix))]
        Endpoint::Unix { .. } => Err(Error::protocol(
            "unix sockets are not supported on this platform",
        )),
        Endpoint::Tcp { host, port } => {
            let s = tokio::net::TcpStream::connect((host.as_str(), *port))
                .await
                .map_err(Error::from)?;
            // Best effort: disable Nagle for request/response latency.
            let _ = s.set_nodelay(true);
            Ok(Box::new(s))
        }
    }
}

/// A bound socket waiting for the QMP server to dial in.
///
/// Used when QEMU is started with a client-mode `-qmp` socket.
#[derive(Debug)]
pub struct Listener {
    inner: ListenerInner,
    endpoint: Endpoint,
}

#[derive(Debug)]
enum ListenerInner {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl Listener {
    /// Bind to `endpoint`.
    ///
    /// A TCP port of 0 picks an ephemeral port; see [`Listener::endpoint`].
    /// A stale Unix socket file at the path is removed first.
    pub async fn bind(endpoint: Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = tokio::net::TcpListener::bind((host.as_str(), port))
                    .await
                    .map_err(Error::from)?;
                let addr = listener.local_addr().map_err(Error::from)?;
                Ok(Self {
                    inner: ListenerInner::Tcp(listener),
                    endpoint: Endpoint::tcp(addr.ip().to_string(), addr.port()),
                })
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                let _ = std::fs::remove_file(&path);
                let listener = tokio::net::UnixListener::bind(&path).map_err(Error::from)?;
                Ok(Self {
                    inner: ListenerInner::Unix(listener),
                    endpoint: Endpoint::Unix { path },
                })
            }
            #[cfg(not(unix))]
            Endpoint::Unix { .. } => Err(Error::protocol(
                "unix sockets are not supported on this platform",
            )),
        }
    }

    /// The bound address, with any ephemeral port resolved.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) async fn accept(&self) -> Result<QmpStream> {
        match &self.inner {
            ListenerInner::Tcp(listener) => {
                let (s, _peer) = listener.accept().await.map_err(Error::from)?;
                let _ = s.set_nodelay(true);
                Ok(Box::new(s))
            }
            #[cfg(unix)]
            ListenerInner::Unix(listener) => {
                let (s, _addr) = listener.accept().await.map_err(Error::from)?;
                Ok(Box::new(s))
            }
        }
    }
}

/// Read side of a framed connection.
pub(crate) type FrameReader = FramedRead<ReadHalf<QmpStream>, QmpCodec>;

/// Write side of a framed connection.
pub(crate) type FrameWriter = FramedWrite<WriteHalf<QmpStream>, QmpCodec>;

/// A framed connection.
///
/// The handshake uses it whole; once the session runs it is split between
/// the reader and writer tasks.
pub(crate) struct Connection {
    reader: FrameReader,
    writer: FrameWriter,
}

impl Connection {
    pub(crate) fn new(stream: QmpStream, max_line_length: usize) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: FramedRead::new(r, QmpCodec::with_max_length(max_line_length)),
            writer: FramedWrite::new(w, QmpCodec::with_max_length(max_line_length)),
        }
    }

    /// Read exactly one message; end of stream is [`Error::Disconnected`].
    pub(crate) async fn recv(&mut self) -> Result<Message> {
        match self.reader.next().await {
            Some(msg) => msg,
            None => Err(Error::Disconnected),
        }
    }

    /// Write one message and flush it.
    pub(crate) async fn send(&mut self, msg: Message) -> Result<()> {
        self.writer.send(msg).await
    }

    pub(crate) fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}
