//! Stream-oriented wrapper over a QUIC session.
//!
//! A session carries exactly one bidirectional stream. On the server side
//! the stream accept is deferred to the first read or write, so the
//! listener's accept loop never blocks on a slow peer; on the client side
//! the stream is opened during the dial. Close conditions that mean "the
//! peer went away normally" surface as clean EOF.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use quinn::{ConnectionError, RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::obfuscator::Dialect;

type AcceptFuture =
    Pin<Box<dyn Future<Output = Result<(SendStream, RecvStream), ConnectionError>> + Send>>;

enum StreamState {
    /// Server side: the stream accept runs on first I/O.
    Deferred,
    Accepting(AcceptFuture),
    Ready {
        send: SendStream,
        recv: RecvStream,
    },
    /// Sticky accept failure.
    Failed(io::ErrorKind, String),
}

pub struct ObfuscatedQuicConn {
    connection: quinn::Connection,
    dialect: Dialect,
    /// Client side only: the dial's endpoint, closed with the connection
    /// so the underlying packet socket is released.
    endpoint: Option<quinn::Endpoint>,
    state: StreamState,
}

impl std::fmt::Debug for ObfuscatedQuicConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObfuscatedQuicConn").finish_non_exhaustive()
    }
}

fn is_error_indicating_closed(connection: &quinn::Connection) -> bool {
    matches!(
        connection.close_reason(),
        Some(ConnectionError::ApplicationClosed(_))
            | Some(ConnectionError::ConnectionClosed(_))
            | Some(ConnectionError::TimedOut)
            | Some(ConnectionError::LocallyClosed)
    )
}

impl ObfuscatedQuicConn {
    /// Server side: wrap an accepted session with a deferred stream accept.
    pub(crate) fn new_deferred(connection: quinn::Connection, dialect: Dialect) -> Self {
        Self {
            connection,
            dialect,
            endpoint: None,
            state: StreamState::Deferred,
        }
    }

    /// Client side: the stream was opened during the dial and the conn owns
    /// the dial's endpoint.
    pub(crate) fn new_client(
        connection: quinn::Connection,
        endpoint: quinn::Endpoint,
        send: SendStream,
        recv: RecvStream,
        dialect: Dialect,
    ) -> Self {
        Self {
            connection,
            dialect,
            endpoint: Some(endpoint),
            state: StreamState::Ready { send, recv },
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.connection.local_ip().map(|ip| {
            std::net::SocketAddr::new(ip, 0)
        })
    }

    pub fn remote_addr(&self) -> std::net::SocketAddr {
        self.connection.remote_address()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    /// Close the session (and, client side, the endpoint with its socket).
    pub fn close(&mut self) {
        self.connection.close(0u32.into(), b"");
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.close(0u32.into(), b"");
        }
    }

    fn poll_stream_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            match &mut self.state {
                StreamState::Ready { .. } => return Poll::Ready(Ok(())),
                StreamState::Failed(kind, message) => {
                    return Poll::Ready(Err(io::Error::new(*kind, message.clone())));
                }
                StreamState::Deferred => {
                    let connection = self.connection.clone();
                    self.state = StreamState::Accepting(Box::pin(async move {
                        connection.accept_bi().await
                    }));
                }
                StreamState::Accepting(future) => {
                    match future.as_mut().poll(cx) {
                        Poll::Ready(Ok((send, recv))) => {
                            self.state = StreamState::Ready { send, recv };
                        }
                        Poll::Ready(Err(e)) => {
                            self.connection.close(0u32.into(), b"");
                            let kind = if is_error_indicating_closed(&self.connection) {
                                io::ErrorKind::UnexpectedEof
                            } else {
                                io::ErrorKind::Other
                            };
                            let message = format!("accept stream failed: {}", e);
                            self.state = StreamState::Failed(kind, message.clone());
                            return Poll::Ready(Err(io::Error::new(kind, message)));
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }
    }
}

impl AsyncRead for ObfuscatedQuicConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_stream_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        let recv = match &mut this.state {
            StreamState::Ready { recv, .. } => recv,
            _ => unreachable!("stream readiness checked above"),
        };
        match Pin::new(recv).poll_read(cx, buf) {
            Poll::Ready(Err(_)) if is_error_indicating_closed(&this.connection) => {
                // Peer going away or idle timeout reads as clean EOF.
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for ObfuscatedQuicConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.poll_stream_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        let send = match &mut this.state {
            StreamState::Ready { send, .. } => send,
            _ => unreachable!("stream readiness checked above"),
        };
        match Pin::new(send).poll_write(cx, buf) {
            Poll::Ready(Err(e)) if is_error_indicating_closed(&this.connection) => {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, e)))
            }
            other => other.map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.state {
            StreamState::Ready { send, .. } => Pin::new(send).poll_flush(cx),
            _ => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let StreamState::Ready { send, .. } = &mut this.state {
            match Pin::new(send).poll_shutdown(cx) {
                Poll::Ready(_) => {}
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for ObfuscatedQuicConn {
    fn drop(&mut self) {
        self.close();
    }
}
