use crate::config::RudtConfig;
use crate::error::{Error, Result};
use crate::multiplexer::{Multiplexer, PendingHandshake};
use crate::packet::HandshakePayload;
use crate::session::SocketSession;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// A listening endpoint accepting incoming connections.
pub struct RudtListener {
    multiplexer: Arc<Multiplexer>,
    incoming: Mutex<mpsc::UnboundedReceiver<PendingHandshake>>,
}

impl RudtListener {
    pub async fn bind(addr: SocketAddr, config: Arc<RudtConfig>) -> Result<RudtListener> {
        let multiplexer = Multiplexer::bind(addr, config).await?;
        let incoming = multiplexer.set_acceptor();
        Ok(RudtListener {
            multiplexer,
            incoming: Mutex::new(incoming),
        })
    }

    /// listen on a pre-assembled endpoint (e.g. one with a test shim on the
    /// send path)
    pub fn with_multiplexer(multiplexer: Arc<Multiplexer>) -> RudtListener {
        let incoming = multiplexer.set_acceptor();
        RudtListener {
            multiplexer,
            incoming: Mutex::new(incoming),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.multiplexer.local_addr()
    }

    /// wait for the next incoming connection
    pub async fn accept(&self) -> Result<RudtStream> {
        let mut incoming = self.incoming.lock().await;
        loop {
            let (handshake, from) = incoming.recv().await.ok_or(Error::NotSocket)?;

            if handshake.version != HandshakePayload::VERSION
                || handshake.socket_type != HandshakePayload::SOCKET_TYPE_STREAM
            {
                warn!("handshake from {:?} with unsupported version/type - rejecting", from);
                continue;
            }

            // the retry of a request we have already accepted may still be
            // queued behind the original
            if let Some(session) = self.multiplexer.lookup_remote(from, handshake.socket_id) {
                session.on_connection_dgr(handshake).await;
                continue;
            }

            debug!("accepting connection from {:?}", from);
            let session = self.multiplexer.accept_session(handshake, from).await;
            return Ok(RudtStream {
                session,
                multiplexer: self.multiplexer.clone(),
            });
        }
    }
}

/// A connected, bidirectional, reliable byte stream.
pub struct RudtStream {
    session: Arc<SocketSession>,
    /// keeps the shared endpoint (and its receive loop) alive for as long
    /// as any stream uses it
    multiplexer: Arc<Multiplexer>,
}

impl RudtStream {
    /// open a connection to `remote` from an ephemeral local endpoint
    pub async fn connect(remote: SocketAddr, config: Arc<RudtConfig>) -> Result<RudtStream> {
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let multiplexer = Multiplexer::bind(bind_addr, config).await?;
        Self::connect_via(multiplexer, remote).await
    }

    /// open a connection through a pre-assembled endpoint
    pub async fn connect_via(multiplexer: Arc<Multiplexer>, remote: SocketAddr) -> Result<RudtStream> {
        let session = multiplexer.connect(remote).await?;
        Ok(RudtStream {
            session,
            multiplexer,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.multiplexer.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.session.remote_addr()
    }

    /// Read some bytes into `buf`, suspending until stream data is
    /// available. Returns 0 at the end of the stream (or for an empty
    /// `buf`).
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let data = self.session.read(buf.len()).await?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// read until `buf` is completely filled; fails with
    /// [`Error::ConnectionReset`] if the stream ends early
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(Error::ConnectionReset);
            }
            filled += n;
        }
        Ok(())
    }

    /// Queue bytes for transmission, suspending until they are segmented.
    /// Returns the number of bytes accepted, which is only less than
    /// `buf.len()` if the send queue is saturated.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.session.write(Bytes::copy_from_slice(buf)).await
    }

    /// write the entire buffer, suspending while the send queue is full
    pub async fn write_all(&self, buf: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.session.write(Bytes::copy_from_slice(&buf[written..])).await?;
            if n == 0 {
                // the send queue is saturated - let the pacer drain it
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
            written += n;
        }
        Ok(())
    }

    /// close the connection, notifying the peer
    pub async fn close(&self) {
        self.session.close().await;
    }
}

impl Drop for RudtStream {
    fn drop(&mut self) {
        // best effort: notify the peer even if the user forgot to close
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let session = self.session.clone();
            handle.spawn(async move {
                session.close().await;
            });
        }
    }
}
