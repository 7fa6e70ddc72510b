use crate::config::RudtConfig;
use crate::congestion::NativeCongestionControl;
use crate::error::{Error, Result};
use crate::flow::{DatagramSocket, Flow};
use crate::packet::{ControlPacket, HandshakePayload, Packet};
use crate::session::SocketSession;
use rustc_hash::FxHashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// maximum size of a UDP datagram we are prepared to receive
const RECV_BUF_SIZE: usize = 65536;

/// a handshake request taken off the wire, waiting for an acceptor
pub(crate) type PendingHandshake = (HandshakePayload, SocketAddr);

/// The multiplexer owns one UDP endpoint shared by any number of sessions:
/// it reads datagrams, classifies them and dispatches them to the session
/// registered under the destination socket id. Handshake datagrams without a
/// destination (socket id 0) go to the listening acceptor, if any.
pub struct Multiplexer {
    recv_socket: Arc<UdpSocket>,
    send_socket: Arc<dyn DatagramSocket>,
    flow: Arc<Flow>,
    config: Arc<RudtConfig>,

    sessions: StdRwLock<FxHashMap<u32, Arc<SocketSession>>>,
    /// (remote address, remote socket id) -> local socket id, for routing
    /// repeated handshakes of an already accepted connection
    by_remote: StdRwLock<FxHashMap<(SocketAddr, u32), u32>>,

    acceptor: StdMutex<Option<mpsc::UnboundedSender<PendingHandshake>>>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl Multiplexer {
    pub async fn bind(addr: SocketAddr, config: Arc<RudtConfig>) -> Result<Arc<Multiplexer>> {
        config.validate().map_err(|_| Error::InvalidArgument)?;
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("bound UDP endpoint to {:?}", socket.local_addr()?);
        Ok(Self::with_socket(socket.clone(), socket, config))
    }

    /// assemble a multiplexer around pre-built sockets; the seam tests use
    /// to interpose packet loss on the send path
    pub fn with_socket(
        recv_socket: Arc<UdpSocket>,
        send_socket: Arc<dyn DatagramSocket>,
        config: Arc<RudtConfig>,
    ) -> Arc<Multiplexer> {
        let flow = Flow::new(send_socket.clone());

        let multiplexer = Arc::new(Multiplexer {
            recv_socket,
            send_socket,
            flow: flow.clone(),
            config,
            sessions: StdRwLock::new(FxHashMap::default()),
            by_remote: StdRwLock::new(FxHashMap::default()),
            acceptor: StdMutex::new(None),
            handles: StdMutex::new(Vec::new()),
        });

        let mut handles = multiplexer.handles.lock().unwrap();
        handles.push(tokio::spawn(Self::recv_loop(
            multiplexer.recv_socket.clone(),
            Arc::downgrade(&multiplexer),
        )));
        handles.push(tokio::spawn(flow.run()));
        drop(handles);

        multiplexer
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.recv_socket.local_addr()?)
    }

    /// register the listening side; handshake requests arrive on the
    /// returned channel
    pub(crate) fn set_acceptor(&self) -> mpsc::UnboundedReceiver<PendingHandshake> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.acceptor.lock().unwrap() = Some(tx);
        rx
    }

    /// open a client connection to `remote`; resolves once the handshake
    /// completes
    pub async fn connect(self: &Arc<Self>, remote: SocketAddr) -> Result<Arc<SocketSession>> {
        let session = self.create_session(remote, 0);
        session.start_connect();
        session.wait_connected().await?;
        Ok(session)
    }

    /// accept path: build a session for a fresh handshake request and
    /// answer it
    pub(crate) async fn accept_session(
        self: &Arc<Self>,
        handshake: HandshakePayload,
        from: SocketAddr,
    ) -> Arc<SocketSession> {
        let session = self.create_session(from, handshake.socket_id);
        session.start_accept(&handshake).await;
        session
    }

    pub(crate) fn create_session(self: &Arc<Self>, remote: SocketAddr, remote_socket_id: u32) -> Arc<SocketSession> {
        let mut sessions = self.sessions.write().unwrap();

        let mut socket_id = rand::random::<u32>();
        while socket_id == 0 || sessions.contains_key(&socket_id) {
            socket_id = rand::random();
        }

        let congestion = Box::new(NativeCongestionControl::new(self.config.packet_data_size));
        let session = SocketSession::new(
            socket_id,
            remote,
            self.config.clone(),
            congestion,
            self.send_socket.clone(),
            self.flow.clone(),
            Arc::downgrade(self),
        );

        sessions.insert(socket_id, session.clone());
        if remote_socket_id != 0 {
            self.by_remote
                .write()
                .unwrap()
                .insert((remote, remote_socket_id), socket_id);
        }
        session
    }

    pub(crate) fn lookup_remote(&self, from: SocketAddr, remote_socket_id: u32) -> Option<Arc<SocketSession>> {
        let local_id = *self.by_remote.read().unwrap().get(&(from, remote_socket_id))?;
        self.sessions.read().unwrap().get(&local_id).cloned()
    }

    /// take a closed session out of dispatch
    pub(crate) fn unbind(&self, session: &SocketSession) {
        debug!("unbinding session {}", session.socket_id());
        self.sessions.write().unwrap().remove(&session.socket_id());
        self.by_remote
            .write()
            .unwrap()
            .remove(&(session.remote_addr(), session.remote_socket_id()));
    }

    /// The receive loop holds the socket and only a weak reference to the
    /// multiplexer, so an endpoint nobody uses any more can actually drop.
    async fn recv_loop(recv_socket: Arc<UdpSocket>, weak: Weak<Multiplexer>) {
        info!("starting receive loop");
        let mut buf = vec![0u8; RECV_BUF_SIZE];

        loop {
            let (num_read, from) = match recv_socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) if e.kind() == ErrorKind::Interrupted || e.kind() == ErrorKind::WouldBlock => {
                    continue;
                }
                Err(e) => {
                    warn!("socket error: {}", e);
                    continue;
                }
            };

            let mut parse_buf = &buf[..num_read];
            let packet = match Packet::deser(&mut parse_buf) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("unparsable datagram from {:?} - dropping: {}", from, e);
                    continue;
                }
            };

            let Some(multiplexer) = weak.upgrade() else {
                return;
            };

            match packet {
                Packet::Control {
                    dest_socket_id: 0,
                    control: ControlPacket::Handshake(handshake),
                    ..
                } => {
                    multiplexer.on_listener_handshake(handshake, from).await;
                }
                packet => {
                    let dest = packet.dest_socket_id();
                    let session = multiplexer.sessions.read().unwrap().get(&dest).cloned();
                    match session {
                        Some(session) => session.on_packet(packet).await,
                        None => {
                            debug!("datagram for unknown socket id {} from {:?} - dropping", dest, from);
                        }
                    }
                }
            }
        }
    }

    /// a handshake addressed to socket id 0, i.e. to whoever is listening on
    /// this endpoint
    async fn on_listener_handshake(self: &Arc<Self>, handshake: HandshakePayload, from: SocketAddr) {
        if handshake.connection_type != HandshakePayload::CONNECTION_TYPE_REQUEST {
            trace!("non-request handshake for the listener from {:?} - dropping", from);
            return;
        }

        // a repeated request for a connection we already accepted: the
        // session re-sends its response
        if let Some(session) = self.lookup_remote(from, handshake.socket_id) {
            session.on_connection_dgr(handshake).await;
            return;
        }

        let acceptor = self.acceptor.lock().unwrap().clone();
        match acceptor {
            Some(acceptor) => {
                if acceptor.send((handshake, from)).is_err() {
                    debug!("acceptor is gone - dropping handshake from {:?}", from);
                }
            }
            None => {
                debug!("handshake from {:?} but nobody is listening - dropping", from);
            }
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        for handle in self.handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}
