use crate::cache::connections_cache;
use crate::config::RudtConfig;
use crate::congestion::{AckContext, CongestionControl};
use crate::connection_info::ConnectionInfo;
use crate::error::{Error, Result};
use crate::flow::{DatagramSocket, Flow};
use crate::multiplexer::Multiplexer;
use crate::packet::{
    AckPayload, AckStats, ControlPacket, DataPacket, HandshakePayload, Packet, CONTROL_HEADER_LEN,
    DATA_HEADER_LEN,
};
use crate::receiver::{ReadOp, Receiver, ReceiverCloseMode};
use crate::sender::{Sender, WriteOp};
use crate::seq::{SeqNumber, SeqNumberGen};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::{oneshot, watch, RwLock};
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// a light ACK is emitted every this many data packets, between timer-driven
/// full ACKs
const LIGHT_ACK_PACKET_THRESHOLD: u32 = 64;

/// Session lifecycle. Transitions are explicit replacements of the current
/// value, observed through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Connecting,
    Accepting,
    Connected,
    TimedOut,
}

/// why a session is being torn down; determines the completion codes of
/// queued operations
#[derive(Debug, Clone, Copy)]
enum CloseKind {
    User,
    PeerShutdown,
    Timeout,
    ConnectFailed,
}

/// One end of one connection: owns the sender and receiver pipelines, the
/// congestion controller, the sequence generators and the timers, and
/// dispatches every inbound datagram according to the current state.
pub struct SocketSession {
    socket_id: u32,
    remote_addr: SocketAddr,
    remote_socket_id: AtomicU32,
    config: Arc<RudtConfig>,
    start_time: Instant,
    init_packet_seq: SeqNumber,

    state_tx: watch::Sender<SessionState>,
    was_connected: AtomicBool,
    close_reason: StdMutex<Option<Error>>,

    pub(crate) sender: Sender,
    pub(crate) receiver: Receiver,
    congestion: StdMutex<Box<dyn CongestionControl>>,
    ack_seq_gen: StdMutex<SeqNumberGen>,
    connection_info: RwLock<ConnectionInfo>,
    packets_since_light_ack: AtomicU32,

    send_socket: Arc<dyn DatagramSocket>,
    flow: Arc<Flow>,
    multiplexer: Weak<Multiplexer>,

    /// when the pending EXP firing was last voided by an arrival; see
    /// [`Self::reset_exp`]
    last_exp_suppress: StdMutex<Instant>,

    task_handles: StdMutex<Vec<JoinHandle<()>>>,
    /// our own handshake datagram, retransmitted while connecting (client)
    /// or when the peer repeats its request (server)
    local_handshake: StdMutex<Option<HandshakePayload>>,
}

impl SocketSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        socket_id: u32,
        remote_addr: SocketAddr,
        config: Arc<RudtConfig>,
        congestion: Box<dyn CongestionControl>,
        send_socket: Arc<dyn DatagramSocket>,
        flow: Arc<Flow>,
        multiplexer: Weak<Multiplexer>,
    ) -> Arc<SocketSession> {
        let init_packet_seq = SeqNumber::random();

        let connection_info = match connections_cache().lookup(remote_addr.ip()) {
            Some(snapshot) => ConnectionInfo::seeded(snapshot, config.packet_data_size),
            None => ConnectionInfo::new(config.packet_data_size),
        };

        let (state_tx, _) = watch::channel(SessionState::Closed);

        Arc::new(SocketSession {
            socket_id,
            remote_addr,
            remote_socket_id: AtomicU32::new(0),
            start_time: Instant::now(),
            init_packet_seq,
            state_tx,
            was_connected: AtomicBool::new(false),
            close_reason: StdMutex::new(None),
            sender: Sender::new(
                init_packet_seq,
                config.packet_data_size - DATA_HEADER_LEN,
                config.max_send_queue_size,
                config.max_window_flow_size,
            ),
            receiver: Receiver::new(config.receive_buffer_packets),
            congestion: StdMutex::new(congestion),
            ack_seq_gen: StdMutex::new(SeqNumberGen::new(SeqNumber::random())),
            connection_info: RwLock::new(connection_info),
            packets_since_light_ack: AtomicU32::new(0),
            send_socket,
            flow,
            multiplexer,
            last_exp_suppress: StdMutex::new(Instant::now()),
            task_handles: StdMutex::new(Vec::new()),
            local_handshake: StdMutex::new(None),
            config,
        })
    }

    pub fn socket_id(&self) -> u32 {
        self.socket_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn remote_socket_id(&self) -> u32 {
        self.remote_socket_id.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    fn elapsed_timestamp_us(&self) -> u32 {
        self.start_time.elapsed().as_micros() as u32
    }

    // ------------------------------------------------------------------
    // connection setup
    // ------------------------------------------------------------------

    fn build_handshake(&self, connection_type: i32) -> HandshakePayload {
        HandshakePayload {
            version: HandshakePayload::VERSION,
            socket_type: HandshakePayload::SOCKET_TYPE_STREAM,
            init_packet_seq: self.init_packet_seq,
            max_packet_size: self.config.packet_data_size as u32,
            max_window_size: self.config.max_window_flow_size,
            connection_type,
            socket_id: self.socket_id,
            syn_cookie: rand::random(),
        }
    }

    /// client side: start handshaking, retrying until the peer responds or
    /// the configured timeout expires
    pub(crate) fn start_connect(self: &Arc<Self>) {
        self.state_tx.send_replace(SessionState::Connecting);
        let request = self.build_handshake(HandshakePayload::CONNECTION_TYPE_REQUEST);
        *self.local_handshake.lock().unwrap() = Some(request.clone());

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let deadline = {
                let Some(session) = weak.upgrade() else { return };
                Instant::now() + session.config.connect_timeout
            };
            loop {
                let Some(session) = weak.upgrade() else { return };
                if session.state() != SessionState::Connecting {
                    return;
                }
                if Instant::now() >= deadline {
                    info!("handshake with {:?} timed out", session.remote_addr);
                    // tear down from a detached task - close aborts the
                    // retry task this very code is running on
                    tokio::spawn(async move {
                        session.close_internal(CloseKind::ConnectFailed).await;
                    });
                    return;
                }
                session.send_handshake(&request).await;
                let retry = session.config.connect_retry_period;
                drop(session);
                tokio::time::sleep(retry).await;
            }
        });
        self.task_handles.lock().unwrap().push(handle);
    }

    /// server side: the session comes out of the acceptor with the peer's
    /// handshake in hand, answers it and goes straight to connected
    pub(crate) async fn start_accept(self: &Arc<Self>, request: &HandshakePayload) {
        self.state_tx.send_replace(SessionState::Accepting);
        self.remote_socket_id.store(request.socket_id, Ordering::Relaxed);

        let response = self.build_handshake(HandshakePayload::CONNECTION_TYPE_RESPONSE);
        *self.local_handshake.lock().unwrap() = Some(response.clone());

        self.on_connected(request).await;
        self.send_handshake(&response).await;
    }

    async fn send_handshake(&self, handshake: &HandshakePayload) {
        let dest = self.remote_socket_id.load(Ordering::Relaxed);
        let mut buf = BytesMut::with_capacity(CONTROL_HEADER_LEN + 32);
        ControlPacket::Handshake(handshake.clone()).ser(self.elapsed_timestamp_us(), dest, &mut buf);
        self.send_socket.send_packet(self.remote_addr, &buf).await;
    }

    /// entering the connected state: initialize both pipelines and the
    /// congestion controller from the peer's handshake, arm the timers
    async fn on_connected(self: &Arc<Self>, peer: &HandshakePayload) {
        let packet_data_size = self
            .config
            .packet_data_size
            .min(peer.max_packet_size as usize);
        self.connection_info
            .write()
            .await
            .set_packet_data_size(packet_data_size);

        self.receiver.init(peer.init_packet_seq).await;
        self.sender
            .init(
                self.remote_socket_id.load(Ordering::Relaxed),
                packet_data_size - DATA_HEADER_LEN,
            )
            .await;
        self.sender.set_peer_window(peer.max_window_size).await;

        self.congestion
            .lock()
            .unwrap()
            .init(self.init_packet_seq, self.config.max_window_flow_size);

        self.was_connected.store(true, Ordering::Relaxed);
        *self.last_exp_suppress.lock().unwrap() = Instant::now();
        self.state_tx.send_replace(SessionState::Connected);
        info!(
            "session {} connected to {:?} (remote socket {})",
            self.socket_id,
            self.remote_addr,
            self.remote_socket_id.load(Ordering::Relaxed)
        );

        let mut handles = self.task_handles.lock().unwrap();
        handles.push(tokio::spawn(Self::ack_timer_loop(Arc::downgrade(self))));
        handles.push(tokio::spawn(Self::exp_timer_loop(Arc::downgrade(self))));
        handles.push(tokio::spawn(Self::unqueue_write_loop(Arc::downgrade(self))));
    }

    /// blocks until the session leaves the connecting phase
    pub(crate) async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                SessionState::Connected => return Ok(()),
                SessionState::Closed | SessionState::TimedOut => {
                    return Err(self
                        .close_reason
                        .lock()
                        .unwrap()
                        .unwrap_or(Error::ConnectionRefused));
                }
                SessionState::Connecting | SessionState::Accepting => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::ConnectionRefused);
            }
        }
    }

    // ------------------------------------------------------------------
    // inbound dispatch
    // ------------------------------------------------------------------

    pub(crate) async fn on_packet(self: &Arc<Self>, packet: Packet) {
        match packet {
            Packet::Data(data) => self.on_data_dgr(data).await,
            Packet::Control { control, .. } => match control {
                ControlPacket::Handshake(hs) => self.on_connection_dgr(hs).await,
                other => self.on_control_dgr(other).await,
            },
        }
    }

    pub(crate) async fn on_connection_dgr(self: &Arc<Self>, handshake: HandshakePayload) {
        match self.state() {
            SessionState::Connecting
                if handshake.connection_type == HandshakePayload::CONNECTION_TYPE_RESPONSE =>
            {
                self.remote_socket_id.store(handshake.socket_id, Ordering::Relaxed);
                self.on_connected(&handshake).await;
            }
            SessionState::Connected
                if handshake.connection_type == HandshakePayload::CONNECTION_TYPE_REQUEST =>
            {
                // our response got lost - repeat it
                let response = self.local_handshake.lock().unwrap().clone();
                if let Some(response) = response {
                    debug!("repeating handshake response to {:?}", self.remote_addr);
                    self.send_handshake(&response).await;
                }
            }
            state => {
                trace!("dropping handshake datagram in state {:?}", state);
            }
        }
    }

    /// Every arrival resets the expiration counter. The pending EXP firing
    /// is only voided for ACK/NAK traffic, or while the sender has nothing
    /// awaiting acknowledgment: with packets in flight, other traffic must
    /// not keep postponing the retransmission backstop.
    async fn reset_exp(&self, with_timer: bool) {
        self.receiver.reset_exp_counter().await;
        if with_timer || !self.sender.has_nack_packets().await {
            *self.last_exp_suppress.lock().unwrap() = Instant::now();
        }
    }

    async fn on_data_dgr(self: &Arc<Self>, data: DataPacket) {
        if !self.is_connected() {
            trace!("data packet in state {:?} - dropping", self.state());
            return;
        }

        self.reset_exp(false).await;
        self.congestion.lock().unwrap().on_packet_received();

        if let Some(loss_list) = self.receiver.on_data(&data).await {
            self.send_control(ControlPacket::Nak { loss_list }).await;
        }

        let received = self.packets_since_light_ack.fetch_add(1, Ordering::Relaxed) + 1;
        if received >= LIGHT_ACK_PACKET_THRESHOLD {
            self.emit_ack(true).await;
        }
    }

    async fn on_control_dgr(self: &Arc<Self>, control: ControlPacket) {
        if !self.is_connected() {
            trace!("control packet in state {:?} - dropping", self.state());
            return;
        }

        match control {
            ControlPacket::KeepAlive => {
                self.reset_exp(false).await;
            }
            ControlPacket::Ack { ack_seq, payload } => {
                self.reset_exp(true).await;
                self.handle_ack(ack_seq, payload).await;
            }
            ControlPacket::Nak { loss_list } => {
                self.reset_exp(true).await;
                let needs_resend = self.sender.update_loss_list_from_nack(&loss_list).await;
                self.congestion.lock().unwrap().on_loss(&loss_list);
                if needs_resend {
                    self.flow.register(self);
                }
            }
            ControlPacket::AckOfAck { ack_seq } => {
                self.reset_exp(false).await;
                self.handle_ack_of_ack(ack_seq).await;
            }
            ControlPacket::Shutdown => {
                debug!("peer {:?} shut the connection down", self.remote_addr);
                self.reset_exp(false).await;
                self.close_internal(CloseKind::PeerShutdown).await;
            }
            ControlPacket::MessageDropRequest { message_number, .. } => {
                // in-order-only delivery: dropping messages is not supported
                trace!("ignoring drop request for message {}", message_number);
                self.reset_exp(false).await;
            }
            ControlPacket::Handshake(_) => unreachable!("handled by on_connection_dgr"),
        }
    }

    async fn handle_ack(self: &Arc<Self>, ack_seq: SeqNumber, payload: AckPayload) {
        self.sender.ack_packets(payload.largest_seq).await;
        self.send_control(ControlPacket::AckOfAck { ack_seq }).await;

        let largest_acked = self.receiver.largest_acked_seq().await;
        let newly_acked = largest_acked.seq_offset(payload.largest_seq);

        match payload.stats {
            None => {
                // light ACK: no buffer report, shrink the window by what it
                // acknowledged
                if newly_acked >= 0 {
                    self.sender.reduce_peer_window(newly_acked as u32).await;
                    self.receiver.set_largest_acked_seq(payload.largest_seq).await;
                }
            }
            Some(stats) => {
                let (rtt_us, arrival, capacity) = {
                    let mut info = self.connection_info.write().await;
                    info.update_rtt(stats.rtt_us);
                    let rtt_diff = stats.rtt_us.abs_diff(info.rtt_us());
                    info.update_rtt_var(rtt_diff);
                    info.update_ack_period();
                    info.update_nak_period();
                    if stats.arrival_speed > 0 {
                        info.update_arrival_speed(stats.arrival_speed as f64);
                    }
                    if stats.link_capacity > 0 {
                        info.update_link_capacity(stats.link_capacity as f64);
                    }
                    (info.rtt_us(), info.arrival_speed(), info.link_capacity())
                };

                self.congestion.lock().unwrap().on_ack(&AckContext {
                    largest_seq: payload.largest_seq,
                    rtt_us,
                    arrival_speed: arrival,
                    link_capacity: capacity,
                });

                if newly_acked >= 0 {
                    self.receiver.set_largest_acked_seq(payload.largest_seq).await;
                    self.sender.set_peer_window(stats.available_buffer).await;
                }
            }
        }

        // the ACK may have opened window space
        self.flow.register(self);
    }

    async fn handle_ack_of_ack(&self, ack_seq: SeqNumber) {
        let Some((packet_seq, rtt)) = self.receiver.ack_ack(ack_seq).await else {
            trace!("ACK-of-ACK for unknown ack seq {} - ignoring", ack_seq);
            return;
        };

        if packet_seq
            .compare(self.receiver.largest_ack_number_acknowledged().await)
            > 0
        {
            self.receiver
                .set_largest_ack_number_acknowledged(packet_seq)
                .await;
        }

        let rtt_us = rtt.as_micros() as u32;
        let mut info = self.connection_info.write().await;
        info.update_rtt(rtt_us);
        let rtt_diff = rtt_us.abs_diff(info.rtt_us());
        info.update_rtt_var(rtt_diff);
        info.update_ack_period();
        info.update_nak_period();
    }

    // ------------------------------------------------------------------
    // timers
    // ------------------------------------------------------------------

    async fn ack_timer_loop(weak: Weak<SocketSession>) {
        loop {
            let period = {
                let Some(session) = weak.upgrade() else { return };
                let period = session.connection_info.read().await.ack_period();
                period
            };
            tokio::time::sleep(period).await;

            let Some(session) = weak.upgrade() else { return };
            if !session.is_connected() {
                return;
            }
            session.emit_ack(false).await;
        }
    }

    async fn exp_timer_loop(weak: Weak<SocketSession>) {
        loop {
            let period = {
                let Some(session) = weak.upgrade() else { return };
                let period = session.connection_info.read().await.exp_period();
                period
            };
            tokio::time::sleep(period).await;

            let Some(session) = weak.upgrade() else { return };
            if !session.is_connected() {
                return;
            }
            if !session.on_exp_tick().await {
                return;
            }
        }
    }

    async fn unqueue_write_loop(weak: Weak<SocketSession>) {
        loop {
            let Some(session) = weak.upgrade() else { return };
            let Some(op) = session.sender.next_write_op().await else {
                return;
            };
            if session.sender.process_write_op(op).await {
                session.flow.register(&session);
            }
        }
    }

    /// Emit an ACK unless it would duplicate the previous one: a full ACK is
    /// suppressed while the ACK position is already confirmed by an
    /// ACK-of-ACK, or unchanged and younger than two round trips.
    async fn emit_ack(self: &Arc<Self>, light: bool) {
        let now = Instant::now();
        let ack_number = self.receiver.ack_number().await;

        if !light {
            if ack_number == self.receiver.largest_ack_number_acknowledged().await {
                return;
            }
            let (last_ack, last_time) = self.receiver.last_ack_number().await;
            if ack_number == last_ack
                && now - last_time < 2 * self.connection_info.read().await.rtt()
            {
                return;
            }
        }

        let ack_seq = self.ack_seq_gen.lock().unwrap().next();

        let stats = if light {
            // the 64-packet counter restarts only on light ACKs; timer-driven
            // full ACKs do not disturb the cadence
            self.packets_since_light_ack.store(0, Ordering::Relaxed);
            None
        } else {
            let info = self.connection_info.read().await;
            Some(AckStats {
                rtt_us: info.rtt_us(),
                rtt_var_us: info.rtt_var_us(),
                available_buffer: self.receiver.available_receive_buffer_size().await,
                arrival_speed: self.receiver.arrival_speed().await.ceil() as u32,
                link_capacity: self.receiver.link_capacity().await.ceil() as u32,
            })
        };

        self.receiver.store_ack(ack_seq, ack_number, now).await;
        self.receiver.set_last_ack_number(ack_number, now).await;

        trace!("sending {} ACK up to {}", if light { "light" } else { "full" }, ack_number);
        self.send_control(ControlPacket::Ack {
            ack_seq,
            payload: AckPayload {
                largest_seq: ack_number,
                stats,
            },
        })
        .await;
    }

    /// one firing of the EXP timer; returns false when the session expired
    async fn on_exp_tick(self: &Arc<Self>) -> bool {
        // a suppressing arrival during the sleep voids this firing, and the
        // timer just re-arms; see reset_exp for what suppresses
        let period = self.connection_info.read().await.exp_period();
        if self.last_exp_suppress.lock().unwrap().elapsed() < period {
            return true;
        }

        if !self.sender.has_loss_packets().await
            && self.sender.update_loss_list_from_nack_packets().await
        {
            self.flow.register(self);
        }

        if self.receiver.has_timeout().await {
            warn!("session {} to {:?} expired", self.socket_id, self.remote_addr);
            self.congestion.lock().unwrap().on_timeout();
            // tear down from a detached task - close aborts the timer task
            // this very code is running on
            let session = self.clone();
            tokio::spawn(async move {
                session.close_internal(CloseKind::Timeout).await;
            });
            return false;
        }

        if !self.sender.has_loss_packets().await {
            self.send_control(ControlPacket::KeepAlive).await;
        }

        let exp_count = self.receiver.inc_exp_counter().await;
        self.connection_info.write().await.update_exp_period(exp_count);
        true
    }

    // ------------------------------------------------------------------
    // outbound
    // ------------------------------------------------------------------

    async fn send_control(&self, control: ControlPacket) {
        let mut buf = BytesMut::with_capacity(CONTROL_HEADER_LEN + 64);
        control.ser(
            self.elapsed_timestamp_us(),
            self.remote_socket_id.load(Ordering::Relaxed),
            &mut buf,
        );
        self.send_socket.send_packet(self.remote_addr, &buf).await;
    }

    /// scheduler entry point: the next data packet to put on the wire
    pub(crate) async fn next_scheduled_packet(&self) -> Option<(BytesMut, SeqNumber)> {
        if !self.is_connected() {
            return None;
        }

        let (window, period) = {
            let cc = self.congestion.lock().unwrap();
            (cc.window_flow_size(), cc.sending_period())
        };

        let (buf, seq, fresh) = self
            .sender
            .next_scheduled_packet(self.elapsed_timestamp_us(), window, period)
            .await?;

        if fresh {
            self.congestion.lock().unwrap().update_last_send_seq(seq);
        }
        Some((buf, seq))
    }

    /// the flow reports completion of the UDP write
    pub(crate) async fn after_packet_sent(&self, seq: SeqNumber) {
        self.congestion.lock().unwrap().on_packet_sent(seq);
        self.sender.on_packet_delivered(seq).await;
    }

    pub(crate) async fn has_packet_to_send(&self) -> bool {
        self.is_connected() && self.sender.has_packet_to_send().await
    }

    pub(crate) fn next_scheduled_packet_time(&self) -> std::time::Duration {
        self.sender.next_scheduled_packet_time()
    }

    // ------------------------------------------------------------------
    // user operations
    // ------------------------------------------------------------------

    /// read up to `max_len` stream bytes; empty result means end of stream
    pub async fn read(&self, max_len: usize) -> Result<Vec<u8>> {
        if !self.was_connected.load(Ordering::Relaxed) {
            return Err(Error::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        self.receiver
            .push_read_op(ReadOp {
                max_len,
                completion: tx,
            })
            .await;
        rx.await.map_err(|_| Error::OperationCanceled)?
    }

    /// queue bytes for transmission; resolves with the number of bytes
    /// accepted once segmentation finishes
    pub async fn write(&self, data: Bytes) -> Result<usize> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        self.sender.push_write_op(WriteOp {
            data,
            completion: tx,
        });
        rx.await.map_err(|_| Error::OperationCanceled)?
    }

    pub async fn close(&self) {
        self.close_internal(CloseKind::User).await;
    }

    // ------------------------------------------------------------------
    // teardown
    // ------------------------------------------------------------------

    async fn close_internal(&self, kind: CloseKind) {
        let was_connected = {
            let previous = self.state();
            if matches!(previous, SessionState::Closed | SessionState::TimedOut) {
                return;
            }
            previous == SessionState::Connected
        };

        let (session_error, read_mode) = match kind {
            CloseKind::User => (Error::OperationCanceled, ReceiverCloseMode::Error(Error::OperationCanceled)),
            CloseKind::PeerShutdown => (Error::NotConnected, ReceiverCloseMode::Eof),
            CloseKind::Timeout => (Error::ConnectionAborted, ReceiverCloseMode::Error(Error::ConnectionAborted)),
            CloseKind::ConnectFailed => (Error::ConnectionRefused, ReceiverCloseMode::Error(Error::ConnectionRefused)),
        };
        *self.close_reason.lock().unwrap() = Some(session_error);

        self.state_tx.send_replace(match kind {
            CloseKind::Timeout => SessionState::TimedOut,
            _ => SessionState::Closed,
        });
        debug!("closing session {} to {:?} ({:?})", self.socket_id, self.remote_addr, kind);

        for handle in self.task_handles.lock().unwrap().drain(..) {
            handle.abort();
        }

        if was_connected {
            self.sender.close().await;
            self.receiver.close(read_mode).await;
            self.congestion.lock().unwrap().on_close();
            self.send_control(ControlPacket::Shutdown).await;

            let snapshot = self.connection_info.read().await.snapshot();
            connections_cache().update(self.remote_addr.ip(), snapshot);
        }

        if let Some(mux) = self.multiplexer.upgrade() {
            mux.unbind(self);
        }
    }
}

impl Drop for SocketSession {
    fn drop(&mut self) {
        for handle in self.task_handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::MockDatagramSocket;
    use crate::packet::MessagePosition;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    type SentPackets = Arc<Mutex<Vec<Vec<u8>>>>;

    async fn test_multiplexer(config: RudtConfig) -> (Arc<Multiplexer>, SentPackets) {
        let sent: SentPackets = Arc::new(Mutex::new(Vec::new()));

        let mut socket = MockDatagramSocket::new();
        let captured = sent.clone();
        socket
            .expect_send_packet()
            .returning(move |_, packet_buf| {
                captured.lock().unwrap().push(packet_buf.to_vec());
            });
        socket
            .expect_local_addr()
            .return_const(SocketAddr::from(([127, 0, 0, 1], 1)));

        let recv_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let multiplexer =
            Multiplexer::with_socket(recv_socket, Arc::new(socket), Arc::new(config));
        (multiplexer, sent)
    }

    fn peer_handshake(init_seq: u32) -> HandshakePayload {
        HandshakePayload {
            version: HandshakePayload::VERSION,
            socket_type: HandshakePayload::SOCKET_TYPE_STREAM,
            init_packet_seq: SeqNumber::from_raw(init_seq),
            max_packet_size: 1472,
            max_window_size: 25600,
            connection_type: HandshakePayload::CONNECTION_TYPE_REQUEST,
            socket_id: 77,
            syn_cookie: 0,
        }
    }

    async fn connected_session() -> (Arc<Multiplexer>, Arc<SocketSession>, SentPackets) {
        let (multiplexer, sent) = test_multiplexer(RudtConfig::default_ipv4()).await;
        let session = multiplexer.create_session(SocketAddr::from(([127, 0, 0, 1], 9)), 77);
        session.start_accept(&peer_handshake(1000)).await;
        (multiplexer, session, sent)
    }

    fn data_packet(seq: u32, payload: &[u8]) -> Packet {
        Packet::Data(DataPacket {
            packet_seq: SeqNumber::from_raw(seq),
            position: MessagePosition::OnlyOnePacket,
            in_order: true,
            message_number: SeqNumber::ZERO,
            timestamp_us: 0,
            dest_socket_id: 0,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// (control type, datagram length) of every captured control packet
    fn sent_control_packets(sent: &SentPackets) -> Vec<(u8, usize)> {
        sent.lock()
            .unwrap()
            .iter()
            .filter(|buf| buf[0] & 0x80 != 0)
            .map(|buf| (buf[1], buf.len()))
            .collect()
    }

    const TYPE_HANDSHAKE: u8 = 0;
    const TYPE_ACK: u8 = 2;
    const TYPE_SHUTDOWN: u8 = 5;
    const TYPE_ACK_OF_ACK: u8 = 6;
    const LIGHT_ACK_LEN: usize = CONTROL_HEADER_LEN + 4;

    #[tokio::test]
    async fn test_accept_answers_handshake_and_connects() {
        let (_multiplexer, session, sent) = connected_session().await;

        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.remote_socket_id(), 77);

        let controls = sent_control_packets(&sent);
        assert_eq!(controls.len(), 1);
        assert_eq!(controls[0].0, TYPE_HANDSHAKE);
    }

    #[tokio::test]
    async fn test_ops_fail_before_connected() {
        let (multiplexer, _sent) = test_multiplexer(RudtConfig::default_ipv4()).await;
        let session = multiplexer.create_session(SocketAddr::from(([127, 0, 0, 1], 9)), 0);

        assert_eq!(session.read(16).await, Err(Error::NotConnected));
        assert_eq!(
            session.write(Bytes::from_static(b"x")).await,
            Err(Error::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_light_ack_every_64_packets() {
        let (_multiplexer, session, sent) = connected_session().await;

        for i in 0..64u32 {
            session.on_packet(data_packet(1000 + i, b"x")).await;
        }

        let light_acks = sent_control_packets(&sent)
            .iter()
            .filter(|&&(t, len)| t == TYPE_ACK && len == LIGHT_ACK_LEN)
            .count();
        assert_eq!(light_acks, 1);

        // the counter restarts after the ACK
        for i in 64..127u32 {
            session.on_packet(data_packet(1000 + i, b"x")).await;
        }
        let light_acks = sent_control_packets(&sent)
            .iter()
            .filter(|&&(t, len)| t == TYPE_ACK && len == LIGHT_ACK_LEN)
            .count();
        assert_eq!(light_acks, 1);
    }

    #[tokio::test]
    async fn test_full_ack_duplicate_suppression() {
        let (_multiplexer, session, sent) = connected_session().await;
        session.on_packet(data_packet(1000, b"x")).await;

        session.emit_ack(false).await;
        session.emit_ack(false).await;

        let acks = sent_control_packets(&sent)
            .iter()
            .filter(|&&(t, _)| t == TYPE_ACK)
            .count();
        assert_eq!(acks, 1, "second timer firing without new data must stay silent");
    }

    #[tokio::test]
    async fn test_peer_shutdown_closes_and_reads_eof() {
        let (_multiplexer, session, sent) = connected_session().await;
        session.on_packet(data_packet(1000, b"tail")).await;

        session
            .on_packet(Packet::Control {
                timestamp_us: 0,
                dest_socket_id: session.socket_id(),
                control: ControlPacket::Shutdown,
            })
            .await;

        assert_eq!(session.state(), SessionState::Closed);
        // buffered data is still readable, then end of stream
        assert_eq!(session.read(16).await.unwrap(), b"tail");
        assert_eq!(session.read(16).await.unwrap(), Vec::<u8>::new());

        // the shutdown is answered in kind
        assert!(sent_control_packets(&sent)
            .iter()
            .any(|&(t, _)| t == TYPE_SHUTDOWN));
    }

    #[tokio::test]
    async fn test_ack_is_confirmed_and_clears_in_flight() {
        let (_multiplexer, session, sent) = connected_session().await;

        assert_eq!(session.write(Bytes::from_static(b"payload")).await, Ok(7));

        // wait for the flow to put the data packet on the wire
        let mut sent_seq = None;
        for _ in 0..100 {
            if let Some(buf) = sent
                .lock()
                .unwrap()
                .iter()
                .find(|buf| buf[0] & 0x80 == 0)
            {
                sent_seq = Some(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]));
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent_seq = SeqNumber::from_raw(sent_seq.expect("data packet was never sent"));
        // let the flow finish its post-send bookkeeping
        tokio::time::sleep(Duration::from_millis(50)).await;

        session
            .on_packet(Packet::Control {
                timestamp_us: 0,
                dest_socket_id: session.socket_id(),
                control: ControlPacket::Ack {
                    ack_seq: SeqNumber::from_raw(9),
                    payload: AckPayload {
                        largest_seq: sent_seq.inc(),
                        stats: Some(AckStats {
                            rtt_us: 50_000,
                            rtt_var_us: 10_000,
                            available_buffer: 4096,
                            arrival_speed: 0,
                            link_capacity: 0,
                        }),
                    },
                },
            })
            .await;

        assert!(!session.sender.has_nack_packets().await);
        assert!(sent_control_packets(&sent)
            .iter()
            .any(|&(t, _)| t == TYPE_ACK_OF_ACK));
    }

    #[tokio::test]
    async fn test_exp_suppression_spares_retransmission_backstop() {
        let (_multiplexer, session, sent) = connected_session().await;

        // put one packet in flight
        assert_eq!(session.write(Bytes::from_static(b"inflight")).await, Ok(8));
        let mut data_seq = None;
        for _ in 0..100 {
            if let Some(buf) = sent.lock().unwrap().iter().find(|buf| buf[0] & 0x80 == 0) {
                data_seq = Some(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]));
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let data_seq = SeqNumber::from_raw(data_seq.expect("data packet was never sent"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.sender.has_nack_packets().await);

        let before = *session.last_exp_suppress.lock().unwrap();

        // ordinary data traffic must not postpone the EXP backstop while a
        // packet awaits acknowledgment
        session.on_packet(data_packet(1000, b"x")).await;
        assert_eq!(*session.last_exp_suppress.lock().unwrap(), before);

        // an ACK does, even one that leaves the packet unacknowledged
        session
            .on_packet(Packet::Control {
                timestamp_us: 0,
                dest_socket_id: session.socket_id(),
                control: ControlPacket::Ack {
                    ack_seq: SeqNumber::from_raw(3),
                    payload: AckPayload {
                        largest_seq: data_seq,
                        stats: None,
                    },
                },
            })
            .await;
        assert!(*session.last_exp_suppress.lock().unwrap() > before);
        assert!(session.sender.has_nack_packets().await);
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_timeout() {
        let mut config = RudtConfig::default_ipv4();
        config.connect_timeout = Duration::from_millis(100);
        config.connect_retry_period = Duration::from_millis(20);

        let (multiplexer, sent) = test_multiplexer(config).await;
        let session = multiplexer.create_session(SocketAddr::from(([127, 0, 0, 1], 9)), 0);
        session.start_connect();

        assert_eq!(session.wait_connected().await, Err(Error::ConnectionRefused));
        assert_eq!(session.state(), SessionState::Closed);

        // the handshake was tried more than once
        let handshakes = sent_control_packets(&sent)
            .iter()
            .filter(|&&(t, _)| t == TYPE_HANDSHAKE)
            .count();
        assert!(handshakes >= 2, "saw only {} handshake attempts", handshakes);
    }
}
