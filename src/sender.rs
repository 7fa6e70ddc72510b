use crate::error::{Error, Result};
use crate::packet::{LossEntry, MessagePosition, SendDatagram};
use crate::seq::{SeqNumber, SeqNumberGen};
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// A user write waiting to be segmented. Completed with the number of bytes
/// actually queued once segmentation finishes, even if transmission has not.
pub struct WriteOp {
    pub data: Bytes,
    pub completion: oneshot::Sender<Result<usize>>,
}

struct SenderInner {
    packet_seq_gen: SeqNumberGen,
    message_seq_gen: SeqNumberGen,
    /// absolute (non-wrapping) position of `packet_seq_gen.current()`; the
    /// loss set and the in-flight map are keyed by absolute position so that
    /// sequence wrap-around cannot reorder them
    next_abs: i64,

    /// packets believed lost and awaiting retransmission. Invariant: every
    /// element is a key of `in_flight` whose datagram is not acked.
    loss_set: BTreeSet<i64>,

    /// transmitted but not yet acknowledged datagrams ("nack map")
    in_flight: BTreeMap<i64, SendDatagram>,

    /// segmented, not yet transmitted datagrams
    packets_to_send: VecDeque<SendDatagram>,

    /// flow window advertised by the peer, in packets
    peer_window: u32,

    dest_socket_id: u32,
    payload_size: usize,
    max_send_queue: usize,
}

impl SenderInner {
    fn abs_of(&self, seq: SeqNumber) -> i64 {
        self.next_abs + self.packet_seq_gen.current().seq_offset(seq)
    }

    fn update_next_send_delay(
        &self,
        sent_seq: SeqNumber,
        call_start: Instant,
        sending_period: Duration,
        delay_slot: &StdMutex<Duration>,
    ) {
        // every 16th packet is followed immediately by its probe pair
        // partner, and retransmissions never wait
        let delay = if sent_seq.to_raw() % 16 == 0 || !self.loss_set.is_empty() {
            Duration::ZERO
        } else {
            sending_period.saturating_sub(call_start.elapsed())
        };
        *delay_slot.lock().unwrap() = delay;
    }
}

/// The sender half of a session: write-op segmentation, the retransmission
/// maps, and pacing of outgoing packets.
pub struct Sender {
    inner: Mutex<SenderInner>,
    /// pacing interval until the next scheduled packet; independently
    /// lockable because the flow scheduler polls it without touching the
    /// rest of the sender state
    next_send_delay: StdMutex<Duration>,
    write_tx: StdMutex<Option<mpsc::UnboundedSender<WriteOp>>>,
    write_rx: Mutex<mpsc::UnboundedReceiver<WriteOp>>,
}

impl Sender {
    pub fn new(
        init_packet_seq: SeqNumber,
        payload_size: usize,
        max_send_queue: usize,
        initial_peer_window: u32,
    ) -> Sender {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        Sender {
            inner: Mutex::new(SenderInner {
                packet_seq_gen: SeqNumberGen::new(init_packet_seq),
                message_seq_gen: SeqNumberGen::new(SeqNumber::ZERO),
                next_abs: 0,
                loss_set: BTreeSet::new(),
                in_flight: BTreeMap::new(),
                packets_to_send: VecDeque::new(),
                peer_window: initial_peer_window,
                dest_socket_id: 0,
                payload_size,
                max_send_queue,
            }),
            next_send_delay: StdMutex::new(Duration::ZERO),
            write_tx: StdMutex::new(Some(write_tx)),
            write_rx: Mutex::new(write_rx),
        }
    }

    /// called on entering the connected state, once the peer's socket id and
    /// the negotiated packet size are known
    pub async fn init(&self, dest_socket_id: u32, payload_size: usize) {
        let mut inner = self.inner.lock().await;
        inner.dest_socket_id = dest_socket_id;
        inner.payload_size = payload_size;
    }

    /// enqueue a user write for segmentation by the unqueue loop
    pub fn push_write_op(&self, op: WriteOp) {
        let tx = self.write_tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => {
                if let Err(mpsc::error::SendError(op)) = tx.send(op) {
                    let _ = op.completion.send(Err(Error::OperationCanceled));
                }
            }
            None => {
                let _ = op.completion.send(Err(Error::OperationCanceled));
            }
        }
    }

    /// blocks until the next queued write op arrives; `None` once the sender
    /// is closed and the queue is drained
    pub async fn next_write_op(&self) -> Option<WriteOp> {
        self.write_rx.lock().await.recv().await
    }

    /// Segment a write into datagrams of `payload_size` bytes under a fresh
    /// message number and queue them for transmission. Returns true if any
    /// datagram was queued.
    pub async fn process_write_op(&self, op: WriteOp) -> bool {
        let mut inner = self.inner.lock().await;

        if op.data.is_empty() {
            let _ = op.completion.send(Ok(0));
            return false;
        }

        let message_number = inner.message_seq_gen.next();
        let payload_size = inner.payload_size;
        let total_len = op.data.len();

        let mut copied = 0usize;
        let mut created = 0usize;
        let mut queue_refused = false;

        while copied < total_len {
            if inner.packets_to_send.len() >= inner.max_send_queue {
                queue_refused = true;
                break;
            }

            let chunk_len = payload_size.min(total_len - copied);
            let position = match (copied == 0, copied + chunk_len == total_len) {
                (true, true) => MessagePosition::OnlyOnePacket,
                (true, false) => MessagePosition::First,
                (false, false) => MessagePosition::Middle,
                (false, true) => MessagePosition::Last,
            };

            let dest_socket_id = inner.dest_socket_id;
            inner.packets_to_send.push_back(SendDatagram {
                packet_seq: SeqNumber::ZERO,
                position,
                message_number,
                timestamp_us: 0,
                dest_socket_id,
                payload: op.data.slice(copied..copied + chunk_len),
                acked: false,
                pending_send: false,
            });

            copied += chunk_len;
            created += 1;
        }

        if queue_refused {
            warn!("send queue full after {} of {} bytes of a write", copied, total_len);
            if created > 0 {
                // the peer must still see a closed message
                let last = inner.packets_to_send.back_mut().unwrap();
                last.position = if created == 1 {
                    MessagePosition::OnlyOnePacket
                } else {
                    MessagePosition::Last
                };
            }
        }

        trace!("segmented write of {} bytes into {} packets", copied, created);
        let _ = op.completion.send(Ok(copied));
        created > 0
    }

    /// The scheduler's single entry point: pick the next packet to put on
    /// the wire. Retransmissions take precedence; fresh packets are held
    /// back while the in-flight map fills the flow window, except for the
    /// probe pair partner (`seq % 16 == 1`). Returns the encoded datagram
    /// and its sequence number, plus whether it is a first transmission.
    pub async fn next_scheduled_packet(
        &self,
        timestamp_us: u32,
        cc_window: u32,
        sending_period: Duration,
    ) -> Option<(BytesMut, SeqNumber, bool)> {
        let call_start = Instant::now();
        let mut inner = self.inner.lock().await;

        while let Some(&abs) = inner.loss_set.iter().next() {
            inner.loss_set.remove(&abs);

            let acked = match inner.in_flight.get(&abs) {
                Some(dgr) => dgr.acked,
                None => continue, // acked and purged since the NAK arrived
            };
            if acked {
                if !inner.in_flight.get(&abs).unwrap().pending_send {
                    inner.in_flight.remove(&abs);
                }
                continue;
            }

            let dgr = inner.in_flight.get_mut(&abs).unwrap();
            dgr.pending_send = true;
            let encoded = dgr.encode();
            let seq = dgr.packet_seq;
            trace!("retransmitting {}", seq);
            inner.update_next_send_delay(seq, call_start, sending_period, &self.next_send_delay);
            return Some((encoded, seq, false));
        }

        if inner.packets_to_send.is_empty() {
            return None;
        }

        let seq = inner.packet_seq_gen.current();
        let window = cc_window.min(inner.peer_window);
        if seq.to_raw() % 16 != 1 && inner.in_flight.len() as u32 >= window {
            // too many unacknowledged packets - wait for an ACK
            return None;
        }

        let mut dgr = inner.packets_to_send.pop_front().unwrap();
        dgr.packet_seq = seq;
        dgr.timestamp_us = timestamp_us;
        dgr.dest_socket_id = inner.dest_socket_id;
        dgr.pending_send = true;
        inner.packet_seq_gen.next();
        let abs = inner.next_abs;
        inner.next_abs += 1;

        let encoded = dgr.encode();
        inner.in_flight.insert(abs, dgr);
        inner.update_next_send_delay(seq, call_start, sending_period, &self.next_send_delay);
        Some((encoded, seq, true))
    }

    /// the flow scheduler reports completion of the UDP write here
    pub async fn on_packet_delivered(&self, seq: SeqNumber) {
        let mut inner = self.inner.lock().await;
        let abs = inner.abs_of(seq);

        let acked = match inner.in_flight.get_mut(&abs) {
            Some(dgr) => {
                dgr.pending_send = false;
                dgr.acked
            }
            None => return,
        };
        if acked {
            inner.in_flight.remove(&abs);
        }
    }

    /// mark everything strictly below `seq_ack` as acknowledged, walking
    /// backwards from the ACK position
    pub async fn ack_packets(&self, seq_ack: SeqNumber) {
        let mut inner = self.inner.lock().await;
        let ack_abs = inner.abs_of(seq_ack);

        let mut current = ack_abs - 1;
        loop {
            let Some(dgr) = inner.in_flight.get_mut(&current) else {
                break;
            };
            dgr.acked = true;
            let still_in_transit = dgr.pending_send;
            inner.loss_set.remove(&current);
            if !still_in_transit {
                inner.in_flight.remove(&current);
            }
            current -= 1;
        }
    }

    /// feed a NAK loss list into the loss set; range ends are inclusive.
    /// Returns true if the loss set is non-empty afterwards (the session
    /// should re-register with the flow).
    pub async fn update_loss_list_from_nack(&self, loss_list: &[LossEntry]) -> bool {
        let mut inner = self.inner.lock().await;

        for entry in loss_list {
            let (first, last) = match entry {
                LossEntry::Single(seq) => (*seq, *seq),
                LossEntry::Range(first, last) => (*first, *last),
            };
            let first_abs = inner.abs_of(first);
            let last_abs = inner.abs_of(last);
            if last_abs < first_abs {
                warn!("NAK range {}..{} is inverted - ignoring", first, last);
                continue;
            }

            let SenderInner {
                in_flight,
                loss_set,
                ..
            } = &mut *inner;
            for (&abs, dgr) in in_flight.range(first_abs..=last_abs) {
                if !dgr.acked {
                    loss_set.insert(abs);
                }
            }
        }

        !inner.loss_set.is_empty()
    }

    /// EXP path: everything unacknowledged goes back on the loss set;
    /// acknowledged stragglers that are not in transit are dropped.
    pub async fn update_loss_list_from_nack_packets(&self) -> bool {
        let mut inner = self.inner.lock().await;

        let SenderInner {
            in_flight,
            loss_set,
            ..
        } = &mut *inner;

        let mut purge = Vec::new();
        for (&abs, dgr) in in_flight.iter() {
            if !dgr.acked {
                loss_set.insert(abs);
            } else if !dgr.pending_send {
                purge.push(abs);
            }
        }
        for abs in purge {
            in_flight.remove(&abs);
        }

        if !loss_set.is_empty() {
            debug!("EXP requeued {} unacknowledged packets", loss_set.len());
        }
        !inner.loss_set.is_empty()
    }

    pub async fn has_packet_to_send(&self) -> bool {
        let inner = self.inner.lock().await;
        !inner.packets_to_send.is_empty() || !inner.loss_set.is_empty()
    }

    pub async fn has_loss_packets(&self) -> bool {
        !self.inner.lock().await.loss_set.is_empty()
    }

    pub async fn has_nack_packets(&self) -> bool {
        !self.inner.lock().await.in_flight.is_empty()
    }

    pub fn next_scheduled_packet_time(&self) -> Duration {
        *self.next_send_delay.lock().unwrap()
    }

    pub async fn set_peer_window(&self, window: u32) {
        self.inner.lock().await.peer_window = window;
    }

    /// light ACKs carry no buffer report; the window shrinks by the number
    /// of packets they acknowledged
    pub async fn reduce_peer_window(&self, newly_acked: u32) {
        let mut inner = self.inner.lock().await;
        inner.peer_window = inner.peer_window.saturating_sub(newly_acked).max(1);
    }

    /// Stop accepting writes and cancel everything still queued. The caller
    /// must have stopped the unqueue loop first.
    pub async fn close(&self) {
        drop(self.write_tx.lock().unwrap().take());

        let mut rx = self.write_rx.lock().await;
        while let Ok(op) = rx.try_recv() {
            let _ = op.completion.send(Err(Error::OperationCanceled));
        }

        let mut inner = self.inner.lock().await;
        inner.packets_to_send.clear();
        inner.loss_set.clear();
        inner.in_flight.clear();
    }
}
