use crate::error::{Error, Result};
use crate::estimators::{ArrivalSpeedEstimator, LinkCapacityEstimator};
use crate::packet::{DataPacket, LossEntry};
use crate::seq::SeqNumber;
use bytes::Bytes;
use std::cmp::max;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace};

const ACK_HISTORY_BOUND: usize = 1024;

/// a session has expired when the EXP counter exceeds this AND
/// [`EXP_TIMEOUT`] has passed since the counter was last reset - either
/// condition alone is not fatal
const EXP_COUNT_THRESHOLD: u32 = 16;
const EXP_TIMEOUT: Duration = Duration::from_secs(10);

/// A suspended user read. Completed with at most `max_len` bytes as soon as
/// contiguous stream data is available, with an empty buffer at end of
/// stream, or with an error when the session goes away.
pub struct ReadOp {
    pub max_len: usize,
    pub completion: oneshot::Sender<Result<Vec<u8>>>,
}

/// one full or light ACK sent, retained until the matching ACK-of-ACK
/// arrives so the round trip can be measured
#[derive(Debug, Clone, Copy)]
struct AckRecord {
    ack_seq: SeqNumber,
    packet_seq: SeqNumber,
    sent_at: Instant,
}

/// how reads queued at close time are completed
#[derive(Debug, Clone, Copy)]
pub enum ReceiverCloseMode {
    /// clean shutdown from the peer: pending and future reads drain buffered
    /// data, then complete empty (end of stream)
    Eof,
    /// the session died: pending and future reads fail with this code
    Error(Error),
}

struct ReceiverInner {
    /// the next packet sequence number that extends the contiguous prefix;
    /// everything before it has been handed to the ready queue
    next_expected: SeqNumber,
    /// absolute (non-wrapping) counterpart of `next_expected`; reassembly
    /// bookkeeping is keyed by absolute position so that sequence number
    /// wrap-around cannot reorder the buffer
    expected_abs: i64,
    /// absolute position of the largest packet received so far
    largest_abs: i64,

    reassembly: BTreeMap<i64, Bytes>,

    /// contiguous payload drained out of the reassembly buffer, waiting for
    /// user reads
    ready: VecDeque<Bytes>,
    ready_bytes: usize,
    pending_reads: VecDeque<ReadOp>,

    ack_history: VecDeque<AckRecord>,

    arrival: ArrivalSpeedEstimator,
    capacity: LinkCapacityEstimator,
    /// absolute position + arrival time of an open probe pair start
    probe_start: Option<(i64, Instant)>,

    exp_count: u32,
    last_exp_reset: Instant,

    // sender-direction ACK bookkeeping, kept on the receiver as the single
    // home of per-connection ACK state
    largest_acked_seq: SeqNumber,
    largest_ack_number_acknowledged: SeqNumber,
    last_ack_number: SeqNumber,
    last_ack_time: Instant,

    receive_buffer_packets: u32,
    closed: Option<ReceiverCloseMode>,
}

impl ReceiverInner {
    fn seq_at(&self, abs: i64) -> SeqNumber {
        self.next_expected.advance(abs - self.expected_abs)
    }

    fn on_data(&mut self, data: &DataPacket, now: Instant) -> Option<Vec<LossEntry>> {
        self.arrival.on_arrival(now);

        let offset = self.next_expected.seq_offset(data.packet_seq);
        let abs = self.expected_abs + offset;

        // every 16th packet is sent back to back with its successor; the
        // receive interval of such a pair feeds the link capacity estimate
        if data.packet_seq.to_raw() % 16 == 0 {
            self.probe_start = Some((abs, now));
        } else if data.packet_seq.to_raw() % 16 == 1 {
            if let Some((start_abs, start_time)) = self.probe_start.take() {
                if start_abs + 1 == abs {
                    self.capacity.record_probe_interval(now - start_time);
                }
            }
        }

        if abs < self.expected_abs {
            trace!("packet {} is below the delivered prefix - dropping", data.packet_seq);
            return None;
        }
        if self.reassembly.contains_key(&abs) {
            trace!("packet {} is a duplicate - dropping", data.packet_seq);
            return None;
        }

        let nak = if abs > self.largest_abs + 1 {
            let first_missing = self.largest_abs + 1;
            let entry = if first_missing == abs - 1 {
                LossEntry::Single(self.seq_at(first_missing))
            } else {
                LossEntry::Range(self.seq_at(first_missing), self.seq_at(abs - 1))
            };
            debug!("gap detected before {}: NAK {:?}", data.packet_seq, entry);
            Some(vec![entry])
        } else {
            None
        };

        if abs > self.largest_abs {
            self.largest_abs = abs;
        }
        self.reassembly.insert(abs, data.payload.clone());

        // hand the contiguous prefix over to readers
        while let Some(payload) = self.reassembly.remove(&self.expected_abs) {
            self.expected_abs += 1;
            self.next_expected = self.next_expected.inc();
            if !payload.is_empty() {
                self.ready_bytes += payload.len();
                self.ready.push_back(payload);
            }
        }

        self.complete_pending_reads();
        nak
    }

    fn complete_pending_reads(&mut self) {
        while let Some(op) = self.pending_reads.front() {
            if self.ready_bytes > 0 {
                let max_len = op.max_len;
                let op = self.pending_reads.pop_front().unwrap();
                let data = self.take_ready(max_len);
                let _ = op.completion.send(Ok(data));
            } else {
                match self.closed {
                    Some(ReceiverCloseMode::Eof) => {
                        let op = self.pending_reads.pop_front().unwrap();
                        let _ = op.completion.send(Ok(Vec::new()));
                    }
                    Some(ReceiverCloseMode::Error(e)) => {
                        let op = self.pending_reads.pop_front().unwrap();
                        let _ = op.completion.send(Err(e));
                    }
                    None => break,
                }
            }
        }
    }

    /// removes and returns up to `max_len` ready bytes
    fn take_ready(&mut self, max_len: usize) -> Vec<u8> {
        let mut result = Vec::with_capacity(max_len.min(self.ready_bytes));
        while result.len() < max_len {
            let Some(mut chunk) = self.ready.pop_front() else {
                break;
            };
            let take = (max_len - result.len()).min(chunk.len());
            result.extend_from_slice(&chunk[..take]);
            if take < chunk.len() {
                self.ready.push_front(chunk.split_off(take));
            }
        }
        self.ready_bytes -= result.len();
        result
    }

    fn push_read_op(&mut self, op: ReadOp) {
        self.pending_reads.push_back(op);
        self.complete_pending_reads();
    }

    fn store_ack(&mut self, ack_seq: SeqNumber, packet_seq: SeqNumber, sent_at: Instant) {
        self.ack_history.push_back(AckRecord {
            ack_seq,
            packet_seq,
            sent_at,
        });
        if self.ack_history.len() > ACK_HISTORY_BOUND {
            self.ack_history.pop_front();
        }
    }

    fn ack_ack(&mut self, ack_seq: SeqNumber, now: Instant) -> Option<(SeqNumber, Duration)> {
        self.ack_history
            .iter()
            .rev()
            .find(|record| record.ack_seq == ack_seq)
            .map(|record| (record.packet_seq, now - record.sent_at))
    }

    fn available_receive_buffer_size(&self) -> u32 {
        let buffered = (self.reassembly.len() + self.ready.len()) as u32;
        max(self.receive_buffer_packets.saturating_sub(buffered), 2)
    }

    fn close(&mut self, mode: ReceiverCloseMode) {
        if self.closed.is_none() {
            self.closed = Some(mode);
        }
        self.complete_pending_reads();
    }
}

/// The receiver half of a session: reassembly, loss detection, ACK history,
/// arrival / capacity estimation and the pending read queue.
pub struct Receiver {
    inner: RwLock<ReceiverInner>,
}

impl Receiver {
    pub fn new(receive_buffer_packets: u32) -> Receiver {
        let now = Instant::now();
        Receiver {
            inner: RwLock::new(ReceiverInner {
                next_expected: SeqNumber::ZERO,
                expected_abs: 0,
                largest_abs: -1,
                reassembly: BTreeMap::new(),
                ready: VecDeque::new(),
                ready_bytes: 0,
                pending_reads: VecDeque::new(),
                ack_history: VecDeque::new(),
                arrival: ArrivalSpeedEstimator::new(),
                capacity: LinkCapacityEstimator::new(),
                probe_start: None,
                exp_count: 0,
                last_exp_reset: now,
                largest_acked_seq: SeqNumber::ZERO,
                largest_ack_number_acknowledged: SeqNumber::ZERO,
                last_ack_number: SeqNumber::ZERO,
                last_ack_time: now,
                receive_buffer_packets,
                closed: None,
            }),
        }
    }

    /// called on entering the connected state with the peer's initial packet
    /// sequence number
    pub async fn init(&self, init_packet_seq: SeqNumber) {
        let mut inner = self.inner.write().await;
        inner.next_expected = init_packet_seq;
        inner.expected_abs = 0;
        inner.largest_abs = -1;
        inner.largest_acked_seq = init_packet_seq;
        inner.largest_ack_number_acknowledged = init_packet_seq;
        inner.last_ack_number = init_packet_seq;
        let now = Instant::now();
        inner.last_exp_reset = now;
        inner.last_ack_time = now;
    }

    /// insert a data packet; returns the loss list of a NAK to emit
    /// immediately if the packet opened a fresh gap
    pub async fn on_data(&self, data: &DataPacket) -> Option<Vec<LossEntry>> {
        self.inner.write().await.on_data(data, Instant::now())
    }

    pub async fn push_read_op(&self, op: ReadOp) {
        self.inner.write().await.push_read_op(op);
    }

    /// the sequence number up to which (exclusively) everything has arrived
    /// contiguously - the number carried in outgoing ACKs
    pub async fn ack_number(&self) -> SeqNumber {
        self.inner.read().await.next_expected
    }

    pub async fn store_ack(&self, ack_seq: SeqNumber, packet_seq: SeqNumber, sent_at: Instant) {
        self.inner.write().await.store_ack(ack_seq, packet_seq, sent_at);
    }

    /// look up the ACK history entry for an ACK-of-ACK; returns the packet
    /// sequence number the ACK referred to and the measured round trip
    pub async fn ack_ack(&self, ack_seq: SeqNumber) -> Option<(SeqNumber, Duration)> {
        self.inner.write().await.ack_ack(ack_seq, Instant::now())
    }

    pub async fn has_timeout(&self) -> bool {
        let inner = self.inner.read().await;
        inner.exp_count > EXP_COUNT_THRESHOLD
            && inner.last_exp_reset.elapsed() > EXP_TIMEOUT
    }

    pub async fn reset_exp_counter(&self) {
        let mut inner = self.inner.write().await;
        inner.exp_count = 0;
        inner.last_exp_reset = Instant::now();
    }

    /// returns the incremented counter value
    pub async fn inc_exp_counter(&self) -> u32 {
        let mut inner = self.inner.write().await;
        inner.exp_count += 1;
        inner.exp_count
    }

    pub async fn exp_count(&self) -> u32 {
        self.inner.read().await.exp_count
    }

    pub async fn available_receive_buffer_size(&self) -> u32 {
        self.inner.read().await.available_receive_buffer_size()
    }

    pub async fn arrival_speed(&self) -> f64 {
        self.inner.read().await.arrival.packets_per_second()
    }

    pub async fn link_capacity(&self) -> f64 {
        self.inner.read().await.capacity.packets_per_second()
    }

    pub async fn largest_acked_seq(&self) -> SeqNumber {
        self.inner.read().await.largest_acked_seq
    }

    pub async fn set_largest_acked_seq(&self, seq: SeqNumber) {
        self.inner.write().await.largest_acked_seq = seq;
    }

    pub async fn largest_ack_number_acknowledged(&self) -> SeqNumber {
        self.inner.read().await.largest_ack_number_acknowledged
    }

    pub async fn set_largest_ack_number_acknowledged(&self, seq: SeqNumber) {
        self.inner.write().await.largest_ack_number_acknowledged = seq;
    }

    pub async fn last_ack_number(&self) -> (SeqNumber, Instant) {
        let inner = self.inner.read().await;
        (inner.last_ack_number, inner.last_ack_time)
    }

    pub async fn set_last_ack_number(&self, seq: SeqNumber, at: Instant) {
        let mut inner = self.inner.write().await;
        inner.last_ack_number = seq;
        inner.last_ack_time = at;
    }

    /// tear down: complete queued reads per `mode`; later reads observe the
    /// same outcome
    pub async fn close(&self, mode: ReceiverCloseMode) {
        self.inner.write().await.close(mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MessagePosition;
    use rstest::rstest;

    fn data(seq: u32, payload: &[u8]) -> DataPacket {
        DataPacket {
            packet_seq: SeqNumber::from_raw(seq),
            position: MessagePosition::OnlyOnePacket,
            in_order: true,
            message_number: SeqNumber::ZERO,
            timestamp_us: 0,
            dest_socket_id: 1,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    async fn receiver_at(init_seq: u32) -> Receiver {
        let receiver = Receiver::new(64);
        receiver.init(SeqNumber::from_raw(init_seq)).await;
        receiver
    }

    async fn read(receiver: &Receiver, max_len: usize) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        receiver
            .push_read_op(ReadOp {
                max_len,
                completion: tx,
            })
            .await;
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_in_order_delivery() {
        let receiver = receiver_at(100).await;

        assert_eq!(receiver.on_data(&data(100, b"hel")).await, None);
        assert_eq!(receiver.on_data(&data(101, b"lo")).await, None);

        assert_eq!(read(&receiver, 10).await.unwrap(), b"hello");
        assert_eq!(receiver.ack_number().await, SeqNumber::from_raw(102));
    }

    #[tokio::test]
    async fn test_read_capped_at_requested_length() {
        let receiver = receiver_at(0).await;
        receiver.on_data(&data(0, b"abcdef")).await;

        assert_eq!(read(&receiver, 4).await.unwrap(), b"abcd");
        assert_eq!(read(&receiver, 4).await.unwrap(), b"ef");
    }

    #[tokio::test]
    async fn test_pending_read_completes_on_arrival() {
        let receiver = receiver_at(0).await;

        let (tx, rx) = oneshot::channel();
        receiver.push_read_op(ReadOp { max_len: 8, completion: tx }).await;

        receiver.on_data(&data(0, b"late")).await;
        assert_eq!(rx.await.unwrap().unwrap(), b"late");
    }

    #[rstest]
    #[case::single_gap(vec![100, 102], vec![LossEntry::Single(SeqNumber::from_raw(101))])]
    #[case::range_gap(vec![100, 104], vec![LossEntry::Range(SeqNumber::from_raw(101), SeqNumber::from_raw(103))])]
    #[tokio::test]
    async fn test_gap_synthesizes_nak(#[case] seqs: Vec<u32>, #[case] expected: Vec<LossEntry>) {
        let receiver = receiver_at(100).await;

        let mut nak = None;
        for seq in seqs {
            nak = receiver.on_data(&data(seq, b"x")).await;
        }
        assert_eq!(nak, Some(expected));
    }

    #[tokio::test]
    async fn test_gap_filled_by_retransmission() {
        let receiver = receiver_at(0).await;
        receiver.on_data(&data(0, b"a")).await;
        assert!(receiver.on_data(&data(2, b"c")).await.is_some());
        assert_eq!(receiver.ack_number().await, SeqNumber::from_raw(1));

        // the retransmitted packet closes the gap without a new NAK
        assert_eq!(receiver.on_data(&data(1, b"b")).await, None);
        assert_eq!(receiver.ack_number().await, SeqNumber::from_raw(3));
        assert_eq!(read(&receiver, 10).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_duplicates_and_stale_packets_dropped() {
        let receiver = receiver_at(10).await;
        receiver.on_data(&data(10, b"a")).await;
        receiver.on_data(&data(12, b"c")).await;

        // below the delivered prefix
        assert_eq!(receiver.on_data(&data(10, b"a")).await, None);
        // duplicate of a buffered out-of-order packet
        assert_eq!(receiver.on_data(&data(12, b"c")).await, None);

        receiver.on_data(&data(11, b"b")).await;
        assert_eq!(read(&receiver, 10).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_reassembly_across_wrap() {
        let receiver = receiver_at(0x7FFF_FFFE).await;

        receiver.on_data(&data(0x7FFF_FFFE, b"a")).await;
        receiver.on_data(&data(0x7FFF_FFFF, b"b")).await;
        receiver.on_data(&data(0, b"c")).await;

        assert_eq!(receiver.ack_number().await, SeqNumber::from_raw(1));
        assert_eq!(read(&receiver, 10).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_ack_history_roundtrip() {
        let receiver = receiver_at(0).await;
        let sent_at = Instant::now();
        receiver
            .store_ack(SeqNumber::from_raw(7), SeqNumber::from_raw(55), sent_at)
            .await;

        let (packet_seq, rtt) = receiver.ack_ack(SeqNumber::from_raw(7)).await.unwrap();
        assert_eq!(packet_seq, SeqNumber::from_raw(55));
        assert!(rtt >= Duration::ZERO);

        assert_eq!(receiver.ack_ack(SeqNumber::from_raw(8)).await, None);
    }

    #[tokio::test]
    async fn test_ack_history_is_bounded() {
        let receiver = receiver_at(0).await;
        let sent_at = Instant::now();
        for i in 0..(ACK_HISTORY_BOUND as u32 + 10) {
            receiver
                .store_ack(SeqNumber::from_raw(i), SeqNumber::from_raw(i), sent_at)
                .await;
        }
        assert_eq!(receiver.inner.read().await.ack_history.len(), ACK_HISTORY_BOUND);
        assert_eq!(receiver.ack_ack(SeqNumber::from_raw(3)).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_needs_count_and_time() {
        let receiver = receiver_at(0).await;

        for _ in 0..20 {
            receiver.inc_exp_counter().await;
        }
        // count exceeded but not enough wall time
        assert!(!receiver.has_timeout().await);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(receiver.has_timeout().await);

        // a reset clears both conditions
        receiver.reset_exp_counter().await;
        assert!(!receiver.has_timeout().await);
    }

    #[tokio::test]
    async fn test_available_buffer_clamped_at_two() {
        let receiver = Receiver::new(2);
        receiver.init(SeqNumber::ZERO).await;
        receiver.on_data(&data(1, b"x")).await; // buffered out of order
        receiver.on_data(&data(2, b"y")).await;

        assert_eq!(receiver.available_receive_buffer_size().await, 2);
    }

    #[tokio::test]
    async fn test_close_eof_drains_then_ends_stream() {
        let receiver = receiver_at(0).await;
        receiver.on_data(&data(0, b"tail")).await;
        receiver.close(ReceiverCloseMode::Eof).await;

        assert_eq!(read(&receiver, 10).await.unwrap(), b"tail");
        assert_eq!(read(&receiver, 10).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_close_cancels_pending_reads() {
        let receiver = receiver_at(0).await;

        let (tx, rx) = oneshot::channel();
        receiver.push_read_op(ReadOp { max_len: 8, completion: tx }).await;
        receiver
            .close(ReceiverCloseMode::Error(Error::OperationCanceled))
            .await;

        assert_eq!(rx.await.unwrap(), Err(Error::OperationCanceled));
    }
}
