use crate::packet::LossEntry;
use crate::seq::SeqNumber;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, trace};

/// everything the controller needs from a full ACK
#[derive(Debug, Clone, Copy)]
pub struct AckContext {
    pub largest_seq: SeqNumber,
    pub rtt_us: u32,
    pub arrival_speed: f64,
    pub link_capacity: f64,
}

/// The capability set of a congestion controller. The session consults
/// `sending_period` and `window_flow_size` for pacing and flow limiting and
/// feeds every protocol event back in; any implementor of this set can be
/// substituted for the native controller.
pub trait CongestionControl: Send + 'static {
    fn init(&mut self, init_packet_seq: SeqNumber, max_window_flow_size: u32);

    fn on_ack(&mut self, ack: &AckContext);

    fn on_loss(&mut self, loss_list: &[LossEntry]);

    fn on_timeout(&mut self);

    fn on_close(&mut self);

    fn on_packet_sent(&mut self, packet_seq: SeqNumber);

    fn on_packet_received(&mut self);

    /// pacing interval between two outgoing packets
    fn sending_period(&self) -> Duration;

    /// upper bound for unacknowledged packets in flight
    fn window_flow_size(&self) -> u32;

    /// the sender reports every freshly assigned sequence number here
    fn update_last_send_seq(&mut self, packet_seq: SeqNumber);
}

const SYN_US: f64 = 10_000.0;

/// ceiling for the pacing interval - one packet per second is as slow as the
/// controller will ever go
const MAX_PERIOD_US: f64 = 1_000_000.0;

/// The native rate-based controller: slow start until the first loss (or a
/// full window), afterwards the sending period tracks the receiver's
/// measured arrival speed, nudged by the headroom between estimated link
/// capacity and the current send rate. Losses multiply the period, timeouts
/// drop the rate to a safe floor.
pub struct NativeCongestionControl {
    packet_size: f64,

    slow_start: bool,
    window: f64,
    max_window: u32,
    period_us: f64,

    last_ack_seq: SeqNumber,
    last_send_seq: SeqNumber,
    last_decrease_seq: SeqNumber,

    /// rolling estimate of NAKs per congestion epoch, for randomizing
    /// subsequent decreases within an epoch
    avg_nak_count: u32,
    nak_count: u32,
    decrease_count: u32,
    decrease_trigger: u32,

    arrival_speed: f64,
    link_capacity: f64,
    rtt_us: u32,
}

impl NativeCongestionControl {
    pub fn new(packet_size: usize) -> NativeCongestionControl {
        NativeCongestionControl {
            packet_size: packet_size as f64,
            slow_start: true,
            window: 16.0,
            max_window: 16,
            period_us: 1.0,
            last_ack_seq: SeqNumber::ZERO,
            last_send_seq: SeqNumber::ZERO,
            last_decrease_seq: SeqNumber::ZERO,
            avg_nak_count: 1,
            nak_count: 0,
            decrease_count: 0,
            decrease_trigger: 1,
            arrival_speed: 0.0,
            link_capacity: 0.0,
            rtt_us: 100_000,
        }
    }

    /// leave slow start, switching the period to the measured receive rate
    /// (or a window-derived rate while no measurement exists yet)
    fn exit_slow_start(&mut self) {
        self.slow_start = false;
        if self.arrival_speed > 0.0 {
            self.period_us = 1_000_000.0 / self.arrival_speed;
        } else {
            self.period_us = (self.rtt_us as f64 + SYN_US) / self.window;
        }
        debug!("leaving slow start, sending period {:.1}us", self.period_us);
    }

    fn clamp_period(&mut self) {
        self.period_us = self.period_us.clamp(1.0, MAX_PERIOD_US);
    }

    fn first_lost_seq(loss_list: &[LossEntry]) -> Option<SeqNumber> {
        loss_list.first().map(|entry| match entry {
            LossEntry::Single(seq) => *seq,
            LossEntry::Range(first, _) => *first,
        })
    }
}

impl CongestionControl for NativeCongestionControl {
    fn init(&mut self, init_packet_seq: SeqNumber, max_window_flow_size: u32) {
        self.last_ack_seq = init_packet_seq;
        self.last_send_seq = init_packet_seq;
        self.last_decrease_seq = init_packet_seq.dec();
        self.max_window = max_window_flow_size;
    }

    fn on_ack(&mut self, ack: &AckContext) {
        self.rtt_us = ack.rtt_us;
        if ack.arrival_speed > 0.0 {
            self.arrival_speed = ack.arrival_speed;
        }
        if ack.link_capacity > 0.0 {
            self.link_capacity = ack.link_capacity;
        }

        if self.slow_start {
            let advance = self.last_ack_seq.seq_offset(ack.largest_seq);
            if advance > 0 {
                self.window += advance as f64;
                self.last_ack_seq = ack.largest_seq;
            }
            if self.window >= self.max_window as f64 {
                self.window = self.max_window as f64;
                self.exit_slow_start();
            }
            return;
        }

        // steady state: the window covers one round trip plus slack at the
        // measured receive rate...
        self.window = self.arrival_speed / 1_000_000.0 * (self.rtt_us as f64 + SYN_US) + 16.0;
        self.window = self.window.min(self.max_window as f64);

        // ...and the rate increase per SYN is derived from the headroom
        // between link capacity and the current send rate
        let send_rate = 1_000_000.0 / self.period_us;
        let headroom = self.link_capacity - send_rate;
        let min_inc = 1.0 / self.packet_size;
        let inc = if headroom <= 0.0 {
            min_inc
        } else {
            let bits = headroom * self.packet_size * 8.0;
            (10f64.powf(bits.log10().ceil()) * 0.000_001_5 / self.packet_size).max(min_inc)
        };

        self.period_us = (self.period_us * SYN_US) / (self.period_us * inc + SYN_US);
        self.clamp_period();
        trace!("ack: window {:.1}, period {:.1}us", self.window, self.period_us);
    }

    fn on_loss(&mut self, loss_list: &[LossEntry]) {
        let Some(first_lost) = Self::first_lost_seq(loss_list) else {
            return;
        };

        if self.slow_start {
            self.exit_slow_start();
        }

        if first_lost.compare(self.last_decrease_seq) > 0 {
            // loss beyond the last decrease point: a new congestion epoch
            let jitter = rand::thread_rng().gen_range(0.0..0.03);
            self.period_us *= 1.125 + jitter;
            self.clamp_period();

            self.avg_nak_count =
                ((self.avg_nak_count as f64 * 0.875) + (self.nak_count as f64 * 0.125)).ceil() as u32;
            self.nak_count = 1;
            self.decrease_count = 1;
            self.last_decrease_seq = self.last_send_seq;
            self.decrease_trigger = rand::thread_rng().gen_range(1..=self.avg_nak_count.max(1));
            debug!("loss beyond decrease point, period now {:.1}us", self.period_us);
        } else {
            // within the current epoch: decrease only on a random subset of
            // NAKs, at most five times
            self.nak_count += 1;
            if self.decrease_count <= 5 && self.nak_count % self.decrease_trigger == 0 {
                self.period_us *= 1.125;
                self.clamp_period();
                self.decrease_count += 1;
                self.last_decrease_seq = self.last_send_seq;
            }
        }
    }

    fn on_timeout(&mut self) {
        if self.slow_start {
            self.exit_slow_start();
        }
        self.window = (self.window / 2.0).max(2.0);
        if self.arrival_speed > 0.0 {
            self.period_us = 1_000_000.0 / self.arrival_speed;
        } else {
            self.period_us *= 2.0;
        }
        self.clamp_period();
        debug!("timeout: window {:.1}, period {:.1}us", self.window, self.period_us);
    }

    fn on_close(&mut self) {}

    fn on_packet_sent(&mut self, _packet_seq: SeqNumber) {}

    fn on_packet_received(&mut self) {}

    fn sending_period(&self) -> Duration {
        Duration::from_micros(self.period_us as u64)
    }

    fn window_flow_size(&self) -> u32 {
        (self.window as u32).max(2)
    }

    fn update_last_send_seq(&mut self, packet_seq: SeqNumber) {
        self.last_send_seq = packet_seq;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ack(largest: u32, arrival: f64, capacity: f64) -> AckContext {
        AckContext {
            largest_seq: SeqNumber::from_raw(largest),
            rtt_us: 50_000,
            arrival_speed: arrival,
            link_capacity: capacity,
        }
    }

    fn controller() -> NativeCongestionControl {
        let mut cc = NativeCongestionControl::new(1472);
        cc.init(SeqNumber::ZERO, 100);
        cc
    }

    #[test]
    fn test_slow_start_grows_window_with_acked_packets() {
        let mut cc = controller();
        assert!(cc.slow_start);

        cc.on_ack(&ack(10, 0.0, 0.0));
        assert_eq!(cc.window_flow_size(), 26);
        assert!(cc.slow_start);

        cc.on_ack(&ack(30, 0.0, 0.0));
        assert_eq!(cc.window_flow_size(), 46);
    }

    #[test]
    fn test_slow_start_ends_at_max_window() {
        let mut cc = controller();
        cc.on_ack(&ack(200, 1000.0, 2000.0));
        assert!(!cc.slow_start);
        assert_eq!(cc.window_flow_size(), 100);
        // period derived from the 1000 pkts/s arrival estimate
        assert_eq!(cc.sending_period(), Duration::from_micros(1000));
    }

    #[test]
    fn test_first_loss_ends_slow_start() {
        let mut cc = controller();
        cc.update_last_send_seq(SeqNumber::from_raw(50));
        cc.on_loss(&[LossEntry::Single(SeqNumber::from_raw(20))]);
        assert!(!cc.slow_start);
    }

    #[test]
    fn test_loss_beyond_decrease_point_raises_period() {
        let mut cc = controller();
        cc.on_ack(&ack(200, 1000.0, 2000.0)); // leaves slow start, period 1000us
        let before = cc.period_us;

        cc.update_last_send_seq(SeqNumber::from_raw(300));
        cc.on_loss(&[LossEntry::Single(SeqNumber::from_raw(250))]);

        assert!(cc.period_us >= before * 1.125);
        assert!(cc.period_us <= before * 1.16);
        assert_eq!(cc.last_decrease_seq, SeqNumber::from_raw(300));
    }

    #[test]
    fn test_loss_behind_decrease_point_is_damped() {
        let mut cc = controller();
        cc.on_ack(&ack(200, 1000.0, 2000.0));
        cc.update_last_send_seq(SeqNumber::from_raw(300));
        cc.on_loss(&[LossEntry::Single(SeqNumber::from_raw(250))]);

        let after_epoch_start = cc.period_us;
        // a retransmission of an older loss must not start a new epoch
        cc.on_loss(&[LossEntry::Single(SeqNumber::from_raw(260))]);
        assert!(cc.period_us <= after_epoch_start * 1.125 + 1.0);
    }

    #[test]
    fn test_timeout_shrinks_window() {
        let mut cc = controller();
        cc.on_ack(&ack(200, 1000.0, 2000.0));
        let window_before = cc.window_flow_size();

        cc.on_timeout();
        assert!(cc.window_flow_size() <= window_before / 2 + 1);
        assert_eq!(cc.sending_period(), Duration::from_micros(1000));
    }

    #[test]
    fn test_period_never_exceeds_ceiling() {
        let mut cc = controller();
        cc.arrival_speed = 0.5; // pathological estimate
        cc.on_timeout();
        for _ in 0..100 {
            cc.update_last_send_seq(cc.last_send_seq.advance(10));
            cc.on_loss(&[LossEntry::Single(cc.last_send_seq)]);
        }
        assert!(cc.sending_period() <= Duration::from_secs(1));
    }

    #[rstest]
    #[case::empty(vec![], None)]
    #[case::single(vec![LossEntry::Single(SeqNumber::from_raw(7))], Some(7))]
    #[case::range(vec![LossEntry::Range(SeqNumber::from_raw(3), SeqNumber::from_raw(9))], Some(3))]
    fn test_first_lost_seq(#[case] list: Vec<LossEntry>, #[case] expected: Option<u32>) {
        assert_eq!(
            NativeCongestionControl::first_lost_seq(&list),
            expected.map(SeqNumber::from_raw)
        );
    }
}
