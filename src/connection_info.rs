use std::cmp::max;
use std::time::Duration;
use tracing::trace;

/// the protocol's fixed synchronization interval - the base unit for all
/// adaptive timer periods
pub const SYN_PERIOD: Duration = Duration::from_millis(10);

const SYN_PERIOD_US: u64 = 10_000;

/// NAK periods never drop below this, to avoid retransmission storms on
/// short round trips
const MIN_NAK_PERIOD: Duration = Duration::from_millis(300);

const INITIAL_RTT_US: u32 = 100_000;

/// Per-connection running estimates, updated by the receiver and on every
/// full ACK, read by the sender and the congestion controller.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    rtt_us: u32,
    rtt_var_us: u32,
    packet_data_size: usize,
    arrival_speed: f64,
    link_capacity: f64,
    ack_period: Duration,
    nak_period: Duration,
    exp_period: Duration,
}

/// The part of a connection's estimates worth remembering across
/// connections to the same remote address.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionInfoSnapshot {
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    pub arrival_speed: f64,
    pub link_capacity: f64,
}

impl ConnectionInfo {
    pub fn new(packet_data_size: usize) -> ConnectionInfo {
        let mut result = ConnectionInfo {
            rtt_us: INITIAL_RTT_US,
            rtt_var_us: INITIAL_RTT_US / 2,
            packet_data_size,
            arrival_speed: 0.0,
            link_capacity: 0.0,
            ack_period: SYN_PERIOD,
            nak_period: MIN_NAK_PERIOD,
            exp_period: Duration::from_millis(500),
        };
        result.update_ack_period();
        result.update_nak_period();
        result.update_exp_period(0);
        result
    }

    /// seed a fresh connection with estimates from a previous connection to
    /// the same remote address
    pub fn seeded(snapshot: ConnectionInfoSnapshot, packet_data_size: usize) -> ConnectionInfo {
        let mut result = ConnectionInfo::new(packet_data_size);
        result.rtt_us = snapshot.rtt_us;
        result.rtt_var_us = snapshot.rtt_var_us;
        result.arrival_speed = snapshot.arrival_speed;
        result.link_capacity = snapshot.link_capacity;
        result.update_ack_period();
        result.update_nak_period();
        result.update_exp_period(0);
        result
    }

    pub fn snapshot(&self) -> ConnectionInfoSnapshot {
        ConnectionInfoSnapshot {
            rtt_us: self.rtt_us,
            rtt_var_us: self.rtt_var_us,
            arrival_speed: self.arrival_speed,
            link_capacity: self.link_capacity,
        }
    }

    pub fn rtt(&self) -> Duration {
        Duration::from_micros(self.rtt_us as u64)
    }

    pub fn rtt_us(&self) -> u32 {
        self.rtt_us
    }

    pub fn rtt_var_us(&self) -> u32 {
        self.rtt_var_us
    }

    pub fn packet_data_size(&self) -> usize {
        self.packet_data_size
    }

    pub fn set_packet_data_size(&mut self, size: usize) {
        self.packet_data_size = size;
    }

    pub fn arrival_speed(&self) -> f64 {
        self.arrival_speed
    }

    pub fn link_capacity(&self) -> f64 {
        self.link_capacity
    }

    pub fn ack_period(&self) -> Duration {
        self.ack_period
    }

    pub fn nak_period(&self) -> Duration {
        self.nak_period
    }

    pub fn exp_period(&self) -> Duration {
        self.exp_period
    }

    /// exponentially weighted moving average, weight 1/8 for the new sample
    pub fn update_rtt(&mut self, sample_us: u32) {
        self.rtt_us = (7 * self.rtt_us + sample_us) / 8;
        trace!("rtt sample {}us -> estimate {}us", sample_us, self.rtt_us);
    }

    /// weight 1/4 for the new deviation sample
    pub fn update_rtt_var(&mut self, deviation_us: u32) {
        self.rtt_var_us = (3 * self.rtt_var_us + deviation_us) / 4;
    }

    pub fn update_arrival_speed(&mut self, packets_per_second: f64) {
        self.arrival_speed = packets_per_second;
    }

    pub fn update_link_capacity(&mut self, packets_per_second: f64) {
        self.link_capacity = packets_per_second;
    }

    /// the ACK cadence adapts to the round trip but never fires more often
    /// than once per SYN interval
    pub fn update_ack_period(&mut self) {
        let adaptive = Duration::from_micros(self.rtt_us as u64 + 4 * self.rtt_var_us as u64);
        self.ack_period = max(adaptive, SYN_PERIOD);
    }

    pub fn update_nak_period(&mut self) {
        let adaptive = Duration::from_micros(
            self.rtt_us as u64 + 4 * self.rtt_var_us as u64 + SYN_PERIOD_US,
        );
        self.nak_period = max(adaptive, MIN_NAK_PERIOD);
    }

    /// exp_period = max(4*RTT + RTT_var + syn, exp_count * (RTT + 4*RTT_var) + syn)
    pub fn update_exp_period(&mut self, exp_count: u32) {
        let rtt = self.rtt_us as u64;
        let var = self.rtt_var_us as u64;
        let base = 4 * rtt + var + SYN_PERIOD_US;
        let escalated = exp_count as u64 * (rtt + 4 * var) + SYN_PERIOD_US;
        self.exp_period = Duration::from_micros(max(base, escalated));
    }
}
