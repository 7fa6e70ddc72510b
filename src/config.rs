use anyhow::bail;
use std::time::Duration;

/// Configuration shared by all sessions on one multiplexer.
pub struct RudtConfig {
    /// This is the UDP payload size the protocol assumes end-to-end. The
    ///  protocol enforces non-fragmentation, so this size (and the implied
    ///  packet size) must be supported by all network paths between peers.
    ///
    /// In an ideal world we would discover the MTU, but discovery is
    ///  unreliable in the presence of surprising network hardware, so the
    ///  responsibility stays with the application. With full Ethernet frames
    ///  and no optional IP headers this is `1500 - 20 - 8 = 1472` for IPV4.
    ///
    /// Choosing this too big causes packets to be dropped (possibly only on
    ///  some routes); choosing it too small wastes bandwidth.
    pub packet_data_size: usize,

    /// upper bound for the flow window advertised to the peer, in packets
    pub max_window_flow_size: u32,

    /// capacity of the sender's segmentation queue, in packets. A write op
    ///  that overruns this has its last accepted fragment re-labelled so the
    ///  peer still sees a closed message.
    pub max_send_queue_size: usize,

    /// receive buffer capacity in packets; the basis for the available-buffer
    ///  figure advertised in full ACKs
    pub receive_buffer_packets: u32,

    /// how long a connect() keeps retrying the handshake before giving up
    pub connect_timeout: Duration,

    /// interval between handshake retransmissions while connecting
    pub connect_retry_period: Duration,
}

impl RudtConfig {
    /// ipv4 with end-to-end full Ethernet MTU, no optional headers
    pub fn default_ipv4() -> RudtConfig {
        RudtConfig {
            packet_data_size: 1472,
            max_window_flow_size: 25600,
            max_send_queue_size: 8192,
            receive_buffer_packets: 8192,
            connect_timeout: Duration::from_secs(3),
            connect_retry_period: Duration::from_millis(250),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.packet_data_size < 100 {
            bail!("packet data size is too small");
        }
        if self.packet_data_size <= crate::packet::DATA_HEADER_LEN {
            bail!("packet data size does not leave room for a payload");
        }
        if self.max_window_flow_size < 2 {
            bail!("flow window must allow at least two packets in flight");
        }
        if self.receive_buffer_packets < 2 {
            bail!("receive buffer must hold at least two packets");
        }
        Ok(())
    }
}
