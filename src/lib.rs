//! A reliable, connection-oriented, message-aware transport protocol layered
//! over UDP, in the tradition of UDT: ordered, reliable, stream-like delivery
//! between two endpoints with selective acknowledgment, NAK-driven
//! retransmission and rate-based congestion control. The service model
//! offered to the application is a connected, bidirectional byte stream with
//! the usual connect / accept / read / write / close operations.
//!
//! ## Design
//!
//! * A single UDP socket (the *multiplexer*) carries any number of
//!   connections, demultiplexed by a per-connection socket id carried in
//!   every datagram.
//! * Packets have 31-bit modular sequence numbers and are acknowledged
//!   cumulatively. The receiver reports gaps with negative acknowledgments
//!   (NAK), which put the missing packets on the sender's retransmission
//!   list.
//! * ACKs come in two flavors: *light* ACKs every 64 received packets
//!   carrying only the ACK position, and timer-driven *full* ACKs adding
//!   RTT, RTT variance, the free receive buffer, the measured packet
//!   arrival speed and the estimated link capacity.
//! * Each ACK is confirmed by an *ACK-of-ACK*, giving the ACK's sender an
//!   RTT measurement without requiring synchronized timestamps.
//! * Outgoing packets are paced: the congestion controller maintains a
//!   *sending period* between packets in addition to a flow window. Every
//!   16th packet is sent back to back with its successor as a *probe pair*
//!   from whose receive spacing the peer estimates link capacity.
//! * User writes are segmented into datagrams below the configured UDP
//!   payload size; position labels (first / middle / last / only) keep
//!   message boundaries visible to the peer.
//! * The expiration (EXP) timer drives keepalives, moves everything
//!   unacknowledged back onto the retransmission list when the peer goes
//!   quiet, and declares the session dead after sixteen misses and ten
//!   seconds of silence.
//!
//! ## Wire format
//!
//! Every datagram starts with four 32-bit big-endian words; bit 31 of the
//! first word separates data (0) from control (1) packets:
//!
//! ```ascii
//! data:    0 | packet sequence number (31 bits)
//!          position (2) | in-order (1) | message number (29)
//!          timestamp (us since connection setup)
//!          destination socket id
//!          payload
//!
//! control: 1 | type (15) | reserved (16)
//!          additional info (ack seq number for ACK / ACK-of-ACK)
//!          timestamp (us since connection setup)
//!          destination socket id
//!          type-specific payload
//! ```
//!
//! Control types: HANDSHAKE, KEEP_ALIVE, ACK, NAK, SHUTDOWN, ACK_OF_ACK,
//! MESSAGE_DROP_REQUEST. A NAK payload is a packed list of sequence numbers
//! in which bit 31 marks the start of an inclusive range. Handshakes travel
//! with destination socket id 0 and are routed to the listening acceptor.
//!
//! ## Related
//!
//! * TCP: same service model, but the positive-ACK window management is
//!   replaced here by NAK-driven retransmission plus rate pacing, which
//!   keeps throughput up on fat long-haul pipes where AIMD starves.
//! * QUIC: connection-oriented over UDP as well, but stream-multiplexing,
//!   TLS-enforcing and message-framed; this protocol stays a single byte
//!   stream per connection.

pub mod cache;
pub mod config;
pub mod congestion;
pub mod connection_info;
pub mod error;
pub mod estimators;
pub mod flow;
pub mod multiplexer;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod seq;
pub mod session;
pub mod socket;

pub use config::RudtConfig;
pub use error::{Error, Result};
pub use socket::{RudtListener, RudtStream};
