use crate::seq::SeqNumber;
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Wire codec for the protocol's datagrams.
///
/// Every datagram starts with four 32-bit big-endian words. Bit 31 of the
/// first word distinguishes data (0) from control (1).
///
/// ```ascii
/// data:     0 | packet seq (31)
///           position (2) | in-order (1) | message number (29)
///           timestamp (us since session start)
///           destination socket id
///           payload...
///
/// control:  1 | type (15) | reserved (16)
///           additional info (ack seq for ACK / ACK_OF_ACK)
///           timestamp (us since session start)
///           destination socket id
///           type-specific payload...
/// ```

pub const DATA_HEADER_LEN: usize = 16;
pub const CONTROL_HEADER_LEN: usize = 16;

const CONTROL_FLAG: u32 = 0x8000_0000;
const SEQ_MASK: u32 = 0x7FFF_FFFF;
const MESSAGE_NUMBER_MASK: u32 = 0x1FFF_FFFF;
const IN_ORDER_FLAG: u32 = 0x2000_0000;

const TYPE_HANDSHAKE: u16 = 0;
const TYPE_KEEP_ALIVE: u16 = 1;
const TYPE_ACK: u16 = 2;
const TYPE_NAK: u16 = 3;
const TYPE_SHUTDOWN: u16 = 5;
const TYPE_ACK_OF_ACK: u16 = 6;
const TYPE_MESSAGE_DROP: u16 = 7;

/// position of a packet within its (possibly multi-packet) message
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessagePosition {
    First,
    Middle,
    Last,
    OnlyOnePacket,
}

impl MessagePosition {
    fn to_bits(self) -> u32 {
        match self {
            MessagePosition::First => 2,
            MessagePosition::Middle => 0,
            MessagePosition::Last => 1,
            MessagePosition::OnlyOnePacket => 3,
        }
    }

    fn from_bits(bits: u32) -> MessagePosition {
        match bits & 3 {
            2 => MessagePosition::First,
            0 => MessagePosition::Middle,
            1 => MessagePosition::Last,
            _ => MessagePosition::OnlyOnePacket,
        }
    }
}

/// A data datagram as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPacket {
    pub packet_seq: SeqNumber,
    pub position: MessagePosition,
    pub in_order: bool,
    pub message_number: SeqNumber,
    pub timestamp_us: u32,
    pub dest_socket_id: u32,
    pub payload: Bytes,
}

impl DataPacket {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.packet_seq.to_raw() & SEQ_MASK);
        let mut w1 = (self.position.to_bits() << 30) | (self.message_number.to_raw() & MESSAGE_NUMBER_MASK);
        if self.in_order {
            w1 |= IN_ORDER_FLAG;
        }
        buf.put_u32(w1);
        buf.put_u32(self.timestamp_us);
        buf.put_u32(self.dest_socket_id);
        buf.put_slice(&self.payload);
    }
}

/// A segmented outgoing message fragment, owned by the sender from enqueue to
/// confirmed ACK. The packet sequence number and timestamp are stamped when
/// the scheduler actually picks the datagram.
#[derive(Debug)]
pub struct SendDatagram {
    pub packet_seq: SeqNumber,
    pub position: MessagePosition,
    pub message_number: SeqNumber,
    pub timestamp_us: u32,
    pub dest_socket_id: u32,
    pub payload: Bytes,
    pub acked: bool,
    pub pending_send: bool,
}

impl SendDatagram {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(DATA_HEADER_LEN + self.payload.len());
        DataPacket {
            packet_seq: self.packet_seq,
            position: self.position,
            in_order: true,
            message_number: self.message_number,
            timestamp_us: self.timestamp_us,
            dest_socket_id: self.dest_socket_id,
            payload: self.payload.clone(),
        }
        .ser(&mut buf);
        buf
    }
}

/// full-ACK statistics block; light ACKs omit it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckStats {
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    pub available_buffer: u32,
    pub arrival_speed: u32,
    pub link_capacity: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckPayload {
    pub largest_seq: SeqNumber,
    /// `None` for a light ACK
    pub stats: Option<AckStats>,
}

impl AckPayload {
    pub fn is_light(&self) -> bool {
        self.stats.is_none()
    }
}

/// One entry of a NAK loss list. On the wire a range start carries bit 31;
/// the following element (bit 31 clear) is the *inclusive* range end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LossEntry {
    Single(SeqNumber),
    Range(SeqNumber, SeqNumber),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakePayload {
    pub version: u32,
    pub socket_type: u32,
    pub init_packet_seq: SeqNumber,
    pub max_packet_size: u32,
    pub max_window_size: u32,
    pub connection_type: i32,
    pub socket_id: u32,
    pub syn_cookie: u32,
}

impl HandshakePayload {
    pub const VERSION: u32 = 4;
    pub const SOCKET_TYPE_STREAM: u32 = 1;
    pub const CONNECTION_TYPE_REQUEST: i32 = 1;
    pub const CONNECTION_TYPE_RESPONSE: i32 = -1;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlPacket {
    Handshake(HandshakePayload),
    KeepAlive,
    Ack {
        ack_seq: SeqNumber,
        payload: AckPayload,
    },
    Nak {
        loss_list: Vec<LossEntry>,
    },
    Shutdown,
    AckOfAck {
        ack_seq: SeqNumber,
    },
    MessageDropRequest {
        message_number: SeqNumber,
        first_seq: SeqNumber,
        last_seq: SeqNumber,
    },
}

impl ControlPacket {
    fn type_code(&self) -> u16 {
        match self {
            ControlPacket::Handshake(_) => TYPE_HANDSHAKE,
            ControlPacket::KeepAlive => TYPE_KEEP_ALIVE,
            ControlPacket::Ack { .. } => TYPE_ACK,
            ControlPacket::Nak { .. } => TYPE_NAK,
            ControlPacket::Shutdown => TYPE_SHUTDOWN,
            ControlPacket::AckOfAck { .. } => TYPE_ACK_OF_ACK,
            ControlPacket::MessageDropRequest { .. } => TYPE_MESSAGE_DROP,
        }
    }

    fn additional_info(&self) -> u32 {
        match self {
            ControlPacket::Ack { ack_seq, .. } => ack_seq.to_raw(),
            ControlPacket::AckOfAck { ack_seq } => ack_seq.to_raw(),
            ControlPacket::MessageDropRequest { message_number, .. } => message_number.to_raw(),
            _ => 0,
        }
    }

    pub fn ser(&self, timestamp_us: u32, dest_socket_id: u32, buf: &mut BytesMut) {
        buf.put_u32(CONTROL_FLAG | ((self.type_code() as u32) << 16));
        buf.put_u32(self.additional_info());
        buf.put_u32(timestamp_us);
        buf.put_u32(dest_socket_id);

        match self {
            ControlPacket::Handshake(hs) => {
                buf.put_u32(hs.version);
                buf.put_u32(hs.socket_type);
                buf.put_u32(hs.init_packet_seq.to_raw());
                buf.put_u32(hs.max_packet_size);
                buf.put_u32(hs.max_window_size);
                buf.put_i32(hs.connection_type);
                buf.put_u32(hs.socket_id);
                buf.put_u32(hs.syn_cookie);
            }
            ControlPacket::Ack { payload, .. } => {
                buf.put_u32(payload.largest_seq.to_raw());
                if let Some(stats) = &payload.stats {
                    buf.put_u32(stats.rtt_us);
                    buf.put_u32(stats.rtt_var_us);
                    buf.put_u32(stats.available_buffer);
                    buf.put_u32(stats.arrival_speed);
                    buf.put_u32(stats.link_capacity);
                }
            }
            ControlPacket::Nak { loss_list } => {
                for entry in loss_list {
                    match entry {
                        LossEntry::Single(seq) => buf.put_u32(seq.to_raw()),
                        LossEntry::Range(first, last) => {
                            buf.put_u32(first.to_raw() | CONTROL_FLAG);
                            buf.put_u32(last.to_raw());
                        }
                    }
                }
            }
            ControlPacket::MessageDropRequest { first_seq, last_seq, .. } => {
                buf.put_u32(first_seq.to_raw());
                buf.put_u32(last_seq.to_raw());
            }
            ControlPacket::KeepAlive | ControlPacket::Shutdown | ControlPacket::AckOfAck { .. } => {}
        }
    }
}

/// Any inbound datagram, after classification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Data(DataPacket),
    Control {
        timestamp_us: u32,
        dest_socket_id: u32,
        control: ControlPacket,
    },
}

impl Packet {
    pub fn dest_socket_id(&self) -> u32 {
        match self {
            Packet::Data(data) => data.dest_socket_id,
            Packet::Control { dest_socket_id, .. } => *dest_socket_id,
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        if buf.remaining() < DATA_HEADER_LEN {
            bail!("datagram shorter than a packet header");
        }

        let w0 = buf.get_u32();
        let w1 = buf.get_u32();
        let timestamp_us = buf.get_u32();
        let dest_socket_id = buf.get_u32();

        if w0 & CONTROL_FLAG == 0 {
            let mut payload = BytesMut::with_capacity(buf.remaining());
            payload.put(buf);
            return Ok(Packet::Data(DataPacket {
                packet_seq: SeqNumber::from_raw(w0),
                position: MessagePosition::from_bits(w1 >> 30),
                in_order: w1 & IN_ORDER_FLAG != 0,
                message_number: SeqNumber::from_raw(w1 & MESSAGE_NUMBER_MASK),
                timestamp_us,
                dest_socket_id,
                payload: payload.freeze(),
            }));
        }

        let type_code = ((w0 >> 16) & 0x7FFF) as u16;
        let additional_info = w1;

        let control = match type_code {
            TYPE_HANDSHAKE => {
                if buf.remaining() < 32 {
                    bail!("truncated handshake payload");
                }
                ControlPacket::Handshake(HandshakePayload {
                    version: buf.get_u32(),
                    socket_type: buf.get_u32(),
                    init_packet_seq: SeqNumber::from_raw(buf.get_u32()),
                    max_packet_size: buf.get_u32(),
                    max_window_size: buf.get_u32(),
                    connection_type: buf.get_i32(),
                    socket_id: buf.get_u32(),
                    syn_cookie: buf.get_u32(),
                })
            }
            TYPE_KEEP_ALIVE => ControlPacket::KeepAlive,
            TYPE_ACK => {
                if buf.remaining() < 4 {
                    bail!("truncated ack payload");
                }
                let largest_seq = SeqNumber::from_raw(buf.get_u32());
                let stats = if buf.remaining() >= 20 {
                    Some(AckStats {
                        rtt_us: buf.get_u32(),
                        rtt_var_us: buf.get_u32(),
                        available_buffer: buf.get_u32(),
                        arrival_speed: buf.get_u32(),
                        link_capacity: buf.get_u32(),
                    })
                } else {
                    None
                };
                ControlPacket::Ack {
                    ack_seq: SeqNumber::from_raw(additional_info),
                    payload: AckPayload { largest_seq, stats },
                }
            }
            TYPE_NAK => {
                let mut loss_list = Vec::new();
                while buf.remaining() >= 4 {
                    let raw = buf.get_u32();
                    if raw & CONTROL_FLAG != 0 {
                        if buf.remaining() < 4 {
                            bail!("NAK range start without range end");
                        }
                        let last = buf.get_u32();
                        if last & CONTROL_FLAG != 0 {
                            bail!("NAK range end carries the range marker");
                        }
                        loss_list.push(LossEntry::Range(
                            SeqNumber::from_raw(raw),
                            SeqNumber::from_raw(last),
                        ));
                    } else {
                        loss_list.push(LossEntry::Single(SeqNumber::from_raw(raw)));
                    }
                }
                ControlPacket::Nak { loss_list }
            }
            TYPE_SHUTDOWN => ControlPacket::Shutdown,
            TYPE_ACK_OF_ACK => ControlPacket::AckOfAck {
                ack_seq: SeqNumber::from_raw(additional_info),
            },
            TYPE_MESSAGE_DROP => {
                if buf.remaining() < 8 {
                    bail!("truncated message drop payload");
                }
                ControlPacket::MessageDropRequest {
                    message_number: SeqNumber::from_raw(additional_info),
                    first_seq: SeqNumber::from_raw(buf.get_u32()),
                    last_seq: SeqNumber::from_raw(buf.get_u32()),
                }
            }
            other => bail!("unknown control type {}", other),
        };

        Ok(Packet::Control {
            timestamp_us,
            dest_socket_id,
            control,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn roundtrip_control(control: ControlPacket) -> Packet {
        let mut buf = BytesMut::new();
        control.ser(1234, 99, &mut buf);
        let mut b: &[u8] = &buf;
        let packet = Packet::deser(&mut b).unwrap();
        assert!(b.is_empty());
        packet
    }

    #[rstest]
    #[case::first(MessagePosition::First)]
    #[case::middle(MessagePosition::Middle)]
    #[case::last(MessagePosition::Last)]
    #[case::only(MessagePosition::OnlyOnePacket)]
    fn test_data_roundtrip(#[case] position: MessagePosition) {
        let original = DataPacket {
            packet_seq: SeqNumber::from_raw(0x7FFF_FFF0),
            position,
            in_order: true,
            message_number: SeqNumber::from_raw(77),
            timestamp_us: 123_456,
            dest_socket_id: 42,
            payload: Bytes::from_static(&[1, 2, 3, 4, 5]),
        };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), DATA_HEADER_LEN + 5);

        let mut b: &[u8] = &buf;
        match Packet::deser(&mut b).unwrap() {
            Packet::Data(data) => assert_eq!(data, original),
            other => panic!("expected data packet, got {:?}", other),
        }
    }

    #[test]
    fn test_data_flag_bit_is_clear() {
        let data = DataPacket {
            packet_seq: SeqNumber::MAX,
            position: MessagePosition::OnlyOnePacket,
            in_order: false,
            message_number: SeqNumber::ZERO,
            timestamp_us: 0,
            dest_socket_id: 0,
            payload: Bytes::new(),
        };
        let mut buf = BytesMut::new();
        data.ser(&mut buf);
        assert_eq!(buf[0] & 0x80, 0);
    }

    #[test]
    fn test_handshake_roundtrip() {
        let original = ControlPacket::Handshake(HandshakePayload {
            version: HandshakePayload::VERSION,
            socket_type: HandshakePayload::SOCKET_TYPE_STREAM,
            init_packet_seq: SeqNumber::from_raw(0x1234_5678),
            max_packet_size: 1472,
            max_window_size: 25600,
            connection_type: HandshakePayload::CONNECTION_TYPE_REQUEST,
            socket_id: 4711,
            syn_cookie: 0xDEAD_BEEF,
        });

        match roundtrip_control(original.clone()) {
            Packet::Control { timestamp_us, dest_socket_id, control } => {
                assert_eq!(timestamp_us, 1234);
                assert_eq!(dest_socket_id, 99);
                assert_eq!(control, original);
            }
            other => panic!("expected control packet, got {:?}", other),
        }
    }

    #[rstest]
    #[case::keep_alive(ControlPacket::KeepAlive)]
    #[case::shutdown(ControlPacket::Shutdown)]
    #[case::ack_of_ack(ControlPacket::AckOfAck { ack_seq: SeqNumber::from_raw(314) })]
    #[case::light_ack(ControlPacket::Ack {
        ack_seq: SeqNumber::from_raw(9),
        payload: AckPayload { largest_seq: SeqNumber::from_raw(1000), stats: None },
    })]
    #[case::full_ack(ControlPacket::Ack {
        ack_seq: SeqNumber::from_raw(10),
        payload: AckPayload {
            largest_seq: SeqNumber::from_raw(1001),
            stats: Some(AckStats {
                rtt_us: 100_000,
                rtt_var_us: 50_000,
                available_buffer: 8192,
                arrival_speed: 1000,
                link_capacity: 2000,
            }),
        },
    })]
    #[case::message_drop(ControlPacket::MessageDropRequest {
        message_number: SeqNumber::from_raw(5),
        first_seq: SeqNumber::from_raw(100),
        last_seq: SeqNumber::from_raw(110),
    })]
    fn test_control_roundtrip(#[case] original: ControlPacket) {
        match roundtrip_control(original.clone()) {
            Packet::Control { control, .. } => assert_eq!(control, original),
            other => panic!("expected control packet, got {:?}", other),
        }
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::singles(vec![
        LossEntry::Single(SeqNumber::from_raw(5)),
        LossEntry::Single(SeqNumber::from_raw(9)),
    ])]
    #[case::range(vec![LossEntry::Range(SeqNumber::from_raw(5), SeqNumber::from_raw(9))])]
    #[case::mixed(vec![
        LossEntry::Single(SeqNumber::from_raw(2)),
        LossEntry::Range(SeqNumber::from_raw(5), SeqNumber::from_raw(9)),
        LossEntry::Single(SeqNumber::from_raw(20)),
    ])]
    fn test_nak_roundtrip(#[case] loss_list: Vec<LossEntry>) {
        let original = ControlPacket::Nak { loss_list };
        match roundtrip_control(original.clone()) {
            Packet::Control { control, .. } => assert_eq!(control, original),
            other => panic!("expected control packet, got {:?}", other),
        }
    }

    #[test]
    fn test_nak_range_marker_on_wire() {
        let nak = ControlPacket::Nak {
            loss_list: vec![LossEntry::Range(SeqNumber::from_raw(5), SeqNumber::from_raw(9))],
        };
        let mut buf = BytesMut::new();
        nak.ser(0, 0, &mut buf);

        // bit 31 set on the range start, clear on the inclusive end
        assert_eq!(&buf[CONTROL_HEADER_LEN..], &[0x80, 0, 0, 5, 0, 0, 0, 9]);
    }

    #[rstest]
    #[case::truncated_header(vec![0x80, 0, 0, 0])]
    #[case::unknown_type(vec![0x80, 0xFF, 0, 0,  0,0,0,0,  0,0,0,0,  0,0,0,0])]
    #[case::truncated_handshake(vec![0x80, 0, 0, 0,  0,0,0,0,  0,0,0,0,  0,0,0,0,  1,2,3,4])]
    #[case::nak_dangling_range(vec![0x80, 0x03, 0, 0,  0,0,0,0,  0,0,0,0,  0,0,0,0,  0x80,0,0,5])]
    fn test_deser_rejects_malformed(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        assert!(Packet::deser(&mut b).is_err());
    }
}
