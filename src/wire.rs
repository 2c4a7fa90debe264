//! UDP wire format for the membership protocol.
//!
//! Every frame starts with a fixed [`Header`]. Integers are little-endian;
//! `id`/`address` strings are NUL-terminated fixed-width fields. This fixes
//! the byte order choice the original implementation left undocumented
//! (host byte order, a latent portability bug across heterogeneous hosts).

use crate::types::NodeState;

/// Current (and only) protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Width in bytes of an `id` field on the wire (63 usable bytes + NUL).
pub const ID_FIELD_LEN: usize = 64;
/// Width in bytes of an `address` field on the wire.
pub const ADDRESS_FIELD_LEN: usize = 64;
/// Maximum usable length, in bytes, of an id or address string — one less
/// than its field width, to leave room for the NUL terminator.
pub const MAX_ID_LEN: usize = ID_FIELD_LEN - 1;
/// Byte length of the fixed [`Header`].
pub const HEADER_LEN: usize = 1 + 1 + 2 + 4 + ID_FIELD_LEN + 4;
/// Maximum node records carried in a single `Sync` frame.
pub const MAX_SYNC_RECORDS: usize = 50;
/// Byte length of one `Sync` node-update record.
pub const SYNC_RECORD_LEN: usize = ID_FIELD_LEN + ADDRESS_FIELD_LEN + 2 + 1 + 4 + 1;

/// Frame type tag, carried in [`Header::msg_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0,
    PingReq = 1,
    Ack = 2,
    Sync = 3,
    Compound = 4,
    /// Opaque application payload carried by `broadcast`/`send_to`. Not part
    /// of the original's five reserved types; added so the engine can
    /// actually deliver application datagrams to `on_message` instead of
    /// letting them fall into the "unknown message type" branch the
    /// original's raw, header-less sends land in.
    App = 5,
}

impl MessageType {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Ping),
            1 => Some(Self::PingReq),
            2 => Some(Self::Ack),
            3 => Some(Self::Sync),
            4 => Some(Self::Compound),
            5 => Some(Self::App),
            _ => None,
        }
    }
}

/// Errors from decoding a datagram. Per §4.1, malformed datagrams are
/// dropped silently by the engine; this type exists so the caller can
/// still count them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram of {len} bytes shorter than header ({HEADER_LEN} bytes)")]
    TooShortForHeader { len: usize },
    #[error("datagram too short for frame body")]
    TooShortForBody,
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("sync node_count {declared} exceeds what the datagram can hold")]
    SyncCountExceedsDatagram { declared: u32 },
    #[error("id field is not valid UTF-8")]
    InvalidUtf8,
    #[error("field {field} of {len} bytes exceeds its {max}-byte wire limit")]
    FieldTooLong { field: &'static str, len: usize, max: usize },
}

/// Fixed 76-byte frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: MessageType,
    pub payload_len: u16,
    pub seq: u32,
    pub sender_id: String,
    pub incarnation: u32,
}

/// Write `s` into a NUL-terminated fixed-width field, rejecting (rather than
/// silently truncating) a string that does not fit in `width - 1` usable
/// bytes.
fn write_fixed_str(buf: &mut Vec<u8>, field: &'static str, s: &str, width: usize) -> Result<(), WireError> {
    let bytes = s.as_bytes();
    if bytes.len() > width - 1 {
        return Err(WireError::FieldTooLong {
            field,
            len: bytes.len(),
            max: width - 1,
        });
    }
    buf.extend_from_slice(bytes);
    buf.resize(buf.len() + (width - bytes.len()), 0);
    Ok(())
}

fn read_fixed_str(bytes: &[u8]) -> Result<String, WireError> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end])
        .map(|s| s.to_string())
        .map_err(|_| WireError::InvalidUtf8)
}

impl Header {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        buf.push(self.version);
        buf.push(self.msg_type as u8);
        buf.extend_from_slice(&self.payload_len.to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        write_fixed_str(buf, "sender_id", &self.sender_id, ID_FIELD_LEN)?;
        buf.extend_from_slice(&self.incarnation.to_le_bytes());
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::TooShortForHeader { len: bytes.len() });
        }
        let version = bytes[0];
        let msg_type = MessageType::from_u8(bytes[1]).ok_or(WireError::UnknownMessageType(bytes[1]))?;
        let payload_len = u16::from_le_bytes([bytes[2], bytes[3]]);
        let seq = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let sender_id = read_fixed_str(&bytes[8..8 + ID_FIELD_LEN])?;
        let incarnation_off = 8 + ID_FIELD_LEN;
        let incarnation = u32::from_le_bytes([
            bytes[incarnation_off],
            bytes[incarnation_off + 1],
            bytes[incarnation_off + 2],
            bytes[incarnation_off + 3],
        ]);
        Ok(Self {
            version,
            msg_type,
            payload_len,
            seq,
            sender_id,
            incarnation,
        })
    }
}

/// One node-update record inside a [`Frame::Sync`] payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUpdateRecord {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub state: NodeState,
    pub incarnation: u32,
    pub is_main: bool,
}

fn state_to_u8(state: NodeState) -> u8 {
    match state {
        NodeState::Alive => 0,
        NodeState::Suspect => 1,
        NodeState::Dead => 2,
        NodeState::Left => 3,
    }
}

fn state_from_u8(b: u8) -> Option<NodeState> {
    match b {
        0 => Some(NodeState::Alive),
        1 => Some(NodeState::Suspect),
        2 => Some(NodeState::Dead),
        3 => Some(NodeState::Left),
        _ => None,
    }
}

impl NodeUpdateRecord {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        write_fixed_str(buf, "id", &self.id, ID_FIELD_LEN)?;
        write_fixed_str(buf, "address", &self.address, ADDRESS_FIELD_LEN)?;
        buf.extend_from_slice(&self.port.to_le_bytes());
        buf.push(state_to_u8(self.state));
        buf.extend_from_slice(&self.incarnation.to_le_bytes());
        buf.push(if self.is_main { 1 } else { 0 });
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let id = read_fixed_str(&bytes[0..ID_FIELD_LEN])?;
        let addr_off = ID_FIELD_LEN;
        let address = read_fixed_str(&bytes[addr_off..addr_off + ADDRESS_FIELD_LEN])?;
        let port_off = addr_off + ADDRESS_FIELD_LEN;
        let port = u16::from_le_bytes([bytes[port_off], bytes[port_off + 1]]);
        let state_off = port_off + 2;
        let state = state_from_u8(bytes[state_off]).unwrap_or(NodeState::Alive);
        let inc_off = state_off + 1;
        let incarnation = u32::from_le_bytes([
            bytes[inc_off],
            bytes[inc_off + 1],
            bytes[inc_off + 2],
            bytes[inc_off + 3],
        ]);
        let is_main = bytes[inc_off + 4] != 0;
        Ok(Self {
            id,
            address,
            port,
            state,
            incarnation,
            is_main,
        })
    }
}

/// A decoded (or to-be-encoded) membership frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ping {
        header: Header,
        target_id: String,
    },
    PingReq {
        header: Header,
        target_id: String,
        source_id: String,
    },
    Ack {
        header: Header,
        target_id: String,
    },
    Sync {
        header: Header,
        records: Vec<NodeUpdateRecord>,
    },
    App {
        header: Header,
        payload: Vec<u8>,
    },
}

impl Frame {
    pub fn header(&self) -> &Header {
        match self {
            Frame::Ping { header, .. }
            | Frame::PingReq { header, .. }
            | Frame::Ack { header, .. }
            | Frame::Sync { header, .. }
            | Frame::App { header, .. } => header,
        }
    }

    pub fn new_ping(sender_id: &str, incarnation: u32, seq: u32, target_id: &str) -> Self {
        Frame::Ping {
            header: Header {
                version: PROTOCOL_VERSION,
                msg_type: MessageType::Ping,
                payload_len: ID_FIELD_LEN as u16,
                seq,
                sender_id: sender_id.to_string(),
                incarnation,
            },
            target_id: target_id.to_string(),
        }
    }

    pub fn new_ack(sender_id: &str, incarnation: u32, seq: u32, target_id: &str) -> Self {
        Frame::Ack {
            header: Header {
                version: PROTOCOL_VERSION,
                msg_type: MessageType::Ack,
                payload_len: ID_FIELD_LEN as u16,
                seq,
                sender_id: sender_id.to_string(),
                incarnation,
            },
            target_id: target_id.to_string(),
        }
    }

    pub fn new_ping_req(
        sender_id: &str,
        incarnation: u32,
        seq: u32,
        target_id: &str,
        source_id: &str,
    ) -> Self {
        Frame::PingReq {
            header: Header {
                version: PROTOCOL_VERSION,
                msg_type: MessageType::PingReq,
                payload_len: (ID_FIELD_LEN * 2) as u16,
                seq,
                sender_id: sender_id.to_string(),
                incarnation,
            },
            target_id: target_id.to_string(),
            source_id: source_id.to_string(),
        }
    }

    pub fn new_sync(
        sender_id: &str,
        incarnation: u32,
        seq: u32,
        records: Vec<NodeUpdateRecord>,
    ) -> Self {
        let records: Vec<_> = records.into_iter().take(MAX_SYNC_RECORDS).collect();
        let payload_len = 4 + records.len() * SYNC_RECORD_LEN;
        Frame::Sync {
            header: Header {
                version: PROTOCOL_VERSION,
                msg_type: MessageType::Sync,
                payload_len: payload_len as u16,
                seq,
                sender_id: sender_id.to_string(),
                incarnation,
            },
            records,
        }
    }

    pub fn new_app(sender_id: &str, incarnation: u32, seq: u32, payload: Vec<u8>) -> Self {
        Frame::App {
            header: Header {
                version: PROTOCOL_VERSION,
                msg_type: MessageType::App,
                payload_len: payload.len().min(u16::MAX as usize) as u16,
                seq,
                sender_id: sender_id.to_string(),
                incarnation,
            },
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 256);
        self.header().encode(&mut buf)?;
        match self {
            Frame::Ping { target_id, .. } | Frame::Ack { target_id, .. } => {
                write_fixed_str(&mut buf, "target_id", target_id, ID_FIELD_LEN)?;
            }
            Frame::PingReq {
                target_id,
                source_id,
                ..
            } => {
                write_fixed_str(&mut buf, "target_id", target_id, ID_FIELD_LEN)?;
                write_fixed_str(&mut buf, "source_id", source_id, ID_FIELD_LEN)?;
            }
            Frame::Sync { records, .. } => {
                buf.extend_from_slice(&(records.len() as u32).to_le_bytes());
                for record in records {
                    record.encode(&mut buf)?;
                }
            }
            Frame::App { payload, .. } => {
                buf.extend_from_slice(payload);
            }
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let header = Header::decode(bytes)?;
        let body = &bytes[HEADER_LEN..];
        match header.msg_type {
            MessageType::Ping | MessageType::Ack => {
                if body.len() < ID_FIELD_LEN {
                    return Err(WireError::TooShortForBody);
                }
                let target_id = read_fixed_str(&body[0..ID_FIELD_LEN])?;
                if header.msg_type == MessageType::Ping {
                    Ok(Frame::Ping { header, target_id })
                } else {
                    Ok(Frame::Ack { header, target_id })
                }
            }
            MessageType::PingReq => {
                if body.len() < ID_FIELD_LEN * 2 {
                    return Err(WireError::TooShortForBody);
                }
                let target_id = read_fixed_str(&body[0..ID_FIELD_LEN])?;
                let source_id = read_fixed_str(&body[ID_FIELD_LEN..ID_FIELD_LEN * 2])?;
                Ok(Frame::PingReq {
                    header,
                    target_id,
                    source_id,
                })
            }
            MessageType::Sync => {
                if body.len() < 4 {
                    return Err(WireError::TooShortForBody);
                }
                let node_count = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                let needed = 4 + node_count as usize * SYNC_RECORD_LEN;
                if needed > body.len() {
                    return Err(WireError::SyncCountExceedsDatagram {
                        declared: node_count,
                    });
                }
                let mut records = Vec::with_capacity(node_count as usize);
                let mut offset = 4;
                for _ in 0..node_count {
                    let record = NodeUpdateRecord::decode(&body[offset..offset + SYNC_RECORD_LEN])?;
                    records.push(record);
                    offset += SYNC_RECORD_LEN;
                }
                Ok(Frame::Sync { header, records })
            }
            MessageType::App => {
                let declared = header.payload_len as usize;
                if declared > body.len() {
                    return Err(WireError::TooShortForBody);
                }
                Ok(Frame::App {
                    header,
                    payload: body[..declared].to_vec(),
                })
            }
            MessageType::Compound => Err(WireError::UnknownMessageType(MessageType::Compound as u8)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_round_trips() {
        let frame = Frame::new_ping("node-a", 3, 42, "node-b");
        let bytes = frame.encode().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn ping_req_round_trips() {
        let frame = Frame::new_ping_req("node-a", 1, 7, "node-b", "node-c");
        let bytes = frame.encode().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn sync_round_trips_with_records() {
        let records = vec![
            NodeUpdateRecord {
                id: "node-a".to_string(),
                address: "127.0.0.1".to_string(),
                port: 7946,
                state: NodeState::Alive,
                incarnation: 5,
                is_main: true,
            },
            NodeUpdateRecord {
                id: "node-b".to_string(),
                address: "127.0.0.1".to_string(),
                port: 7947,
                state: NodeState::Suspect,
                incarnation: 1,
                is_main: false,
            },
        ];
        let frame = Frame::new_sync("node-a", 1, 9, records.clone());
        let bytes = frame.encode().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        match decoded {
            Frame::Sync { records: got, .. } => assert_eq!(got, records),
            _ => panic!("expected Sync"),
        }
    }

    #[test]
    fn sync_caps_at_max_records() {
        let records: Vec<_> = (0..100)
            .map(|i| NodeUpdateRecord {
                id: format!("node-{i}"),
                address: "127.0.0.1".to_string(),
                port: 7946,
                state: NodeState::Alive,
                incarnation: 0,
                is_main: false,
            })
            .collect();
        let frame = Frame::new_sync("node-a", 1, 0, records);
        match frame {
            Frame::Sync { records, .. } => assert_eq!(records.len(), MAX_SYNC_RECORDS),
            _ => panic!("expected Sync"),
        }
    }

    #[test]
    fn app_payload_round_trips() {
        let frame = Frame::new_app("node-a", 1, 4, b"hello mesh".to_vec());
        let bytes = frame.encode().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn too_short_datagram_is_rejected() {
        let err = Frame::decode(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, WireError::TooShortForHeader { .. }));
    }

    #[test]
    fn sync_with_inflated_node_count_is_rejected() {
        let mut bytes = Frame::new_sync("node-a", 1, 0, vec![]).encode().unwrap();
        // Claim 5 records while the datagram carries none.
        let count_offset = HEADER_LEN;
        bytes[count_offset..count_offset + 4].copy_from_slice(&5u32.to_le_bytes());
        let err = Frame::decode(&bytes).unwrap_err();
        assert!(matches!(err, WireError::SyncCountExceedsDatagram { .. }));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let mut bytes = Frame::new_ping("node-a", 1, 0, "node-b").encode().unwrap();
        bytes[1] = 0xFF;
        let err = Frame::decode(&bytes).unwrap_err();
        assert!(matches!(err, WireError::UnknownMessageType(0xFF)));
    }

    #[test]
    fn overlong_sender_id_is_rejected_instead_of_truncated() {
        let oversized = "x".repeat(MAX_ID_LEN + 1);
        let frame = Frame::new_ping(&oversized, 1, 0, "node-b");
        let err = frame.encode().unwrap_err();
        assert!(matches!(err, WireError::FieldTooLong { field: "sender_id", .. }));
    }

    proptest::proptest! {
        #[test]
        fn ping_round_trips_over_arbitrary_ids(
            sender in "[a-zA-Z0-9_-]{0,63}",
            target in "[a-zA-Z0-9_-]{0,63}",
            incarnation: u32,
            seq: u32,
        ) {
            let frame = Frame::new_ping(&sender, incarnation, seq, &target);
            let bytes = frame.encode().unwrap();
            let decoded = Frame::decode(&bytes).unwrap();
            prop_assert_eq!(frame, decoded);
        }

        #[test]
        fn sync_record_round_trips_over_arbitrary_address_and_port(
            id in "[a-zA-Z0-9_-]{0,63}",
            address in "[a-zA-Z0-9.:_-]{0,63}",
            port: u16,
            incarnation: u32,
            is_main: bool,
        ) {
            let record = NodeUpdateRecord {
                id,
                address,
                port,
                state: NodeState::Alive,
                incarnation,
                is_main,
            };
            let frame = Frame::new_sync("node-a", 1, 0, vec![record.clone()]);
            let bytes = frame.encode().unwrap();
            let decoded = Frame::decode(&bytes).unwrap();
            match decoded {
                Frame::Sync { records, .. } => prop_assert_eq!(records, vec![record]),
                _ => prop_assert!(false, "expected Sync"),
            }
        }
    }
}
