/// Message Framing
///
/// Application messages are cut into fixed-size packets carrying
/// `(message_id: u64, packet_count: u8, packet_index: u8)` headers and
/// reassembled by message id on the far side. A mismatched packet count
/// for an in-progress message fails the stream.

use std::collections::{BTreeMap, HashMap};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::TransportError;

pub const PACKET_SIZE: usize = 1500;
pub const PACKET_HEADER: usize = 10;
pub const PACKET_PAYLOAD: usize = PACKET_SIZE - PACKET_HEADER;

/// Split one message into wire packets.
pub fn serialize_message(message_id: u64, payload: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
    let count = payload.len().div_ceil(PACKET_PAYLOAD).max(1);
    if count > u8::MAX as usize {
        return Err(TransportError::FrameViolation(format!(
            "message of {} bytes needs {} packets",
            payload.len(),
            count
        )));
    }

    let mut packets = Vec::with_capacity(count);
    for index in 0..count {
        let chunk_start = index * PACKET_PAYLOAD;
        let chunk_end = (chunk_start + PACKET_PAYLOAD).min(payload.len());
        let mut packet = Vec::with_capacity(PACKET_HEADER + (chunk_end - chunk_start));
        let mut header = [0u8; PACKET_HEADER];
        LittleEndian::write_u64(&mut header[0..8], message_id);
        header[8] = count as u8;
        header[9] = index as u8;
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&payload[chunk_start..chunk_end]);
        packets.push(packet);
    }
    Ok(packets)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub message_id: u64,
    pub packet_count: u8,
    pub packet_index: u8,
    pub payload: Vec<u8>,
}

pub fn parse_packet(data: &[u8]) -> Result<Packet, TransportError> {
    if data.len() < PACKET_HEADER {
        return Err(TransportError::FrameViolation(format!(
            "packet of {} bytes is shorter than the header",
            data.len()
        )));
    }
    let message_id = LittleEndian::read_u64(&data[0..8]);
    let packet_count = data[8];
    let packet_index = data[9];
    if packet_count == 0 {
        return Err(TransportError::FrameViolation("zero packet count".into()));
    }
    if packet_index >= packet_count {
        return Err(TransportError::FrameViolation(format!(
            "packet index {} out of {}",
            packet_index, packet_count
        )));
    }
    Ok(Packet {
        message_id,
        packet_count,
        packet_index,
        payload: data[PACKET_HEADER..].to_vec(),
    })
}

struct Fragments {
    packet_count: u8,
    parts: BTreeMap<u8, Vec<u8>>,
}

/// Reassembles interleaved fragmented messages by id.
#[derive(Default)]
pub struct Reassembler {
    pending: HashMap<u64, Fragments>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one wire packet; yields `(message_id, payload)` when a message
    /// completes.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<(u64, Vec<u8>)>, TransportError> {
        let packet = parse_packet(data)?;

        // Unfragmented fast path.
        if packet.packet_count == 1 {
            if self.pending.contains_key(&packet.message_id) {
                return Err(TransportError::FrameViolation(format!(
                    "single-packet message {} collides with in-progress fragments",
                    packet.message_id
                )));
            }
            return Ok(Some((packet.message_id, packet.payload)));
        }

        let fragments = self
            .pending
            .entry(packet.message_id)
            .or_insert_with(|| Fragments {
                packet_count: packet.packet_count,
                parts: BTreeMap::new(),
            });
        if fragments.packet_count != packet.packet_count {
            self.pending.remove(&packet.message_id);
            return Err(TransportError::FrameViolation(format!(
                "packet count changed mid-message {}",
                packet.message_id
            )));
        }
        if fragments.parts.insert(packet.packet_index, packet.payload).is_some() {
            self.pending.remove(&packet.message_id);
            return Err(TransportError::FrameViolation(format!(
                "duplicate packet index for message {}",
                packet.message_id
            )));
        }

        if fragments.parts.len() == fragments.packet_count as usize {
            let fragments = self.pending.remove(&packet.message_id).unwrap();
            let mut payload = Vec::new();
            for (_, part) in fragments.parts {
                payload.extend_from_slice(&part);
            }
            return Ok(Some((packet.message_id, payload)));
        }
        Ok(None)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_message_is_one_packet() {
        let packets = serialize_message(7, b"hello").unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), PACKET_HEADER + 5);

        let mut reassembler = Reassembler::new();
        let (id, payload) = reassembler.feed(&packets[0]).unwrap().unwrap();
        assert_eq!(id, 7);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn test_large_message_roundtrip() {
        let payload: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        let packets = serialize_message(42, &payload).unwrap();
        assert_eq!(packets.len(), 4);
        assert!(packets.iter().all(|p| p.len() <= PACKET_SIZE));

        let mut reassembler = Reassembler::new();
        for packet in &packets[..3] {
            assert!(reassembler.feed(packet).unwrap().is_none());
        }
        let (id, out) = reassembler.feed(&packets[3]).unwrap().unwrap();
        assert_eq!(id, 42);
        assert_eq!(out, payload);
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let payload: Vec<u8> = vec![0xAB; PACKET_PAYLOAD * 2];
        let packets = serialize_message(9, &payload).unwrap();

        let mut reassembler = Reassembler::new();
        assert!(reassembler.feed(&packets[1]).unwrap().is_none());
        let (_, out) = reassembler.feed(&packets[0]).unwrap().unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_interleaved_messages() {
        let a = serialize_message(1, &vec![0x11; PACKET_PAYLOAD + 1]).unwrap();
        let b = serialize_message(2, &vec![0x22; PACKET_PAYLOAD + 1]).unwrap();

        let mut reassembler = Reassembler::new();
        assert!(reassembler.feed(&a[0]).unwrap().is_none());
        assert!(reassembler.feed(&b[0]).unwrap().is_none());
        assert_eq!(reassembler.feed(&a[1]).unwrap().unwrap().0, 1);
        assert_eq!(reassembler.feed(&b[1]).unwrap().unwrap().0, 2);
    }

    #[test]
    fn test_count_mismatch_fails_stream() {
        let packets = serialize_message(5, &vec![0x33; PACKET_PAYLOAD * 2]).unwrap();
        let mut reassembler = Reassembler::new();
        reassembler.feed(&packets[0]).unwrap();

        // Same id, different declared count.
        let mut rogue = packets[1].clone();
        rogue[8] = 3;
        assert!(matches!(
            reassembler.feed(&rogue),
            Err(TransportError::FrameViolation(_))
        ));
    }

    #[test]
    fn test_message_too_large() {
        let payload = vec![0u8; PACKET_PAYLOAD * 256];
        assert!(matches!(
            serialize_message(1, &payload),
            Err(TransportError::FrameViolation(_))
        ));
    }

    #[test]
    fn test_truncated_packet_rejected() {
        assert!(matches!(
            parse_packet(&[0u8; 4]),
            Err(TransportError::FrameViolation(_))
        ));
    }
}
