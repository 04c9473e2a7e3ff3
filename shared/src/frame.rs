//! Reassembles whole packets from an arbitrarily chunked byte stream.

use crate::codec::{parse_packet_header, Packet};
use crate::error::{ProtocolError, ProtocolResult};

/// Accumulates bytes from one connection and yields complete packets.
///
/// A packet is only emitted once every byte its length prefix declares has
/// arrived. Bytes belonging to a following packet stay buffered.
#[derive(Debug, Default)]
pub struct FrameReassembler {
    buffer: Vec<u8>,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Appends a chunk and returns every packet it completed, in arrival order.
    ///
    /// Decode failures (a malformed length or id, an oversized frame) are
    /// fatal for the stream; the caller should drop the connection.
    pub fn push(&mut self, chunk: &[u8]) -> ProtocolResult<Vec<Packet>> {
        self.buffer.extend_from_slice(chunk);
        let mut packets = Vec::new();
        let mut consumed = 0;

        loop {
            let remaining = &self.buffer[consumed..];
            if remaining.is_empty() {
                break;
            }

            match parse_packet_header(remaining) {
                Ok(header) => {
                    packets.push(Packet::new(header.id, header.payload.to_vec()));
                    consumed += header.frame_length();
                }
                Err(ProtocolError::TruncatedPacket { .. }) => break,
                Err(e) => return Err(e),
            }
        }

        self.buffer.drain(..consumed);
        Ok(packets)
    }

    /// Bytes received but not yet part of an emitted packet.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{serialize_handshake, serialize_status_request, ProtocolState};

    fn sample_stream() -> (Vec<Packet>, Vec<u8>) {
        let packets = vec![
            Packet::decode(&serialize_handshake(769, "localhost", 25565, ProtocolState::Status))
                .unwrap(),
            Packet::decode(&serialize_status_request()).unwrap(),
            Packet::new(0x01, vec![0, 1, 2, 3, 4, 5, 6, 7]),
            Packet::new(0x05, vec![0xEE; 300]),
        ];
        let bytes = packets.iter().flat_map(|p| p.encode()).collect();
        (packets, bytes)
    }

    #[test]
    fn test_whole_buffer_yields_all_packets() {
        let (expected, bytes) = sample_stream();
        let mut reassembler = FrameReassembler::new();

        let packets = reassembler.push(&bytes).unwrap();
        assert_eq!(packets, expected);
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_byte_by_byte_matches_whole_buffer() {
        let (expected, bytes) = sample_stream();
        let mut reassembler = FrameReassembler::new();

        let mut packets = Vec::new();
        for byte in &bytes {
            packets.extend(reassembler.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(packets, expected);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_every_split_point_matches_whole_buffer() {
        let (expected, bytes) = sample_stream();

        for first in 0..=bytes.len() {
            for second in (first..=bytes.len()).step_by(7) {
                let mut reassembler = FrameReassembler::new();
                let mut packets = Vec::new();
                packets.extend(reassembler.push(&bytes[..first]).unwrap());
                packets.extend(reassembler.push(&bytes[first..second]).unwrap());
                packets.extend(reassembler.push(&bytes[second..]).unwrap());
                assert_eq!(packets, expected, "split at {} and {}", first, second);
            }
        }
    }

    #[test]
    fn test_partial_packet_is_retained() {
        let frame = Packet::new(0x00, vec![1, 2, 3, 4]).encode();
        let mut reassembler = FrameReassembler::new();

        assert!(reassembler.push(&frame[..3]).unwrap().is_empty());
        assert_eq!(reassembler.pending(), 3);

        let packets = reassembler.push(&frame[3..]).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_trailing_fragment_survives_complete_packet() {
        let first = Packet::new(0x00, vec![0xAA]).encode();
        let second = Packet::new(0x01, vec![0xBB, 0xCC]).encode();

        let mut chunk = first.clone();
        chunk.extend_from_slice(&second[..2]);

        let mut reassembler = FrameReassembler::new();
        let packets = reassembler.push(&chunk).unwrap();
        assert_eq!(packets, vec![Packet::new(0x00, vec![0xAA])]);
        assert_eq!(reassembler.pending(), 2);

        let packets = reassembler.push(&second[2..]).unwrap();
        assert_eq!(packets, vec![Packet::new(0x01, vec![0xBB, 0xCC])]);
    }

    #[test]
    fn test_malformed_length_is_an_error() {
        let mut reassembler = FrameReassembler::new();
        let result = reassembler.push(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(ProtocolError::MalformedVarint(_))));
    }

    #[test]
    fn test_oversized_frame_is_rejected_before_buffering_it() {
        let mut reassembler = FrameReassembler::new();
        let result = reassembler.push(&[0x80, 0x80, 0x80, 0x01]);
        assert!(matches!(result, Err(ProtocolError::PacketTooLarge(_))));
    }
}
