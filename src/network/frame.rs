use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::TransportError::Incomplete;
use crate::{TransportError, TransportResult};

/// Width of the unsigned big-endian length prefix on every frame.
pub const FRAME_HEADER_SIZE: usize = 4;

/// One length-delimited wire frame carrying a single opaque packet.
///
/// Encoding prepends a 4-byte big-endian length header. Decoding is
/// incremental: `parse` consumes a `BytesMut` receive buffer and yields one
/// complete payload at a time, regardless of how the bytes were split across
/// socket reads.
#[derive(Debug)]
pub struct PacketFrame;

impl PacketFrame {
    /// Frames a payload for the wire.
    ///
    /// Fails if the payload exceeds `max_frame_size` or the representable
    /// range of the length header.
    pub fn encode(payload: &[u8], max_frame_size: usize) -> TransportResult<Bytes> {
        if payload.len() > max_frame_size || payload.len() > u32::MAX as usize {
            return Err(TransportError::FrameTooLarge {
                size: payload.len(),
                limit: max_frame_size,
            });
        }
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(payload);
        Ok(frame.freeze())
    }

    pub fn check(buffer: &mut BytesMut, max_frame_size: usize) -> TransportResult<()> {
        if buffer.remaining() < FRAME_HEADER_SIZE {
            return Err(Incomplete);
        }
        let header = buffer.get(0..FRAME_HEADER_SIZE).unwrap();
        let declared = u32::from_be_bytes(header.try_into().unwrap()) as usize;
        if declared > max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: declared,
                limit: max_frame_size,
            });
        }
        if buffer.remaining() < FRAME_HEADER_SIZE + declared {
            buffer.reserve(FRAME_HEADER_SIZE + declared - buffer.remaining());
            return Err(Incomplete);
        }
        Ok(())
    }

    /// Extracts the next complete payload from the receive buffer.
    ///
    /// Returns `Ok(None)` while the frame is still incomplete. A declared
    /// length above `max_frame_size` is a protocol violation and is returned
    /// as an error before any payload-sized allocation happens; the caller
    /// is expected to close the connection.
    pub fn parse(buffer: &mut BytesMut, max_frame_size: usize) -> TransportResult<Option<Bytes>> {
        match PacketFrame::check(buffer, max_frame_size) {
            Ok(()) => {
                let body_length = buffer.get_u32() as usize;
                let payload = buffer.split_to(body_length).freeze();
                Ok(Some(payload))
            }
            Err(Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const MAX: usize = 1024;

    fn stream_of(payloads: &[&[u8]]) -> Vec<u8> {
        let mut wire = Vec::new();
        for payload in payloads {
            wire.extend_from_slice(&PacketFrame::encode(payload, MAX).unwrap());
        }
        wire
    }

    #[test]
    fn encode_parse_round_trip() {
        for size in [0usize, 1, 7, 255, MAX] {
            let payload = vec![0xA5u8; size];
            let frame = PacketFrame::encode(&payload, MAX).unwrap();
            assert_eq!(frame.len(), FRAME_HEADER_SIZE + size);

            let mut buffer = BytesMut::from(&frame[..]);
            let decoded = PacketFrame::parse(&mut buffer, MAX).unwrap().unwrap();
            assert_eq!(&decoded[..], &payload[..]);
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX + 1];
        let result = PacketFrame::encode(&payload, MAX);
        assert!(matches!(
            result,
            Err(TransportError::FrameTooLarge { size, limit }) if size == MAX + 1 && limit == MAX
        ));
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    #[case(5)]
    #[case(8)]
    fn split_deliveries_yield_payloads_in_order(#[case] chunk_size: usize) {
        let payloads: [&[u8]; 3] = [b"attack", b"", b"end of turn"];
        let wire = stream_of(&payloads);

        let mut buffer = BytesMut::new();
        let mut decoded = Vec::new();
        for chunk in wire.chunks(chunk_size) {
            buffer.extend_from_slice(chunk);
            while let Some(payload) = PacketFrame::parse(&mut buffer, MAX).unwrap() {
                decoded.push(payload);
            }
        }

        assert_eq!(decoded.len(), payloads.len());
        for (got, expected) in decoded.iter().zip(payloads.iter()) {
            assert_eq!(&got[..], *expected);
        }
    }

    #[test]
    fn multiple_frames_in_one_delivery() {
        let wire = stream_of(&[b"one", b"two", b"three"]);
        let mut buffer = BytesMut::from(&wire[..]);

        let mut decoded = Vec::new();
        while let Some(payload) = PacketFrame::parse(&mut buffer, MAX).unwrap() {
            decoded.push(payload);
        }

        assert_eq!(decoded, vec![&b"one"[..], &b"two"[..], &b"three"[..]]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_header_is_incomplete() {
        let mut buffer = BytesMut::from(&[0u8, 0, 0][..]);
        assert!(PacketFrame::parse(&mut buffer, MAX).unwrap().is_none());
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn corrupted_length_header_is_a_protocol_violation() {
        let mut buffer = BytesMut::from(&[0xFFu8, 0xFF, 0xFF, 0xFF][..]);
        let result = PacketFrame::parse(&mut buffer, MAX);
        assert!(matches!(
            result,
            Err(TransportError::FrameTooLarge { size, .. }) if size == u32::MAX as usize
        ));
    }
}
