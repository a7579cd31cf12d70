//! Wire codec for data packets and acknowledgements.
//!
//! Stateless: building a packet and parsing an ACK are pure functions over
//! byte slices, no socket involved.

use crate::error::SenderError;

/// Total datagram size cap, header included.
pub const PACKET_SIZE: usize = 1024;
/// Width of the big-endian signed sequence-id header.
pub const SEQ_ID_SIZE: usize = 4;
/// Largest payload a single data packet may carry.
pub const MSS: usize = PACKET_SIZE - SEQ_ID_SIZE;

/// Builds a data packet: 4-byte big-endian signed `seq_id` followed by
/// `payload`, truncated to [`MSS`] bytes if the caller hands us more.
pub fn encode(seq_id: i32, payload: &[u8]) -> Vec<u8> {
    let payload = if payload.len() > MSS {
        &payload[..MSS]
    } else {
        payload
    };
    let mut packet = Vec::with_capacity(SEQ_ID_SIZE + payload.len());
    packet.extend_from_slice(&seq_id.to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// Parses an inbound ACK datagram into `(ack_id, message)`.
///
/// `message` is decoded as UTF-8 with invalid sequences dropped (not
/// replaced), matching the reference `decode(errors="ignore")`, then
/// trimmed of ASCII whitespace.
pub fn decode_ack(bytes: &[u8]) -> Result<(i32, String), SenderError> {
    if bytes.len() < SEQ_ID_SIZE {
        return Err(SenderError::MalformedPacket);
    }
    let ack_id = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let message = decode_utf8_lossy_ignoring_invalid(&bytes[SEQ_ID_SIZE..])
        .trim()
        .to_string();
    Ok((ack_id, message))
}

/// Salvages the valid UTF-8 spans of `bytes`, dropping invalid ones
/// entirely rather than substituting U+FFFD.
fn decode_utf8_lossy_ignoring_invalid(mut bytes: &[u8]) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(bytes) {
            Ok(valid) => {
                out.push_str(valid);
                break;
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                out.push_str(std::str::from_utf8(&bytes[..valid_up_to]).unwrap());
                let skip = e.error_len().unwrap_or(bytes.len() - valid_up_to);
                bytes = &bytes[valid_up_to + skip..];
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_prefixes_seq_id_big_endian() {
        let pkt = encode(256, b"hi");
        assert_eq!(pkt, vec![0, 0, 1, 0, b'h', b'i']);
    }

    #[test]
    fn encode_truncates_oversized_payload() {
        let payload = vec![7u8; MSS + 100];
        let pkt = encode(0, &payload);
        assert_eq!(pkt.len(), SEQ_ID_SIZE + MSS);
    }

    #[test]
    fn encode_accepts_empty_payload_for_eof_marker() {
        let pkt = encode(1000, b"");
        assert_eq!(pkt, vec![0, 0, 3, 232]);
    }

    #[test]
    fn decode_ack_rejects_short_packets() {
        assert!(matches!(
            decode_ack(&[0, 0, 1]),
            Err(SenderError::MalformedPacket)
        ));
    }

    #[test]
    fn decode_ack_reads_signed_big_endian_id_and_trims_message() {
        let mut bytes = vec![0, 0, 0, 100];
        bytes.extend_from_slice(b"  fin  ");
        let (ack_id, msg) = decode_ack(&bytes).unwrap();
        assert_eq!(ack_id, 100);
        assert_eq!(msg, "fin");
    }

    #[test]
    fn decode_ack_drops_invalid_utf8_as_empty_output() {
        let mut bytes = vec![0, 0, 0, 1];
        bytes.extend_from_slice(&[0xff, 0xfe]);
        let (ack_id, msg) = decode_ack(&bytes).unwrap();
        assert_eq!(ack_id, 1);
        assert!(msg.is_empty());
    }

    #[test]
    fn decode_ack_salvages_valid_utf8_around_invalid_bytes() {
        let mut bytes = vec![0, 0, 0, 2];
        bytes.extend_from_slice(b"fi");
        bytes.push(0xff);
        bytes.extend_from_slice(b"n");
        let (_, msg) = decode_ack(&bytes).unwrap();
        assert_eq!(msg, "fin");
    }

    #[test]
    fn round_trip_ack_through_encode_reproduces_bytes() {
        let original = encode(42, b"fin");
        let (ack_id, msg) = decode_ack(&original).unwrap();
        let reencoded = encode(ack_id, msg.as_bytes());
        assert_eq!(original, reencoded);
    }

    #[test]
    fn seq_id_zero_is_legal() {
        let pkt = encode(0, b"x");
        assert_eq!(&pkt[..SEQ_ID_SIZE], &[0, 0, 0, 0]);
    }
}
