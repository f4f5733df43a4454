//! Interleaved RTP framing for the metadata sub-channel.
//!
//! Frames read from the transport look like:
//!
//! ```text
//! +-----+---------+-------------+------------------------+
//! | '$' | channel | length (BE) | RTP header | payload   |
//! +-----+---------+-------------+------------------------+
//!   1B      1B         2B          12B + CSRC + ext
//! ```
//!
//! The channel byte identifies which multiplexed track the packet
//! belongs to, so several tracks can share one socket.

/// First byte of every interleaved frame.
pub const INTERLEAVED_MAGIC: u8 = b'$';

/// Size of the interleaved frame header.
pub const INTERLEAVED_HEADER_LEN: usize = 4;

/// Size of the fixed part of an RTP header.
pub const RTP_FIXED_HEADER_LEN: usize = 12;

const RTP_VERSION: u8 = 2;

/// Outcome of decoding one frame against the selected metadata channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecode<'a> {
    /// Shorter than the interleaved header; drop it.
    TooShort,
    /// Belongs to another multiplexed track.
    OtherChannel(u8),
    /// Right channel but the RTP header is inconsistent; drop it.
    Malformed,
    /// Metadata payload.
    Payload(&'a [u8]),
}

/// Strips the RTP header (CSRC list, extension and padding included).
///
/// Returns `None` when the packet is not RTP v2 or is truncated.
pub fn rtp_payload(packet: &[u8]) -> Option<&[u8]> {
    let first = *packet.first()?;
    if first >> 6 != RTP_VERSION || packet.len() < RTP_FIXED_HEADER_LEN {
        return None;
    }

    let csrc_count = usize::from(first & 0x0f);
    let has_extension = first & 0x10 != 0;
    let has_padding = first & 0x20 != 0;

    let mut offset = RTP_FIXED_HEADER_LEN + csrc_count * 4;
    if has_extension {
        let words = packet.get(offset + 2..offset + 4)?;
        let ext_words = usize::from(u16::from_be_bytes([*words.first()?, *words.get(1)?]));
        offset += 4 + ext_words * 4;
    }

    let mut end = packet.len();
    if has_padding {
        let pad = usize::from(*packet.last()?);
        end = end.checked_sub(pad)?;
    }

    packet.get(offset..end)
}

/// Decodes an interleaved frame, keeping only packets on `channel`.
pub fn decode_metadata_frame(frame: &[u8], channel: u8) -> FrameDecode<'_> {
    if frame.len() < INTERLEAVED_HEADER_LEN {
        return FrameDecode::TooShort;
    }

    let frame_channel = frame.get(1).copied().unwrap_or_default();
    if frame_channel != channel {
        return FrameDecode::OtherChannel(frame_channel);
    }

    match frame.get(INTERLEAVED_HEADER_LEN..).and_then(rtp_payload) {
        Some(payload) => FrameDecode::Payload(payload),
        None => FrameDecode::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp(payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x80, 103, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        packet.extend_from_slice(payload);
        packet
    }

    fn frame(channel: u8, packet: &[u8]) -> Vec<u8> {
        let mut out = vec![INTERLEAVED_MAGIC, channel];
        out.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        out.extend_from_slice(packet);
        out
    }

    #[test]
    fn test_payload_on_selected_channel() {
        let data = frame(2, &rtp(b"{\"track\":1}"));
        assert_eq!(decode_metadata_frame(&data, 2), FrameDecode::Payload(b"{\"track\":1}"));
    }

    #[test]
    fn test_other_channel_ignored() {
        let data = frame(0, &rtp(b"video"));
        assert_eq!(decode_metadata_frame(&data, 2), FrameDecode::OtherChannel(0));
    }

    #[test]
    fn test_short_frames_dropped() {
        assert_eq!(decode_metadata_frame(&[], 2), FrameDecode::TooShort);
        assert_eq!(decode_metadata_frame(&[b'$', 2, 0], 2), FrameDecode::TooShort);
    }

    #[test]
    fn test_truncated_rtp_header_is_malformed() {
        let data = frame(2, &[0x80, 103, 0]);
        assert_eq!(decode_metadata_frame(&data, 2), FrameDecode::Malformed);
    }

    #[test]
    fn test_csrc_and_extension_skipped() {
        // CC=1, X=1
        let mut packet = vec![0x91, 103, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        packet.extend_from_slice(&[0xaa; 4]); // one CSRC
        packet.extend_from_slice(&[0xbe, 0xde, 0, 1]); // extension header, 1 word
        packet.extend_from_slice(&[0xcc; 4]);
        packet.extend_from_slice(b"meta");
        assert_eq!(rtp_payload(&packet), Some(&b"meta"[..]));
    }

    #[test]
    fn test_padding_removed() {
        let mut packet = rtp(b"meta");
        packet[0] |= 0x20;
        packet.extend_from_slice(&[0, 0, 3]);
        assert_eq!(rtp_payload(&packet), Some(&b"meta"[..]));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut packet = rtp(b"meta");
        packet[0] = 0x40;
        assert_eq!(rtp_payload(&packet), None);
    }

    #[test]
    fn test_empty_payload_allowed() {
        assert_eq!(rtp_payload(&rtp(b"")), Some(&b""[..]));
    }
}
