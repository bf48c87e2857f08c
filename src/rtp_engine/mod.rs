#[cfg(test)]
mod rtp_engine_test;

pub mod context;

use bytes::{Bytes, BytesMut};
use util::{Marshal, Unmarshal};

use crate::error::{Error, Result};

/// a=extmap URIs the gateway understands.
pub const EXTMAP_AUDIO_LEVEL: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";
pub const EXTMAP_TOFFSET: &str = "urn:ietf:params:rtp-hdrext:toffset";
pub const EXTMAP_ABS_SEND_TIME: &str = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";
pub const EXTMAP_VIDEO_ORIENTATION: &str = "urn:3gpp:video-orientation";
pub const EXTMAP_TRANSPORT_WIDE_CC: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";
pub const EXTMAP_PLAYOUT_DELAY: &str =
    "http://www.webrtc.org/experiments/rtp-hdrext/playout-delay";
pub const EXTMAP_RTP_STREAM_ID: &str = "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id";

pub const RTP_HEADER_SIZE: usize = 12;

/// Parses an RTP packet off the wire.
pub fn parse(buf: &[u8]) -> Result<rtp::packet::Packet> {
    let mut b = buf;
    Ok(rtp::packet::Packet::unmarshal(&mut b)?)
}

/// Parses just the header, leaving the payload alone.
pub fn parse_header(buf: &[u8]) -> Result<rtp::header::Header> {
    let mut b = buf;
    Ok(rtp::header::Header::unmarshal(&mut b)?)
}

pub fn marshal(pkt: &rtp::packet::Packet) -> Result<Bytes> {
    Ok(pkt.marshal()?)
}

/// The payload of a raw RTP packet, past the header and its extensions.
pub fn payload_of(buf: &[u8]) -> Result<&[u8]> {
    let mut b = buf;
    rtp::header::Header::unmarshal(&mut b)?;
    Ok(b)
}

/// ssrc-audio-level (RFC 6464): level in dBov, 0 is loudest.
pub fn parse_audio_level(header: &rtp::header::Header, id: u8) -> Option<(bool, u8)> {
    let ext = header.get_extension(id)?;
    let b = *ext.first()?;
    Some((b & 0x80 != 0, b & 0x7f))
}

/// urn:3gpp:video-orientation: (camera, flip, rotation degrees).
pub fn parse_video_orientation(header: &rtp::header::Header, id: u8) -> Option<(bool, bool, u16)> {
    let ext = header.get_extension(id)?;
    let b = *ext.first()?;
    let rotation = match b & 0x03 {
        0 => 0,
        1 => 90,
        2 => 180,
        _ => 270,
    };
    Some((b & 0x08 != 0, b & 0x04 != 0, rotation))
}

/// playout-delay: (min, max) in 10 ms units.
pub fn parse_playout_delay(header: &rtp::header::Header, id: u8) -> Option<(u16, u16)> {
    let ext = header.get_extension(id)?;
    if ext.len() < 3 {
        return None;
    }
    let min = ((ext[0] as u16) << 4) | ((ext[1] as u16) >> 4);
    let max = (((ext[1] & 0x0f) as u16) << 8) | ext[2] as u16;
    Some((min, max))
}

/// rtp-stream-id (RID) as a string.
pub fn parse_rtp_stream_id(header: &rtp::header::Header, id: u8) -> Option<String> {
    let ext = header.get_extension(id)?;
    std::str::from_utf8(&ext).ok().map(|s| {
        s.trim_end_matches('\0').to_owned()
    })
}

/// transport-wide-cc sequence number.
pub fn parse_transport_wide_seq(header: &rtp::header::Header, id: u8) -> Option<u16> {
    let ext = header.get_extension(id)?;
    if ext.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([ext[0], ext[1]]))
}

/// Rewrites a buffered packet onto its RTX companion stream: the original
/// sequence number is prepended to the payload (OSN) and SSRC/PT/seq are
/// replaced with the retransmission ones (RFC 4588).
pub fn rtx_wrap(
    pkt: &rtp::packet::Packet,
    rtx_ssrc: u32,
    rtx_pt: u8,
    rtx_seq: u16,
) -> rtp::packet::Packet {
    let mut payload = BytesMut::with_capacity(pkt.payload.len() + 2);
    payload.extend_from_slice(&pkt.header.sequence_number.to_be_bytes());
    payload.extend_from_slice(&pkt.payload);

    let mut header = pkt.header.clone();
    header.ssrc = rtx_ssrc;
    header.payload_type = rtx_pt;
    header.sequence_number = rtx_seq;

    rtp::packet::Packet {
        header,
        payload: payload.freeze(),
    }
}

/// Recovers the original packet from an RTX one: strips the OSN prefix,
/// restores the media payload type and SSRC, and returns the original
/// sequence number.
pub fn rtx_unwrap(
    pkt: &rtp::packet::Packet,
    media_pt: u8,
    media_ssrc: u32,
) -> Result<(rtp::packet::Packet, u16)> {
    if pkt.payload.len() < 2 {
        return Err(Error::new("RTX packet too short for OSN".to_owned()));
    }
    let osn = u16::from_be_bytes([pkt.payload[0], pkt.payload[1]]);

    let mut header = pkt.header.clone();
    header.ssrc = media_ssrc;
    header.payload_type = media_pt;
    header.sequence_number = osn;

    Ok((
        rtp::packet::Packet {
            header,
            payload: pkt.payload.slice(2..),
        },
        osn,
    ))
}

/// Keyframe classifier bound to the negotiated video codec.
pub type KeyframeClassifier = fn(&[u8]) -> bool;

pub fn keyframe_classifier(codec: &str) -> Option<KeyframeClassifier> {
    match codec.to_ascii_lowercase().as_str() {
        "vp8" => Some(vp8_is_keyframe),
        "vp9" => Some(vp9_is_keyframe),
        "h264" => Some(h264_is_keyframe),
        _ => None,
    }
}

/// VP8 payload descriptor walk (RFC 7741), then the P bit of the payload
/// header: 0 means keyframe.
pub fn vp8_is_keyframe(payload: &[u8]) -> bool {
    let mut idx = 0usize;
    if payload.is_empty() {
        return false;
    }
    let b0 = payload[idx];
    let extended = b0 & 0x80 != 0;
    let start_of_partition = b0 & 0x10 != 0;
    let pid = b0 & 0x07;
    idx += 1;
    if extended {
        if payload.len() <= idx {
            return false;
        }
        let b1 = payload[idx];
        let has_picture_id = b1 & 0x80 != 0;
        let has_tl0picidx = b1 & 0x40 != 0;
        let has_tid = b1 & 0x20 != 0;
        let has_keyidx = b1 & 0x10 != 0;
        idx += 1;
        if has_picture_id {
            if payload.len() <= idx {
                return false;
            }
            if payload[idx] & 0x80 != 0 {
                idx += 2;
            } else {
                idx += 1;
            }
        }
        if has_tl0picidx {
            idx += 1;
        }
        if has_tid || has_keyidx {
            idx += 1;
        }
    }
    if !start_of_partition || pid != 0 || payload.len() <= idx {
        return false;
    }
    // Inverse key frame flag in the VP8 payload header.
    payload[idx] & 0x01 == 0
}

/// VP9 payload descriptor walk (draft-ietf-payload-vp9): a keyframe is a
/// non-inter-predicted frame at the beginning of a layer frame.
pub fn vp9_is_keyframe(payload: &[u8]) -> bool {
    if payload.is_empty() {
        return false;
    }
    let b0 = payload[0];
    let has_picture_id = b0 & 0x80 != 0;
    let inter_predicted = b0 & 0x40 != 0;
    let has_layer_indices = b0 & 0x20 != 0;
    let flexible_mode = b0 & 0x10 != 0;
    let begins_frame = b0 & 0x08 != 0;

    if inter_predicted || !begins_frame {
        return false;
    }

    let mut idx = 1usize;
    if has_picture_id {
        if payload.len() <= idx {
            return false;
        }
        if payload[idx] & 0x80 != 0 {
            idx += 2;
        } else {
            idx += 1;
        }
    }
    if has_layer_indices {
        if payload.len() <= idx {
            return false;
        }
        // Spatial layer 0 only; higher layers repeat the same frame.
        if (payload[idx] >> 1) & 0x07 != 0 {
            return false;
        }
        idx += 1;
        if !flexible_mode {
            idx += 1;
        }
    }
    payload.len() > idx
}

/// H.264: SPS or IDR NAL units, also inside STAP-A aggregates and
/// FU-A fragments (RFC 6184).
pub fn h264_is_keyframe(payload: &[u8]) -> bool {
    if payload.is_empty() {
        return false;
    }
    match payload[0] & 0x1f {
        5 | 7 => true,
        // STAP-A: walk the aggregated NALUs.
        24 => {
            let mut idx = 1usize;
            while idx + 2 < payload.len() {
                let size = u16::from_be_bytes([payload[idx], payload[idx + 1]]) as usize;
                idx += 2;
                if idx >= payload.len() {
                    return false;
                }
                match payload[idx] & 0x1f {
                    5 | 7 => return true,
                    _ => idx += size,
                }
            }
            false
        }
        // FU-A: only the fragment start carries the original NAL type.
        28 => {
            payload.len() > 1
                && payload[1] & 0x80 != 0
                && matches!(payload[1] & 0x1f, 5 | 7)
        }
        _ => false,
    }
}
