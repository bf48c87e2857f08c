use bytes::Bytes;

use super::context::SwitchingContext;
use super::*;
use crate::config::SkewTunables;

fn header_with_extension(id: u8, payload: &[u8]) -> rtp::header::Header {
    let mut header = rtp::header::Header {
        version: 2,
        ..Default::default()
    };
    header
        .set_extension(id, Bytes::copy_from_slice(payload))
        .expect("set extension");
    header
}

#[test]
fn test_extension_parsing() {
    let header = header_with_extension(1, &[0x80 | 42]);
    assert_eq!(parse_audio_level(&header, 1), Some((true, 42)));
    assert_eq!(parse_audio_level(&header, 2), None);

    // Camera bit set, rotation 180.
    let header = header_with_extension(4, &[0x08 | 0x02]);
    assert_eq!(parse_video_orientation(&header, 4), Some((true, false, 180)));

    // min=1 (10ms), max=10 (100ms).
    let header = header_with_extension(6, &[0x00, 0x10, 0x0a]);
    assert_eq!(parse_playout_delay(&header, 6), Some((1, 10)));

    let header = header_with_extension(3, b"m1\0");
    assert_eq!(parse_rtp_stream_id(&header, 3).as_deref(), Some("m1"));

    let header = header_with_extension(5, &[0x01, 0x02]);
    assert_eq!(parse_transport_wide_seq(&header, 5), Some(258));
}

#[test]
fn test_rtx_wrap_unwrap() -> crate::error::Result<()> {
    let pkt = rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type: 96,
            sequence_number: 103,
            timestamp: 3000,
            ssrc: 1000,
            ..Default::default()
        },
        payload: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
    };

    let rtx = rtx_wrap(&pkt, 2000, 97, 0);
    assert_eq!(rtx.header.ssrc, 2000);
    assert_eq!(rtx.header.payload_type, 97);
    assert_eq!(rtx.header.sequence_number, 0);
    // OSN prefix carries the original sequence number.
    assert_eq!(&rtx.payload[..2], &103u16.to_be_bytes());
    assert_eq!(&rtx.payload[2..], &[0xde, 0xad, 0xbe, 0xef]);

    let (recovered, osn) = rtx_unwrap(&rtx, 96, 1000)?;
    assert_eq!(osn, 103);
    assert_eq!(recovered.header.ssrc, 1000);
    assert_eq!(recovered.header.payload_type, 96);
    assert_eq!(recovered.header.sequence_number, 103);
    assert_eq!(recovered.payload, pkt.payload);

    Ok(())
}

#[test]
fn test_payload_of() -> crate::error::Result<()> {
    let pkt = rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type: 111,
            ..Default::default()
        },
        payload: Bytes::from_static(&[0x11, 0x22, 0x33]),
    };
    let raw = marshal(&pkt)?;
    assert_eq!(payload_of(&raw)?, &[0x11, 0x22, 0x33]);
    Ok(())
}

#[test]
fn test_rtx_unwrap_too_short() {
    let pkt = rtp::packet::Packet {
        header: rtp::header::Header::default(),
        payload: Bytes::from_static(&[0x01]),
    };
    assert!(rtx_unwrap(&pkt, 96, 1000).is_err());
}

#[test]
fn test_vp8_keyframe() {
    // S=1, PID=0, no extension, P bit clear in the payload header.
    assert!(vp8_is_keyframe(&[0x10, 0x00, 0x00, 0x00]));
    // Same but P bit set: interframe.
    assert!(!vp8_is_keyframe(&[0x10, 0x01, 0x00, 0x00]));
    // Extended descriptor with a 15-bit picture id.
    assert!(vp8_is_keyframe(&[0x90, 0x80, 0x81, 0x01, 0x00, 0x00]));
    // Not the start of a partition.
    assert!(!vp8_is_keyframe(&[0x00, 0x00]));
    assert!(!vp8_is_keyframe(&[]));
}

#[test]
fn test_vp9_keyframe() {
    // B set, P clear, one payload byte.
    assert!(vp9_is_keyframe(&[0x08, 0x00]));
    // Inter-predicted.
    assert!(!vp9_is_keyframe(&[0x48, 0x00]));
    // Not the beginning of a frame.
    assert!(!vp9_is_keyframe(&[0x00, 0x00]));
}

#[test]
fn test_h264_keyframe() {
    assert!(h264_is_keyframe(&[0x65, 0x88]));
    assert!(h264_is_keyframe(&[0x67, 0x42]));
    assert!(!h264_is_keyframe(&[0x41, 0x9a]));
    // STAP-A aggregating an SPS.
    assert!(h264_is_keyframe(&[0x18, 0x00, 0x02, 0x67, 0x42]));
    // FU-A start fragment of an IDR slice.
    assert!(h264_is_keyframe(&[0x7c, 0x85]));
    // FU-A continuation fragment.
    assert!(!h264_is_keyframe(&[0x7c, 0x45]));
}

#[test]
fn test_keyframe_classifier_lookup() {
    assert!(keyframe_classifier("VP8").is_some());
    assert!(keyframe_classifier("vp9").is_some());
    assert!(keyframe_classifier("H264").is_some());
    assert!(keyframe_classifier("opus").is_none());
}

fn audio_header(ssrc: u32, seq: u16, ts: u32) -> rtp::header::Header {
    rtp::header::Header {
        version: 2,
        payload_type: 111,
        sequence_number: seq,
        timestamp: ts,
        ssrc,
        ..Default::default()
    }
}

#[test]
fn test_switching_context_passthrough() {
    let mut ctx = SwitchingContext::new();
    for i in 0u16..10 {
        let mut header = audio_header(0x1111, 100 + i, 10_000 + 960 * i as u32);
        ctx.update_header(&mut header, false, 0);
        assert_eq!(header.sequence_number, 100 + i);
        assert_eq!(header.timestamp, 10_000 + 960 * i as u32);
    }
}

#[test]
fn test_switching_context_ssrc_change() {
    let mut ctx = SwitchingContext::new();
    let mut last_seq = 0u16;
    let mut last_ts = 0u32;
    for i in 0u16..5 {
        let mut header = audio_header(0x1111, 200 + i, 40_000 + 960 * i as u32);
        ctx.update_header(&mut header, false, 0);
        last_seq = header.sequence_number;
        last_ts = header.timestamp;
    }

    // New source with wildly different seq/ts: the emitted stream must
    // continue from where it was, one seq ahead and one step beyond.
    let mut header = audio_header(0x2222, 9, 777);
    ctx.update_header(&mut header, false, 960);
    assert_eq!(header.sequence_number, last_seq.wrapping_add(1));
    assert_eq!(header.timestamp, last_ts.wrapping_add(960));

    let mut header = audio_header(0x2222, 10, 777 + 960);
    ctx.update_header(&mut header, false, 960);
    assert_eq!(header.sequence_number, last_seq.wrapping_add(2));
    assert_eq!(header.timestamp, last_ts.wrapping_add(1920));
}

#[test]
fn test_switching_context_monotonic_across_wrap() {
    let mut ctx = SwitchingContext::new();
    let mut prev: Option<u16> = None;
    // Walk across the u16 wrap and through an SSRC change.
    for i in 0u32..20 {
        let ssrc = if i < 10 { 0xaaaa } else { 0xbbbb };
        let seq = 65530u16.wrapping_add(i as u16);
        let mut header = audio_header(ssrc, seq, 1000 + 960 * i);
        ctx.update_header(&mut header, false, 0);
        if let Some(p) = prev {
            assert_eq!(
                header.sequence_number,
                p.wrapping_add(1),
                "outbound seq must be strictly monotonic mod 2^16"
            );
        }
        prev = Some(header.sequence_number);
    }
}

#[test]
fn test_switching_context_seq_reset() {
    let mut ctx = SwitchingContext::new();
    let mut header = audio_header(0x1111, 100, 10_000);
    ctx.update_header(&mut header, false, 0);

    ctx.seq_reset(false);
    // Same SSRC, but the source paused and restarted far away.
    let mut header = audio_header(0x1111, 30_000, 10_960);
    ctx.update_header(&mut header, false, 0);
    assert_eq!(header.sequence_number, 101);
}

#[test]
fn test_skew_compensation_drops_fast_source() {
    let tunables = SkewTunables::default();
    let mut ctx = SwitchingContext::new();

    // 48 kHz timestamps (960/packet) arriving on a wallclock consistent
    // with a 44.1 kHz crystal: 18375 us per packet instead of 20 ms.
    let mut dropped = 0i64;
    let mut compensated = 0i64;
    for i in 0u32..1200 {
        let now_us = i as i64 * 18_375;
        let mut header = audio_header(0x1111, i as u16, 960 * i);
        let ret = ctx.skew_compensate(&mut header, false, now_us, &tunables);
        if now_us < tunables.warmup.as_micros() as i64 {
            assert_eq!(ret, 0, "no compensation during warm-up");
        }
        if ret < 0 {
            dropped += 1;
            compensated += ret as i64;
        }
    }
    assert!(dropped > 0, "fast source must force packet drops");
    assert_eq!(compensated, -dropped);
}

#[test]
fn test_skew_compensation_quiet_when_aligned() {
    let tunables = SkewTunables::default();
    let mut ctx = SwitchingContext::new();
    for i in 0u32..1200 {
        let now_us = i as i64 * 20_000;
        let mut header = audio_header(0x1111, i as u16, 960 * i);
        assert_eq!(ctx.skew_compensate(&mut header, false, now_us, &tunables), 0);
        assert_eq!(header.timestamp, 960 * i);
        assert_eq!(header.sequence_number, i as u16);
    }
}
