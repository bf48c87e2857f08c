use std::time::{Duration, Instant};

use rtcp::transport_feedbacks::transport_layer_cc::PacketStatusChunk;

use super::*;

#[test]
fn test_rtcp_context_counts_and_cycles() {
    let epoch = Instant::now();
    let mut ctx = RtcpContext::new(48_000);

    ctx.update(65534, 0, 100, epoch, epoch);
    ctx.update(65535, 960, 100, epoch + Duration::from_millis(20), epoch);
    // Wrap: the cycle counter must advance.
    ctx.update(0, 1920, 100, epoch + Duration::from_millis(40), epoch);
    ctx.update(1, 2880, 100, epoch + Duration::from_millis(60), epoch);

    assert_eq!(ctx.received, 4);
    assert_eq!(ctx.cycles, 1);
    assert_eq!(ctx.highest_seq(), (1 << 16) | 1);
    assert_eq!(ctx.expected(), 4);
    assert_eq!(ctx.lost(), 0);
}

#[test]
fn test_rtcp_context_loss() {
    let epoch = Instant::now();
    let mut ctx = RtcpContext::new(90_000);

    ctx.update(100, 0, 100, epoch, epoch);
    ctx.update(101, 3000, 100, epoch, epoch);
    // 102..104 lost.
    ctx.update(105, 15000, 100, epoch, epoch);

    assert_eq!(ctx.expected(), 6);
    assert_eq!(ctx.lost(), 3);
    let fraction = ctx.fraction_lost();
    assert!(fraction > 0);
    // Second call covers a clean interval.
    assert_eq!(ctx.fraction_lost(), 0);
}

#[test]
fn test_rtcp_context_ignores_reordering() {
    let epoch = Instant::now();
    let mut ctx = RtcpContext::new(90_000);
    ctx.update(100, 0, 100, epoch, epoch);
    ctx.update(102, 0, 100, epoch, epoch);
    ctx.update(101, 0, 100, epoch, epoch); // late, not a new highest
    assert_eq!(ctx.highest_seq(), 102);
    assert_eq!(ctx.received, 3);
}

#[test]
fn test_twcc_feedback() {
    let now = Instant::now();
    let mut twcc = TwccState {
        enabled: true,
        ext_id: 3,
        ..Default::default()
    };

    twcc.record(10, now);
    twcc.record(11, now + Duration::from_millis(5));
    // 12 missing.
    twcc.record(13, now + Duration::from_millis(15));
    assert!(twcc.has_pending());

    let fb = twcc.build_feedback(0xaaaa, 0xbbbb).expect("feedback");
    assert_eq!(fb.sender_ssrc, 0xaaaa);
    assert_eq!(fb.media_ssrc, 0xbbbb);
    assert_eq!(fb.base_sequence_number, 10);
    assert_eq!(fb.packet_status_count, 4);
    assert_eq!(fb.fb_pkt_count, 0);
    assert_eq!(fb.recv_deltas.len(), 3);

    // Runs: received(2), missing(1), received(1).
    let runs: Vec<(u16, bool)> = fb
        .packet_chunks
        .iter()
        .map(|c| match c {
            PacketStatusChunk::RunLengthChunk(r) => (
                r.run_length,
                r.packet_status_symbol != SymbolTypeTcc::PacketNotReceived,
            ),
            _ => panic!("expected run-length chunks"),
        })
        .collect();
    assert_eq!(runs, vec![(2, true), (1, false), (1, true)]);

    // Drained; the feedback counter advances.
    assert!(!twcc.has_pending());
    twcc.record(14, now + Duration::from_millis(20));
    let fb = twcc.build_feedback(0xaaaa, 0xbbbb).expect("feedback");
    assert_eq!(fb.fb_pkt_count, 1);
}

#[test]
fn test_twcc_wrap() {
    let now = Instant::now();
    let mut twcc = TwccState::default();
    twcc.record(65535, now);
    twcc.record(0, now);
    assert_eq!(twcc.cycles, 1);
    assert_eq!(twcc.last_seq, 1 << 16);
}

#[test]
fn test_stream_ssrc_classification() {
    let mut stream = Stream::new(64);
    stream.audio_ssrc_peer = 1;
    stream.video_ssrc_peer = [10, 20, 30];
    stream.video_ssrc_peer_rtx = [11, 21, 31];

    assert_eq!(stream.classify_ssrc(1), SsrcClass::Audio);
    assert_eq!(stream.classify_ssrc(20), SsrcClass::Video(1));
    assert_eq!(stream.classify_ssrc(31), SsrcClass::VideoRtx(2));
    assert_eq!(stream.classify_ssrc(99), SsrcClass::Unknown);

    // Zero never matches anything.
    stream.audio_ssrc_peer = 0;
    assert_eq!(stream.classify_ssrc(0), SsrcClass::Unknown);
}
