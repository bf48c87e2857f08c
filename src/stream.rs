#[cfg(test)]
mod stream_test;

use std::collections::HashMap;
use std::time::Instant;

use rtcp::transport_feedbacks::transport_layer_cc::{
    PacketStatusChunk, RecvDelta, RunLengthChunk, StatusChunkTypeTcc, SymbolTypeTcc,
    TransportLayerCc,
};

use crate::component::Component;
use crate::dtls_srtp::DtlsRole;
use crate::rtp_engine::context::SwitchingContext;
use crate::rtp_engine::KeyframeClassifier;

/// RTCP reception context per RFC 3550 appendix A: highest sequence with
/// wrap cycles, interarrival jitter, packet/byte counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcpContext {
    clock_rate: u32,
    started: bool,
    base_seq: u16,
    max_seq: u16,
    pub cycles: u16,
    pub received: u32,
    pub received_bytes: u64,
    transit: i64,
    jitter: f64,
    expected_prior: u32,
    received_prior: u32,
}

impl RtcpContext {
    pub fn new(clock_rate: u32) -> Self {
        RtcpContext {
            clock_rate,
            ..Default::default()
        }
    }

    pub fn update(&mut self, seq: u16, rtp_ts: u32, payload_len: usize, now: Instant, epoch: Instant) {
        if !self.started {
            self.started = true;
            self.base_seq = seq;
            self.max_seq = seq;
        } else {
            let diff = seq.wrapping_sub(self.max_seq);
            if diff != 0 && diff < 1 << 15 {
                if seq < self.max_seq {
                    self.cycles = self.cycles.wrapping_add(1);
                }
                self.max_seq = seq;
            }
        }
        self.received += 1;
        self.received_bytes += payload_len as u64;

        // Interarrival jitter, in timestamp units.
        if self.clock_rate > 0 {
            let arrival = now.saturating_duration_since(epoch).as_secs_f64() * self.clock_rate as f64;
            let transit = arrival as i64 - rtp_ts as i64;
            if self.transit != 0 {
                let d = (transit - self.transit).abs() as f64;
                self.jitter += (d - self.jitter) / 16.0;
            }
            self.transit = transit;
        }
    }

    pub fn highest_seq(&self) -> u32 {
        ((self.cycles as u32) << 16) | self.max_seq as u32
    }

    pub fn expected(&self) -> u32 {
        self.highest_seq()
            .wrapping_sub(self.base_seq as u32)
            .wrapping_add(1)
    }

    pub fn lost(&self) -> i64 {
        self.expected() as i64 - self.received as i64
    }

    /// Fraction of packets lost since the previous call, as the 8-bit
    /// fixed-point value reception reports carry.
    pub fn fraction_lost(&mut self) -> u8 {
        let expected = self.expected();
        let expected_interval = expected.wrapping_sub(self.expected_prior);
        let received_interval = self.received.wrapping_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.received;
        let lost_interval = expected_interval as i64 - received_interval as i64;
        if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval as i64) as u8
        }
    }

    pub fn jitter(&self) -> u32 {
        self.jitter as u32
    }
}

/// Transport-wide congestion control bookkeeping for the peer's video.
#[derive(Debug, Default)]
pub struct TwccState {
    pub enabled: bool,
    pub ext_id: u8,
    pub last_seq: u32,
    pub cycles: u16,
    pub feedback_count: u8,
    started: bool,
    /// (extended seq, arrival) pairs waiting for the next feedback.
    pending: Vec<(u32, Instant)>,
}

impl TwccState {
    /// Registers an inbound transport-wide sequence number.
    pub fn record(&mut self, seq: u16, now: Instant) {
        let last16 = (self.last_seq & 0xffff) as u16;
        if self.started && seq < last16 && last16.wrapping_sub(seq) > (1 << 15) {
            // 16-bit wrap of the transport-wide counter.
            self.cycles = self.cycles.wrapping_add(1);
        }
        self.started = true;
        let extended = ((self.cycles as u32) << 16) | seq as u32;
        if extended > self.last_seq {
            self.last_seq = extended;
        }
        self.pending.push((extended, now));
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drains the pending list into a transport-cc feedback packet.
    pub fn build_feedback(&mut self, sender_ssrc: u32, media_ssrc: u32) -> Option<TransportLayerCc> {
        if self.pending.is_empty() {
            return None;
        }
        let mut pending = std::mem::take(&mut self.pending);
        pending.sort_by_key(|(seq, _)| *seq);
        pending.dedup_by_key(|(seq, _)| *seq);

        let base_seq = pending[0].0;
        let last_seq = pending[pending.len() - 1].0;
        let status_count = (last_seq - base_seq + 1).min(0xffff) as u16;
        let first_arrival = pending[0].1;

        let mut chunks = vec![];
        let mut deltas = vec![];
        let mut prev_arrival = first_arrival;
        let mut run_symbol: Option<SymbolTypeTcc> = None;
        let mut run_length = 0u16;
        let mut iter = pending.iter().peekable();

        let mut flush =
            |chunks: &mut Vec<PacketStatusChunk>, symbol: SymbolTypeTcc, length: u16| {
                if length > 0 {
                    chunks.push(PacketStatusChunk::RunLengthChunk(RunLengthChunk {
                        type_tcc: StatusChunkTypeTcc::RunLengthChunk,
                        packet_status_symbol: symbol,
                        run_length: length,
                    }));
                }
            };

        for seq in base_seq..=last_seq {
            let symbol = match iter.peek() {
                Some((s, arrival)) if *s == seq => {
                    let delta_us = arrival.saturating_duration_since(prev_arrival).as_micros() as i64;
                    prev_arrival = *arrival;
                    let symbol = if delta_us / 250 <= u8::MAX as i64 {
                        SymbolTypeTcc::PacketReceivedSmallDelta
                    } else {
                        SymbolTypeTcc::PacketReceivedLargeDelta
                    };
                    deltas.push(RecvDelta {
                        type_tcc_packet: symbol,
                        delta: delta_us,
                    });
                    iter.next();
                    symbol
                }
                _ => SymbolTypeTcc::PacketNotReceived,
            };
            match run_symbol {
                Some(current) if current == symbol => run_length += 1,
                Some(current) => {
                    flush(&mut chunks, current, run_length);
                    run_symbol = Some(symbol);
                    run_length = 1;
                }
                None => {
                    run_symbol = Some(symbol);
                    run_length = 1;
                }
            }
        }
        if let Some(current) = run_symbol {
            flush(&mut chunks, current, run_length);
        }

        let feedback = TransportLayerCc {
            sender_ssrc,
            media_ssrc,
            base_sequence_number: (base_seq & 0xffff) as u16,
            packet_status_count: status_count,
            reference_time: 0,
            fb_pkt_count: self.feedback_count,
            packet_chunks: chunks,
            recv_deltas: deltas,
        };
        self.feedback_count = self.feedback_count.wrapping_add(1);
        Some(feedback)
    }
}

/// Which inbound stream an SSRC belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsrcClass {
    Audio,
    Video(usize),
    VideoRtx(usize),
    Unknown,
}

/// Per-handle media state: one bundled stream carrying audio, up to
/// three simulcast video layers and their RTX companions.
pub struct Stream {
    /// SSRCs the gateway sends with.
    pub audio_ssrc: u32,
    pub video_ssrc: u32,
    pub video_ssrc_rtx: u32,
    /// SSRCs the peer announced.
    pub audio_ssrc_peer: u32,
    pub video_ssrc_peer: [u32; 3],
    pub video_ssrc_peer_rtx: [u32; 3],
    /// RTP stream IDs, when simulcast is signalled through RIDs.
    pub rid: [Option<String>; 3],
    pub rid_ext_id: Option<u8>,
    /// Media IDs, taken from the remote description when answering.
    pub audio_mid: String,
    pub video_mid: String,
    pub data_mid: String,
    pub audio_codec: Option<String>,
    pub video_codec: Option<String>,
    pub audio_payload_type: Option<u8>,
    pub video_payload_type: Option<u8>,
    pub video_rtx_payload_type: Option<u8>,
    /// rtx payload type -> media payload type.
    pub rtx_payload_types: HashMap<u8, u8>,
    pub video_is_keyframe: Option<KeyframeClassifier>,
    pub audio_send: bool,
    pub audio_recv: bool,
    pub video_send: bool,
    pub video_recv: bool,
    pub audio_rtcp_ctx: RtcpContext,
    pub video_rtcp_ctx: [RtcpContext; 3],
    /// A/V sync baseline: wallclock + RTP timestamp of the first packet.
    pub audio_first_ntp: Option<(Instant, u32)>,
    pub video_first_ntp: [Option<(Instant, u32)>; 3],
    pub audio_last_ts: u32,
    pub video_last_ts: u32,
    pub twcc: TwccState,
    pub dtls_role: DtlsRole,
    pub remote_hashing: Option<String>,
    pub remote_fingerprint: Option<String>,
    pub ruser: Option<String>,
    pub rpass: Option<String>,
    /// Outbound rewrite state.
    pub rtp_ctx: SwitchingContext,
    /// Inbound skew compensation state.
    pub skew_ctx: SwitchingContext,
    pub component: Component,
}

impl Stream {
    pub fn new(max_nack_queue: usize) -> Self {
        Stream {
            audio_ssrc: rand::random::<u32>(),
            video_ssrc: rand::random::<u32>(),
            video_ssrc_rtx: rand::random::<u32>(),
            audio_ssrc_peer: 0,
            video_ssrc_peer: [0; 3],
            video_ssrc_peer_rtx: [0; 3],
            rid: [None, None, None],
            rid_ext_id: None,
            audio_mid: "audio".to_owned(),
            video_mid: "video".to_owned(),
            data_mid: "data".to_owned(),
            audio_codec: None,
            video_codec: None,
            audio_payload_type: None,
            video_payload_type: None,
            video_rtx_payload_type: None,
            rtx_payload_types: HashMap::new(),
            video_is_keyframe: None,
            audio_send: false,
            audio_recv: false,
            video_send: false,
            video_recv: false,
            audio_rtcp_ctx: RtcpContext::new(48_000),
            video_rtcp_ctx: [RtcpContext::new(90_000); 3],
            audio_first_ntp: None,
            video_first_ntp: [None; 3],
            audio_last_ts: 0,
            video_last_ts: 0,
            twcc: TwccState::default(),
            dtls_role: DtlsRole::default(),
            remote_hashing: None,
            remote_fingerprint: None,
            ruser: None,
            rpass: None,
            rtp_ctx: SwitchingContext::new(),
            skew_ctx: SwitchingContext::new(),
            component: Component::new(max_nack_queue),
        }
    }

    /// Classifies an inbound SSRC against what the remote SDP declared.
    pub fn classify_ssrc(&self, ssrc: u32) -> SsrcClass {
        if ssrc != 0 && ssrc == self.audio_ssrc_peer {
            return SsrcClass::Audio;
        }
        for (layer, &s) in self.video_ssrc_peer.iter().enumerate() {
            if ssrc != 0 && s == ssrc {
                return SsrcClass::Video(layer);
            }
        }
        for (layer, &s) in self.video_ssrc_peer_rtx.iter().enumerate() {
            if ssrc != 0 && s == ssrc {
                return SsrcClass::VideoRtx(layer);
            }
        }
        SsrcClass::Unknown
    }

    /// Learns the video layer of an unknown SSRC from its RID extension;
    /// used when simulcast is negotiated through `a=rid`/`a=simulcast`
    /// instead of `a=ssrc-group:SIM`.
    pub fn learn_ssrc_from_rid(&mut self, ssrc: u32, rid: &str) -> Option<usize> {
        let layer = self
            .rid
            .iter()
            .position(|r| r.as_deref() == Some(rid))?;
        if self.video_ssrc_peer[layer] == 0 {
            self.video_ssrc_peer[layer] = ssrc;
        }
        Some(layer)
    }

    /// Maps an RTX payload type back to the media one.
    pub fn media_payload_type(&self, rtx_pt: u8) -> Option<u8> {
        self.rtx_payload_types.get(&rtx_pt).copied()
    }

    pub fn rtcp_ctx_mut(&mut self, class: SsrcClass) -> Option<&mut RtcpContext> {
        match class {
            SsrcClass::Audio => Some(&mut self.audio_rtcp_ctx),
            SsrcClass::Video(layer) | SsrcClass::VideoRtx(layer) => {
                Some(&mut self.video_rtcp_ctx[layer.min(2)])
            }
            SsrcClass::Unknown => None,
        }
    }
}
