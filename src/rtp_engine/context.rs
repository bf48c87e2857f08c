use crate::config::SkewTunables;

const AUDIO_KHZ: i64 = 48;
const VIDEO_KHZ: i64 = 90;
const DEFAULT_AUDIO_STEP: u32 = 960;
const DEFAULT_VIDEO_STEP: u32 = 4500;
const EVALUATION_INTERVAL_US: i64 = 1_000_000;

/// Per-kind rewrite state: keeps outbound sequence numbers and timestamps
/// coherent across SSRC changes and clock skew.
#[derive(Debug, Default, Clone, Copy)]
struct KindContext {
    last_ssrc: u32,
    last_ts: u32,
    base_ts: u32,
    base_ts_prev: u32,
    prev_ts: u32,
    target_ts: u32,
    start_ts: u32,
    last_seq: u16,
    prev_seq: u16,
    base_seq: u16,
    base_seq_prev: u16,
    seq_reset: bool,
    new_ssrc: bool,
    started: bool,
    skew_ssrc: u32,
    seq_offset: i16,
    ts_offset: i32,
    active_delay: i64,
    prev_delay: i64,
    last_time: i64,
    reference_time: i64,
    start_time: i64,
}

impl KindContext {
    fn update(&mut self, header: &mut rtp::header::Header, step: u32) {
        let ssrc = header.ssrc;
        let timestamp = header.timestamp;
        let seq = header.sequence_number;

        if !self.started {
            self.started = true;
            self.last_ssrc = ssrc;
            self.base_ts = timestamp;
            self.base_ts_prev = timestamp;
            self.last_ts = timestamp;
            self.base_seq = seq;
            self.base_seq_prev = seq.wrapping_sub(1);
            self.last_seq = seq.wrapping_sub(1);
        } else if ssrc != self.last_ssrc {
            // Source switched: rebase on the last emitted values plus the
            // synthesized timestamp step so the stream stays monotonic.
            self.last_ssrc = ssrc;
            self.new_ssrc = true;
            self.base_ts_prev = self.last_ts.wrapping_add(step);
            self.base_ts = timestamp;
            self.base_seq_prev = self.last_seq;
            self.base_seq = seq;
        }
        if self.seq_reset {
            self.seq_reset = false;
            self.base_seq_prev = self.last_seq;
            self.base_seq = seq;
        }

        self.prev_ts = self.last_ts;
        self.last_ts = timestamp
            .wrapping_sub(self.base_ts)
            .wrapping_add(self.base_ts_prev);
        self.prev_seq = self.last_seq;
        self.last_seq = seq
            .wrapping_sub(self.base_seq)
            .wrapping_add(self.base_seq_prev)
            .wrapping_add(1);

        header.timestamp = self.last_ts;
        header.sequence_number = self.last_seq;
    }

    fn reset_skew(&mut self, now: i64) {
        self.reference_time = now;
        self.start_time = 0;
        self.start_ts = 0;
        self.active_delay = 0;
        self.prev_delay = 0;
        self.seq_offset = 0;
        self.ts_offset = 0;
        self.target_ts = 0;
        self.last_time = 0;
    }

    fn skew_compensate(
        &mut self,
        header: &mut rtp::header::Header,
        khz: i64,
        threshold_ms: i64,
        warmup_us: i64,
        now: i64,
    ) -> i32 {
        if self.reference_time == 0 {
            self.reference_time = now;
        }

        let ts = header.timestamp;
        let seq = header.sequence_number;

        // Still burning through a previously computed catch-up point:
        // every packet below the target gets dropped by the caller.
        if self.target_ts != 0 && (self.target_ts.wrapping_sub(ts) as i32) > 0 {
            self.seq_offset = self.seq_offset.wrapping_sub(1);
            header.timestamp = ts.wrapping_add(self.ts_offset as u32);
            header.sequence_number = seq.wrapping_add(self.seq_offset as u16);
            return -1;
        }
        self.target_ts = 0;

        if self.start_time == 0 {
            self.start_time = now;
            self.start_ts = ts;
            self.last_time = now;
        }

        let mut status = 0i32;
        if now - self.last_time >= EVALUATION_INTERVAL_US && now - self.start_time >= warmup_us {
            self.last_time = now;

            let expected = (now - self.start_time) * khz / 1000;
            let actual = ts.wrapping_sub(self.start_ts) as i64;
            let delay_ms = (actual + self.ts_offset as i64 - expected) / khz;

            self.prev_delay = self.active_delay;
            self.active_delay = delay_ms;

            if delay_ms >= threshold_ms {
                // The source is producing media faster than real time:
                // shrink the emitted timeline and have the caller drop
                // packets until the stream catches up.
                let excess_ts = (delay_ms * khz) as i32;
                self.ts_offset -= excess_ts;
                self.target_ts = ts.wrapping_add(excess_ts as u32);
                self.seq_offset = self.seq_offset.wrapping_sub(1);
                header.timestamp = ts.wrapping_add(self.ts_offset as u32);
                header.sequence_number = seq.wrapping_add(self.seq_offset as u16);
                return -1;
            } else if delay_ms <= -threshold_ms {
                // The source is starving: open a one-packet gap.
                let missing_ts = (-delay_ms * khz) as i32;
                self.ts_offset += missing_ts;
                self.seq_offset = self.seq_offset.wrapping_add(1);
                status = 1;
            }
        }

        header.timestamp = ts.wrapping_add(self.ts_offset as u32);
        header.sequence_number = seq.wrapping_add(self.seq_offset as u16);
        status
    }
}

/// RTP switching context: one audio and one video rewrite state, mutated
/// on every relayed packet.
#[derive(Debug, Default, Clone, Copy)]
pub struct SwitchingContext {
    audio: KindContext,
    video: KindContext,
}

impl SwitchingContext {
    pub fn new() -> Self {
        SwitchingContext::default()
    }

    pub fn reset(&mut self) {
        *self = SwitchingContext::default();
    }

    /// Flags a sequence discontinuity (e.g. the plugin paused the
    /// source); the next packet rebases the sequence counter.
    pub fn seq_reset(&mut self, video: bool) {
        let ctx = if video { &mut self.video } else { &mut self.audio };
        ctx.seq_reset = true;
    }

    pub fn last_seq(&self, video: bool) -> u16 {
        if video {
            self.video.last_seq
        } else {
            self.audio.last_seq
        }
    }

    pub fn last_ts(&self, video: bool) -> u32 {
        if video {
            self.video.last_ts
        } else {
            self.audio.last_ts
        }
    }

    /// Rewrites the header so seq/ts stay coherent across source
    /// substitutions; `step` is the timestamp gap synthesized at a
    /// switch (0 picks the kind default).
    pub fn update_header(&mut self, header: &mut rtp::header::Header, video: bool, step: u32) {
        let (ctx, default_step) = if video {
            (&mut self.video, DEFAULT_VIDEO_STEP)
        } else {
            (&mut self.audio, DEFAULT_AUDIO_STEP)
        };
        let step = if step == 0 { default_step } else { step };
        ctx.update(header, step);
    }

    /// Compensates clock skew on an inbound stream. Returns 0 when no
    /// action is needed, -N when the caller must drop this packet to
    /// re-align (N packets dropped so far in this correction), +N when a
    /// sequence jump of N was synthesized.
    pub fn skew_compensate(
        &mut self,
        header: &mut rtp::header::Header,
        video: bool,
        now_us: i64,
        tunables: &SkewTunables,
    ) -> i32 {
        let (ctx, khz, threshold) = if video {
            (&mut self.video, VIDEO_KHZ, tunables.video_threshold_ms)
        } else {
            (&mut self.audio, AUDIO_KHZ, tunables.audio_threshold_ms)
        };
        if ctx.new_ssrc || ctx.skew_ssrc != header.ssrc {
            ctx.reset_skew(now_us);
            ctx.new_ssrc = false;
            ctx.skew_ssrc = header.ssrc;
        }
        ctx.skew_compensate(
            header,
            khz,
            threshold,
            tunables.warmup.as_micros() as i64,
            now_us,
        )
    }
}
