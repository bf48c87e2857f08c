#[cfg(test)]
mod stats_test;

use std::time::{Duration, Instant};

use crate::config::SlowLinkTunables;

/// Rolling counters for one direction of one media kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatsInfo {
    pub packets: u64,
    pub bytes: u64,
    pub bytes_lastsec: u64,
    bytes_lastsec_temp: u64,
    pub nacks: u32,
    pub updated: Option<Instant>,
}

impl StatsInfo {
    pub fn add_packet(&mut self, bytes: usize, now: Instant) {
        self.packets += 1;
        self.bytes += bytes as u64;
        match self.updated {
            Some(updated) if now.saturating_duration_since(updated) < Duration::from_secs(1) => {
                self.bytes_lastsec_temp += bytes as u64;
            }
            _ => {
                self.bytes_lastsec = self.bytes_lastsec_temp + bytes as u64;
                self.bytes_lastsec_temp = 0;
                self.updated = Some(now);
            }
        }
    }

    pub fn add_nacks(&mut self, count: u32) {
        self.nacks += count;
    }
}

/// Counters for one direction: audio, up to three simulcast video
/// layers, and data.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectionStats {
    pub audio: StatsInfo,
    pub video: [StatsInfo; 3],
    pub data: StatsInfo,
}

impl DirectionStats {
    pub fn info_mut(&mut self, video: bool, layer: usize) -> &mut StatsInfo {
        if video {
            &mut self.video[layer.min(2)]
        } else {
            &mut self.audio
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.audio.bytes
            + self.video.iter().map(|v| v.bytes).sum::<u64>()
            + self.data.bytes
    }

    pub fn last_activity(&self) -> Option<Instant> {
        [self.audio.updated, self.data.updated]
            .into_iter()
            .chain(self.video.iter().map(|v| v.updated))
            .flatten()
            .max()
    }
}

/// Rolling NACK window deciding when to warn the plugin that a link is
/// slow; at most one notification per direction per minimum interval.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlowLinkState {
    window_start: Option<Instant>,
    recent_nacks: u32,
    last_notified: Option<Instant>,
}

impl SlowLinkState {
    /// Feeds `count` NACKs into the rolling window; returns true when a
    /// slow_link notification must fire.
    pub fn register_nacks(
        &mut self,
        count: u32,
        now: Instant,
        tunables: &SlowLinkTunables,
    ) -> bool {
        match self.window_start {
            Some(start) if now.saturating_duration_since(start) <= tunables.window => {
                self.recent_nacks += count;
            }
            _ => {
                self.window_start = Some(now);
                self.recent_nacks = count;
            }
        }

        if self.recent_nacks < tunables.nack_threshold {
            return false;
        }
        if let Some(last) = self.last_notified {
            if now.saturating_duration_since(last) < tunables.min_interval {
                return false;
            }
        }
        self.last_notified = Some(now);
        self.window_start = None;
        self.recent_nacks = 0;
        true
    }
}
