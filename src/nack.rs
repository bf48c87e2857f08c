
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const UINT16SIZE_HALF: u16 = 1 << 15;

/// Upper bound on the received-sequence window length.
pub const LAST_SEQS_MAX_LEN: usize = 160;

/// Lifecycle of a tracked sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqState {
    /// A gap was observed but the packet may still arrive in time.
    Missing,
    /// A NACK went out for this sequence.
    Nacked,
    /// Too old, not worth retransmitting any more.
    GiveUp,
    /// Arrived.
    Recved,
}

#[derive(Debug, Clone, Copy)]
pub struct SeqInfo {
    pub seq: u16,
    pub created: Instant,
    pub state: SeqState,
}

/// Received-sequence window backing NACK generation: a bounded deque in
/// receive order, trimmed from the front, with no duplicate sequences.
#[derive(Debug, Default)]
pub struct SeqWindow {
    infos: VecDeque<SeqInfo>,
    started: bool,
    last: u16,
}

impl SeqWindow {
    pub fn new() -> Self {
        SeqWindow::default()
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SeqInfo> {
        self.infos.iter()
    }

    /// Registers an arrival. New highest sequences append gap entries in
    /// Missing state for everything skipped; lower ones fill their gap
    /// entry if it is still tracked.
    pub fn update(&mut self, seq: u16, now: Instant) {
        if !self.started {
            self.started = true;
            self.last = seq;
            self.push(SeqInfo {
                seq,
                created: now,
                state: SeqState::Recved,
            });
            return;
        }

        let diff = seq.wrapping_sub(self.last);
        if diff == 0 {
            return;
        }
        if diff < UINT16SIZE_HALF {
            let mut missing = self.last.wrapping_add(1);
            while missing != seq {
                self.push(SeqInfo {
                    seq: missing,
                    created: now,
                    state: SeqState::Missing,
                });
                missing = missing.wrapping_add(1);
            }
            self.push(SeqInfo {
                seq,
                created: now,
                state: SeqState::Recved,
            });
            self.last = seq;
        } else if let Some(info) = self.infos.iter_mut().find(|i| i.seq == seq) {
            // Late arrival or retransmission of a tracked gap.
            if info.state != SeqState::Recved {
                info.state = SeqState::Recved;
            }
        }
    }

    /// Scans the window: Missing entries older than `hold` move to Nacked
    /// and are returned for a compound NACK; Nacked entries older than
    /// `give_up` move to GiveUp.
    pub fn nacks_due(&mut self, now: Instant, hold: Duration, give_up: Duration) -> Vec<u16> {
        let mut nacks = vec![];
        for info in self.infos.iter_mut() {
            let age = now.saturating_duration_since(info.created);
            match info.state {
                SeqState::Missing if age >= give_up => {
                    info.state = SeqState::GiveUp;
                }
                SeqState::Missing if age >= hold => {
                    info.state = SeqState::Nacked;
                    nacks.push(info.seq);
                }
                SeqState::Nacked if age >= give_up => {
                    info.state = SeqState::GiveUp;
                }
                _ => {}
            }
        }
        nacks
    }

    fn push(&mut self, info: SeqInfo) {
        self.infos.push_back(info);
        while self.infos.len() > LAST_SEQS_MAX_LEN {
            self.infos.pop_front();
        }
    }
}

/// One buffered outgoing packet, kept around for NACK-triggered
/// retransmission.
#[derive(Debug, Clone)]
pub struct RtxEntry {
    pub packet: rtp::packet::Packet,
    pub created: Instant,
    pub last_retransmit: Option<Instant>,
}

/// Fixed-capacity retransmit buffer indexed by sequence number: a
/// power-of-two ring, O(1) lookup, oldest entries overwritten in FIFO
/// order as the sequence counter advances.
pub struct RetransmitQueue {
    entries: Vec<Option<RtxEntry>>,
    size: u16,
    limit: u16,
    last_added: u16,
    started: bool,
}

impl RetransmitQueue {
    /// Holds at most `capacity` packets; the backing ring is the next
    /// power of two (minimum 8, maximum 32768) so sequence lookups stay
    /// unambiguous across wrap-around.
    pub fn new(capacity: usize) -> Self {
        let limit = capacity.clamp(8, 1 << 15);
        let ring = limit.next_power_of_two();
        RetransmitQueue {
            entries: vec![None; ring],
            size: ring as u16,
            limit: limit as u16,
            last_added: 0,
            started: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.limit as usize
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_none())
    }

    pub fn push(&mut self, packet: rtp::packet::Packet, now: Instant) {
        let seq = packet.header.sequence_number;
        let entry = RtxEntry {
            packet,
            created: now,
            last_retransmit: None,
        };
        if !self.started {
            self.started = true;
            self.entries[(seq % self.size) as usize] = Some(entry);
            self.last_added = seq;
            return;
        }

        let diff = seq.wrapping_sub(self.last_added);
        if diff == 0 {
            return;
        }
        if diff < UINT16SIZE_HALF {
            // Clear skipped slots so stale packets from a full lap ago
            // can never answer a NACK for a newer sequence.
            let mut i = self.last_added.wrapping_add(1);
            while i != seq {
                self.entries[(i % self.size) as usize] = None;
                if self.limit != self.size {
                    self.entries[(i.wrapping_sub(self.limit) % self.size) as usize] = None;
                }
                i = i.wrapping_add(1);
            }
            self.last_added = seq;
            if self.limit != self.size {
                // Evict the packet that fell out of the FIFO bound.
                self.entries[(seq.wrapping_sub(self.limit) % self.size) as usize] = None;
            }
        }
        self.entries[(seq % self.size) as usize] = Some(entry);
    }

    pub fn get(&self, seq: u16) -> Option<&RtxEntry> {
        let diff = self.last_added.wrapping_sub(seq);
        if diff >= UINT16SIZE_HALF || diff >= self.limit {
            return None;
        }
        self.entries[(seq % self.size) as usize]
            .as_ref()
            .filter(|e| e.packet.header.sequence_number == seq)
    }

    /// Looks up a NACKed sequence; debounced so a sequence is resent at
    /// most once per `min_interval`.
    pub fn get_for_retransmit(
        &mut self,
        seq: u16,
        now: Instant,
        min_interval: Duration,
    ) -> Option<rtp::packet::Packet> {
        let diff = self.last_added.wrapping_sub(seq);
        if diff >= UINT16SIZE_HALF || diff >= self.limit {
            return None;
        }
        let entry = self.entries[(seq % self.size) as usize]
            .as_mut()
            .filter(|e| e.packet.header.sequence_number == seq)?;
        if let Some(last) = entry.last_retransmit {
            if now.saturating_duration_since(last) < min_interval {
                return None;
            }
        }
        entry.last_retransmit = Some(now);
        Some(entry.packet.clone())
    }

    /// Drops entries past the NACK deadline.
    pub fn purge_older_than(&mut self, now: Instant, max_age: Duration) {
        for slot in self.entries.iter_mut() {
            if let Some(entry) = slot {
                if now.saturating_duration_since(entry.created) > max_age {
                    *slot = None;
                }
            }
        }
    }

    pub fn clear(&mut self) {
        for slot in self.entries.iter_mut() {
            *slot = None;
        }
        self.started = false;
    }
}
