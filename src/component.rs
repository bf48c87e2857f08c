use std::time::Instant;

use ice::state::ConnectionState;

use crate::nack::{RetransmitQueue, SeqWindow};
use crate::stats::{DirectionStats, SlowLinkState};

/// The single ICE component left after bundling: connectivity state,
/// candidates, retransmission buffers, sequence windows and counters.
pub struct Component {
    pub state: ConnectionState,
    pub connected_at: Option<Instant>,
    /// Structured local candidates, as gathered.
    pub local_candidates: Vec<String>,
    /// Remote candidates as signalled (kept as strings for debugging).
    pub remote_candidates: Vec<String>,
    pub selected_pair: Option<String>,
    /// When ICE first reported failure; hangup fires once the grace
    /// period expires without a recovery.
    pub failed_detected: Option<Instant>,
    pub do_audio_nacks: bool,
    pub do_video_nacks: bool,
    pub audio_retransmit: RetransmitQueue,
    pub video_retransmit: RetransmitQueue,
    /// Current sequence number of the RFC 4588 rtx stream.
    pub rtx_seq_number: u16,
    pub retransmit_recent_cnt: u32,
    pub nack_sent_recent_cnt: u32,
    pub last_seqs_audio: SeqWindow,
    pub last_seqs_video: [SeqWindow; 3],
    pub in_stats: DirectionStats,
    pub out_stats: DirectionStats,
    pub slowlink_in: [SlowLinkState; 2],
    pub slowlink_out: [SlowLinkState; 2],
}

impl Component {
    pub fn new(max_nack_queue: usize) -> Self {
        Component {
            state: ConnectionState::New,
            connected_at: None,
            local_candidates: vec![],
            remote_candidates: vec![],
            selected_pair: None,
            failed_detected: None,
            do_audio_nacks: false,
            do_video_nacks: false,
            audio_retransmit: RetransmitQueue::new(max_nack_queue),
            video_retransmit: RetransmitQueue::new(max_nack_queue),
            rtx_seq_number: u16::MAX,
            retransmit_recent_cnt: 0,
            nack_sent_recent_cnt: 0,
            last_seqs_audio: SeqWindow::new(),
            last_seqs_video: [SeqWindow::new(), SeqWindow::new(), SeqWindow::new()],
            in_stats: DirectionStats::default(),
            out_stats: DirectionStats::default(),
            slowlink_in: [SlowLinkState::default(); 2],
            slowlink_out: [SlowLinkState::default(); 2],
        }
    }

    pub fn retransmit_queue_mut(&mut self, video: bool) -> &mut RetransmitQueue {
        if video {
            &mut self.video_retransmit
        } else {
            &mut self.audio_retransmit
        }
    }

    pub fn seq_window_mut(&mut self, video: bool, layer: usize) -> &mut SeqWindow {
        if video {
            &mut self.last_seqs_video[layer.min(2)]
        } else {
            &mut self.last_seqs_audio
        }
    }

    pub fn nacks_enabled(&self, video: bool) -> bool {
        if video {
            self.do_video_nacks
        } else {
            self.do_audio_nacks
        }
    }

    /// Next sequence number on the rtx stream.
    pub fn next_rtx_seq(&mut self) -> u16 {
        self.rtx_seq_number = self.rtx_seq_number.wrapping_add(1);
        self.rtx_seq_number
    }

    pub fn clear_buffers(&mut self) {
        self.audio_retransmit.clear();
        self.video_retransmit.clear();
    }
}
