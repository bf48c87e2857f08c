#[cfg(test)]
mod trickle_test;

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A trickled ICE candidate as carried by the signaling API: either a
/// candidate line with its m-line correlation, or the end-of-candidates
/// marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TrickleCandidate {
    Completed {
        completed: bool,
    },
    Candidate {
        candidate: String,
        #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u32>,
    },
}

impl TrickleCandidate {
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let parsed: TrickleCandidate =
            serde_json::from_value(value.clone()).map_err(|_| Error::ErrTrickleInvalid)?;
        match &parsed {
            TrickleCandidate::Completed { completed } if !*completed => {
                Err(Error::ErrTrickleInvalid)
            }
            _ => Ok(parsed),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TrickleCandidate::Completed { .. })
    }

    /// The raw `candidate:` line, without any `a=` prefix.
    pub fn candidate_line(&self) -> Option<&str> {
        match self {
            TrickleCandidate::Candidate { candidate, .. } => {
                Some(candidate.strip_prefix("candidate:").unwrap_or(candidate))
            }
            TrickleCandidate::Completed { .. } => None,
        }
    }
}

/// A candidate that arrived before the remote description: buffered on
/// the handle and drained, in order, once the offer/answer is applied.
#[derive(Debug, Clone)]
pub struct PendingTrickle {
    pub received: Instant,
    pub transaction: Option<String>,
    pub candidate: TrickleCandidate,
}

impl PendingTrickle {
    pub fn new(transaction: Option<String>, candidate: TrickleCandidate) -> Self {
        PendingTrickle {
            received: Instant::now(),
            transaction,
            candidate,
        }
    }
}
