use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SegmentState {
    Pending,
    Downloading,
    Decrypting,
    Done,
    Failed,
}

impl SegmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentState::Pending => "pending",
            SegmentState::Downloading => "downloading",
            SegmentState::Decrypting => "decrypting",
            SegmentState::Done => "done",
            SegmentState::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(SegmentState::Pending),
            "downloading" => Some(SegmentState::Downloading),
            "decrypting" => Some(SegmentState::Decrypting),
            "done" => Some(SegmentState::Done),
            "failed" => Some(SegmentState::Failed),
            _ => None,
        }
    }

    /// A fetch attempt is running for the segment.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, SegmentState::Downloading | SegmentState::Decrypting)
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub state: SegmentState,
    /// Decrypted payload size, set once the segment is done.
    pub bytes: u64,
    /// Operator retries, automatic attempts are not counted.
    pub retries: u32,
    pub last_error: Option<ErrorKind>,
}

impl Segment {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: SegmentState::Pending,
            bytes: 0,
            retries: 0,
            last_error: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == SegmentState::Done
    }

    /// Move to the next stage of an attempt. Refuses anything but the forward
    /// transitions of a single attempt.
    pub fn advance(&mut self, next: SegmentState) -> bool {
        use SegmentState::*;
        let allowed = matches!(
            (self.state, next),
            (Pending, Downloading)
                | (Downloading, Decrypting)
                | (Downloading, Done)
                | (Decrypting, Done)
                // next automatic attempt after a failed decrypt
                | (Decrypting, Downloading)
                | (Downloading, Failed)
                | (Decrypting, Failed)
        );
        if allowed {
            self.state = next;
        }
        allowed
    }

    pub fn complete(&mut self, bytes: u64) -> bool {
        if self.advance(SegmentState::Done) {
            self.bytes = bytes;
            self.last_error = None;
            true
        } else {
            false
        }
    }

    pub fn fail(&mut self, kind: ErrorKind) -> bool {
        if self.advance(SegmentState::Failed) {
            self.last_error = Some(kind);
            true
        } else {
            false
        }
    }

    /// Failed -> Pending. Only an explicit operator retry calls this.
    pub fn reset_for_retry(&mut self) -> bool {
        if self.state != SegmentState::Failed {
            return false;
        }
        self.state = SegmentState::Pending;
        self.retries += 1;
        self.last_error = None;
        self.bytes = 0;
        true
    }
}
