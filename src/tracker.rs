//! In-flight URB bookkeeping for one connection.
//!
//! The tracker is owned by the connection task; nothing here is shared
//! across tasks. Completions for seqnums that were already taken or
//! drained are discarded by the owner (a `take` miss), never delivered
//! twice.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::backend::{Direction, TransferKind};

#[derive(Debug, Clone)]
pub struct InFlightUrb {
    pub seqnum: u32,
    pub endpoint: u8,
    pub direction: Direction,
    pub kind: TransferKind,
    pub setup: [u8; 8],
    pub requested_length: u32,
    pub submitted_at: Instant,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    /// Marked; the backend cancel should be issued.
    Pending,
    /// No such seqnum in flight; it already completed (or never existed).
    AlreadyCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateSeqnum(pub u32);

#[derive(Default)]
pub struct UrbTracker {
    in_flight: HashMap<u32, InFlightUrb>,
}

impl UrbTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, urb: InFlightUrb) -> Result<(), DuplicateSeqnum> {
        if self.in_flight.contains_key(&urb.seqnum) {
            return Err(DuplicateSeqnum(urb.seqnum));
        }
        self.in_flight.insert(urb.seqnum, urb);
        Ok(())
    }

    /// Remove on completion. A second take for the same seqnum misses.
    pub fn take(&mut self, seqnum: u32) -> Option<InFlightUrb> {
        self.in_flight.remove(&seqnum)
    }

    /// Mark a URB for cancellation without removing it; its completion
    /// (cancelled or otherwise) still flows through `take`.
    pub fn request_cancel(&mut self, seqnum: u32) -> CancelState {
        match self.in_flight.get_mut(&seqnum) {
            Some(urb) => {
                urb.cancel_requested = true;
                CancelState::Pending
            }
            None => CancelState::AlreadyCompleted,
        }
    }

    /// Seqnums older than `deadline` that have not been asked to cancel
    /// yet. Marks them, so a sweep never reports the same URB twice.
    pub fn mark_expired(&mut self, now: Instant, deadline: Duration) -> Vec<u32> {
        let mut expired = Vec::new();
        for urb in self.in_flight.values_mut() {
            if !urb.cancel_requested && now.duration_since(urb.submitted_at) >= deadline {
                urb.cancel_requested = true;
                expired.push(urb.seqnum);
            }
        }
        expired.sort_unstable();
        expired
    }

    /// Empty the tracker for teardown; every drained URB must be
    /// cancelled at the backend by the caller.
    pub fn drain(&mut self) -> Vec<InFlightUrb> {
        let mut urbs: Vec<InFlightUrb> = self.in_flight.drain().map(|(_, u)| u).collect();
        urbs.sort_by_key(|u| u.seqnum);
        urbs
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}
