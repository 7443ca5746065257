//! Offer/answer bookkeeping for one call session.
//!
//! This holds the negotiation state only. The call manager performs the
//! peer-connection I/O and consults this struct to decide what to apply,
//! what to buffer and when to give up.

use std::collections::VecDeque;

use super::peer::{IceCandidate, SessionDescription};

#[derive(Debug, Default)]
pub(crate) struct Negotiation {
    /// Candidates received before the remote description, in arrival order.
    pending_candidates: VecDeque<IceCandidate>,
    /// Offer received by the receiver before it accepted.
    buffered_offer: Option<SessionDescription>,
    /// Last offer we created, kept for the single re-send.
    local_offer: Option<SessionDescription>,
    remote_description_set: bool,
    /// An offer is out and its answer has not been applied yet.
    awaiting_answer: bool,
    ice_restart_attempt: u32,
}

impl Negotiation {
    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn mark_remote_description_set(&mut self) {
        self.remote_description_set = true;
    }

    /// Queue a candidate that cannot be applied yet. Returns false for
    /// end-of-candidates markers, which are dropped.
    pub fn buffer_candidate(&mut self, candidate: IceCandidate) -> bool {
        if candidate.is_end_of_candidates() {
            return false;
        }
        self.pending_candidates.push_back(candidate);
        true
    }

    /// Hand out every buffered candidate in arrival order.
    pub fn take_pending_candidates(&mut self) -> Vec<IceCandidate> {
        self.pending_candidates.drain(..).collect()
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Keep an early offer until the receiver accepts. A newer offer
    /// replaces an older one.
    pub fn buffer_offer(&mut self, offer: SessionDescription) -> bool {
        self.buffered_offer.replace(offer).is_some()
    }

    pub fn take_buffered_offer(&mut self) -> Option<SessionDescription> {
        self.buffered_offer.take()
    }

    pub fn record_local_offer(&mut self, offer: SessionDescription) {
        self.local_offer = Some(offer);
        self.awaiting_answer = true;
    }

    pub fn local_offer(&self) -> Option<&SessionDescription> {
        self.local_offer.as_ref()
    }

    pub fn awaiting_answer(&self) -> bool {
        self.awaiting_answer
    }

    pub fn answer_applied(&mut self) {
        self.awaiting_answer = false;
        self.remote_description_set = true;
    }

    pub fn ice_restart_attempt(&self) -> u32 {
        self.ice_restart_attempt
    }

    /// Claim the next ICE restart attempt, or `None` once `max` attempts
    /// have been spent.
    pub fn next_restart_attempt(&mut self, max: u32) -> Option<u32> {
        if self.ice_restart_attempt >= max {
            return None;
        }
        self.ice_restart_attempt += 1;
        Some(self.ice_restart_attempt)
    }

    /// The link came up; restart attempts are counted consecutively.
    pub fn reset_restarts(&mut self) {
        self.ice_restart_attempt = 0;
    }

    pub fn clear(&mut self) {
        self.pending_candidates.clear();
        self.buffered_offer = None;
        self.local_offer = None;
        self.awaiting_answer = false;
    }
}
