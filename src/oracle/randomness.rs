//! Randomness oracle client
//!
//! The engine issues one request per session and later receives the random
//! word through `QuizEngine::on_randomness_fulfilled`. `status` lets callers
//! see whether the oracle has produced the value yet.

use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use super::DeliveryQueue;
use crate::error::Result;
use crate::protocol::{short_hex, ParticipantId, RandomWord, RequestId};

/// Fulfillment status of a randomness request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Unknown,
    Pending,
    Fulfilled,
}

pub trait RandomnessOracle: Send + Sync {
    /// Ask for one random word on behalf of `participant`.
    fn request(&self, participant: &ParticipantId) -> Result<RequestId>;

    fn status(&self, request_id: &RequestId) -> RequestStatus;
}

struct LocalState {
    nonce: u64,
    rng: ChaCha20Rng,
    requesters: HashMap<RequestId, ParticipantId>,
    outbox: DeliveryQueue<RandomWord>,
}

impl LocalState {
    fn forget_evicted(&mut self) {
        for id in self.outbox.take_evicted() {
            self.requesters.remove(&id);
        }
    }
}

/// In-process randomness oracle
///
/// Values come from a seeded ChaCha20 stream so simulations replay exactly.
/// The word for a request is drawn once at request time; redeliveries carry
/// the same word. Settled requests are remembered up to the history limit,
/// after which their status reads `Unknown`.
pub struct LocalRandomnessOracle {
    state: Mutex<LocalState>,
}

impl LocalRandomnessOracle {
    const NAMESPACE: &'static [u8] = b"STAKEQUIZ_VRF";

    pub fn from_seed(seed: u64, max_attempts: u32) -> Self {
        let mut seed_bytes = [0u8; 32];
        seed_bytes[..8].copy_from_slice(&seed.to_le_bytes());
        Self {
            state: Mutex::new(LocalState {
                nonce: 0,
                rng: ChaCha20Rng::from_seed(seed_bytes),
                requesters: HashMap::new(),
                outbox: DeliveryQueue::new(max_attempts),
            }),
        }
    }

    /// Fulfillments ready to be delivered to the engine
    pub fn drain_ready(&self) -> Vec<(RequestId, RandomWord)> {
        self.state.lock().outbox.drain_ready()
    }

    pub fn with_history_limit(self, limit: usize) -> Self {
        self.state.lock().outbox.set_history_limit(limit);
        self
    }

    pub fn acknowledge(&self, request_id: &RequestId) {
        let mut state = self.state.lock();
        state.outbox.acknowledge(request_id);
        state.forget_evicted();
    }

    pub fn retry(&self, request_id: &RequestId) -> bool {
        let mut state = self.state.lock();
        let requeued = state.outbox.retry(request_id);
        state.forget_evicted();
        requeued
    }

    pub fn requester(&self, request_id: &RequestId) -> Option<ParticipantId> {
        self.state.lock().requesters.get(request_id).copied()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().outbox.pending()
    }
}

impl RandomnessOracle for LocalRandomnessOracle {
    fn request(&self, participant: &ParticipantId) -> Result<RequestId> {
        let mut state = self.state.lock();
        state.nonce += 1;
        let request_id = RequestId::derive(Self::NAMESPACE, state.nonce);

        let mut word = [0u8; 32];
        state.rng.fill_bytes(&mut word);
        state.requesters.insert(request_id, *participant);
        state.outbox.push(request_id, word);

        debug!(participant = %short_hex(participant), request = %request_id, "randomness requested");
        Ok(request_id)
    }

    fn status(&self, request_id: &RequestId) -> RequestStatus {
        let state = self.state.lock();
        if !state.outbox.contains(request_id) {
            RequestStatus::Unknown
        } else if state.outbox.is_delivered(request_id) {
            RequestStatus::Fulfilled
        } else {
            RequestStatus::Pending
        }
    }
}
