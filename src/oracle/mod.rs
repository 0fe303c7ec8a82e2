//! Oracle collaborators
//!
//! Both oracles follow the same two-part shape: `issue` returns a request id
//! immediately and the result comes back later as an independent call into
//! the engine. Nothing blocks while a request is in flight.
//!
//! - `randomness`: one random word per request, used for topic selection
//! - `compute`: off-chain question generation and answer grading
//! - `relay`: async loop carrying local oracle fulfillments into the engine

pub mod compute;
pub mod randomness;
pub mod relay;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::protocol::{RandomWord, RequestId};

pub use compute::{ComputeOracle, ComputeResult, ComputeTask, LocalComputeOracle, TaskKind};
pub use randomness::{LocalRandomnessOracle, RandomnessOracle, RequestStatus};
pub use relay::{OracleRelay, RelayStats};

/// Settled deliveries and side records a local oracle keeps before
/// dropping the oldest
pub const DEFAULT_HISTORY_LIMIT: usize = 4096;

/// Which oracle issued a request id. Each oracle owns its own id space, so
/// the same bytes from different oracles name different requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OracleKind {
    Randomness,
    Compute,
}

/// A fulfillment on its way back to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OracleCallback {
    Randomness {
        request_id: RequestId,
        random_value: RandomWord,
    },
    Compute {
        request_id: RequestId,
        result: Vec<u8>,
    },
}

impl OracleCallback {
    pub fn oracle(&self) -> OracleKind {
        match self {
            OracleCallback::Randomness { .. } => OracleKind::Randomness,
            OracleCallback::Compute { .. } => OracleKind::Compute,
        }
    }

    pub fn request_id(&self) -> RequestId {
        match self {
            OracleCallback::Randomness { request_id, .. }
            | OracleCallback::Compute { request_id, .. } => *request_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryState {
    Queued,
    InFlight,
    Delivered,
    Abandoned,
}

#[derive(Debug, Clone)]
struct Delivery<T> {
    payload: T,
    state: DeliveryState,
    attempts: u32,
}

/// Oracle-side outbox with bounded redelivery
///
/// A delivery is handed out once per `drain_ready`; the receiver then
/// either acknowledges it (never handed out again) or asks for a retry.
/// Delivered and abandoned entries are kept up to `history_limit`, oldest
/// first out; an evicted id reads as unknown afterwards.
#[derive(Debug)]
pub(crate) struct DeliveryQueue<T> {
    order: VecDeque<RequestId>,
    entries: HashMap<RequestId, Delivery<T>>,
    settled: VecDeque<RequestId>,
    evicted: Vec<RequestId>,
    max_attempts: u32,
    history_limit: usize,
}

impl<T: Clone> DeliveryQueue<T> {
    pub(crate) fn new(max_attempts: u32) -> Self {
        Self {
            order: VecDeque::new(),
            entries: HashMap::new(),
            settled: VecDeque::new(),
            evicted: Vec::new(),
            max_attempts: max_attempts.max(1),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub(crate) fn set_history_limit(&mut self, limit: usize) {
        self.history_limit = limit;
        self.prune();
    }

    pub(crate) fn push(&mut self, id: RequestId, payload: T) {
        self.entries.insert(
            id,
            Delivery {
                payload,
                state: DeliveryState::Queued,
                attempts: 0,
            },
        );
        self.order.push_back(id);
    }

    pub(crate) fn drain_ready(&mut self) -> Vec<(RequestId, T)> {
        let mut ready = Vec::new();
        while let Some(id) = self.order.pop_front() {
            if let Some(delivery) = self.entries.get_mut(&id) {
                if delivery.state == DeliveryState::Queued {
                    delivery.state = DeliveryState::InFlight;
                    delivery.attempts += 1;
                    ready.push((id, delivery.payload.clone()));
                }
            }
        }
        ready
    }

    pub(crate) fn acknowledge(&mut self, id: &RequestId) {
        if let Some(delivery) = self.entries.get_mut(id) {
            if matches!(delivery.state, DeliveryState::Queued | DeliveryState::InFlight) {
                delivery.state = DeliveryState::Delivered;
                self.settle(*id);
            }
        }
    }

    /// Re-queue an in-flight delivery; returns false once attempts run out.
    pub(crate) fn retry(&mut self, id: &RequestId) -> bool {
        match self.entries.get_mut(id) {
            Some(delivery) if delivery.state == DeliveryState::InFlight => {
                if delivery.attempts >= self.max_attempts {
                    delivery.state = DeliveryState::Abandoned;
                    self.settle(*id);
                    false
                } else {
                    delivery.state = DeliveryState::Queued;
                    self.order.push_back(*id);
                    true
                }
            }
            _ => false,
        }
    }

    /// Ids dropped from history since the last call
    pub(crate) fn take_evicted(&mut self) -> Vec<RequestId> {
        std::mem::take(&mut self.evicted)
    }

    fn settle(&mut self, id: RequestId) {
        self.settled.push_back(id);
        self.prune();
    }

    fn prune(&mut self) {
        while self.settled.len() > self.history_limit {
            if let Some(oldest) = self.settled.pop_front() {
                self.entries.remove(&oldest);
                self.evicted.push(oldest);
            }
        }
    }

    pub(crate) fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    pub(crate) fn is_delivered(&self, id: &RequestId) -> bool {
        self.entries
            .get(id)
            .map(|d| d.state == DeliveryState::Delivered)
            .unwrap_or(false)
    }

    pub(crate) fn is_abandoned(&self, id: &RequestId) -> bool {
        self.entries
            .get(id)
            .map(|d| d.state == DeliveryState::Abandoned)
            .unwrap_or(false)
    }

    pub(crate) fn pending(&self) -> usize {
        self.entries
            .values()
            .filter(|d| matches!(d.state, DeliveryState::Queued | DeliveryState::InFlight))
            .count()
    }
}
