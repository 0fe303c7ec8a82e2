//! Delivery loop between the local oracles and the engine
//!
//! The relay plays the oracle network's side of the callback contract. It
//! drains fulfillments, hands them to the engine and decides per delivery:
//!
//! - applied, or ignored because the session moved on: acknowledge
//! - ignored because no session knows the id yet: redeliver later, up to
//!   the oracle's attempt bound
//! - rejected by the engine: acknowledge and log; the session keeps waiting
//!   until it times out

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::{LocalComputeOracle, LocalRandomnessOracle, OracleCallback};
use crate::error::Result;
use crate::protocol::RequestId;
use crate::session::{CallbackOutcome, IgnoreReason, QuizEngine};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    pub delivered: u64,
    pub ignored: u64,
    pub redelivered: u64,
    pub abandoned: u64,
    pub rejected: u64,
}

impl RelayStats {
    fn merge(&mut self, other: &RelayStats) {
        self.delivered += other.delivered;
        self.ignored += other.ignored;
        self.redelivered += other.redelivered;
        self.abandoned += other.abandoned;
        self.rejected += other.rejected;
    }

    /// Deliveries handled in this pass, whatever the outcome
    pub fn handled(&self) -> u64 {
        self.delivered + self.ignored + self.redelivered + self.abandoned + self.rejected
    }
}

pub struct OracleRelay {
    engine: Arc<QuizEngine>,
    randomness: Arc<LocalRandomnessOracle>,
    compute: Arc<LocalComputeOracle>,
    poll_interval: Duration,
    totals: Mutex<RelayStats>,
}

impl OracleRelay {
    pub fn new(
        engine: Arc<QuizEngine>,
        randomness: Arc<LocalRandomnessOracle>,
        compute: Arc<LocalComputeOracle>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            engine,
            randomness,
            compute,
            poll_interval,
            totals: Mutex::new(RelayStats::default()),
        }
    }

    pub fn stats(&self) -> RelayStats {
        *self.totals.lock()
    }

    /// Deliveries still owed by either oracle
    pub fn pending(&self) -> usize {
        self.randomness.pending() + self.compute.pending()
    }

    /// Hand every ready fulfillment to the engine once.
    pub fn pump(&self) -> RelayStats {
        let mut pass = RelayStats::default();

        let callbacks = self
            .randomness
            .drain_ready()
            .into_iter()
            .map(|(request_id, random_value)| OracleCallback::Randomness {
                request_id,
                random_value,
            })
            .chain(
                self.compute
                    .drain_ready()
                    .into_iter()
                    .map(|(request_id, result)| OracleCallback::Compute { request_id, result }),
            )
            .collect::<Vec<_>>();

        for callback in callbacks {
            let request_id = callback.request_id();
            let outcome = self.dispatch(&callback);
            self.settle_delivery(&callback, request_id, outcome, &mut pass);
        }

        self.totals.lock().merge(&pass);
        pass
    }

    /// Pump on a fixed interval until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> RelayStats {
        let mut ticker = interval(self.poll_interval);
        info!(interval = ?self.poll_interval, "oracle relay running");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.pump();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let totals = self.stats();
        info!(
            delivered = totals.delivered,
            redelivered = totals.redelivered,
            abandoned = totals.abandoned,
            rejected = totals.rejected,
            "oracle relay stopped"
        );
        totals
    }

    fn dispatch(&self, callback: &OracleCallback) -> Result<CallbackOutcome> {
        match callback {
            OracleCallback::Randomness {
                request_id,
                random_value,
            } => self
                .engine
                .on_randomness_fulfilled(*request_id, *random_value),
            OracleCallback::Compute { request_id, result } => {
                self.engine.on_compute_fulfilled(*request_id, result)
            }
        }
    }

    fn settle_delivery(
        &self,
        callback: &OracleCallback,
        request_id: RequestId,
        outcome: Result<CallbackOutcome>,
        pass: &mut RelayStats,
    ) {
        match outcome {
            Ok(CallbackOutcome::Applied) => {
                self.acknowledge(callback, &request_id);
                pass.delivered += 1;
            }
            Ok(CallbackOutcome::Ignored(IgnoreReason::UnknownRequest)) => {
                if self.retry(callback, &request_id) {
                    debug!(oracle = ?callback.oracle(), request = %request_id, "delivery re-queued");
                    pass.redelivered += 1;
                } else {
                    debug!(oracle = ?callback.oracle(), request = %request_id, "delivery abandoned");
                    pass.abandoned += 1;
                }
            }
            Ok(CallbackOutcome::Ignored(_)) => {
                self.acknowledge(callback, &request_id);
                pass.ignored += 1;
            }
            Err(e) => {
                warn!(oracle = ?callback.oracle(), request = %request_id, error = %e, "engine refused delivery");
                self.acknowledge(callback, &request_id);
                pass.rejected += 1;
            }
        }
    }

    fn acknowledge(&self, callback: &OracleCallback, request_id: &RequestId) {
        match callback {
            OracleCallback::Randomness { .. } => self.randomness.acknowledge(request_id),
            OracleCallback::Compute { .. } => self.compute.acknowledge(request_id),
        }
    }

    fn retry(&self, callback: &OracleCallback, request_id: &RequestId) -> bool {
        match callback {
            OracleCallback::Randomness { .. } => self.randomness.retry(request_id),
            OracleCallback::Compute { .. } => self.compute.retry(request_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::QuizConfig;
    use crate::oracle::RandomnessOracle;
    use crate::protocol::{AnswerOption, QuizTokens, Topic};
    use crate::session::SessionPhase;
    use crate::token::{TokenCustody, TokenLedger, VAULT_ADDRESS};

    const ALICE: [u8; 32] = [1u8; 32];

    fn relay() -> (OracleRelay, Arc<TokenLedger>) {
        let ledger = Arc::new(TokenLedger::new());
        ledger.mint(ALICE, QuizTokens::new(500)).unwrap();
        ledger.approve(ALICE, VAULT_ADDRESS, QuizTokens::new(500));

        let randomness = Arc::new(LocalRandomnessOracle::from_seed(3, 2));
        let compute = Arc::new(LocalComputeOracle::new(2));
        let engine = Arc::new(
            QuizEngine::new(
                QuizConfig::default(),
                randomness.clone(),
                compute.clone(),
                ledger.clone(),
                Arc::new(ManualClock::new(50)),
            )
            .unwrap(),
        );
        (
            OracleRelay::new(engine, randomness, compute, Duration::from_millis(5)),
            ledger,
        )
    }

    #[test]
    fn test_pump_drives_session_to_first_question() {
        let (relay, _) = relay();
        relay
            .engine
            .start(ALICE, &Topic::ALL[..5], QuizTokens::new(100))
            .unwrap();

        // randomness, then the generate result it triggered
        assert_eq!(relay.pump().delivered, 1);
        assert_eq!(relay.pump().delivered, 1);
        assert_eq!(
            relay.engine.session(&ALICE).unwrap().phase,
            SessionPhase::InProgress
        );
        assert_eq!(relay.pending(), 0);
        assert_eq!(relay.pump().handled(), 0);
    }

    #[test]
    fn test_orphan_request_is_redelivered_then_abandoned() {
        let (relay, _) = relay();
        // nobody registers this request with the engine
        relay.randomness.request(&ALICE).unwrap();

        let first = relay.pump();
        assert_eq!(first.redelivered, 1);
        let second = relay.pump();
        assert_eq!(second.abandoned, 1);
        assert_eq!(relay.pending(), 0);
        assert_eq!(relay.stats().handled(), 2);
    }

    #[test]
    fn test_rejected_result_is_acknowledged() {
        let (relay, ledger) = relay();
        relay.compute.force_question_count(Some(0));
        relay
            .engine
            .start(ALICE, &Topic::ALL[..5], QuizTokens::new(100))
            .unwrap();

        relay.pump();
        let pass = relay.pump();
        assert_eq!(pass.rejected, 1);
        assert_eq!(relay.pending(), 0);
        assert_eq!(
            relay.engine.session(&ALICE).unwrap().phase,
            SessionPhase::AwaitingContent
        );
        assert_eq!(ledger.balance_of(&ALICE).amount(), 400);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let (relay, _) = relay();
        let relay = Arc::new(relay);
        relay
            .engine
            .start(ALICE, &Topic::ALL[..5], QuizTokens::new(100))
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.run(shutdown_rx).await })
        };

        for _ in 0..200 {
            if relay
                .engine
                .session(&ALICE)
                .map(|s| s.phase == SessionPhase::InProgress)
                .unwrap_or(false)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        relay
            .engine
            .submit_answer(ALICE, AnswerOption::Skipped)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown_tx.send(true).unwrap();
        let totals = runner.await.unwrap();
        assert_eq!(totals.delivered, 3);
        assert_eq!(
            relay.engine.session(&ALICE).unwrap().current_question_index,
            1
        );
    }
}
