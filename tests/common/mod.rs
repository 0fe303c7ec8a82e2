//! Shared fixtures for StakeQuiz integration tests

#![allow(dead_code)]

use std::sync::Arc;

use stakequiz::config::QuizConfig;
use stakequiz::protocol::{ContentRef, RequestId};
use stakequiz::{
    CallbackOutcome, LocalComputeOracle, LocalRandomnessOracle, ManualClock, ParticipantId,
    QuizEngine, QuizTokens, Session, Topic, TokenLedger, VAULT_ADDRESS,
};

pub const START_TIME: u64 = 1_700_000_000;

pub fn participant(n: u8) -> ParticipantId {
    let mut id = [0u8; 32];
    id[0] = n;
    id[31] = 0xA5;
    id
}

pub fn preferences() -> Vec<Topic> {
    vec![
        Topic::Science,
        Topic::History,
        Topic::Literature,
        Topic::Music,
        Topic::Cinema,
    ]
}

/// Engine wired to an in-memory ledger, local oracles and a manual clock
pub struct Harness {
    pub engine: Arc<QuizEngine>,
    pub ledger: Arc<TokenLedger>,
    pub randomness: Arc<LocalRandomnessOracle>,
    pub compute: Arc<LocalComputeOracle>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(QuizConfig::default())
    }

    pub fn with_config(config: QuizConfig) -> Self {
        let ledger = Arc::new(TokenLedger::new());
        let randomness = Arc::new(LocalRandomnessOracle::from_seed(2024, 4));
        let compute = Arc::new(LocalComputeOracle::new(4));
        let clock = Arc::new(ManualClock::new(START_TIME));
        let engine = Arc::new(
            QuizEngine::new(
                config,
                randomness.clone(),
                compute.clone(),
                ledger.clone(),
                clock.clone(),
            )
            .expect("valid config"),
        );

        Self {
            engine,
            ledger,
            randomness,
            compute,
            clock,
        }
    }

    /// Mint `amount` to `who` and approve all of it toward the vault
    pub fn fund(&self, who: ParticipantId, amount: u64) {
        self.ledger
            .mint(who, QuizTokens::new(amount))
            .expect("mint");
        self.ledger
            .approve(who, VAULT_ADDRESS, QuizTokens::new(amount));
    }

    pub fn session(&self, who: &ParticipantId) -> Session {
        self.engine.session(who).expect("live session")
    }

    pub fn outstanding(&self, who: &ParticipantId) -> RequestId {
        self.session(who)
            .outstanding
            .expect("outstanding request")
            .id
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.engine
            .store()
            .snapshot_bytes()
            .expect("snapshot")
    }

    /// Start a session and carry it through randomness and generation
    /// with `questions` questions. Returns the content handle.
    pub fn start_in_progress(&self, who: ParticipantId, stake: u64, questions: u8) -> ContentRef {
        let randomness_id = self
            .engine
            .start(who, &preferences(), QuizTokens::new(stake))
            .expect("start");
        assert_eq!(
            self.engine
                .on_randomness_fulfilled(randomness_id, [who[0]; 32])
                .expect("randomness"),
            CallbackOutcome::Applied
        );

        let content_ref = ContentRef([who[0] ^ 0x5A; 32]);
        let generate_id = self.outstanding(&who);
        assert_eq!(
            self.engine
                .on_content_ready(generate_id, content_ref, questions)
                .expect("content"),
            CallbackOutcome::Applied
        );
        content_ref
    }
}
