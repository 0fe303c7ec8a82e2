use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::TimeoutConfig;
use crate::error::{Error, Result};
use crate::oracle::OracleKind;
use crate::protocol::{
    AnswerOption, ContentRef, Hash256, ParticipantId, QuizTokens, RandomWord, RequestId,
    SessionId, Topic, CONTENT_SEED_DOMAIN, MAX_QUESTIONS,
};

/// Lifecycle phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionPhase {
    AwaitingRandomness,
    AwaitingContent,
    InProgress,
    AwaitingVerification,
    Settled,
    Cancelled,
}

impl SessionPhase {
    /// Phases in which a live oracle request must be outstanding
    pub fn awaits_oracle(&self) -> bool {
        matches!(
            self,
            SessionPhase::AwaitingRandomness
                | SessionPhase::AwaitingContent
                | SessionPhase::AwaitingVerification
        )
    }

    pub fn accepts_answers(&self) -> bool {
        matches!(self, SessionPhase::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Settled | SessionPhase::Cancelled)
    }

    /// Deadline for this phase, measured from phase entry
    pub fn timeout(&self, timeouts: &TimeoutConfig) -> Option<Duration> {
        match self {
            SessionPhase::AwaitingRandomness => Some(timeouts.randomness),
            SessionPhase::AwaitingContent => Some(timeouts.content),
            SessionPhase::InProgress => Some(timeouts.question),
            SessionPhase::AwaitingVerification => Some(timeouts.verification),
            SessionPhase::Settled | SessionPhase::Cancelled => None,
        }
    }
}

/// Oracle task a session is suspended on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PendingTask {
    Randomness,
    Generate,
    Verify {
        question_index: u8,
        answer: AnswerOption,
    },
}

impl PendingTask {
    /// The only phase in which this task may be outstanding
    pub fn phase(&self) -> SessionPhase {
        match self {
            PendingTask::Randomness => SessionPhase::AwaitingRandomness,
            PendingTask::Generate => SessionPhase::AwaitingContent,
            PendingTask::Verify { .. } => SessionPhase::AwaitingVerification,
        }
    }

    /// Oracle whose id space the request lives in
    pub fn oracle(&self) -> OracleKind {
        match self {
            PendingTask::Randomness => OracleKind::Randomness,
            PendingTask::Generate | PendingTask::Verify { .. } => OracleKind::Compute,
        }
    }
}

/// The single live oracle request of a suspended session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutstandingRequest {
    pub id: RequestId,
    pub task: PendingTask,
}

impl OutstandingRequest {
    /// Key of this request in the store's request index
    pub fn key(&self) -> (OracleKind, RequestId) {
        (self.task.oracle(), self.id)
    }
}

/// One participant's staked quiz
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub participant: ParticipantId,
    pub stake: QuizTokens,
    pub phase: SessionPhase,
    pub topic_preferences: Vec<Topic>,
    pub selected_topics: Vec<Topic>,
    /// Set once the topic subset is fixed
    pub content_seed: Option<Hash256>,
    /// Set once the compute oracle has generated the questions
    pub content_ref: Option<ContentRef>,
    pub current_question_index: u8,
    pub correct_count: u8,
    pub total_questions: u8,
    pub started_at: u64,
    pub phase_entered_at: u64,
    pub outstanding: Option<OutstandingRequest>,
}

impl Session {
    /// Fresh session waiting on its randomness request
    pub fn new(
        participant: ParticipantId,
        stake: QuizTokens,
        topic_preferences: Vec<Topic>,
        randomness_request: RequestId,
        now: u64,
    ) -> Self {
        Self {
            session_id: SessionId::new(),
            participant,
            stake,
            phase: SessionPhase::AwaitingRandomness,
            topic_preferences,
            selected_topics: Vec::new(),
            content_seed: None,
            content_ref: None,
            current_question_index: 0,
            correct_count: 0,
            total_questions: 0,
            started_at: now,
            phase_entered_at: now,
            outstanding: Some(OutstandingRequest {
                id: randomness_request,
                task: PendingTask::Randomness,
            }),
        }
    }

    /// Move to `phase` and restart its timer
    pub fn enter(&mut self, phase: SessionPhase, now: u64) {
        self.phase = phase;
        self.phase_entered_at = now;
    }

    /// True when `request_id` is the live request of this session
    pub fn awaits(&self, request_id: &RequestId) -> bool {
        self.outstanding
            .as_ref()
            .map(|o| &o.id == request_id)
            .unwrap_or(false)
    }

    /// True when `request_id` from `oracle` is the live request of this session
    pub fn awaits_from(&self, oracle: OracleKind, request_id: &RequestId) -> bool {
        self.outstanding
            .as_ref()
            .map(|o| o.key() == (oracle, *request_id))
            .unwrap_or(false)
    }

    pub fn outstanding_task(&self) -> Option<PendingTask> {
        self.outstanding.map(|o| o.task)
    }

    /// Unix second after which the current phase counts as expired
    pub fn deadline(&self, timeouts: &TimeoutConfig) -> Option<u64> {
        self.phase
            .timeout(timeouts)
            .map(|t| self.phase_entered_at.saturating_add(t.as_secs()))
    }

    /// Expiry is strict: the deadline second itself is still inside the phase.
    pub fn is_expired(&self, now: u64, timeouts: &TimeoutConfig) -> bool {
        self.deadline(timeouts)
            .map(|deadline| now > deadline)
            .unwrap_or(false)
    }

    pub fn answer_window_open(&self, now: u64, timeouts: &TimeoutConfig) -> bool {
        self.phase.accepts_answers()
            && now.saturating_sub(self.phase_entered_at) <= timeouts.question.as_secs()
    }

    pub fn questions_remaining(&self) -> u8 {
        self.total_questions.saturating_sub(self.current_question_index)
    }

    /// Structural invariants every stored session satisfies
    pub fn check_invariants(&self) -> Result<()> {
        if self.phase.is_terminal() {
            return Err(Error::CorruptState(format!(
                "terminal phase {:?} cannot be stored",
                self.phase
            )));
        }

        if self.total_questions > MAX_QUESTIONS {
            return Err(Error::CorruptState(format!(
                "{} questions exceeds the maximum of {}",
                self.total_questions, MAX_QUESTIONS
            )));
        }

        if self.current_question_index > self.total_questions {
            return Err(Error::CorruptState(format!(
                "question index {} beyond total {}",
                self.current_question_index, self.total_questions
            )));
        }

        if self.correct_count > self.current_question_index {
            return Err(Error::CorruptState(format!(
                "{} correct answers after {} questions",
                self.correct_count, self.current_question_index
            )));
        }

        match (self.phase.awaits_oracle(), self.outstanding) {
            (true, None) => {
                return Err(Error::CorruptState(format!(
                    "{:?} without an outstanding request",
                    self.phase
                )))
            }
            (false, Some(o)) => {
                return Err(Error::CorruptState(format!(
                    "{:?} with outstanding request {}",
                    self.phase, o.id
                )))
            }
            (true, Some(o)) if o.task.phase() != self.phase => {
                return Err(Error::CorruptState(format!(
                    "{:?} waiting on a {:?} task",
                    self.phase, o.task
                )))
            }
            _ => {}
        }

        let content_fixed = matches!(
            self.phase,
            SessionPhase::InProgress | SessionPhase::AwaitingVerification
        );
        if content_fixed {
            if self.content_ref.is_none() || self.total_questions == 0 {
                return Err(Error::CorruptState(
                    "questions in play without generated content".to_string(),
                ));
            }
            // Reaching the last index settles the session instead of storing it
            if self.current_question_index >= self.total_questions {
                return Err(Error::CorruptState(
                    "all questions answered but session not settled".to_string(),
                ));
            }
        }

        if let Some(PendingTask::Verify { question_index, .. }) = self.outstanding_task() {
            if question_index != self.current_question_index {
                return Err(Error::CorruptState(format!(
                    "verifying question {} while on question {}",
                    question_index, self.current_question_index
                )));
            }
        }

        Ok(())
    }
}

/// Derive the content-selection seed from a delivered random word
pub fn derive_content_seed(random_value: &RandomWord) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(CONTENT_SEED_DOMAIN);
    hasher.update(random_value);
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&hasher.finalize());
    seed
}

/// Pick `count` topics out of `preferences` with a seeded partial
/// Fisher-Yates shuffle. The same seed always yields the same subset in
/// the same order.
pub fn select_topics(preferences: &[Topic], seed: &Hash256, count: usize) -> Vec<Topic> {
    let mut pool = preferences.to_vec();
    let mut rng = ChaCha20Rng::from_seed(*seed);
    let count = count.min(pool.len());

    for i in 0..count {
        let j = i + uniform_below(&mut rng, (pool.len() - i) as u64) as usize;
        pool.swap(i, j);
    }

    pool.truncate(count);
    pool
}

/// Unbiased value in `[0, bound)` by rejection sampling
fn uniform_below(rng: &mut ChaCha20Rng, bound: u64) -> u64 {
    if bound <= 1 {
        return 0;
    }
    let threshold = u64::MAX - (u64::MAX % bound);
    loop {
        let value = rng.next_u64();
        if value < threshold {
            return value % bound;
        }
    }
}
