//! Session state machine
//!
//! `QuizEngine` is the only writer of sessions and the only caller of the
//! custody collaborator. Every entry point is an independent invocation:
//! participant actions (`start`, `submit_answer`, `cancel`) and oracle
//! fulfillments (`on_*`) may arrive in any order, late or more than once.
//!
//! Each step runs under the participant's store entry, so steps for one
//! participant are serialized and steps for different participants never
//! contend. A step either commits its next session together with the token
//! movement it requires or fails leaving everything as it was. Events go out
//! once the store has committed but before the participant's entry is
//! released, so a session's events are published in transition order.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::settlement::{self, CancelReceipt};
use super::state::{
    derive_content_seed, select_topics, OutstandingRequest, PendingTask, Session, SessionPhase,
};
use super::store::{SessionStore, StoreUpdate};
use crate::clock::Clock;
use crate::config::QuizConfig;
use crate::error::{Error, Result};
use crate::events::SessionEvent;
use crate::oracle::{
    ComputeOracle, ComputeResult, ComputeTask, OracleKind, RandomnessOracle, RequestStatus,
    TaskKind,
};
use crate::protocol::{
    short_hex, AnswerOption, ContentRef, ParticipantId, QuizTokens, RandomWord, RequestId, Topic,
    MAX_QUESTIONS,
};
use crate::token::TokenCustody;

/// Why a callback was dropped without touching any session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IgnoreReason {
    /// No live session is waiting on this id
    UnknownRequest,
    /// The owning session has moved on to another request
    RequestMismatch,
    /// The id is live but belongs to a different kind of task
    WrongPhase,
}

/// Result of delivering an oracle fulfillment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackOutcome {
    Applied,
    Ignored(IgnoreReason),
}

impl CallbackOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CallbackOutcome::Applied)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub sessions_started: u64,
    pub sessions_settled: u64,
    pub sessions_cancelled: u64,
    pub answers_recorded: u64,
    pub stale_callbacks: u64,
    pub rejected_results: u64,
    pub total_staked: u64,
    pub total_rewarded: u64,
    pub total_refunded: u64,
    pub total_retained: u64,
}

/// What a step hands back to the entry point once the store has committed
enum Step<T> {
    Done(T, Vec<SessionEvent>),
    Ignored(IgnoreReason),
}

pub struct QuizEngine {
    config: QuizConfig,
    store: SessionStore,
    randomness: Arc<dyn RandomnessOracle>,
    compute: Arc<dyn ComputeOracle>,
    custody: Arc<dyn TokenCustody>,
    clock: Arc<dyn Clock>,
    event_tx: broadcast::Sender<SessionEvent>,
    stats: Mutex<EngineStats>,
}

impl QuizEngine {
    pub fn new(
        config: QuizConfig,
        randomness: Arc<dyn RandomnessOracle>,
        compute: Arc<dyn ComputeOracle>,
        custody: Arc<dyn TokenCustody>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(1000);

        Ok(Self {
            config,
            store: SessionStore::new(),
            randomness,
            compute,
            custody,
            clock,
            event_tx,
            stats: Mutex::new(EngineStats::default()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &QuizConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.lock().clone()
    }

    /// Copy of the participant's live session
    pub fn session(&self, participant: &ParticipantId) -> Option<Session> {
        self.store.get(participant)
    }

    /// True once the current phase of the participant's session has expired
    pub fn is_cancellable(&self, participant: &ParticipantId) -> bool {
        let now = self.clock.now();
        self.store
            .get(participant)
            .map(|s| s.is_expired(now, &self.config.timeouts))
            .unwrap_or(false)
    }

    /// Oracle-side status of the session's randomness request, while the
    /// session is still waiting on one
    pub fn randomness_status(&self, participant: &ParticipantId) -> Option<RequestStatus> {
        let session = self.store.get(participant)?;
        match session.outstanding {
            Some(OutstandingRequest {
                id,
                task: PendingTask::Randomness,
            }) => Some(self.randomness.status(&id)),
            _ => None,
        }
    }

    /// Stake tokens and open a session. Returns the randomness request id.
    pub fn start(
        &self,
        participant: ParticipantId,
        topic_preferences: &[Topic],
        stake: QuizTokens,
    ) -> Result<RequestId> {
        self.validate_stake(stake)?;
        self.validate_preferences(topic_preferences)?;

        if self.store.contains(&participant) {
            return Err(Error::SessionAlreadyActive(short_hex(&participant)));
        }

        // Check funds before asking the oracle for anything
        let balance = self.custody.balance_of(&participant);
        if balance < stake {
            return Err(Error::InsufficientBalance(format!(
                "{} holds {}, stake is {}",
                short_hex(&participant),
                balance,
                stake
            )));
        }
        let allowance = self
            .custody
            .allowance(&participant, &self.custody.custodian());
        if allowance < stake {
            return Err(Error::InsufficientAllowance(format!(
                "{} approved {}, stake is {}",
                short_hex(&participant),
                allowance,
                stake
            )));
        }

        let now = self.clock.now();
        let session = self.store.create_with(
            participant,
            || {
                let request_id = self.randomness.request(&participant)?;
                Ok(Session::new(
                    participant,
                    stake,
                    topic_preferences.to_vec(),
                    request_id,
                    now,
                ))
            },
            |session| {
                // Last fallible step: once tokens move the session is stored
                self.custody.transfer_in(&participant, stake)?;
                if let Some(outstanding) = session.outstanding {
                    self.emit(SessionEvent::SessionStarted {
                        session_id: session.session_id,
                        participant,
                        stake,
                        randomness_request: outstanding.id,
                    });
                }
                Ok(())
            },
        )?;

        let request_id = session
            .outstanding
            .map(|o| o.id)
            .ok_or_else(|| Error::CorruptState("new session without a request".to_string()))?;

        {
            let mut stats = self.stats.lock();
            stats.sessions_started += 1;
            stats.total_staked = stats.total_staked.saturating_add(stake.amount());
        }

        info!(
            participant = %short_hex(&participant),
            session = %session.session_id,
            %stake,
            request = %request_id,
            "session started"
        );

        Ok(request_id)
    }

    /// Randomness arrived: fix the topic subset and ask for questions.
    pub fn on_randomness_fulfilled(
        &self,
        request_id: RequestId,
        random_value: RandomWord,
    ) -> Result<CallbackOutcome> {
        let now = self.clock.now();
        let topics_per_session = self.config.session.topics_per_session;
        let question_count = self.config.session.questions_per_session;

        self.callback(OracleKind::Randomness, request_id, |session| {
            if session.outstanding_task() != Some(PendingTask::Randomness) {
                return Ok((StoreUpdate::Keep, Step::Ignored(IgnoreReason::WrongPhase)));
            }

            let content_seed = derive_content_seed(&random_value);
            let topics = select_topics(&session.topic_preferences, &content_seed, topics_per_session);

            let content_request = self.compute.submit(ComputeTask::Generate {
                participant: session.participant,
                topics: topics.clone(),
                question_count,
                content_seed,
            })?;

            let mut next = session.clone();
            next.selected_topics = topics.clone();
            next.content_seed = Some(content_seed);
            next.enter(SessionPhase::AwaitingContent, now);
            next.outstanding = Some(OutstandingRequest {
                id: content_request,
                task: PendingTask::Generate,
            });

            debug!(
                participant = %short_hex(&session.participant),
                request = %content_request,
                ?topics,
                "topics selected"
            );
            let event = SessionEvent::TopicsSelected {
                session_id: session.session_id,
                participant: session.participant,
                topics,
                content_seed,
                content_request,
            };
            Ok((StoreUpdate::Replace(next), Step::Done((), vec![event])))
        })
        .map(|(outcome, ())| outcome)
    }

    /// Questions generated: bind the content handle and open question 0.
    pub fn on_content_ready(
        &self,
        request_id: RequestId,
        content_ref: ContentRef,
        question_count: u8,
    ) -> Result<CallbackOutcome> {
        let now = self.clock.now();

        self.callback(OracleKind::Compute, request_id, |session| {
            if session.outstanding_task() != Some(PendingTask::Generate) {
                return Ok((StoreUpdate::Keep, Step::Ignored(IgnoreReason::WrongPhase)));
            }

            if question_count == 0 || question_count > MAX_QUESTIONS {
                return Err(Error::InvalidOracleResult(format!(
                    "question count {} outside 1..={}",
                    question_count, MAX_QUESTIONS
                )));
            }

            let mut next = session.clone();
            next.content_ref = Some(content_ref);
            next.total_questions = question_count;
            next.current_question_index = 0;
            next.outstanding = None;
            next.enter(SessionPhase::InProgress, now);

            let event = SessionEvent::ContentReady {
                session_id: session.session_id,
                participant: session.participant,
                content_ref,
                total_questions: question_count,
            };
            Ok((StoreUpdate::Replace(next), Step::Done((), vec![event])))
        })
        .map(|(outcome, ())| outcome)
    }

    /// Submit an answer to the current question. Returns the verify request id.
    pub fn submit_answer(
        &self,
        participant: ParticipantId,
        answer: AnswerOption,
    ) -> Result<RequestId> {
        answer.validate()?;
        let now = self.clock.now();
        let timeouts = &self.config.timeouts;

        let request_id = self.store.update(&participant, |session| {
            match session.phase {
                SessionPhase::InProgress => {}
                SessionPhase::AwaitingVerification => {
                    return Err(Error::InvalidPhase(format!(
                        "answer to question {} is still being verified",
                        session.current_question_index
                    )))
                }
                phase => {
                    return Err(Error::InvalidPhase(format!(
                        "cannot answer while {:?}",
                        phase
                    )))
                }
            }

            if !session.answer_window_open(now, timeouts) {
                return Err(Error::AnswerWindowClosed(format!(
                    "question {} opened at {}, window is {}s",
                    session.current_question_index,
                    session.phase_entered_at,
                    timeouts.question.as_secs()
                )));
            }

            let content_ref = session.content_ref.ok_or_else(|| {
                Error::CorruptState("session in progress without content".to_string())
            })?;
            let question_index = session.current_question_index;

            let request_id = self.compute.submit(ComputeTask::Verify {
                content_ref,
                question_index,
                answer,
            })?;

            let mut next = session.clone();
            next.enter(SessionPhase::AwaitingVerification, now);
            next.outstanding = Some(OutstandingRequest {
                id: request_id,
                task: PendingTask::Verify {
                    question_index,
                    answer,
                },
            });
            Ok((StoreUpdate::Replace(next), request_id))
        })?;

        debug!(participant = %short_hex(&participant), request = %request_id, ?answer, "answer submitted");
        Ok(request_id)
    }

    /// Verdict arrived: score the answer, then advance or settle.
    pub fn on_answer_verified(
        &self,
        request_id: RequestId,
        is_correct: bool,
    ) -> Result<CallbackOutcome> {
        let now = self.clock.now();

        self.callback(OracleKind::Compute, request_id, |session| {
            let (question_index, answer) = match session.outstanding_task() {
                Some(PendingTask::Verify {
                    question_index,
                    answer,
                }) => (question_index, answer),
                _ => return Ok((StoreUpdate::Keep, Step::Ignored(IgnoreReason::WrongPhase))),
            };

            // A skipped question never scores
            let scored = is_correct && !answer.is_skip();

            let mut next = session.clone();
            next.outstanding = None;
            if scored {
                next.correct_count += 1;
            }
            next.current_question_index = question_index + 1;

            let mut events = vec![SessionEvent::AnswerRecorded {
                session_id: session.session_id,
                participant: session.participant,
                question_index,
                is_correct: scored,
                correct_count: next.correct_count,
            }];

            if next.current_question_index < next.total_questions {
                next.enter(SessionPhase::InProgress, now);
                return Ok((StoreUpdate::Replace(next), Step::Done(None, events)));
            }

            next.enter(SessionPhase::Settled, now);
            let receipt = settlement::settle(self.custody.as_ref(), &next)?;
            events.push(SessionEvent::Settled {
                session_id: receipt.session_id,
                participant: receipt.participant,
                correct_count: receipt.correct_count,
                total_questions: receipt.total_questions,
                reward: receipt.reward,
                retained: receipt.retained,
            });
            Ok((StoreUpdate::Remove, Step::Done(Some(receipt), events)))
        })
        .map(|(outcome, receipt)| {
            if let Some(receipt) = receipt {
                let mut stats = self.stats.lock();
                stats.sessions_settled += 1;
                stats.total_rewarded = stats.total_rewarded.saturating_add(receipt.reward.amount());
                stats.total_retained = stats
                    .total_retained
                    .saturating_add(receipt.retained.amount());
                drop(stats);
                info!(
                    participant = %short_hex(&receipt.participant),
                    session = %receipt.session_id,
                    correct = receipt.correct_count,
                    total = receipt.total_questions,
                    reward = %receipt.reward,
                    retained = %receipt.retained,
                    "session settled"
                );
            }
            outcome
        })
    }

    /// Route raw compute-oracle result bytes by the kind of task the owning
    /// session is waiting on.
    pub fn on_compute_fulfilled(
        &self,
        request_id: RequestId,
        result: &[u8],
    ) -> Result<CallbackOutcome> {
        let task = self
            .store
            .participant_for(OracleKind::Compute, &request_id)
            .and_then(|participant| self.store.get(&participant))
            .filter(|session| session.awaits_from(OracleKind::Compute, &request_id))
            .and_then(|session| session.outstanding_task());

        let kind = match task {
            None => return Ok(self.ignore(&request_id, IgnoreReason::UnknownRequest)),
            Some(PendingTask::Randomness) => {
                return Ok(self.ignore(&request_id, IgnoreReason::WrongPhase))
            }
            Some(PendingTask::Generate) => TaskKind::Generate,
            Some(PendingTask::Verify { .. }) => TaskKind::Verify,
        };

        let decoded = match ComputeResult::decode(kind, result) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.reject(&request_id, &e);
                return Err(e);
            }
        };

        match decoded {
            ComputeResult::Content {
                content_ref,
                question_count,
            } => self.on_content_ready(request_id, content_ref, question_count),
            ComputeResult::Verdict { is_correct } => {
                self.on_answer_verified(request_id, is_correct)
            }
        }
    }

    /// Tear down an expired session and refund the whole stake. Anyone may
    /// call this once the current phase has timed out.
    pub fn cancel(&self, caller: ParticipantId, participant: ParticipantId) -> Result<CancelReceipt> {
        let now = self.clock.now();
        let timeouts = &self.config.timeouts;

        let receipt = self.store.update_and_then(
            &participant,
            |session| {
                if !session.is_expired(now, timeouts) {
                    let deadline = session.deadline(timeouts).unwrap_or(session.phase_entered_at);
                    return Err(Error::TimeoutNotElapsed(format!(
                        "{:?} runs until {}, now {}",
                        session.phase, deadline, now
                    )));
                }

                let receipt = settlement::refund(self.custody.as_ref(), session, caller)?;
                Ok((StoreUpdate::Remove, receipt))
            },
            |receipt| {
                self.emit(SessionEvent::Cancelled {
                    session_id: receipt.session_id,
                    participant,
                    caller,
                    refund: receipt.refund,
                })
            },
        )?;

        {
            let mut stats = self.stats.lock();
            stats.sessions_cancelled += 1;
            stats.total_refunded = stats.total_refunded.saturating_add(receipt.refund.amount());
        }

        info!(
            participant = %short_hex(&participant),
            caller = %short_hex(&caller),
            session = %receipt.session_id,
            refund = %receipt.refund,
            "session cancelled"
        );

        Ok(receipt)
    }

    fn validate_stake(&self, stake: QuizTokens) -> Result<()> {
        let bounds = &self.config.stake;
        if stake.amount() < bounds.min_stake || stake.amount() > bounds.max_stake {
            return Err(Error::InvalidStake(format!(
                "{} outside {}..={}",
                stake, bounds.min_stake, bounds.max_stake
            )));
        }
        Ok(())
    }

    fn validate_preferences(&self, preferences: &[Topic]) -> Result<()> {
        let required = self.config.session.min_topic_preferences;
        if preferences.len() < required {
            return Err(Error::InvalidTopics(format!(
                "{} preferences given, at least {} required",
                preferences.len(),
                required
            )));
        }

        let mut seen = HashSet::new();
        for topic in preferences {
            if !seen.insert(topic) {
                return Err(Error::InvalidTopics(format!("{} listed twice", topic)));
            }
        }
        Ok(())
    }

    /// Shared shape of every oracle fulfillment: resolve the owner through
    /// `oracle`'s id space, check the id against the live request, run
    /// `step` under the entry lock and publish before releasing it.
    fn callback<F, T>(
        &self,
        oracle: OracleKind,
        request_id: RequestId,
        step: F,
    ) -> Result<(CallbackOutcome, T)>
    where
        F: FnOnce(&Session) -> Result<(StoreUpdate, Step<T>)>,
        T: Default,
    {
        let participant = match self.store.participant_for(oracle, &request_id) {
            Some(participant) => participant,
            None => {
                return Ok((
                    self.ignore(&request_id, IgnoreReason::UnknownRequest),
                    T::default(),
                ))
            }
        };

        let result = self.store.update_and_then(
            &participant,
            |session| {
                if !session.awaits_from(oracle, &request_id) {
                    return Ok((StoreUpdate::Keep, Step::Ignored(IgnoreReason::RequestMismatch)));
                }
                step(session)
            },
            |committed| {
                if let Step::Done(_, events) = committed {
                    let answers = events
                        .iter()
                        .filter(|e| matches!(e, SessionEvent::AnswerRecorded { .. }))
                        .count() as u64;
                    if answers > 0 {
                        self.stats.lock().answers_recorded += answers;
                    }
                    for event in events.drain(..) {
                        self.emit(event);
                    }
                }
            },
        );

        match result {
            Ok(Step::Done(output, _)) => Ok((CallbackOutcome::Applied, output)),
            Ok(Step::Ignored(reason)) => Ok((self.ignore(&request_id, reason), T::default())),
            // Session settled or cancelled between lookup and lock
            Err(Error::SessionNotFound(_)) => Ok((
                self.ignore(&request_id, IgnoreReason::UnknownRequest),
                T::default(),
            )),
            Err(e) => {
                if matches!(e, Error::InvalidOracleResult(_)) {
                    self.reject(&request_id, &e);
                }
                Err(e)
            }
        }
    }

    fn ignore(&self, request_id: &RequestId, reason: IgnoreReason) -> CallbackOutcome {
        self.stats.lock().stale_callbacks += 1;
        debug!(request = %request_id, ?reason, "stale callback ignored");
        CallbackOutcome::Ignored(reason)
    }

    fn reject(&self, request_id: &RequestId, error: &Error) {
        self.stats.lock().rejected_results += 1;
        warn!(request = %request_id, %error, "oracle result rejected");
    }

    fn emit(&self, event: SessionEvent) {
        debug!(event = event.name(), session = %event.session_id(), "event");
        let _ = self.event_tx.send(event);
    }
}
