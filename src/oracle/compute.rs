//! Off-chain compute oracle client
//!
//! Two task kinds travel over one request/fulfill channel: question
//! generation and answer grading. Both the task and the result are tagged
//! unions, so the engine matches on the kind instead of guessing from the
//! payload shape.
//!
//! Wire format is bincode. The HTTP round-trip, prompt and grading logic
//! live on the oracle's side.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

use super::{DeliveryQueue, DEFAULT_HISTORY_LIMIT};
use crate::error::{Error, Result};
use crate::protocol::{
    short_hex, AnswerOption, ContentRef, Hash256, ParticipantId, RequestId, Topic,
    OPTIONS_PER_QUESTION,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Generate,
    Verify,
}

/// Work submitted to the compute oracle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComputeTask {
    Generate {
        participant: ParticipantId,
        topics: Vec<Topic>,
        question_count: u8,
        content_seed: Hash256,
    },
    Verify {
        content_ref: ContentRef,
        question_index: u8,
        answer: AnswerOption,
    },
}

impl ComputeTask {
    pub fn kind(&self) -> TaskKind {
        match self {
            ComputeTask::Generate { .. } => TaskKind::Generate,
            ComputeTask::Verify { .. } => TaskKind::Verify,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode_payload(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Result body of a generate task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct ContentManifest {
    content_ref: ContentRef,
    question_count: u8,
}

/// Result body of a verify task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Verdict {
    is_correct: bool,
}

/// Decoded compute fulfillment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeResult {
    Content {
        content_ref: ContentRef,
        question_count: u8,
    },
    Verdict {
        is_correct: bool,
    },
}

impl ComputeResult {
    pub fn kind(&self) -> TaskKind {
        match self {
            ComputeResult::Content { .. } => TaskKind::Generate,
            ComputeResult::Verdict { .. } => TaskKind::Verify,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = match *self {
            ComputeResult::Content {
                content_ref,
                question_count,
            } => bincode::serialize(&ContentManifest {
                content_ref,
                question_count,
            })?,
            ComputeResult::Verdict { is_correct } => bincode::serialize(&Verdict { is_correct })?,
        };
        Ok(bytes)
    }

    /// Decode result bytes for a task of `kind`. Malformed bytes are an
    /// invalid oracle result, not a transport error.
    pub fn decode(kind: TaskKind, bytes: &[u8]) -> Result<Self> {
        let invalid = |e: bincode::Error| {
            Error::InvalidOracleResult(format!("undecodable {:?} result: {}", kind, e))
        };
        match kind {
            TaskKind::Generate => {
                let manifest: ContentManifest = bincode::deserialize(bytes).map_err(invalid)?;
                Ok(ComputeResult::Content {
                    content_ref: manifest.content_ref,
                    question_count: manifest.question_count,
                })
            }
            TaskKind::Verify => {
                let verdict: Verdict = bincode::deserialize(bytes).map_err(invalid)?;
                Ok(ComputeResult::Verdict {
                    is_correct: verdict.is_correct,
                })
            }
        }
    }
}

pub trait ComputeOracle: Send + Sync {
    /// Submit a task; the result arrives later through the engine.
    fn submit(&self, task: ComputeTask) -> Result<RequestId>;
}

struct LocalState {
    nonce: u64,
    /// question count of recently generated content handles
    contents: HashMap<ContentRef, u8>,
    content_order: VecDeque<ContentRef>,
    submitted: VecDeque<(RequestId, ComputeTask)>,
    history_limit: usize,
    forced_question_count: Option<u8>,
    outbox: DeliveryQueue<Vec<u8>>,
}

impl LocalState {
    fn remember_content(&mut self, content_ref: ContentRef, question_count: u8) {
        if self.contents.insert(content_ref, question_count).is_none() {
            self.content_order.push_back(content_ref);
        }
        while self.content_order.len() > self.history_limit {
            if let Some(oldest) = self.content_order.pop_front() {
                self.contents.remove(&oldest);
            }
        }
    }

    fn remember_task(&mut self, request_id: RequestId, task: ComputeTask) {
        self.submitted.push_back((request_id, task));
        while self.submitted.len() > self.history_limit {
            self.submitted.pop_front();
        }
    }
}

/// In-process compute oracle
///
/// Generation derives a content handle from the task payload and an answer
/// key from the handle; grading compares against that key. Deterministic,
/// so tests and simulations can predict every verdict. Generated content,
/// the task log and settled deliveries are kept up to the history limit;
/// a verify task against content that has aged out grades as incorrect.
pub struct LocalComputeOracle {
    state: Mutex<LocalState>,
}

impl LocalComputeOracle {
    const NAMESPACE: &'static [u8] = b"STAKEQUIZ_COMPUTE";

    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: Mutex::new(LocalState {
                nonce: 0,
                contents: HashMap::new(),
                content_order: VecDeque::new(),
                submitted: VecDeque::new(),
                history_limit: DEFAULT_HISTORY_LIMIT,
                forced_question_count: None,
                outbox: DeliveryQueue::new(max_attempts),
            }),
        }
    }

    pub fn with_history_limit(self, limit: usize) -> Self {
        {
            let mut state = self.state.lock();
            state.history_limit = limit;
            state.outbox.set_history_limit(limit);
        }
        self
    }

    /// Correct option for a question of generated content
    pub fn answer_key(content_ref: &ContentRef, question_index: u8) -> u8 {
        let mut hasher = Sha256::new();
        hasher.update(b"STAKEQUIZ_ANSWER_KEY");
        hasher.update(content_ref.0);
        hasher.update([question_index]);
        hasher.finalize()[0] % OPTIONS_PER_QUESTION
    }

    /// Report `count` questions for every later generate task, regardless
    /// of what was requested. Used to exercise result validation.
    pub fn force_question_count(&self, count: Option<u8>) {
        self.state.lock().forced_question_count = count;
    }

    pub fn drain_ready(&self) -> Vec<(RequestId, Vec<u8>)> {
        self.state.lock().outbox.drain_ready()
    }

    pub fn acknowledge(&self, request_id: &RequestId) {
        let mut state = self.state.lock();
        state.outbox.acknowledge(request_id);
        // nothing else here is keyed by request id
        state.outbox.take_evicted();
    }

    pub fn retry(&self, request_id: &RequestId) -> bool {
        let mut state = self.state.lock();
        let requeued = state.outbox.retry(request_id);
        state.outbox.take_evicted();
        requeued
    }

    pub fn pending(&self) -> usize {
        self.state.lock().outbox.pending()
    }

    /// Recent tasks in submission order
    pub fn submitted(&self) -> Vec<(RequestId, ComputeTask)> {
        self.state.lock().submitted.iter().cloned().collect()
    }

    fn generate(
        participant: &ParticipantId,
        topics: &[Topic],
        content_seed: &Hash256,
        nonce: u64,
    ) -> ContentRef {
        let mut hasher = Sha256::new();
        hasher.update(b"STAKEQUIZ_CONTENT");
        hasher.update(participant);
        hasher.update(content_seed);
        for topic in topics {
            hasher.update([topic.code()]);
        }
        hasher.update(nonce.to_be_bytes());
        let mut handle = [0u8; 32];
        handle.copy_from_slice(&hasher.finalize());
        ContentRef(handle)
    }
}

impl ComputeOracle for LocalComputeOracle {
    fn submit(&self, task: ComputeTask) -> Result<RequestId> {
        // Payload must survive the wire before the task is accepted
        let payload = task.encode_payload()?;
        let task = ComputeTask::decode_payload(&payload)?;

        let mut state = self.state.lock();
        state.nonce += 1;
        let nonce = state.nonce;
        let request_id = RequestId::derive(Self::NAMESPACE, nonce);

        let result = match &task {
            ComputeTask::Generate {
                participant,
                topics,
                question_count,
                content_seed,
            } => {
                let content_ref = Self::generate(participant, topics, content_seed, nonce);
                let question_count = state.forced_question_count.unwrap_or(*question_count);
                state.remember_content(content_ref, question_count);
                debug!(participant = %short_hex(participant), request = %request_id, %content_ref, "generate task accepted");
                ComputeResult::Content {
                    content_ref,
                    question_count,
                }
            }
            ComputeTask::Verify {
                content_ref,
                question_index,
                answer,
            } => {
                let known = state
                    .contents
                    .get(content_ref)
                    .map(|count| question_index < count)
                    .unwrap_or(false);
                let is_correct = known
                    && *answer == AnswerOption::Choice(Self::answer_key(content_ref, *question_index));
                debug!(request = %request_id, %content_ref, question = question_index, "verify task accepted");
                ComputeResult::Verdict { is_correct }
            }
        };

        state.outbox.push(request_id, result.encode()?);
        state.remember_task(request_id, task);
        Ok(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate_task() -> ComputeTask {
        ComputeTask::Generate {
            participant: [4u8; 32],
            topics: vec![Topic::Science, Topic::Art, Topic::Music],
            question_count: 5,
            content_seed: [8u8; 32],
        }
    }

    fn content_from(bytes: &[u8]) -> (ContentRef, u8) {
        match ComputeResult::decode(TaskKind::Generate, bytes).unwrap() {
            ComputeResult::Content {
                content_ref,
                question_count,
            } => (content_ref, question_count),
            other => panic!("expected content, got {:?}", other),
        }
    }

    #[test]
    fn test_result_decoding_is_kind_directed() {
        let bytes = ComputeResult::Verdict { is_correct: true }.encode().unwrap();
        assert_eq!(
            ComputeResult::decode(TaskKind::Verify, &bytes).unwrap(),
            ComputeResult::Verdict { is_correct: true }
        );
        // a one-byte verdict cannot be a manifest
        assert!(matches!(
            ComputeResult::decode(TaskKind::Generate, &bytes),
            Err(Error::InvalidOracleResult(_))
        ));
        assert!(matches!(
            ComputeResult::decode(TaskKind::Verify, &[7u8]),
            Err(Error::InvalidOracleResult(_))
        ));
        assert!(ComputeResult::decode(TaskKind::Verify, &[]).is_err());
    }

    #[test]
    fn test_generate_then_grade() {
        let oracle = LocalComputeOracle::new(3);
        let gen_id = oracle.submit(generate_task()).unwrap();
        let ready = oracle.drain_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, gen_id);
        let (content_ref, count) = content_from(&ready[0].1);
        assert_eq!(count, 5);

        let key = LocalComputeOracle::answer_key(&content_ref, 2);
        let right = oracle
            .submit(ComputeTask::Verify {
                content_ref,
                question_index: 2,
                answer: AnswerOption::Choice(key),
            })
            .unwrap();
        let wrong = oracle
            .submit(ComputeTask::Verify {
                content_ref,
                question_index: 2,
                answer: AnswerOption::Choice((key + 1) % OPTIONS_PER_QUESTION),
            })
            .unwrap();
        let skipped = oracle
            .submit(ComputeTask::Verify {
                content_ref,
                question_index: 2,
                answer: AnswerOption::Skipped,
            })
            .unwrap();

        let verdicts: HashMap<RequestId, ComputeResult> = oracle
            .drain_ready()
            .into_iter()
            .map(|(id, bytes)| (id, ComputeResult::decode(TaskKind::Verify, &bytes).unwrap()))
            .collect();
        assert_eq!(verdicts[&right], ComputeResult::Verdict { is_correct: true });
        assert_eq!(verdicts[&wrong], ComputeResult::Verdict { is_correct: false });
        assert_eq!(verdicts[&skipped], ComputeResult::Verdict { is_correct: false });
        assert_eq!(oracle.submitted().len(), 4);
    }

    #[test]
    fn test_forced_question_count() {
        let oracle = LocalComputeOracle::new(1);
        oracle.force_question_count(Some(0));
        oracle.submit(generate_task()).unwrap();
        let ready = oracle.drain_ready();
        assert_eq!(content_from(&ready[0].1).1, 0);
    }

    #[test]
    fn test_payload_round_trip_keeps_kind() {
        let task = generate_task();
        let decoded = ComputeTask::decode_payload(&task.encode_payload().unwrap()).unwrap();
        assert_eq!(decoded.kind(), TaskKind::Generate);
        assert_eq!(decoded, task);
    }

    #[test]
    fn test_history_limit_ages_out_content_and_tasks() {
        let oracle = LocalComputeOracle::new(1).with_history_limit(1);
        oracle.submit(generate_task()).unwrap();
        let (old_ref, _) = content_from(&oracle.drain_ready()[0].1);

        let mut newer = generate_task();
        if let ComputeTask::Generate { content_seed, .. } = &mut newer {
            *content_seed = [9u8; 32];
        }
        oracle.submit(newer).unwrap();
        assert_eq!(oracle.submitted().len(), 1);

        let stale = oracle
            .submit(ComputeTask::Verify {
                content_ref: old_ref,
                question_index: 0,
                answer: AnswerOption::Choice(LocalComputeOracle::answer_key(&old_ref, 0)),
            })
            .unwrap();
        let verdict = oracle
            .drain_ready()
            .into_iter()
            .find(|(id, _)| *id == stale)
            .map(|(_, bytes)| ComputeResult::decode(TaskKind::Verify, &bytes).unwrap());
        assert_eq!(verdict, Some(ComputeResult::Verdict { is_correct: false }));
        assert_eq!(oracle.submitted().len(), 1);
    }
}
