//! Outward session notifications
//!
//! Events are published on a `tokio::sync::broadcast` channel; UI and
//! indexing layers subscribe to it. Sending never blocks and a missing
//! subscriber is not an error.

use serde::{Deserialize, Serialize};

use crate::protocol::{ContentRef, ParticipantId, QuizTokens, RequestId, SessionId, Topic};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    SessionStarted {
        session_id: SessionId,
        participant: ParticipantId,
        stake: QuizTokens,
        randomness_request: RequestId,
    },
    TopicsSelected {
        session_id: SessionId,
        participant: ParticipantId,
        topics: Vec<Topic>,
        content_seed: [u8; 32],
        content_request: RequestId,
    },
    ContentReady {
        session_id: SessionId,
        participant: ParticipantId,
        content_ref: ContentRef,
        total_questions: u8,
    },
    AnswerRecorded {
        session_id: SessionId,
        participant: ParticipantId,
        question_index: u8,
        is_correct: bool,
        correct_count: u8,
    },
    Settled {
        session_id: SessionId,
        participant: ParticipantId,
        correct_count: u8,
        total_questions: u8,
        reward: QuizTokens,
        retained: QuizTokens,
    },
    Cancelled {
        session_id: SessionId,
        participant: ParticipantId,
        caller: ParticipantId,
        refund: QuizTokens,
    },
}

impl SessionEvent {
    pub fn participant(&self) -> &ParticipantId {
        match self {
            SessionEvent::SessionStarted { participant, .. }
            | SessionEvent::TopicsSelected { participant, .. }
            | SessionEvent::ContentReady { participant, .. }
            | SessionEvent::AnswerRecorded { participant, .. }
            | SessionEvent::Settled { participant, .. }
            | SessionEvent::Cancelled { participant, .. } => participant,
        }
    }

    pub fn session_id(&self) -> SessionId {
        match self {
            SessionEvent::SessionStarted { session_id, .. }
            | SessionEvent::TopicsSelected { session_id, .. }
            | SessionEvent::ContentReady { session_id, .. }
            | SessionEvent::AnswerRecorded { session_id, .. }
            | SessionEvent::Settled { session_id, .. }
            | SessionEvent::Cancelled { session_id, .. } => *session_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::SessionStarted { .. } => "SessionStarted",
            SessionEvent::TopicsSelected { .. } => "TopicsSelected",
            SessionEvent::ContentReady { .. } => "ContentReady",
            SessionEvent::AnswerRecorded { .. } => "AnswerRecorded",
            SessionEvent::Settled { .. } => "Settled",
            SessionEvent::Cancelled { .. } => "Cancelled",
        }
    }

    /// Terminal events end the session
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::Settled { .. } | SessionEvent::Cancelled { .. }
        )
    }
}
