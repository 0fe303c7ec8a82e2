//! Core protocol types for StakeQuiz
//!
//! Identifiers, token amounts, the topic vocabulary and answer encoding
//! shared by the session state machine and its oracle collaborators.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{Error, Result};

/// Participant identity (32-byte public key)
pub type ParticipantId = [u8; 32];

/// Raw 256-bit random word delivered by the randomness oracle (big-endian)
pub type RandomWord = [u8; 32];

/// Hash output used for seeds and content identifiers
pub type Hash256 = [u8; 32];

/// Highest number of questions a single session may contain
pub const MAX_QUESTIONS: u8 = 20;

/// Answer options offered per question
pub const OPTIONS_PER_QUESTION: u8 = 4;

/// Wire value reserved for "timed out / skipped"
pub const SKIPPED_ANSWER_WIRE: u8 = 0xFF;

/// Number of topics in the allowed vocabulary
pub const TOPIC_COUNT: usize = 12;

/// Domain separator for deriving a content seed from a random word
pub const CONTENT_SEED_DOMAIN: &[u8] = b"STAKEQUIZ_CONTENT_SEED_V1";

/// Short hex form of an identifier for log lines
pub fn short_hex(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(4)])
}

/// Opaque identifier of an oracle request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub [u8; 32]);

impl RequestId {
    /// Derive a request id from an issuer namespace and a monotonically
    /// increasing nonce.
    pub fn derive(namespace: &[u8], nonce: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(namespace);
        hasher.update(nonce.to_be_bytes());
        let mut id = [0u8; 32];
        id.copy_from_slice(&hasher.finalize());
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", short_hex(&self.0))
    }
}

/// Handle binding a session to its generated question set. The compute
/// oracle and the off-chain content store understand it; the engine never
/// sees question text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentRef(pub [u8; 32]);

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", short_hex(&self.0))
    }
}

/// Unique id of one session instance, used for correlating events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// QUIZ token amount in the smallest currency unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QuizTokens(u64);

impl QuizTokens {
    pub const ZERO: QuizTokens = QuizTokens(0);

    pub fn new(amount: u64) -> Self {
        Self(amount)
    }

    pub fn amount(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: QuizTokens) -> Result<QuizTokens> {
        self.0
            .checked_add(other.0)
            .map(QuizTokens)
            .ok_or_else(|| Error::ArithmeticOverflow(format!("{} + {}", self.0, other.0)))
    }

    pub fn checked_sub(self, other: QuizTokens) -> Result<QuizTokens> {
        self.0
            .checked_sub(other.0)
            .map(QuizTokens)
            .ok_or_else(|| Error::ArithmeticOverflow(format!("{} - {}", self.0, other.0)))
    }
}

impl fmt::Display for QuizTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} QUIZ", self.0)
    }
}

impl From<u64> for QuizTokens {
    fn from(amount: u64) -> Self {
        Self(amount)
    }
}

/// Allowed topic vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Topic {
    Science,
    History,
    Geography,
    Literature,
    Mathematics,
    Technology,
    Sports,
    Music,
    Art,
    Cinema,
    Nature,
    Economics,
}

impl Topic {
    pub const ALL: [Topic; TOPIC_COUNT] = [
        Topic::Science,
        Topic::History,
        Topic::Geography,
        Topic::Literature,
        Topic::Mathematics,
        Topic::Technology,
        Topic::Sports,
        Topic::Music,
        Topic::Art,
        Topic::Cinema,
        Topic::Nature,
        Topic::Economics,
    ];

    /// Stable wire code
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Topic> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Topic::Science => "science",
            Topic::History => "history",
            Topic::Geography => "geography",
            Topic::Literature => "literature",
            Topic::Mathematics => "mathematics",
            Topic::Technology => "technology",
            Topic::Sports => "sports",
            Topic::Music => "music",
            Topic::Art => "art",
            Topic::Cinema => "cinema",
            Topic::Nature => "nature",
            Topic::Economics => "economics",
        }
    }

    pub fn parse(name: &str) -> Option<Topic> {
        let name = name.trim().to_lowercase();
        Self::ALL.iter().copied().find(|t| t.name() == name)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Answer submitted for the current question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnswerOption {
    /// Zero-based option index, `< OPTIONS_PER_QUESTION`
    Choice(u8),
    /// Reserved "timed out / skipped" sentinel, always scored incorrect
    Skipped,
}

impl AnswerOption {
    /// Decode the wire byte, rejecting indices outside the option range.
    pub fn from_wire(value: u8) -> Result<Self> {
        match value {
            SKIPPED_ANSWER_WIRE => Ok(AnswerOption::Skipped),
            v if v < OPTIONS_PER_QUESTION => Ok(AnswerOption::Choice(v)),
            v => Err(Error::InvalidAnswer(format!(
                "option {} outside 0..{} and not the skip sentinel",
                v, OPTIONS_PER_QUESTION
            ))),
        }
    }

    pub fn to_wire(&self) -> u8 {
        match self {
            AnswerOption::Choice(v) => *v,
            AnswerOption::Skipped => SKIPPED_ANSWER_WIRE,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, AnswerOption::Skipped)
    }

    /// Choices must address an existing option.
    pub fn validate(&self) -> Result<()> {
        match *self {
            AnswerOption::Choice(v) if v >= OPTIONS_PER_QUESTION => Err(Error::InvalidAnswer(
                format!("option {} outside 0..{}", v, OPTIONS_PER_QUESTION),
            )),
            _ => Ok(()),
        }
    }
}
