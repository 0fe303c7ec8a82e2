//! StakeQuiz - staked trivia sessions settled against two asynchronous oracles
//!
//! A participant stakes QUIZ tokens, a randomness oracle picks the topic set,
//! an off-chain compute oracle generates and grades the questions, and the
//! stake is paid back in proportion to the score. Modules, leaves first:
//!
//! - protocol: identifiers, token amounts, topics and answers
//! - clock: injectable wall clock for lazy timeout checks
//! - config: stake bounds, per-phase timeouts and session shape
//! - token: custody of staked tokens
//! - oracle: randomness and compute oracle clients plus the delivery relay
//! - session: session record, store, settlement and the state machine
//! - events: notifications published for UI and indexing layers

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod oracle;
pub mod protocol;
pub mod session;
pub mod token;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::QuizConfig;
pub use error::{Error, Result};
pub use events::SessionEvent;
pub use oracle::{
    ComputeOracle, LocalComputeOracle, LocalRandomnessOracle, OracleRelay, RandomnessOracle,
};
pub use protocol::{AnswerOption, ContentRef, ParticipantId, QuizTokens, RequestId, Topic};
pub use session::{CallbackOutcome, QuizEngine, Session, SessionPhase};
pub use token::{TokenCustody, TokenLedger, VAULT_ADDRESS};
