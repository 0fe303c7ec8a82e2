//! Staked quiz sessions
//!
//! - `state`: the session record, its phases and pure transition helpers
//! - `store`: participant-keyed arena with the live request index
//! - `settlement`: reward and refund arithmetic plus the token movement
//! - `engine`: the state machine driving all of the above

pub mod engine;
pub mod settlement;
pub mod state;
pub mod store;

pub use engine::{CallbackOutcome, EngineStats, IgnoreReason, QuizEngine};
pub use settlement::{compute_reward, CancelReceipt, RewardQuote, SettlementReceipt};
pub use state::{OutstandingRequest, PendingTask, Session, SessionPhase};
pub use store::{RequestKey, SessionStore, StoreUpdate};
