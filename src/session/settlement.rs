//! Reward and refund arithmetic
//!
//! Settlement pays `stake * correct / total`, truncated toward zero. The
//! remainder stays in custody as the house's share; it is reported, never
//! refunded. Cancellation returns the full stake no matter how many
//! questions were already answered.

use serde::{Deserialize, Serialize};

use super::state::Session;
use crate::error::{Error, Result};
use crate::protocol::{ParticipantId, QuizTokens, SessionId};
use crate::token::TokenCustody;

/// Split of a stake at settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardQuote {
    pub reward: QuizTokens,
    pub retained: QuizTokens,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementReceipt {
    pub session_id: SessionId,
    pub participant: ParticipantId,
    pub correct_count: u8,
    pub total_questions: u8,
    pub reward: QuizTokens,
    pub retained: QuizTokens,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReceipt {
    pub session_id: SessionId,
    pub participant: ParticipantId,
    pub caller: ParticipantId,
    pub refund: QuizTokens,
}

/// Proportional reward with truncation toward zero
pub fn compute_reward(stake: QuizTokens, correct: u8, total: u8) -> Result<RewardQuote> {
    if total == 0 {
        return Err(Error::ArithmeticOverflow(
            "reward over zero questions".to_string(),
        ));
    }
    if correct > total {
        return Err(Error::CorruptState(format!(
            "{} correct out of {}",
            correct, total
        )));
    }

    let reward = (stake.amount() as u128 * correct as u128) / total as u128;
    // reward <= stake, so the cast cannot truncate
    let reward = QuizTokens::new(reward as u64);
    let retained = stake.checked_sub(reward)?;

    Ok(RewardQuote { reward, retained })
}

/// Pay out a finished session. Nothing moves when the reward is zero.
pub fn settle(custody: &dyn TokenCustody, session: &Session) -> Result<SettlementReceipt> {
    let quote = compute_reward(session.stake, session.correct_count, session.total_questions)?;

    if !quote.reward.is_zero() {
        custody.transfer_out(&session.participant, quote.reward)?;
    }

    Ok(SettlementReceipt {
        session_id: session.session_id,
        participant: session.participant,
        correct_count: session.correct_count,
        total_questions: session.total_questions,
        reward: quote.reward,
        retained: quote.retained,
    })
}

/// Return the whole stake to the participant
pub fn refund(
    custody: &dyn TokenCustody,
    session: &Session,
    caller: ParticipantId,
) -> Result<CancelReceipt> {
    if !session.stake.is_zero() {
        custody.transfer_out(&session.participant, session.stake)?;
    }

    Ok(CancelReceipt {
        session_id: session.session_id,
        participant: session.participant,
        caller,
        refund: session.stake,
    })
}
