//! Token custody for StakeQuiz
//!
//! The engine only needs four fungible-asset operations: pull a stake into
//! custody, push tokens back out, and read balances/allowances. Both moves
//! either complete fully or fail without touching any balance.
//!
//! `TokenLedger` is the in-process implementation: accounts, ERC20-style
//! allowances toward the custody vault, and an append-only transaction log
//! used to audit stake conservation.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::{short_hex, ParticipantId, QuizTokens};

/// Well-known account holding staked tokens
pub const VAULT_ADDRESS: ParticipantId = [0xFFu8; 32];

/// Fungible-asset operations consumed by the session engine
pub trait TokenCustody: Send + Sync {
    /// Account whose allowance `transfer_in` spends
    fn custodian(&self) -> ParticipantId;

    fn balance_of(&self, account: &ParticipantId) -> QuizTokens;

    fn allowance(&self, owner: &ParticipantId, spender: &ParticipantId) -> QuizTokens;

    /// Pull `amount` from `from` into custody, consuming allowance.
    fn transfer_in(&self, from: &ParticipantId, amount: QuizTokens) -> Result<()>;

    /// Push `amount` out of custody to `to`.
    fn transfer_out(&self, to: &ParticipantId, amount: QuizTokens) -> Result<()>;
}

/// Token transaction types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Mint { to: ParticipantId, amount: u64 },
    Approve { owner: ParticipantId, spender: ParticipantId, amount: u64 },
    CustodyIn { from: ParticipantId, amount: u64 },
    CustodyOut { to: ParticipantId, amount: u64 },
}

/// Token transaction record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransaction {
    pub sequence: u64,
    pub transaction_type: TransactionType,
}

/// Account information
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: u64,
    pub allowances: HashMap<ParticipantId, u64>,
    pub transaction_count: u64,
}

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<ParticipantId, Account>,
    transactions: Vec<TokenTransaction>,
    total_supply: u64,
}

impl LedgerState {
    fn record(&mut self, transaction_type: TransactionType) {
        let sequence = self.transactions.len() as u64;
        self.transactions.push(TokenTransaction {
            sequence,
            transaction_type,
        });
    }
}

/// Ledger statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerStats {
    pub total_accounts: usize,
    pub total_transactions: usize,
    pub total_supply: u64,
    pub vault_balance: u64,
}

/// In-memory token ledger with a single custody vault
pub struct TokenLedger {
    state: RwLock<LedgerState>,
    vault: ParticipantId,
}

impl Default for TokenLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::with_vault(VAULT_ADDRESS)
    }

    pub fn with_vault(vault: ParticipantId) -> Self {
        Self {
            state: RwLock::new(LedgerState::default()),
            vault,
        }
    }

    /// Create tokens in `to`'s account
    pub fn mint(&self, to: ParticipantId, amount: QuizTokens) -> Result<()> {
        let mut state = self.state.write();
        let supply = state
            .total_supply
            .checked_add(amount.amount())
            .ok_or_else(|| Error::ArithmeticOverflow("total supply".to_string()))?;
        let account = state.accounts.entry(to).or_default();
        account.balance = account
            .balance
            .checked_add(amount.amount())
            .ok_or_else(|| Error::ArithmeticOverflow("account balance".to_string()))?;
        account.transaction_count += 1;
        state.total_supply = supply;
        state.record(TransactionType::Mint {
            to,
            amount: amount.amount(),
        });

        debug!(account = %short_hex(&to), %amount, "minted");
        Ok(())
    }

    /// Authorise `spender` to pull up to `amount` from `owner`
    pub fn approve(&self, owner: ParticipantId, spender: ParticipantId, amount: QuizTokens) {
        let mut state = self.state.write();
        let account = state.accounts.entry(owner).or_default();
        account.allowances.insert(spender, amount.amount());
        account.transaction_count += 1;
        state.record(TransactionType::Approve {
            owner,
            spender,
            amount: amount.amount(),
        });
    }

    /// Balance held in custody
    pub fn vault_balance(&self) -> QuizTokens {
        self.balance_of(&self.vault)
    }

    pub fn transactions(&self) -> Vec<TokenTransaction> {
        self.state.read().transactions.clone()
    }

    /// Net tokens moved into custody from `account` (in minus out).
    pub fn net_custody_flow(&self, account: &ParticipantId) -> i128 {
        self.state
            .read()
            .transactions
            .iter()
            .map(|tx| match &tx.transaction_type {
                TransactionType::CustodyIn { from, amount } if from == account => *amount as i128,
                TransactionType::CustodyOut { to, amount } if to == account => -(*amount as i128),
                _ => 0,
            })
            .sum()
    }

    pub fn get_stats(&self) -> LedgerStats {
        let state = self.state.read();
        LedgerStats {
            total_accounts: state.accounts.len(),
            total_transactions: state.transactions.len(),
            total_supply: state.total_supply,
            vault_balance: state
                .accounts
                .get(&self.vault)
                .map(|a| a.balance)
                .unwrap_or(0),
        }
    }
}

impl TokenCustody for TokenLedger {
    fn custodian(&self) -> ParticipantId {
        self.vault
    }

    fn balance_of(&self, account: &ParticipantId) -> QuizTokens {
        QuizTokens::new(
            self.state
                .read()
                .accounts
                .get(account)
                .map(|a| a.balance)
                .unwrap_or(0),
        )
    }

    fn allowance(&self, owner: &ParticipantId, spender: &ParticipantId) -> QuizTokens {
        QuizTokens::new(
            self.state
                .read()
                .accounts
                .get(owner)
                .and_then(|a| a.allowances.get(spender).copied())
                .unwrap_or(0),
        )
    }

    fn transfer_in(&self, from: &ParticipantId, amount: QuizTokens) -> Result<()> {
        let mut state = self.state.write();
        let vault = self.vault;

        // Validate everything before the first write
        let account = state
            .accounts
            .get(from)
            .ok_or_else(|| Error::InsufficientBalance(format!("{} has no account", short_hex(from))))?;
        if account.balance < amount.amount() {
            return Err(Error::InsufficientBalance(format!(
                "{} holds {} but stake is {}",
                short_hex(from),
                account.balance,
                amount
            )));
        }
        let allowance = account.allowances.get(&vault).copied().unwrap_or(0);
        if allowance < amount.amount() {
            return Err(Error::InsufficientAllowance(format!(
                "{} approved {} but stake is {}",
                short_hex(from),
                allowance,
                amount
            )));
        }
        let vault_balance = state
            .accounts
            .get(&vault)
            .map(|a| a.balance)
            .unwrap_or(0)
            .checked_add(amount.amount())
            .ok_or_else(|| Error::ArithmeticOverflow("vault balance".to_string()))?;

        if let Some(account) = state.accounts.get_mut(from) {
            account.balance -= amount.amount();
            account.allowances.insert(vault, allowance - amount.amount());
            account.transaction_count += 1;
        }
        state.accounts.entry(vault).or_default().balance = vault_balance;
        state.record(TransactionType::CustodyIn {
            from: *from,
            amount: amount.amount(),
        });

        info!(from = %short_hex(from), %amount, "stake moved into custody");
        Ok(())
    }

    fn transfer_out(&self, to: &ParticipantId, amount: QuizTokens) -> Result<()> {
        let mut state = self.state.write();
        let vault = self.vault;

        let vault_balance = state.accounts.get(&vault).map(|a| a.balance).unwrap_or(0);
        if vault_balance < amount.amount() {
            return Err(Error::InsufficientBalance(format!(
                "vault holds {} but payout is {}",
                vault_balance, amount
            )));
        }
        let recipient_balance = state
            .accounts
            .get(to)
            .map(|a| a.balance)
            .unwrap_or(0)
            .checked_add(amount.amount())
            .ok_or_else(|| Error::ArithmeticOverflow("recipient balance".to_string()))?;

        state.accounts.entry(vault).or_default().balance = vault_balance - amount.amount();
        let account = state.accounts.entry(*to).or_default();
        account.balance = recipient_balance;
        account.transaction_count += 1;
        state.record(TransactionType::CustodyOut {
            to: *to,
            amount: amount.amount(),
        });

        info!(to = %short_hex(to), %amount, "tokens released from custody");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: ParticipantId = [1u8; 32];
    const BOB: ParticipantId = [2u8; 32];

    #[test]
    fn test_mint_and_balance() {
        let ledger = TokenLedger::new();
        assert_eq!(ledger.balance_of(&ALICE), QuizTokens::ZERO);

        ledger.mint(ALICE, QuizTokens::new(500)).unwrap();
        assert_eq!(ledger.balance_of(&ALICE).amount(), 500);
        assert_eq!(ledger.get_stats().total_supply, 500);
    }

    #[test]
    fn test_transfer_in_requires_allowance() {
        let ledger = TokenLedger::new();
        ledger.mint(ALICE, QuizTokens::new(500)).unwrap();

        let err = ledger.transfer_in(&ALICE, QuizTokens::new(100)).unwrap_err();
        assert!(matches!(err, Error::InsufficientAllowance(_)));
        assert_eq!(ledger.balance_of(&ALICE).amount(), 500);
        assert_eq!(ledger.vault_balance(), QuizTokens::ZERO);

        ledger.approve(ALICE, VAULT_ADDRESS, QuizTokens::new(100));
        ledger.transfer_in(&ALICE, QuizTokens::new(100)).unwrap();
        assert_eq!(ledger.balance_of(&ALICE).amount(), 400);
        assert_eq!(ledger.vault_balance().amount(), 100);
        assert_eq!(ledger.allowance(&ALICE, &VAULT_ADDRESS), QuizTokens::ZERO);
    }

    #[test]
    fn test_transfer_in_insufficient_balance_is_atomic() {
        let ledger = TokenLedger::new();
        ledger.mint(BOB, QuizTokens::new(50)).unwrap();
        ledger.approve(BOB, VAULT_ADDRESS, QuizTokens::new(1_000));
        let before = ledger.transactions().len();

        let err = ledger.transfer_in(&BOB, QuizTokens::new(51)).unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance(_)));
        assert_eq!(ledger.balance_of(&BOB).amount(), 50);
        assert_eq!(ledger.allowance(&BOB, &VAULT_ADDRESS).amount(), 1_000);
        assert_eq!(ledger.transactions().len(), before);
    }

    #[test]
    fn test_transfer_out_and_net_flow() {
        let ledger = TokenLedger::new();
        ledger.mint(ALICE, QuizTokens::new(100)).unwrap();
        ledger.approve(ALICE, VAULT_ADDRESS, QuizTokens::new(100));
        ledger.transfer_in(&ALICE, QuizTokens::new(100)).unwrap();
        ledger.transfer_out(&ALICE, QuizTokens::new(70)).unwrap();

        assert_eq!(ledger.balance_of(&ALICE).amount(), 70);
        assert_eq!(ledger.vault_balance().amount(), 30);
        assert_eq!(ledger.net_custody_flow(&ALICE), 30);

        assert!(ledger.transfer_out(&ALICE, QuizTokens::new(31)).is_err());
        assert_eq!(ledger.vault_balance().amount(), 30);
    }
}
