//! Error taxonomy shared by the scraper, calculator, store and settlement pipeline

use sea_orm::{DbErr, SqlErr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettlementError {
    /// Any archive-node RPC failure (dial, transport, JSON-RPC error, undecodable reply)
    #[error("Chain call error: {0}")]
    ChainCall(String),

    #[error("Not enough validators: {eligible} eligible, at least {required} required")]
    NotEnoughValidators { eligible: usize, required: usize },

    #[error("Epoch {epoch_index} is not complete yet (current epoch is {current_epoch})")]
    EpochNotComplete { epoch_index: u64, current_epoch: u64 },

    #[error("Co-signing exchange returned an empty raw transaction")]
    EmptySignedTransaction,

    /// Duplicate `Epoch`, `Reward` or `SendRecord`
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Reorg guard tripped twice in a row
    #[error("Chain unstable at height {height}: too close to the epoch boundary")]
    ChainUnstable { height: u64 },

    #[error("Cycle cancelled")]
    Cancelled,
}

impl SettlementError {
    /// Duplicate creation under overlapping cycles means "already done"
    pub fn is_conflict(&self) -> bool {
        matches!(self, SettlementError::Conflict(_))
    }

    pub fn chain(err: impl std::fmt::Display) -> Self {
        SettlementError::ChainCall(err.to_string())
    }

    pub fn gateway(err: impl std::fmt::Display) -> Self {
        SettlementError::Gateway(err.to_string())
    }
}

impl From<DbErr> for SettlementError {
    fn from(err: DbErr) -> Self {
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(msg)) => SettlementError::Conflict(msg),
            _ => SettlementError::Database(err.to_string()),
        }
    }
}

impl From<alloy::transports::TransportError> for SettlementError {
    fn from(err: alloy::transports::TransportError) -> Self {
        SettlementError::ChainCall(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SettlementError>;
