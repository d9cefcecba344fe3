use alloy::primitives::TxHash;
use thiserror::Error;

pub type Result<T, E = LotteryError> = std::result::Result<T, E>;

/// Everything the client can report to a user. None of these are fatal: each
/// one maps to a recoverable UI state.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LotteryError {
    #[error("no wallet provider is available")]
    WalletUnavailable,
    #[error("wallet access request was declined")]
    UserRejected,
    #[error("wallet error: {0}")]
    Wallet(String),
    #[error("contract read failed: {0}")]
    ReadFailure(String),
    #[error("no connected wallet to sign with")]
    NoSigner,
    #[error("transaction was not submitted: {0}")]
    SubmissionRejected(String),
    #[error("transaction {0} reverted on-chain")]
    TransactionReverted(TxHash),
    #[error("failed to attach event listener: {0}")]
    ListenerAttachError(String),
}

/// Failures talking to the chain node.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("{method} failed: {message}")]
    Call {
        method: &'static str,
        message: String,
    },
    #[error("{method} returned {value}, which does not fit in u64")]
    OutOfRange { method: &'static str, value: String },
    #[error("invalid RPC URL {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("event stream error: {0}")]
    Stream(String),
}

impl ChainError {
    pub fn call(method: &'static str, err: impl std::fmt::Display) -> Self {
        ChainError::Call {
            method,
            message: err.to_string(),
        }
    }
}

/// Failures reported by a wallet provider or signer.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WalletError {
    #[error("no wallet is available")]
    Unavailable,
    #[error("request declined by the user")]
    Rejected,
    #[error("{0}")]
    Failed(String),
}

impl WalletError {
    /// Mapping used while requesting account access.
    pub(crate) fn into_access_error(self) -> LotteryError {
        match self {
            WalletError::Unavailable => LotteryError::WalletUnavailable,
            WalletError::Rejected => LotteryError::UserRejected,
            WalletError::Failed(message) => LotteryError::Wallet(message),
        }
    }

    /// Mapping used while asking a signer to submit a transaction.
    pub(crate) fn into_submission_error(self) -> LotteryError {
        match self {
            WalletError::Unavailable => LotteryError::NoSigner,
            WalletError::Rejected => {
                LotteryError::SubmissionRejected("declined by the wallet".to_string())
            }
            WalletError::Failed(message) => LotteryError::SubmissionRejected(message),
        }
    }
}
