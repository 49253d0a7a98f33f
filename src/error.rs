use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::OrderStatus;

/// Errors raised by the sizing, risk and ledger core.
///
/// Policy rejections from the risk gate are *not* errors; they come back as
/// [`crate::risk::Rejection`] data so one bad candidate never aborts a batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Zero or malformed American price (|price| < 100).
    #[error("invalid American price {price}")]
    InvalidPrice { price: i32 },

    #[error("probability {probability} is outside (0, 1)")]
    InvalidProbability { probability: f64 },

    #[error("confidence {confidence} is outside [0, 1]")]
    InvalidConfidence { confidence: f64 },

    #[error("decimal odds {decimal} must be finite and greater than 1")]
    InvalidDecimalOdds { decimal: f64 },

    #[error("stake {stake} must be finite and positive")]
    InvalidStake { stake: f64 },

    #[error("bankroll {bankroll} must be finite and non-negative")]
    InvalidBankroll { bankroll: f64 },

    #[error("stake {stake:.2} exceeds available bankroll {available:.2}")]
    InsufficientBankroll { stake: Decimal, available: Decimal },

    #[error("order {order_id} not found")]
    OrderNotFound { order_id: String },

    #[error("order {order_id} is {status}, expected open")]
    OrderNotOpen { order_id: String, status: OrderStatus },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;
