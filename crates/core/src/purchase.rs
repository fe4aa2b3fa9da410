use thiserror::Error;

use crate::points::Points;

/// Business-rule rejections of a purchase. Neither one mutates any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PurchaseRejection {
    #[error("insufficient funds")]
    InsufficientFunds { balance: Points, price: Points },
    #[error("already subscribed")]
    AlreadySubscribed,
}

impl PurchaseRejection {
    /// Returns the label used for metrics and problem types.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::AlreadySubscribed => "already_subscribed",
        }
    }
}

/// Accepted purchase: the price to debit and the balance left afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurchaseQuote {
    pub price: Points,
    pub remaining: Points,
}

/// Decides whether a user holding `balance` may buy a course costing `price`.
///
/// Funds are checked before the existing-subscription rule, so a user who is
/// both broke and already subscribed is told about the funds.
pub fn check_purchase(
    balance: Points,
    price: Points,
    already_subscribed: bool,
) -> Result<PurchaseQuote, PurchaseRejection> {
    let insufficient = PurchaseRejection::InsufficientFunds { balance, price };
    if balance < price {
        return Err(insufficient);
    }

    if already_subscribed {
        return Err(PurchaseRejection::AlreadySubscribed);
    }

    let remaining = balance.checked_sub(price).ok_or(insufficient)?;
    Ok(PurchaseQuote { price, remaining })
}
