//! Lightning payment capability: invoice creation, payment checks, and
//! LNURL payouts. Two variants exist behind one enum — a Strike-style REST
//! client for production and a mock for development and tests — selected by
//! configuration at startup. Callers depend only on the enum's methods.

use thiserror::Error as ThisError;

mod mock;
mod strike;

pub use mock::MockClient;
pub use strike::StrikeClient;

#[derive(Debug, ThisError)]
pub enum LightningError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected provider response: {0}")]
    Protocol(String),
}

/// An invoice awaiting payment. `payment_hash` is the provider's tracking
/// id and doubles as the session correlation key.
#[derive(Clone, Debug)]
pub struct Invoice {
    pub payment_hash: String,
    /// BOLT11 payment request presented to the player.
    pub payment_request: String,
    pub amount_sats: u64,
    pub expires_in_secs: Option<u64>,
}

/// Outcome of an outbound payout attempt. Failure is an expected result
/// here, not an error: the caller compensates and carries on.
#[derive(Clone, Debug)]
pub struct PaymentResult {
    pub success: bool,
    pub payment_hash: Option<String>,
    pub error: Option<String>,
}

impl PaymentResult {
    pub fn paid(payment_hash: String) -> Self {
        PaymentResult {
            success: true,
            payment_hash: Some(payment_hash),
            error: None,
        }
    }

    pub fn failed(error: String) -> Self {
        PaymentResult {
            success: false,
            payment_hash: None,
            error: Some(error),
        }
    }
}

pub enum Lightning {
    Mock(MockClient),
    Strike(StrikeClient),
}

impl Lightning {
    pub fn is_mock(&self) -> bool {
        matches!(self, Lightning::Mock(_))
    }

    pub async fn create_invoice(
        &self,
        amount_sats: u64,
        memo: &str,
    ) -> Result<Invoice, LightningError> {
        match self {
            Lightning::Mock(client) => Ok(client.create_invoice(amount_sats)),
            Lightning::Strike(client) => client.create_invoice(amount_sats, memo).await,
        }
    }

    pub async fn check_payment(&self, payment_hash: &str) -> Result<bool, LightningError> {
        match self {
            Lightning::Mock(client) => Ok(client.check_payment(payment_hash)),
            Lightning::Strike(client) => client.check_payment(payment_hash).await,
        }
    }

    /// Pay `amount_sats` to a Lightning address or LNURL. Never returns an
    /// `Err` for a declined payment — that is a `PaymentResult` with
    /// `success == false`.
    pub async fn pay_lnurl(&self, destination: &str, amount_sats: u64) -> PaymentResult {
        match self {
            Lightning::Mock(client) => client.pay_lnurl(destination, amount_sats),
            Lightning::Strike(client) => client.pay_lnurl(destination, amount_sats).await,
        }
    }

    pub async fn balance(&self) -> Result<u64, LightningError> {
        match self {
            Lightning::Mock(client) => Ok(client.balance()),
            Lightning::Strike(client) => client.balance().await,
        }
    }
}

/// Syntactic check of a payout destination: either a Lightning address
/// (`name@domain.tld`) or a bech32 LNURL (`lnurl1…`). Runs before any pool
/// mutation so a doomed payout never drains anything.
pub fn is_payable_destination(destination: &str) -> bool {
    let destination = destination.trim();
    if destination.is_empty() || !destination.is_ascii() {
        return false;
    }
    if destination.len() >= 6 && destination[..6].eq_ignore_ascii_case("lnurl1") {
        return true;
    }
    let Some((local, domain)) = destination.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}
