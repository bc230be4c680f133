use std::collections::HashMap;
use std::sync::Mutex;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::info;

use crate::{Invoice, PaymentResult};

fn token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// Mock Lightning client: invoices are paid the moment they are created and
/// payouts always succeed (unless built with `failing()`, which tests use to
/// drive the compensation path).
pub struct MockClient {
    pending: Mutex<HashMap<String, bool>>,
    fail_payouts: bool,
}

impl MockClient {
    pub fn new() -> Self {
        info!("using MOCK lightning client, no real payments");
        MockClient {
            pending: Mutex::new(HashMap::new()),
            fail_payouts: false,
        }
    }

    /// Mock whose payouts are declined.
    pub fn failing() -> Self {
        MockClient {
            pending: Mutex::new(HashMap::new()),
            fail_payouts: true,
        }
    }

    pub fn create_invoice(&self, amount_sats: u64) -> Invoice {
        let payment_hash = format!("mock_{}", token(32));
        let payment_request = format!("lnbc{amount_sats}mock1{}", token(64));
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(payment_hash.clone(), true);
        info!(amount_sats, payment_hash = %payment_hash, "[mock] created invoice");
        Invoice {
            payment_hash,
            payment_request,
            amount_sats,
            expires_in_secs: Some(3600),
        }
    }

    pub fn check_payment(&self, payment_hash: &str) -> bool {
        *self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(payment_hash)
            .unwrap_or(&true)
    }

    pub fn pay_lnurl(&self, destination: &str, amount_sats: u64) -> PaymentResult {
        if self.fail_payouts {
            info!(destination, amount_sats, "[mock] payout declined");
            return PaymentResult::failed("mock payout failure".into());
        }
        info!(destination, amount_sats, "[mock] payout sent");
        PaymentResult::paid(format!("mock_out_{}", token(32)))
    }

    pub fn balance(&self) -> u64 {
        // Bottomless wallet in mock mode.
        u64::MAX / 2
    }
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}
