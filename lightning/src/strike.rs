use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::{Invoice, LightningError, PaymentResult};

const DEFAULT_BASE_URL: &str = "https://api.strike.me/v1";

fn sats_to_btc(amount_sats: u64) -> String {
    format!("{:.8}", amount_sats as f64 / 100_000_000.0)
}

#[derive(Deserialize)]
struct CreatedInvoice {
    #[serde(rename = "invoiceId")]
    invoice_id: String,
}

#[derive(Deserialize)]
struct InvoiceQuote {
    #[serde(rename = "lnInvoice")]
    ln_invoice: String,
    #[serde(rename = "expirationInSec")]
    expiration_in_sec: Option<u64>,
}

#[derive(Deserialize)]
struct InvoiceState {
    state: String,
}

#[derive(Deserialize)]
struct PaymentQuote {
    #[serde(rename = "paymentQuoteId")]
    payment_quote_id: String,
}

#[derive(Deserialize)]
struct ExecutedPayment {
    #[serde(rename = "paymentId")]
    payment_id: Option<String>,
}

#[derive(Deserialize)]
struct Balance {
    currency: String,
    available: Option<String>,
}

/// Strike REST client. Invoice creation takes two calls (create, then
/// quote); LNURL payouts take two calls (quote, then execute). Amounts on
/// the wire are BTC strings; everything here is sats.
pub struct StrikeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl StrikeClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        StrikeClient {
            http: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.bearer_auth(&self.api_key)
    }

    pub async fn create_invoice(
        &self,
        amount_sats: u64,
        memo: &str,
    ) -> Result<Invoice, LightningError> {
        let correlation_id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        let body = json!({
            "correlationId": correlation_id,
            "description": memo,
            "amount": { "amount": sats_to_btc(amount_sats), "currency": "BTC" },
        });
        let created: CreatedInvoice = self
            .auth(self.http.post(format!("{}/invoices", self.base_url)))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        info!(invoice_id = %created.invoice_id, amount_sats, "created strike invoice");

        let quote: InvoiceQuote = self
            .auth(self.http.post(format!(
                "{}/invoices/{}/quote",
                self.base_url, created.invoice_id
            )))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(Invoice {
            payment_hash: created.invoice_id,
            payment_request: quote.ln_invoice,
            amount_sats,
            expires_in_secs: quote.expiration_in_sec,
        })
    }

    pub async fn check_payment(&self, payment_hash: &str) -> Result<bool, LightningError> {
        let response = self
            .auth(
                self.http
                    .get(format!("{}/invoices/{}", self.base_url, payment_hash)),
            )
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let state: InvoiceState = response.error_for_status()?.json().await?;
        Ok(state.state == "PAID")
    }

    /// Full invoice details, used by the webhook handler to re-check state
    /// before trusting the event.
    pub async fn invoice_state(&self, invoice_id: &str) -> Result<Option<String>, LightningError> {
        let response = self
            .auth(
                self.http
                    .get(format!("{}/invoices/{}", self.base_url, invoice_id)),
            )
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let state: InvoiceState = response.error_for_status()?.json().await?;
        Ok(Some(state.state))
    }

    pub async fn pay_lnurl(&self, destination: &str, amount_sats: u64) -> PaymentResult {
        let body = json!({
            "lnUrlOrAddress": destination,
            "sourceCurrency": "BTC",
            "amount": { "amount": sats_to_btc(amount_sats), "currency": "BTC" },
        });
        let quote = match self
            .auth(self.http.post(format!(
                "{}/payment-quotes/lightning/lnurl",
                self.base_url
            )))
            .json(&body)
            .send()
            .await
        {
            Ok(response) => match Self::read_or_decline::<PaymentQuote>(response).await {
                Ok(quote) => quote,
                Err(result) => return result,
            },
            Err(err) => {
                error!(%err, "strike payment quote request failed");
                return PaymentResult::failed(err.to_string());
            }
        };
        info!(quote_id = %quote.payment_quote_id, "created strike payment quote");

        let executed = match self
            .auth(self.http.patch(format!(
                "{}/payment-quotes/{}/execute",
                self.base_url, quote.payment_quote_id
            )))
            .send()
            .await
        {
            Ok(response) => match Self::read_or_decline::<ExecutedPayment>(response).await {
                Ok(executed) => executed,
                Err(result) => return result,
            },
            Err(err) => {
                error!(%err, "strike payment execution request failed");
                return PaymentResult::failed(err.to_string());
            }
        };

        let payment_id = executed
            .payment_id
            .unwrap_or(quote.payment_quote_id);
        info!(payment_id = %payment_id, amount_sats, "strike payment executed");
        PaymentResult::paid(payment_id)
    }

    /// Decode a 2xx body, or convert an error status into a declined
    /// `PaymentResult` carrying the provider's message.
    async fn read_or_decline<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, PaymentResult> {
        if response.status().is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|err| PaymentResult::failed(err.to_string()));
        }
        let status = response.status();
        let detail = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|value| {
                value
                    .get("message")
                    .and_then(|message| message.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| format!("provider returned {status}"));
        error!(%status, %detail, "strike payout declined");
        Err(PaymentResult::failed(detail))
    }

    pub async fn balance(&self) -> Result<u64, LightningError> {
        let balances: Vec<Balance> = self
            .auth(self.http.get(format!("{}/balances", self.base_url)))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        for balance in balances {
            if balance.currency == "BTC" {
                let available = balance
                    .available
                    .as_deref()
                    .unwrap_or("0")
                    .parse::<f64>()
                    .map_err(|err| LightningError::Protocol(err.to_string()))?;
                return Ok((available * 100_000_000.0) as u64);
            }
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sats_convert_to_btc_strings() {
        assert_eq!(sats_to_btc(100_000_000), "1.00000000");
        assert_eq!(sats_to_btc(1000), "0.00001000");
        assert_eq!(sats_to_btc(0), "0.00000000");
    }
}
