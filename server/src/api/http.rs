use axum::{
    body::Bytes,
    extract::{Path, Query, State as AxumState},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, info, warn};
use valhalla_types::api::{
    HealthResponse, InvoiceResponse, PlayRequest, PotResponse, SessionResponse, SetAddressRequest,
    StatsResponse, WebhookEvent,
};
use valhalla_types::{api::GameSummary, NewSession, SessionStatus};

use crate::confirm::{confirm_payment, ConfirmError, SessionKey};
use crate::{constant_time_eq, generate_access_token, generate_password, generate_username, Arena};

fn error_response(status: StatusCode, detail: &str) -> Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

fn internal_error(err: impl std::fmt::Display) -> Response {
    error!(%err, "internal error");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

pub(super) async fn create_play_session(
    AxumState(arena): AxumState<Arc<Arena>>,
    Json(body): Json<PlayRequest>,
) -> Response {
    match arena.ledger.count_active_sessions() {
        Ok(count) if count >= arena.config.max_active_sessions => {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "Server is full, please try again later",
            );
        }
        Ok(_) => {}
        Err(err) => return internal_error(err),
    }

    let username = generate_username(&arena.config.user_prefix);
    let password = generate_password();
    let access_token = generate_access_token();

    let invoice = match arena
        .lightning
        .create_invoice(
            arena.config.ante_sats,
            &format!("Valhalla ante - {username}"),
        )
        .await
    {
        Ok(invoice) => invoice,
        Err(err) => {
            error!(%err, "invoice creation failed");
            return error_response(
                StatusCode::BAD_GATEWAY,
                "Failed to create Lightning invoice",
            );
        }
    };

    let session_id = match arena.ledger.create_session(&NewSession {
        username,
        password,
        access_token: access_token.clone(),
        payment_hash: invoice.payment_hash.clone(),
        ante_sats: arena.config.ante_sats,
        lightning_address: body.lightning_address,
        email: body.email,
    }) {
        Ok(id) => id,
        Err(err) => return internal_error(err),
    };
    info!(session_id, "created pending session");

    Json(InvoiceResponse {
        session_id,
        access_token,
        payment_request: invoice.payment_request,
        payment_hash: invoice.payment_hash,
        amount_sats: invoice.amount_sats,
        expires_in_secs: invoice.expires_in_secs,
    })
    .into_response()
}

pub(super) async fn set_payout_address(
    AxumState(arena): AxumState<Arc<Arena>>,
    Path(session_id): Path<i64>,
    Json(body): Json<SetAddressRequest>,
) -> Response {
    let session = match arena.ledger.session(session_id) {
        Ok(Some(session)) => session,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Session not found"),
        Err(err) => return internal_error(err),
    };
    if session.status == SessionStatus::Ended {
        return error_response(StatusCode::BAD_REQUEST, "Session has ended");
    }
    if let Err(err) = arena
        .ledger
        .set_lightning_address(session_id, &body.lightning_address)
    {
        return internal_error(err);
    }
    Json(json!({ "status": "ok", "lightning_address": body.lightning_address })).into_response()
}

#[derive(Deserialize)]
pub(super) struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

pub(super) async fn get_session(
    AxumState(arena): AxumState<Arc<Arena>>,
    Path(session_id): Path<i64>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Response {
    let access_token = bearer_token(&headers).or_else(|| {
        if query.token.is_some() {
            warn!(session_id, "access token in query string, use the Authorization header");
        }
        query.token.clone()
    });

    let mut session = match arena.ledger.session(session_id) {
        Ok(Some(session)) => session,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Session not found"),
        Err(err) => return internal_error(err),
    };

    // Poll path of the confirmation race: if the invoice was paid but the
    // webhook has not landed yet, confirm here. The gate makes the two
    // paths converge on one transition.
    if session.status == SessionStatus::Pending {
        match arena.lightning.check_payment(&session.payment_hash).await {
            Ok(true) => match confirm_payment(&arena, SessionKey::Id(session_id)).await {
                Ok(confirmation) => session = confirmation.session,
                Err(ConfirmError::NotFound) => {
                    return error_response(StatusCode::NOT_FOUND, "Session not found")
                }
                Err(err) => return internal_error(err),
            },
            Ok(false) => {}
            Err(err) => warn!(%err, session_id, "payment check failed"),
        }
    }

    // Credentials require the access token once the session is live.
    if session.status.is_playable()
        && !constant_time_eq(&session.access_token, access_token.as_deref().unwrap_or(""))
    {
        return error_response(StatusCode::FORBIDDEN, "Invalid or missing access token");
    }

    let mut response = SessionResponse {
        id: session.id,
        status: session.status,
        username: None,
        password: None,
        ssh_command: None,
        lightning_address: session.lightning_address.clone(),
        ante_sats: session.ante_sats,
        created_at: session.created_at.clone(),
    };
    if session.status.is_playable() {
        response.ssh_command = Some(format!(
            "ssh {}@{}",
            session.username, arena.config.hostname
        ));
        response.username = Some(session.username);
        response.password = Some(session.password);
    }
    Json(response).into_response()
}

pub(super) async fn get_pot(AxumState(arena): AxumState<Arc<Arena>>) -> Response {
    match arena.ledger.pot_balance() {
        Ok(balance_sats) => Json(PotResponse {
            balance_sats,
            ante_sats: arena.config.ante_sats,
        })
        .into_response(),
        Err(err) => internal_error(err),
    }
}

pub(super) async fn get_stats(AxumState(arena): AxumState<Arc<Arena>>) -> Response {
    let summaries = |games: Vec<(valhalla_types::GameOutcome, String)>| {
        games
            .into_iter()
            .map(|(outcome, username)| GameSummary::from_outcome(&outcome, username))
            .collect::<Vec<_>>()
    };
    let result = (|| {
        let stats = arena.ledger.stats()?;
        let recent_games = summaries(arena.ledger.recent_games(10)?);
        let leaderboard = summaries(arena.ledger.leaderboard(10)?);
        let ascensions = summaries(arena.ledger.ascensions()?);
        let pot_balance = arena.ledger.pot_balance()?;
        Ok::<_, valhalla_ledger::LedgerError>(StatsResponse {
            pot_balance,
            total_games: stats.total_games,
            total_ascensions: stats.total_ascensions,
            high_score: stats.high_score,
            avg_score: stats.avg_score,
            recent_games,
            leaderboard,
            ascensions,
        })
    })();
    match result {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => internal_error(err),
    }
}

pub(super) async fn health(AxumState(arena): AxumState<Arc<Arena>>) -> Response {
    let pot_balance = arena.ledger.pot_balance().unwrap_or(0);
    let active_sessions = arena.ledger.count_active_sessions().unwrap_or(0);
    Json(HealthResponse {
        status: "ok".to_string(),
        pot_balance,
        active_sessions,
        mock_mode: arena.lightning.is_mock(),
    })
    .into_response()
}

pub(super) async fn metrics_snapshot(AxumState(arena): AxumState<Arc<Arena>>) -> Response {
    Json(arena.metrics.snapshot()).into_response()
}

/// Provider webhook. The envelope only names the invoice; its state is
/// re-checked against the provider before the confirmation gate runs, so a
/// forged or stale event cannot activate anything.
pub(super) async fn payment_webhook(
    AxumState(arena): AxumState<Arc<Arena>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match headers
        .get("webhook-signature")
        .and_then(|value| value.to_str().ok())
    {
        None => {
            // Unsigned deliveries are only acceptable from the mock provider.
            if !arena.lightning.is_mock() {
                warn!("webhook without signature rejected");
                return error_response(StatusCode::UNAUTHORIZED, "Missing signature");
            }
        }
        Some(signature) => {
            if let Some(secret) = &arena.config.webhook_secret {
                let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
                    return internal_error("webhook secret rejected by hmac");
                };
                mac.update(&body);
                let expected = hex::encode(mac.finalize().into_bytes());
                if !constant_time_eq(&expected, signature) {
                    warn!("invalid webhook signature");
                    return error_response(StatusCode::UNAUTHORIZED, "Invalid signature");
                }
            } else {
                warn!("webhook signature present but no webhook secret configured");
            }
        }
    }

    let event: WebhookEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(err) => {
            warn!(%err, "unparseable webhook payload");
            return error_response(StatusCode::BAD_REQUEST, "Invalid JSON payload");
        }
    };
    if event.event_type != "invoice.updated" {
        info!(event_type = %event.event_type, "ignoring webhook event");
        return Json(json!({ "status": "ignored", "reason": event.event_type })).into_response();
    }
    let Some(invoice_id) = event.data.entity_id else {
        return error_response(StatusCode::BAD_REQUEST, "Missing entityId in webhook data");
    };
    info!(invoice_id = %invoice_id, "payment webhook received");

    match arena.lightning.check_payment(&invoice_id).await {
        Ok(true) => {}
        Ok(false) => return Json(json!({ "status": "pending" })).into_response(),
        Err(err) => {
            error!(%err, "payment check failed");
            return error_response(StatusCode::BAD_GATEWAY, "Payment provider unavailable");
        }
    }

    match confirm_payment(&arena, SessionKey::PaymentHash(invoice_id)).await {
        Ok(confirmation) if confirmation.already_processed => {
            Json(json!({ "status": "already_processed" })).into_response()
        }
        Ok(confirmation) => Json(json!({
            "status": "ok",
            "session_id": confirmation.session.id,
            "username": confirmation.session.username,
            "pot_balance": confirmation.pot_balance,
        }))
        .into_response(),
        Err(ConfirmError::NotFound) => error_response(StatusCode::NOT_FOUND, "Session not found"),
        Err(err) => internal_error(err),
    }
}
