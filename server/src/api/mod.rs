//! HTTP/WS surface: router assembly, CORS, rate limits, and request-id
//! tagging.

use axum::{
    extract::Request,
    http::{header, HeaderValue, Method},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use governor::middleware::NoOpMiddleware;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::Arena;

mod http;
mod ws;

type IpGovernorConfig =
    tower_governor::governor::GovernorConfig<SmartIpKeyExtractor, NoOpMiddleware>;

fn per_second_governor(per_second: u64, burst: u32) -> Option<Arc<IpGovernorConfig>> {
    if per_second == 0 || burst == 0 {
        return None;
    }
    let nanos_per_request = (1_000_000_000u64 / per_second).max(1);
    GovernorConfigBuilder::default()
        .period(Duration::from_nanos(nanos_per_request))
        .burst_size(burst)
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .map(Arc::new)
}

fn per_minute_governor(per_minute: u64, burst: u32) -> Option<Arc<IpGovernorConfig>> {
    if per_minute == 0 || burst == 0 {
        return None;
    }
    let nanos_per_request = (60_000_000_000u64 / per_minute).max(1);
    GovernorConfigBuilder::default()
        .period(Duration::from_nanos(nanos_per_request))
        .burst_size(burst)
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .map(Arc::new)
}

pub struct Api {
    arena: Arc<Arena>,
}

impl Api {
    pub fn new(arena: Arc<Arena>) -> Self {
        Api { arena }
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(AllowOrigin::any())
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

        let router = Router::new()
            .route("/api/play/:id/address", post(http::set_payout_address))
            .route("/api/session/:id", get(http::get_session))
            .route("/api/pot", get(http::get_pot))
            .route("/api/stats", get(http::get_stats))
            .route("/api/health", get(http::health))
            .route("/api/metrics", get(http::metrics_snapshot))
            .route("/ws/terminal/:session_id", get(ws::terminal_ws));

        let router = match (
            self.arena.config.http_rate_limit_per_second,
            self.arena.config.http_rate_limit_burst,
        ) {
            (Some(per_second), Some(burst)) => match per_second_governor(per_second, burst) {
                Some(config) => router.layer(GovernorLayer { config }),
                None => router,
            },
            _ => router,
        };

        // Session creation and webhook delivery carry their own limits;
        // both endpoints are reachable without credentials.
        let play_route = match per_minute_governor(5, 5) {
            Some(config) => Router::new()
                .route("/api/play", post(http::create_play_session))
                .layer(GovernorLayer { config }),
            None => Router::new().route("/api/play", post(http::create_play_session)),
        };
        let webhook_route = match per_minute_governor(100, 20) {
            Some(config) => Router::new()
                .route("/api/webhook/payment", post(http::payment_webhook))
                .layer(GovernorLayer { config }),
            None => Router::new().route("/api/webhook/payment", post(http::payment_webhook)),
        };
        let router = router.merge(play_route).merge(webhook_route);

        router
            .layer(cors)
            .layer(middleware::from_fn(request_id_middleware))
            .layer(TraceLayer::new_for_http())
            .with_state(self.arena.clone())
    }
}

async fn request_id_middleware(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(header::HeaderName::from_static("x-request-id"))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let mut response = next.run(req).await;
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(
            header::HeaderName::from_static("x-request-id"),
            header_value,
        );
    }
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "http.request"
    );
    response
}
