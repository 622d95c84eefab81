use axum::{
    extract::{Request, State as AxumState},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::Wagerboard;

mod http;
mod ws;

pub struct Api {
    wagerboard: Arc<Wagerboard>,
    origins: OriginConfig,
}

/// Browser origins accepted by the API.
#[derive(Clone, Debug)]
struct OriginConfig {
    allowed_origins: Arc<HashSet<String>>,
    allow_any_origin: bool,
    allow_no_origin: bool,
}

impl OriginConfig {
    fn new(allowed_origins: HashSet<String>, allow_no_origin: bool) -> Self {
        Self {
            allow_any_origin: allowed_origins.contains("*"),
            allowed_origins: Arc::new(allowed_origins),
            allow_no_origin,
        }
    }

    fn from_env() -> Self {
        Self::from_values(
            std::env::var("ALLOWED_HTTP_ORIGINS").ok().as_deref(),
            std::env::var("ALLOW_HTTP_NO_ORIGIN").ok().as_deref(),
        )
    }

    /// An empty origin list accepts every browser origin. Requests without an
    /// `Origin` header (curl, health checks) are accepted
    /// unless `allow_no_origin` is explicitly switched off.
    fn from_values(allowed_origins: Option<&str>, allow_no_origin: Option<&str>) -> Self {
        let mut allowed_origins = parse_allowed_origins(allowed_origins.unwrap_or_default());
        if allowed_origins.is_empty() {
            allowed_origins.insert("*".to_string());
        }
        Self::new(
            allowed_origins,
            allow_no_origin
                .filter(|raw| !raw.trim().is_empty())
                .map_or(true, parse_flag),
        )
    }
}

impl Api {
    /// Origins come from `ALLOWED_HTTP_ORIGINS` (comma separated, empty means
    /// any) and `ALLOW_HTTP_NO_ORIGIN` (on unless set to `0`/`false`/`no`).
    pub fn new(wagerboard: Arc<Wagerboard>) -> Self {
        Self {
            wagerboard,
            origins: OriginConfig::from_env(),
        }
    }

    pub fn with_origins<I, S>(mut self, allowed_origins: I, allow_no_origin: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed_origins = allowed_origins.into_iter().map(Into::into).collect();
        self.origins = OriginConfig::new(allowed_origins, allow_no_origin);
        self
    }

    pub fn router(&self) -> Router {
        let origin_config = self.origins.clone();
        if origin_config.allow_any_origin {
            tracing::warn!("ALLOWED_HTTP_ORIGINS is empty or '*'; all browser origins are allowed");
        } else if origin_config.allowed_origins.is_empty() {
            tracing::warn!("no browser origins allowed");
        }
        let cors_origins = origin_config
            .allowed_origins
            .iter()
            .filter(|origin| *origin != "*")
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!("Invalid origin in ALLOWED_HTTP_ORIGINS: {}", origin);
                    None
                }
            })
            .collect::<Vec<_>>();

        let cors = if origin_config.allow_any_origin {
            CorsLayer::new().allow_origin(AllowOrigin::any())
        } else {
            CorsLayer::new().allow_origin(AllowOrigin::list(cors_origins))
        }
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([header::HeaderName::from_static("x-request-id")]);

        let router = Router::new()
            .route("/healthz", get(http::healthz))
            .route("/api/wager-races/current", get(http::current_race))
            .route("/api/wager-races/previous", get(http::previous_race))
            .route("/api/wager-race/position", get(http::race_position))
            .route("/api/affiliate/stats", get(http::affiliate_stats))
            .route("/ws/leaderboard", get(ws::leaderboard_ws))
            .route("/ws/wager-races", get(ws::wager_races_ws))
            .route("/metrics/ws", get(http::ws_metrics))
            .route("/metrics/http", get(http::http_metrics))
            .route("/metrics/snapshot", get(http::snapshot_metrics))
            .route("/metrics/prometheus", get(http::prometheus_metrics));

        let router = router.layer(cors);
        let router = router.layer(middleware::from_fn(move |req, next| {
            let origin_config = origin_config.clone();
            async move { enforce_origin(origin_config, req, next).await }
        }));
        let router = router.layer(middleware::from_fn_with_state(
            self.wagerboard.clone(),
            request_id_middleware,
        ));
        let router = router.layer(TraceLayer::new_for_http());

        router.with_state(self.wagerboard.clone())
    }
}

fn parse_allowed_origins(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn parse_flag(raw: &str) -> bool {
    !matches!(raw.trim(), "0" | "false" | "FALSE" | "no" | "NO")
}

async fn enforce_origin(config: OriginConfig, req: Request, next: Next) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if let Some(origin) = origin {
        if !config.allow_any_origin && !config.allowed_origins.contains(origin) {
            return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
        }
    } else if !config.allow_no_origin {
        return (StatusCode::FORBIDDEN, "Origin required").into_response();
    }
    next.run(req).await
}

async fn request_id_middleware(
    AxumState(wagerboard): AxumState<Arc<Wagerboard>>,
    req: Request,
    next: Next,
) -> Response {
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
    match response.status() {
        StatusCode::FORBIDDEN => wagerboard.http_metrics().inc_reject_origin(),
        StatusCode::NOT_FOUND => wagerboard.http_metrics().inc_not_found(),
        _ => {}
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wagerboard, StaticSource};
    use crate::ServerConfig;
    use chrono::Utc;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use wagerboard_types::{LiveMessage, RaceType};

    async fn serve(api: Api) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let router = api.router();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        (addr, handle)
    }

    fn leaderboard() -> Value {
        json!([
            { "uid": "a", "name": "Alice", "wagered": { "this_month": 500, "today": 1 } },
            { "uid": "b", "name": "Bob", "wagered": { "this_month": 300, "today": 2 } },
            { "uid": "c", "name": "Cara", "wagered": { "this_month": 100, "today": 3 } }
        ])
    }

    async fn api_with(source: Option<Value>) -> (Arc<Wagerboard>, SocketAddr, tokio::task::JoinHandle<()>) {
        let wagerboard = wagerboard(ServerConfig::default(), StaticSource::new(source)).await;
        let api = Api::new(Arc::clone(&wagerboard)).with_origins(["http://allowed.test"], true);
        let (addr, handle) = serve(api).await;
        (wagerboard, addr, handle)
    }

    async fn read_live(
        socket: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> LiveMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .expect("socket error");
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_healthz_and_request_id() {
        let (_, addr, handle) = api_with(None).await;
        let response = reqwest::Client::new()
            .get(format!("http://{addr}/healthz"))
            .header("x-request-id", "req-1")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.headers()["x-request-id"], "req-1");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({ "ok": true }));
        handle.abort();
    }

    #[tokio::test]
    async fn test_origin_enforcement() {
        let (wagerboard, addr, handle) = api_with(None).await;
        let client = reqwest::Client::new();
        let rejected = client
            .get(format!("http://{addr}/healthz"))
            .header("origin", "http://evil.test")
            .send()
            .await
            .unwrap();
        assert_eq!(rejected.status().as_u16(), 403);
        let allowed = client
            .get(format!("http://{addr}/healthz"))
            .header("origin", "http://allowed.test")
            .send()
            .await
            .unwrap();
        assert_eq!(allowed.status().as_u16(), 200);
        assert_eq!(wagerboard.http_metrics_snapshot().reject_origin, 1);
        handle.abort();
    }

    #[test]
    fn test_origin_config_defaults() {
        let config = OriginConfig::from_values(None, None);
        assert!(config.allow_any_origin);
        assert!(config.allow_no_origin);

        let config = OriginConfig::from_values(Some(" http://a.test , http://b.test "), Some(""));
        assert!(!config.allow_any_origin);
        assert!(config.allow_no_origin);
        assert!(config.allowed_origins.contains("http://b.test"));

        let config = OriginConfig::from_values(Some("http://a.test"), Some("0"));
        assert!(!config.allow_no_origin);
        let config = OriginConfig::from_values(Some("http://a.test"), Some("true"));
        assert!(config.allow_no_origin);
    }

    #[tokio::test]
    async fn test_default_env_serves_requests_without_origin() {
        let wagerboard = wagerboard(ServerConfig::default(), StaticSource::new(None)).await;
        let (addr, handle) = serve(Api::new(Arc::clone(&wagerboard))).await;

        let health = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
        assert_eq!(health.status().as_u16(), 200);
        let current = reqwest::get(format!("http://{addr}/api/wager-races/current"))
            .await
            .unwrap();
        assert_eq!(current.status().as_u16(), 404);
        let body: Value = current.json().await.unwrap();
        assert_eq!(body["message"], "No active wager race found");
        assert_eq!(wagerboard.http_metrics_snapshot().reject_origin, 0);
        handle.abort();
    }

    #[tokio::test]
    async fn test_missing_origin_rejected_when_disabled() {
        let wagerboard = wagerboard(ServerConfig::default(), StaticSource::new(None)).await;
        let api = Api::new(Arc::clone(&wagerboard)).with_origins(["http://allowed.test"], false);
        let (addr, handle) = serve(api).await;

        let response = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
        assert_eq!(response.status().as_u16(), 403);
        assert_eq!(response.text().await.unwrap(), "Origin required");
        handle.abort();
    }

    #[tokio::test]
    async fn test_current_race_missing_is_404_with_message() {
        let (wagerboard, addr, handle) = api_with(None).await;
        let response = reqwest::get(format!("http://{addr}/api/wager-races/current"))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);
        let body: Value = response.json().await.unwrap();
        assert!(!body["message"].as_str().unwrap().is_empty());

        let response = reqwest::get(format!("http://{addr}/api/wager-races/previous"))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);
        assert_eq!(wagerboard.http_metrics_snapshot().not_found, 2);
        handle.abort();
    }

    #[tokio::test]
    async fn test_current_race_after_snapshot() {
        let (wagerboard, addr, handle) = api_with(Some(leaderboard())).await;
        wagerboard
            .builder()
            .build_snapshot(RaceType::Monthly, Utc::now())
            .await
            .unwrap();

        let response = reqwest::get(format!("http://{addr}/api/wager-races/current"))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["type"], "monthly");
        assert_eq!(body["status"], "live");
        assert_eq!(body["participants"][0]["uid"], "a");
        assert_eq!(body["participants"][0]["position"], 1);
        assert_eq!(body["participants"][2]["position"], 3);
        handle.abort();
    }

    #[tokio::test]
    async fn test_race_position() {
        let (_, addr, handle) = api_with(Some(leaderboard())).await;
        let client = reqwest::Client::new();

        let missing = client
            .get(format!("http://{addr}/api/wager-race/position"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status().as_u16(), 400);

        let unknown = client
            .get(format!("http://{addr}/api/wager-race/position?uid=nobody"))
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status().as_u16(), 404);

        let found = client
            .get(format!("http://{addr}/api/wager-race/position?username=Bob"))
            .send()
            .await
            .unwrap();
        assert_eq!(found.status().as_u16(), 200);
        let body: Value = found.json().await.unwrap();
        assert_eq!(body["position"], 2);
        assert_eq!(body["totalParticipants"], 3);
        assert_eq!(body["wagerAmount"], 300.0);
        assert_eq!(body["raceType"], "monthly");
        handle.abort();
    }

    #[tokio::test]
    async fn test_affiliate_stats_paginates_and_falls_back() {
        let (_, addr, handle) = api_with(Some(leaderboard())).await;
        let body: Value = reqwest::get(format!("http://{addr}/api/affiliate/stats?page=1&limit=2"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let monthly = body["data"]["monthly"]["data"].as_array().unwrap();
        assert_eq!(monthly.len(), 1);
        assert_eq!(monthly[0]["uid"], "c");
        assert_eq!(body["metadata"]["totalUsers"], 3);
        handle.abort();

        let (_, addr, handle) = api_with(None).await;
        let response = reqwest::get(format!("http://{addr}/api/affiliate/stats"))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["data"]["monthly"]["data"], json!([]));
        handle.abort();
    }

    #[tokio::test]
    async fn test_metrics_endpoints() {
        let (_, addr, handle) = api_with(None).await;
        for path in ["/metrics/ws", "/metrics/http", "/metrics/snapshot"] {
            let response = reqwest::get(format!("http://{addr}{path}")).await.unwrap();
            assert_eq!(response.status().as_u16(), 200, "{path}");
        }
        let text = reqwest::get(format!("http://{addr}/metrics/prometheus"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(text.contains("wagerboard_ws_active_connections"));
        assert!(text.contains("wagerboard_snapshot_build_latency_ms_count"));
        handle.abort();
    }

    #[tokio::test]
    async fn test_leaderboard_socket_receives_status_then_updates() {
        let (wagerboard, addr, handle) = api_with(Some(leaderboard())).await;
        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/leaderboard"))
            .await
            .unwrap();

        let LiveMessage::ConnectionStatus { connected, client_id } = read_live(&mut socket).await
        else {
            panic!("expected connection status first");
        };
        assert!(connected);
        assert!(!client_id.is_empty());

        // The connection joins the topic right after queueing its status.
        tokio::time::timeout(Duration::from_secs(5), async {
            while wagerboard
                .broadcaster()
                .subscriber_count(wagerboard_types::Topic::Leaderboard)
                == 0
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let mut last_version = None;
        crate::scheduler::tick(&wagerboard, Utc::now(), &mut last_version).await;
        let LiveMessage::LeaderboardUpdate { data } = read_live(&mut socket).await else {
            panic!("expected leaderboard update");
        };
        assert_eq!(data.metadata.total_users, 3);

        drop(socket);
        tokio::time::timeout(Duration::from_secs(5), async {
            while wagerboard.ws_metrics_snapshot().active_connections > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        handle.abort();
    }

    async fn wait_until(what: &str, condition: impl Fn() -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(10), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {what}");
    }

    #[tokio::test]
    async fn test_silent_socket_closed_after_heartbeat_grace() {
        let config = ServerConfig {
            ws_heartbeat_interval_seconds: Some(1),
            ws_heartbeat_grace_seconds: Some(1),
            ..ServerConfig::default()
        };
        let wagerboard = wagerboard(config, StaticSource::new(None)).await;
        let api = Api::new(Arc::clone(&wagerboard)).with_origins(["*"], true);
        let (addr, handle) = serve(api).await;

        // Never read from the socket, so pings are never answered.
        let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/leaderboard"))
            .await
            .unwrap();
        wait_until("connection to open", || {
            wagerboard.ws_metrics_snapshot().connections_opened == 1
        })
        .await;
        wait_until("heartbeat close", || {
            let metrics = wagerboard.ws_metrics_snapshot();
            metrics.heartbeat_timeouts == 1 && metrics.active_connections == 0
        })
        .await;
        assert_eq!(
            wagerboard
                .broadcaster()
                .subscriber_count(wagerboard_types::Topic::Leaderboard),
            0
        );
        drop(socket);
        handle.abort();
    }

    #[tokio::test]
    async fn test_stalled_socket_dropped_after_send_timeout() {
        let config = ServerConfig {
            ws_send_timeout_ms: Some(100),
            ws_outbound_buffer: Some(4096),
            ws_heartbeat_interval_seconds: Some(3600),
            ws_heartbeat_grace_seconds: Some(3600),
            ..ServerConfig::default()
        };
        let wagerboard = wagerboard(config, StaticSource::new(None)).await;
        let api = Api::new(Arc::clone(&wagerboard)).with_origins(["*"], true);
        let (addr, handle) = serve(api).await;

        let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/wager-races"))
            .await
            .unwrap();
        let topic = wagerboard_types::Topic::WagerRaces;
        wait_until("subscriber", || wagerboard.broadcaster().subscriber_count(topic) == 1).await;

        // The client never reads, so socket buffers fill up and writes stall.
        let payload: Arc<str> = "x".repeat(1 << 20).into();
        let stalled = tokio::time::timeout(Duration::from_secs(20), async {
            while wagerboard.ws_metrics_snapshot().send_timeouts == 0 {
                wagerboard.broadcaster().notify(topic, Arc::clone(&payload));
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(stalled.is_ok(), "writes never stalled");

        wait_until("stalled connection to close", || {
            wagerboard.ws_metrics_snapshot().active_connections == 0
        })
        .await;
        let metrics = wagerboard.ws_metrics_snapshot();
        assert_eq!(metrics.send_timeouts, 1);
        assert_eq!(metrics.queue_full, 0);
        assert_eq!(wagerboard.broadcaster().subscriber_count(topic), 0);
        drop(socket);
        handle.abort();
    }

    #[tokio::test]
    async fn test_socket_limit_rejects_before_upgrade() {
        let config = ServerConfig {
            ws_max_connections_per_ip: Some(1),
            ..ServerConfig::default()
        };
        let wagerboard = wagerboard(config, StaticSource::new(None)).await;
        let api = Api::new(Arc::clone(&wagerboard)).with_origins(["*"], true);
        let (addr, handle) = serve(api).await;

        let (_first, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/wager-races"))
            .await
            .unwrap();
        let second = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/wager-races")).await;
        match second {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 429);
            }
            Err(err) => panic!("expected 429, got {err}"),
            Ok(_) => panic!("expected 429, got an upgrade"),
        }
        assert_eq!(wagerboard.ws_metrics_snapshot().connection_reject_per_ip, 1);
        handle.abort();
    }
}
