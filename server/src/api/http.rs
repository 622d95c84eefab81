use axum::{
    extract::{Query, State as AxumState},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Instant;
use wagerboard_types::{
    api::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT},
    ErrorResponse, LeaderboardResponse, RacePosition, RaceSnapshot, RaceType,
};

use crate::metrics::LatencySnapshot;
use crate::store::StoreError;
use crate::Wagerboard;

#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct PositionQuery {
    #[serde(default, alias = "userId")]
    uid: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct PageQuery {
    #[serde(default)]
    page: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(ErrorResponse::new(message))).into_response()
}

pub(super) async fn healthz() -> Response {
    Json(HealthzResponse { ok: true }).into_response()
}

fn race_response(
    result: Result<Option<RaceSnapshot>, StoreError>,
    missing: &str,
    failed: &str,
) -> Response {
    match result {
        Ok(Some(snapshot)) => Json(snapshot).into_response(),
        Ok(None) => error(StatusCode::NOT_FOUND, missing),
        Err(err) => {
            tracing::warn!("race lookup failed: {err}");
            error(StatusCode::INTERNAL_SERVER_ERROR, failed)
        }
    }
}

pub(super) async fn current_race(AxumState(wagerboard): AxumState<Arc<Wagerboard>>) -> Response {
    let start = Instant::now();
    let result = wagerboard.store().current_race(RaceType::Monthly).await;
    let response = race_response(
        result,
        "No active wager race found",
        "Failed to fetch current wager race",
    );
    wagerboard.http_metrics().record_current_race(start.elapsed());
    response
}

pub(super) async fn previous_race(AxumState(wagerboard): AxumState<Arc<Wagerboard>>) -> Response {
    let start = Instant::now();
    let result = wagerboard.store().previous_race(RaceType::Monthly).await;
    let response = race_response(
        result,
        "No previous wager race found",
        "Failed to fetch previous wager race",
    );
    wagerboard.http_metrics().record_previous_race(start.elapsed());
    response
}

pub(super) async fn race_position(
    AxumState(wagerboard): AxumState<Arc<Wagerboard>>,
    Query(query): Query<PositionQuery>,
) -> Response {
    let start = Instant::now();
    let response = race_position_response(&wagerboard, query).await;
    wagerboard.http_metrics().record_race_position(start.elapsed());
    response
}

async fn race_position_response(wagerboard: &Wagerboard, query: PositionQuery) -> Response {
    let uid = query.uid.filter(|uid| !uid.is_empty());
    let username = query.username.filter(|name| !name.is_empty());
    if uid.is_none() && username.is_none() {
        return error(StatusCode::BAD_REQUEST, "Either uid or username is required");
    }
    let leaderboard = match wagerboard.leaderboard().await {
        Ok(cached) => cached,
        Err(err) => {
            tracing::warn!("leaderboard unavailable for position lookup: {err}");
            return error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch wager race position",
            );
        }
    };
    match locate(
        &leaderboard.data,
        uid.as_deref(),
        username.as_deref(),
        Utc::now(),
    ) {
        Some(position) => Json(position).into_response(),
        None => error(StatusCode::NOT_FOUND, "User not found in current race"),
    }
}

/// Finds a participant in the monthly ranking by uid or display name.
fn locate(
    leaderboard: &LeaderboardResponse,
    uid: Option<&str>,
    username: Option<&str>,
    now: DateTime<Utc>,
) -> Option<RacePosition> {
    let race_type = RaceType::Monthly;
    let period = race_type.period();
    let mut entries = leaderboard.entries(period)?.to_vec();
    wagerboard_types::sort_by_wagered(&mut entries, period);
    let index = entries.iter().position(|entry| {
        uid.is_some_and(|uid| entry.uid == uid) || username.is_some_and(|name| entry.name == name)
    })?;
    let (start, end) = race_type.period_bounds(now);
    Some(RacePosition {
        position: index as u32 + 1,
        total_participants: entries.len(),
        wager_amount: entries[index].wagered.for_period(period),
        race_type,
        race_title: race_type.title(start),
        end_date: end,
    })
}

pub(super) async fn affiliate_stats(
    AxumState(wagerboard): AxumState<Arc<Wagerboard>>,
    Query(query): Query<PageQuery>,
) -> Response {
    let start = Instant::now();
    let page = query.page.unwrap_or(0);
    let limit = query
        .limit
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .min(MAX_PAGE_LIMIT);
    let data = match wagerboard.leaderboard().await {
        Ok(cached) => cached.data.paginate(page, limit),
        Err(err) => {
            // Empty buckets keep clients rendering while the provider is down.
            tracing::warn!("serving empty leaderboard: {err}");
            LeaderboardResponse::from_entries(Vec::new(), Utc::now())
        }
    };
    wagerboard.http_metrics().record_affiliate_stats(start.elapsed());
    Json(data).into_response()
}

pub(super) async fn ws_metrics(
    headers: HeaderMap,
    AxumState(wagerboard): AxumState<Arc<Wagerboard>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(wagerboard.ws_metrics_snapshot()).into_response()
}

pub(super) async fn http_metrics(
    headers: HeaderMap,
    AxumState(wagerboard): AxumState<Arc<Wagerboard>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(wagerboard.http_metrics_snapshot()).into_response()
}

#[derive(Serialize)]
struct SnapshotMetricsResponse {
    provider: crate::metrics::ProviderMetricsSnapshot,
    snapshot: crate::metrics::SnapshotMetricsSnapshot,
}

pub(super) async fn snapshot_metrics(
    headers: HeaderMap,
    AxumState(wagerboard): AxumState<Arc<Wagerboard>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(SnapshotMetricsResponse {
        provider: wagerboard.provider_metrics_snapshot(),
        snapshot: wagerboard.snapshot_metrics_snapshot(),
    })
    .into_response()
}

pub(super) async fn prometheus_metrics(
    headers: HeaderMap,
    AxumState(wagerboard): AxumState<Arc<Wagerboard>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    let body = render_prometheus_metrics(&wagerboard);
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        body,
    )
        .into_response()
}

fn metrics_auth_error(headers: &HeaderMap) -> Option<StatusCode> {
    let token = std::env::var("METRICS_AUTH_TOKEN").unwrap_or_default();
    check_metrics_token(headers, &token)
}

fn check_metrics_token(headers: &HeaderMap, token: &str) -> Option<StatusCode> {
    if token.is_empty() {
        return None;
    }
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let header_token = headers
        .get("x-metrics-token")
        .and_then(|value| value.to_str().ok());
    if bearer == Some(token) || header_token == Some(token) {
        None
    } else {
        Some(StatusCode::UNAUTHORIZED)
    }
}

fn render_prometheus_metrics(wagerboard: &Wagerboard) -> String {
    let ws = wagerboard.ws_metrics_snapshot();
    let http = wagerboard.http_metrics_snapshot();
    let provider = wagerboard.provider_metrics_snapshot();
    let snapshot = wagerboard.snapshot_metrics_snapshot();

    let mut out = String::new();

    append_histogram(
        &mut out,
        "wagerboard_http_current_race_latency_ms",
        &http.current_race,
    );
    append_histogram(
        &mut out,
        "wagerboard_http_previous_race_latency_ms",
        &http.previous_race,
    );
    append_histogram(
        &mut out,
        "wagerboard_http_race_position_latency_ms",
        &http.race_position,
    );
    append_histogram(
        &mut out,
        "wagerboard_http_affiliate_stats_latency_ms",
        &http.affiliate_stats,
    );
    append_counter(&mut out, "wagerboard_http_reject_origin_total", http.reject_origin);
    append_counter(&mut out, "wagerboard_http_not_found_total", http.not_found);

    append_counter(
        &mut out,
        "wagerboard_ws_connections_opened_total",
        ws.connections_opened,
    );
    append_counter(
        &mut out,
        "wagerboard_ws_connections_closed_total",
        ws.connections_closed,
    );
    append_gauge(
        &mut out,
        "wagerboard_ws_active_connections",
        ws.active_connections,
    );
    append_counter(
        &mut out,
        "wagerboard_ws_messages_delivered_total",
        ws.messages_delivered,
    );
    append_counter(&mut out, "wagerboard_ws_queue_full_total", ws.queue_full);
    append_counter(&mut out, "wagerboard_ws_send_errors_total", ws.send_errors);
    append_counter(&mut out, "wagerboard_ws_send_timeouts_total", ws.send_timeouts);
    append_counter(
        &mut out,
        "wagerboard_ws_heartbeat_timeouts_total",
        ws.heartbeat_timeouts,
    );
    append_counter(
        &mut out,
        "wagerboard_ws_connection_reject_global_total",
        ws.connection_reject_global,
    );
    append_counter(
        &mut out,
        "wagerboard_ws_connection_reject_per_ip_total",
        ws.connection_reject_per_ip,
    );

    append_histogram(
        &mut out,
        "wagerboard_provider_fetch_latency_ms",
        &provider.fetch,
    );
    append_counter(
        &mut out,
        "wagerboard_provider_fetch_failures_total",
        provider.fetch_failures,
    );
    append_counter(
        &mut out,
        "wagerboard_provider_stale_served_total",
        provider.stale_served,
    );

    append_histogram(
        &mut out,
        "wagerboard_snapshot_build_latency_ms",
        &snapshot.build,
    );
    append_counter(
        &mut out,
        "wagerboard_snapshot_races_created_total",
        snapshot.races_created,
    );
    append_counter(
        &mut out,
        "wagerboard_snapshot_races_existing_total",
        snapshot.races_existing,
    );
    append_counter(
        &mut out,
        "wagerboard_snapshot_build_failures_total",
        snapshot.build_failures,
    );
    append_counter(
        &mut out,
        "wagerboard_snapshot_status_transitions_total",
        snapshot.status_transitions,
    );
    append_counter(
        &mut out,
        "wagerboard_live_leaderboard_publishes_total",
        snapshot.leaderboard_publishes,
    );
    append_counter(
        &mut out,
        "wagerboard_live_race_publishes_total",
        snapshot.race_publishes,
    );

    out
}

fn append_counter(out: &mut String, name: &str, value: u64) {
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn append_gauge(out: &mut String, name: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

fn append_histogram(out: &mut String, name: &str, snapshot: &LatencySnapshot) {
    let _ = writeln!(out, "# TYPE {name} histogram");
    let mut cumulative = 0u64;
    for (bucket, count) in snapshot.buckets_ms.iter().zip(snapshot.counts.iter()) {
        cumulative = cumulative.saturating_add(*count);
        let _ = writeln!(out, "{name}_bucket{{le=\"{bucket}\"}} {cumulative}");
    }
    cumulative = cumulative.saturating_add(snapshot.overflow);
    let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(out, "{name}_count {}", snapshot.count);
    let sum = snapshot.avg_ms * snapshot.count as f64;
    let _ = writeln!(out, "{name}_sum {sum}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wagerboard_types::{LeaderboardEntry, WagerTotals};

    fn entry(uid: &str, name: &str, month: f64) -> LeaderboardEntry {
        LeaderboardEntry {
            uid: uid.to_string(),
            name: name.to_string(),
            wagered: WagerTotals {
                this_month: month,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_locate_by_uid_or_name() {
        let now = Utc.with_ymd_and_hms(2025, 3, 17, 12, 0, 0).unwrap();
        let board = LeaderboardResponse::from_entries(
            vec![entry("a", "Alice", 10.0), entry("b", "Bob", 90.0)],
            now,
        );

        let alice = locate(&board, Some("a"), None, now).unwrap();
        assert_eq!(alice.position, 2);
        assert_eq!(alice.total_participants, 2);
        assert_eq!(alice.wager_amount, 10.0);
        assert_eq!(alice.race_title, "Monthly Wager Race - March 2025");
        assert_eq!(alice.end_date, Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap());

        assert_eq!(locate(&board, None, Some("Bob"), now).unwrap().position, 1);
        assert!(locate(&board, Some("zed"), Some("Zed"), now).is_none());
        assert!(locate(&LeaderboardResponse::default(), Some("a"), None, now).is_none());
    }

    #[test]
    fn test_metrics_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(check_metrics_token(&headers, ""), None);
        assert_eq!(
            check_metrics_token(&headers, "secret"),
            Some(StatusCode::UNAUTHORIZED)
        );

        headers.insert("x-metrics-token", HeaderValue::from_static("secret"));
        assert_eq!(check_metrics_token(&headers, "secret"), None);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert_eq!(check_metrics_token(&headers, "secret"), None);
        assert_eq!(
            check_metrics_token(&headers, "other"),
            Some(StatusCode::UNAUTHORIZED)
        );
    }

    #[test]
    fn test_histogram_rendering() {
        let snapshot = LatencySnapshot {
            buckets_ms: vec![1, 10],
            counts: vec![2, 1],
            overflow: 1,
            count: 4,
            avg_ms: 5.0,
            max_ms: 50,
        };
        let mut out = String::new();
        append_histogram(&mut out, "t", &snapshot);
        assert!(out.contains("t_bucket{le=\"1\"} 2\n"));
        assert!(out.contains("t_bucket{le=\"10\"} 3\n"));
        assert!(out.contains("t_bucket{le=\"+Inf\"} 4\n"));
        assert!(out.contains("t_sum 20\n"));
    }
}
