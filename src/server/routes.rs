use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

use crate::crawler::scheduler::Frequency;
use crate::crawler::task::{validate_url, TaskKind};
use crate::server::AppState;
use crate::server::facade::{not_found_body, status_body};
use crate::storage::schedules::NewSchedule;

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct KeywordStatusQuery {
    pub url: Option<String>,
    pub keyword: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub user_id: String,
    pub url: String,
    pub frequency: String,
    pub next_scrape: Option<DateTime<Utc>>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "message": message.into() }))).into_response()
}

fn internal_error(e: anyhow::Error) -> Response {
    error!("Request failed: {:#}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "message": "Internal server error" }))).into_response()
}

/// Required, non-blank query parameter
fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, Response> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(bad_request(format!("Missing required parameter: {}", name))),
    }
}

/// GET /health
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.metrics.get_metrics().await;
    Json(serde_json::to_value(snapshot).unwrap_or_else(|_| json!({})))
}

/// GET /status?type=&url=
pub async fn job_status(State(state): State<Arc<AppState>>, Query(query): Query<StatusQuery>) -> Response {
    let kind = match required(&query.kind, "type") {
        Ok(kind) => kind,
        Err(response) => return response,
    };
    let kind: TaskKind = match kind.parse() {
        Ok(kind) => kind,
        Err(_) => return bad_request(format!("Unrecognized type: {}", kind)),
    };
    let url = match required(&query.url, "url") {
        Ok(url) => url,
        Err(response) => return response,
    };

    match state.facade.get_status(url, kind).await {
        Ok(Some(status)) => Json(status_body(url, ("type", kind.as_str()), &status)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(not_found_body(url, ("type", kind.as_str())))).into_response(),
        Err(e) => internal_error(e),
    }
}

/// GET /keyword-status?url=&keyword=
pub async fn keyword_status(State(state): State<Arc<AppState>>, Query(query): Query<KeywordStatusQuery>) -> Response {
    let url = match required(&query.url, "url") {
        Ok(url) => url,
        Err(response) => return response,
    };
    let keyword = match required(&query.keyword, "keyword") {
        Ok(keyword) => keyword,
        Err(response) => return response,
    };

    match state.facade.get_keyword_status(url, keyword).await {
        Ok(Some(status)) => Json(status_body(url, ("keyword", keyword), &status)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(not_found_body(url, ("keyword", keyword)))).into_response(),
        Err(e) => internal_error(e),
    }
}

/// POST /schedule/create
pub async fn create_schedule(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateScheduleRequest>,
) -> Response {
    if request.user_id.trim().is_empty() {
        return bad_request("Missing required field: user_id");
    }
    if let Err(e) = validate_url(&request.url) {
        return bad_request(e.to_string());
    }
    let frequency: Frequency = match request.frequency.parse() {
        Ok(frequency) => frequency,
        Err(e) => return bad_request(format!("{}", e)),
    };
    if request.keywords.iter().any(|k| k.trim().is_empty()) {
        return bad_request("Keywords must not be blank");
    }

    let new = NewSchedule {
        owner_id: request.user_id,
        url: request.url.trim().to_string(),
        frequency: frequency.to_string(),
        keywords: request.keywords.into_iter().map(|k| k.trim().to_string()).collect(),
        next_run_at: request.next_scrape,
    };

    match state.store.create(new).await {
        Ok(schedule) => (StatusCode::CREATED, Json(schedule)).into_response(),
        Err(e) => internal_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::task_key;
    use crate::server::facade::StatusFacade;
    use crate::storage::cache::{JobStatus, JobStatusCache, MemoryJobCache};
    use crate::storage::schedules::{MemoryScheduleStore, ScheduleStore};
    use crate::utils::metrics::MetricsCollector;
    use axum::body::to_bytes;
    use std::time::Duration;

    struct Fixture {
        cache: Arc<MemoryJobCache>,
        store: Arc<MemoryScheduleStore>,
        state: Arc<AppState>,
    }

    fn fixture() -> Fixture {
        let cache = Arc::new(MemoryJobCache::new());
        let store = Arc::new(MemoryScheduleStore::new());
        let state = Arc::new(AppState {
            facade: StatusFacade::new(cache.clone()),
            store: store.clone(),
            metrics: MetricsCollector::new(),
        });

        Fixture { cache, store, state }
    }

    async fn body(response: Response) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn status_query(kind: Option<&str>, url: Option<&str>) -> Query<StatusQuery> {
        Query(StatusQuery { kind: kind.map(String::from), url: url.map(String::from) })
    }

    #[tokio::test]
    async fn test_health_check() {
        let json = health_check().await.0;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_status_round_trip() {
        let f = fixture();
        let key = task_key("https://acme.test", TaskKind::ScrapeImages);
        let result = json!(["https://acme.test/a.png"]);

        f.cache.set(&key, &JobStatus::processing(), Duration::from_secs(60)).await.unwrap();
        let (code, json) = body(job_status(
            State(f.state.clone()),
            status_query(Some("scrape-images"), Some("https://acme.test")),
        ).await).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(json["status"], "processing");

        f.cache.set(&key, &JobStatus::completed(result.clone()), Duration::from_secs(60)).await.unwrap();
        let (code, json) = body(job_status(
            State(f.state.clone()),
            status_query(Some("scrape-images"), Some("https://acme.test")),
        ).await).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(json["status"], "completed");
        assert_eq!(json["type"], "scrape-images");
        assert_eq!(json["url"], "https://acme.test");
        assert_eq!(json["result"], result);
    }

    #[tokio::test]
    async fn test_status_miss_is_not_found() {
        let f = fixture();
        let (code, json) = body(job_status(
            State(f.state),
            status_query(Some("scrape"), Some("https://acme.test")),
        ).await).await;

        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(json["message"], "Job not found");
        assert!(json["data"].is_null());
    }

    #[tokio::test]
    async fn test_status_rejects_bad_type_and_missing_url() {
        let f = fixture();

        let (code, json) = body(job_status(
            State(f.state.clone()),
            status_query(Some("crawl-everything"), Some("https://acme.test")),
        ).await).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert!(json["message"].as_str().unwrap().contains("crawl-everything"));

        let (code, _) = body(job_status(State(f.state.clone()), status_query(None, Some("https://acme.test"))).await).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);

        let (code, _) = body(job_status(State(f.state), status_query(Some("scrape"), None)).await).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_keyword_status_echoes_keyword() {
        let f = fixture();
        f.cache.set("https://acme.test-keyword-tea", &JobStatus::completed(json!({ "occurrences": 4 })), Duration::from_secs(60))
            .await
            .unwrap();

        let query = Query(KeywordStatusQuery {
            url: Some("https://acme.test".to_string()),
            keyword: Some("tea".to_string()),
        });
        let (code, json) = body(keyword_status(State(f.state.clone()), query).await).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(json["keyword"], "tea");
        assert_eq!(json["result"]["occurrences"], 4);

        let query = Query(KeywordStatusQuery {
            url: Some("https://acme.test".to_string()),
            keyword: Some("coffee".to_string()),
        });
        let (code, json) = body(keyword_status(State(f.state), query).await).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(json["keyword"], "coffee");
    }

    #[tokio::test]
    async fn test_create_schedule() {
        let f = fixture();
        let request = CreateScheduleRequest {
            user_id: "user-7".to_string(),
            url: "https://acme.test/shop".to_string(),
            frequency: "bi-weekly".to_string(),
            next_scrape: None,
            keywords: vec!["green tea".to_string()],
        };

        let (code, json) = body(create_schedule(State(f.state), Json(request)).await).await;
        assert_eq!(code, StatusCode::CREATED);
        assert_eq!(json["frequency"], "bi-weekly");
        assert_eq!(json["owner_id"], "user-7");

        let due = f.store.due_schedules(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].keywords, vec!["green tea".to_string()]);
    }

    #[tokio::test]
    async fn test_create_schedule_validates() {
        let f = fixture();

        let bad_frequency = CreateScheduleRequest {
            user_id: "user-7".to_string(),
            url: "https://acme.test".to_string(),
            frequency: "hourly".to_string(),
            next_scrape: None,
            keywords: vec![],
        };
        let (code, _) = body(create_schedule(State(f.state.clone()), Json(bad_frequency)).await).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);

        let bad_url = CreateScheduleRequest {
            user_id: "user-7".to_string(),
            url: "ftp://acme.test".to_string(),
            frequency: "daily".to_string(),
            next_scrape: None,
            keywords: vec![],
        };
        let (code, _) = body(create_schedule(State(f.state), Json(bad_url)).await).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);

        assert!(f.store.due_schedules(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let f = fixture();
        f.state.metrics.record_published(2).await;

        let json = metrics(State(f.state)).await.0;
        assert_eq!(json["messages_published"], 2);
    }
}
