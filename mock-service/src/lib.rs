//! Stand-in for the test-paper API the load scripts exercise, plus a few knobs for tests.
use axum::{
    debug_handler,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use lazy_static::lazy_static;
use metrics::counter;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

#[derive(Clone, Default)]
pub struct AppState {
    papers: Arc<Mutex<Vec<Paper>>>,
    next_id: Arc<AtomicU64>,
    /// Mean latency of the generate endpoint.
    generate_latency: Duration,
}

impl AppState {
    pub fn with_generate_latency(latency: Duration) -> Self {
        Self {
            generate_latency: latency,
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub paper_name: String,
    pub course_id: u64,
    pub generation_method: String,
    pub total_questions: u32,
    pub duration_minutes: u32,
    pub total_score: u32,
    #[serde(default)]
    pub question_types: Vec<String>,
    #[serde(default)]
    pub knowledge_point_ids: Vec<u64>,
    #[serde(default)]
    pub difficulty_question_counts: HashMap<String, u32>,
    #[serde(default)]
    pub difficulty_weights: HashMap<String, u32>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Paper {
    pub id: u64,
    pub paper_name: String,
    pub course_id: u64,
    pub total_questions: u32,
    pub total_score: u32,
    pub duration_minutes: u32,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    page: usize,
    #[serde(default = "default_page_size")]
    size: usize,
    #[serde(default)]
    search: String,
}

fn default_page_size() -> usize {
    12
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/test-papers", get(list))
        .route("/api/test-papers/generate", post(generate))
        .route("/api/test-papers/preview", post(preview))
        .route("/delay/ms/:delay_ms", get(delay))
        .route("/status/:code", get(status))
        .route("/limited/:max_tps/delay/ms/:delay_ms", get(limited))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Mock service listening on {}", listener.local_addr()?);
    axum::serve(listener, router(AppState::default())).await?;
    Ok(())
}

/// Serve on an ephemeral local port in the background.
pub async fn spawn(state: AppState) -> anyhow::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router(state)).await {
            tracing::error!("Mock service failed: {err}");
        }
    });
    Ok(addr)
}

fn authorized(headers: &HeaderMap) -> Result<(), StatusCode> {
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(value) if value.starts_with("Bearer ") && value.len() > "Bearer ".len() => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

fn validate(req: &GenerateRequest) -> Result<(), StatusCode> {
    if req.paper_name.trim().is_empty() || req.total_questions == 0 {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(())
}

async fn jitter(mean: Duration) {
    if mean.is_zero() {
        return;
    }
    let mean_ms = mean.as_secs_f64() * 1_000.;
    let sampled = match Normal::new(mean_ms, mean_ms / 4.) {
        Ok(normal) => normal.sample(&mut rand::thread_rng()).max(0.),
        Err(_) => mean_ms,
    };
    tokio::time::sleep(Duration::from_secs_f64(sampled / 1_000.)).await;
}

#[debug_handler]
async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<Paper>, StatusCode> {
    counter!("mock_service_requests_total", "endpoint" => "generate").increment(1);
    TPS_MEASURE.fetch_add(1, Ordering::Relaxed);
    authorized(&headers)?;
    validate(&req)?;
    jitter(state.generate_latency).await;

    let paper = Paper {
        id: state.next_id.fetch_add(1, Ordering::Relaxed) + 1,
        paper_name: req.paper_name,
        course_id: req.course_id,
        total_questions: req.total_questions,
        total_score: req.total_score,
        duration_minutes: req.duration_minutes,
    };
    debug!("Generated paper {} ({})", paper.id, req.generation_method);

    if let Ok(mut papers) = state.papers.lock() {
        papers.push(paper.clone());
    }
    Ok(Json(paper))
}

#[debug_handler]
async fn preview(
    headers: HeaderMap,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<Value>, StatusCode> {
    counter!("mock_service_requests_total", "endpoint" => "preview").increment(1);
    TPS_MEASURE.fetch_add(1, Ordering::Relaxed);
    authorized(&headers)?;
    validate(&req)?;

    let types = if req.question_types.is_empty() {
        vec!["SINGLE_CHOICE".to_string()]
    } else {
        req.question_types.clone()
    };
    let questions: Vec<Value> = (0..req.total_questions)
        .map(|i| {
            json!({
                "index": i,
                "type": types[i as usize % types.len()],
                "score": req.total_score / req.total_questions,
            })
        })
        .collect();

    Ok(Json(json!({
        "paperName": req.paper_name,
        "courseId": req.course_id,
        "questions": questions,
    })))
}

#[debug_handler]
async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, StatusCode> {
    counter!("mock_service_requests_total", "endpoint" => "list").increment(1);
    TPS_MEASURE.fetch_add(1, Ordering::Relaxed);
    authorized(&headers)?;

    let papers = state
        .papers
        .lock()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let matching: Vec<&Paper> = papers
        .iter()
        .filter(|p| params.search.is_empty() || p.paper_name.contains(&params.search))
        .collect();
    let content: Vec<&Paper> = matching
        .iter()
        .skip(params.page * params.size)
        .take(params.size)
        .copied()
        .collect();

    Ok(Json(json!({
        "content": content,
        "page": params.page,
        "size": params.size,
        "totalElements": matching.len(),
    })))
}

#[debug_handler]
async fn delay(Path(delay_ms): Path<u64>) {
    counter!("mock_service_requests_total", "endpoint" => "delay").increment(1);
    TPS_MEASURE.fetch_add(1, Ordering::Relaxed);
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
}

#[debug_handler]
async fn status(Path(code): Path<u16>) -> StatusCode {
    TPS_MEASURE.fetch_add(1, Ordering::Relaxed);
    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST)
}

lazy_static! {
    static ref LIMITED_MAP: RwLock<HashMap<u32, Arc<DefaultDirectRateLimiter>>> =
        RwLock::new(HashMap::new());
}

/// Rejects requests beyond `max_tps` with a 503.
#[debug_handler]
async fn limited(Path((max_tps, delay_ms)): Path<(u32, u64)>) -> Result<(), StatusCode> {
    TPS_MEASURE.fetch_add(1, Ordering::Relaxed);
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

    let tps = NonZeroU32::new(max_tps).ok_or(StatusCode::BAD_REQUEST)?;
    let existing = LIMITED_MAP
        .read()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .get(&max_tps)
        .cloned();
    let limiter = match existing {
        Some(limiter) => limiter,
        None => {
            let limiter = Arc::new(rate_limiter(tps));
            LIMITED_MAP
                .write()
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
                .entry(max_tps)
                .or_insert(limiter)
                .clone()
        }
    };

    limiter
        .check()
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

pub fn rate_limiter(tps: NonZeroU32) -> DefaultDirectRateLimiter {
    RateLimiter::direct(Quota::per_second(tps))
}

/** TPS Printer **/

static TPS_MEASURE: AtomicU64 = AtomicU64::new(0);

pub async fn tps_measure_task() {
    loop {
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let requests = TPS_MEASURE.swap(0, Ordering::Relaxed);
        info!("{requests} TPS");
    }
}
