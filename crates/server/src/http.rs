//! HTTP boundary for the kopi backend.
//!
//! Endpoints (all JSON):
//! - `POST /api/chat`       - full agentic pipeline for one question
//! - `GET  /products`       - top-k semantic product search with scores
//! - `GET  /outlets`        - natural-language outlet query (includes `sql`)
//! - `GET  /calculate`      - arithmetic on an expression or free text
//! - `GET  /health`         - subsystem flags
//! - `GET  /api/stats`      - catalog / outlet / session counts

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderValue, Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, warn};

use kopi_agent::{Calculator, ChatEngine, OutletSqlGate, ProductIndex, SessionStore, SortKey};
use kopi_core::{EngineError, RequestError};
use kopi_db::OutletStore;

use crate::bootstrap::Application;

#[derive(Clone)]
pub struct ApiState {
    engine: Arc<ChatEngine>,
    index: Arc<ProductIndex>,
    gate: Arc<OutletSqlGate>,
    sessions: Arc<SessionStore>,
    store: Arc<dyn OutletStore>,
    calculator: Calculator,
    catalog_size: usize,
}

impl ApiState {
    pub fn from_application(app: &Application) -> Self {
        Self {
            engine: app.engine.clone(),
            index: app.index.clone(),
            gate: app.gate.clone(),
            sessions: app.sessions.clone(),
            store: app.store.clone(),
            calculator: app.calculator,
            catalog_size: app.catalog_size,
        }
    }
}

pub fn router(state: ApiState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/products", get(products))
        .route("/outlets", get(outlets))
        .route("/calculate", get(calculate))
        .route("/health", get(health))
        .route("/api/stats", get(stats))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match origin.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = %origin, "ignoring unparseable CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

// ---------------------------------------------------------------------------
// Request shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProductsQuery {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    k: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct OutletsQuery {
    #[serde(default)]
    query: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CalculateQuery {
    #[serde(default)]
    expression: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn chat(
    State(state): State<ApiState>,
    Json(request): Json<ChatRequest>,
) -> (StatusCode, Json<Value>) {
    let question = request.question.unwrap_or_default();
    match state.engine.handle(&question, request.session_id.as_deref()).await {
        Ok(envelope) => match serde_json::to_value(&envelope) {
            Ok(body) => (StatusCode::OK, Json(body)),
            Err(err) => {
                error!(error = %err, "failed to encode chat envelope");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "An unexpected internal error occurred."})),
                )
            }
        },
        Err(engine_error) => error_response(engine_error),
    }
}

pub async fn products(
    State(state): State<ApiState>,
    Query(params): Query<ProductsQuery>,
) -> (StatusCode, Json<Value>) {
    let Some(query) = params.query.filter(|query| !query.trim().is_empty()) else {
        return (StatusCode::OK, Json(products_usage()));
    };

    // k = 0 legitimately yields an empty list; only an oversized k is an
    // input error.
    let k = params.k.unwrap_or(kopi_agent::product_index::DEFAULT_TOP_K);
    if k > kopi_agent::product_index::MAX_TOP_K {
        return error_response(RequestError::InvalidTopK.into());
    }

    let sort_key = SortKey::detect(&query);
    let results = state.index.search_sorted(&query, k, sort_key).await;

    let products: Vec<Value> = results
        .iter()
        .map(|(product, score)| {
            json!({
                "id": product.id.0,
                "name": product.name,
                "description": product.description,
                "price": product.price,
                "capacity_ml": product.capacity_ml,
                "score": score,
            })
        })
        .collect();

    (
        StatusCode::OK,
        Json(json!({
            "query": query,
            "k": k,
            "sort": sort_key.map(|key| key.as_str()),
            "count": products.len(),
            "products": products,
            "success": true,
        })),
    )
}

pub async fn outlets(
    State(state): State<ApiState>,
    Query(params): Query<OutletsQuery>,
) -> (StatusCode, Json<Value>) {
    let Some(query) = params.query.filter(|query| !query.trim().is_empty()) else {
        return (StatusCode::OK, Json(outlets_usage()));
    };

    match state.gate.answer(&query).await {
        Ok(answer) => (
            StatusCode::OK,
            Json(json!({
                "query": query,
                "sql": answer.sql,
                "kind": answer.kind,
                "count": answer.count,
                "results": answer.rows,
                "formatted": answer.formatted_text,
                "success": true,
            })),
        ),
        Err(resource) => error_response(EngineError::Resource(resource)),
    }
}

pub async fn calculate(
    State(state): State<ApiState>,
    Query(params): Query<CalculateQuery>,
) -> (StatusCode, Json<Value>) {
    let (result, mode) = if let Some(expression) = params.expression {
        (state.calculator.calculate(&expression), "direct_expression")
    } else if let Some(text) = params.text {
        (state.calculator.parse_and_calculate(&text), "natural_language")
    } else {
        return (StatusCode::OK, Json(calculate_usage()));
    };

    match serde_json::to_value(&result) {
        Ok(mut body) => {
            if let Some(map) = body.as_object_mut() {
                map.insert("mode".to_string(), json!(mode));
            }
            (StatusCode::OK, Json(body))
        }
        Err(err) => {
            error!(error = %err, "failed to encode calculation result");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "An unexpected internal error occurred."})),
            )
        }
    }
}

pub async fn health(State(state): State<ApiState>) -> (StatusCode, Json<Value>) {
    let outlet_store_ready = state.store.count_all().await.is_ok();
    (
        StatusCode::OK,
        Json(json!({
            "status": "online",
            "catalog_empty": state.catalog_size == 0,
            "outlet_store_ready": outlet_store_ready,
            "sessions": state.sessions.len(),
        })),
    )
}

pub async fn stats(State(state): State<ApiState>) -> (StatusCode, Json<Value>) {
    let total_outlets = match state.store.count_all().await {
        Ok(count) => count,
        Err(err) => {
            warn!(error = %err, "outlet count unavailable for stats");
            0
        }
    };

    (
        StatusCode::OK,
        Json(json!({
            "total_products": state.catalog_size,
            "total_outlets": total_outlets,
            "total_sessions": state.sessions.len(),
            "regions": ["Kuala Lumpur", "Selangor"],
        })),
    )
}

fn error_response(error: EngineError) -> (StatusCode, Json<Value>) {
    match &error {
        EngineError::Request(request_error) => {
            (StatusCode::BAD_REQUEST, Json(json!({"error": request_error.to_string()})))
        }
        EngineError::Resource(resource) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": error.user_message(),
                "retry_after_ms": resource.retry_after_ms(),
            })),
        ),
        EngineError::Internal(detail) => {
            error!(detail = %detail, "internal failure reached the boundary");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": error.user_message()})),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Usage documents returned when a query parameter is absent
// ---------------------------------------------------------------------------

fn products_usage() -> Value {
    json!({
        "message": "Drinkware products - vector search endpoint",
        "usage": "/products?query=<question>&k=<number_of_results>",
        "parameters": {
            "query": "Natural language question about products (required)",
            "k": "Number of similar products to retrieve (default 5, max 20)",
        },
        "examples": [
            {"query": "tumblers for hot drinks"},
            {"query": "cheapest water bottle"},
            {"query": "large capacity cups for all-day use"},
        ],
    })
}

fn outlets_usage() -> Value {
    json!({
        "message": "Outlet directory - natural language query endpoint",
        "usage": "/outlets?query=<question>",
        "examples": [
            {"query": "how many outlets in Selangor"},
            {"query": "show me outlets in malls"},
            {"query": "map links for outlets in Subang"},
        ],
    })
}

fn calculate_usage() -> Value {
    json!({
        "message": "Calculator - arithmetic endpoint",
        "usage": {
            "direct_expression": "/calculate?expression=<math_expression>",
            "natural_language": "/calculate?text=<question>",
        },
        "supported_operations": {
            "+": "addition",
            "-": "subtraction",
            "*": "multiplication",
            "/": "division",
            "%": "modulo",
            "**": "power",
            "()": "grouping",
        },
        "examples": [
            {"expression": "5 + 3", "result": 8},
            {"text": "what is 15 divided by 3", "result": 5},
        ],
    })
}
