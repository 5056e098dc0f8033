use crate::entity::{Entity, EntityKey, LayerAttributes, OsiLayer, Transition};
use crate::metrics::Metrics;
use crate::monitor::MonitorState;
use crate::severity::SeverityLevel;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: Arc<RwLock<MonitorState>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntitySummary {
    pub key: EntityKey,
    pub layer: OsiLayer,
    pub id: String,
    pub severity: SeverityLevel,
    pub annotation: String,
    pub since_unix_ms: Option<i64>,
    pub dependencies: Vec<EntityKey>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityDetail {
    #[serde(flatten)]
    pub summary: EntitySummary,
    pub observed: SeverityLevel,
    pub attributes: LayerAttributes,
    pub history: Vec<Transition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntitiesResponse {
    pub system_name: String,
    pub cycles: u64,
    pub entities: Vec<EntitySummary>,
}

fn summarize(state: &MonitorState, entity: &Entity) -> EntitySummary {
    let last = entity.last_transition();
    EntitySummary {
        key: entity.key().clone(),
        layer: entity.layer(),
        id: entity.id().to_string(),
        severity: entity.current_severity(),
        annotation: last.map(|t| t.annotation.clone()).unwrap_or_default(),
        since_unix_ms: last.map(|t| t.at_unix_ms),
        dependencies: state.graph.dependencies_of(entity.key()).cloned().collect(),
    }
}

pub fn build_router(metrics: Arc<Metrics>, state: Arc<RwLock<MonitorState>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/entities", get(entities_handler))
        .route("/api/entities/:layer/:id", get(entity_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .route("/api/diff", get(diff_handler))
        .with_state(HttpAppState { metrics, state })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn entities_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let guard = state.state.read().await;
    Json(EntitiesResponse {
        system_name: guard.system_name.clone(),
        cycles: guard.cycles,
        entities: guard
            .entities
            .values()
            .map(|e| summarize(&guard, e))
            .collect(),
    })
}

async fn entity_handler(
    State(state): State<HttpAppState>,
    Path((layer, id)): Path<(String, String)>,
) -> Response {
    let layer: OsiLayer = match layer.parse() {
        Ok(layer) => layer,
        Err(err) => return (StatusCode::BAD_REQUEST, err).into_response(),
    };
    let key = EntityKey::new(layer, id);
    let guard = state.state.read().await;
    match guard.entities.get(&key) {
        Some(entity) => Json(EntityDetail {
            summary: summarize(&guard, entity),
            observed: entity.observed_severity(),
            attributes: entity.attributes().clone(),
            history: entity.history().to_vec(),
        })
        .into_response(),
        None => (StatusCode::NOT_FOUND, format!("no entity {key}")).into_response(),
    }
}

async fn snapshot_handler(State(state): State<HttpAppState>) -> Response {
    let guard = state.state.read().await;
    match &guard.last_snapshot {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "no cycle completed yet").into_response(),
    }
}

async fn diff_handler(State(state): State<HttpAppState>) -> Response {
    let guard = state.state.read().await;
    match (&guard.nominal, &guard.last_snapshot) {
        (None, _) => (StatusCode::NOT_FOUND, "no nominal snapshot configured").into_response(),
        (Some(_), None) => {
            (StatusCode::SERVICE_UNAVAILABLE, "no cycle completed yet").into_response()
        }
        (Some(nominal), Some(last)) => Json(crate::snapshot::diff(nominal, last)).into_response(),
    }
}
