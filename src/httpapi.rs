//! HTTP front: the legacy `/send` endpoint driving the MT pipeline, plus the
//! status surfaces.
//!
//! Endpoints:
//! - `GET /send` - legacy send (query-string parameters)
//! - `GET /api/v1/status` - liveness
//! - `GET /api/v1/smpp/connectors` - connector state map

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::connector::StateRegistry;
use crate::interceptor::InterceptorRegistry;
use crate::pipeline::{
    MtJob, MtPipeline, SendRequest, apply_connector_params, apply_dlr_flag,
};
use crate::queue::QueueTransport;
use crate::routing::RouteTable;

pub struct ApiState {
    pub config: Arc<GatewayConfig>,
    pub pipeline: MtPipeline,
    pub interceptors: InterceptorRegistry,
    pub route_table: Arc<RouteTable>,
    pub queues: Arc<dyn QueueTransport>,
    pub states: StateRegistry,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/send", get(handler_send))
        .route("/api/v1/status", get(handler_status))
        .route("/api/v1/smpp/connectors", get(handler_connectors))
        .with_state(state)
}

async fn handler_status() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

async fn handler_connectors(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let connectors: HashMap<String, String> = state
        .states
        .read()
        .expect("state registry lock")
        .iter()
        .map(|(name, session_state)| (name.clone(), session_state.as_str().to_string()))
        .collect();

    Json(json!({ "connectors": connectors }))
}

async fn handler_send(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    process_send(&state, &params).await
}

/// The `/send` pipeline, separated from the axum extractors so tests can
/// drive it directly.
pub async fn process_send(
    state: &ApiState,
    params: &HashMap<String, String>,
) -> (StatusCode, String) {
    let request = match SendRequest::parse(params) {
        Ok(request) => request,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("Error \"{err}\""));
        }
    };

    let req_id = uuid::Uuid::new_v4().to_string();

    let event = match state.pipeline.build_event(&request) {
        Ok(event) => event,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("Error \"{err}\""));
        }
    };
    debug!(req_id = %req_id, pdus = event.pdus.len(), "MT event built");

    let mut event = state.interceptors.apply(event);

    let Some(connector) = state.route_table.evaluate(&event) else {
        warn!(req_id = %req_id, "no route found");
        return (
            StatusCode::PRECONDITION_FAILED,
            "Error \"No route found\"".to_string(),
        );
    };

    if let Some(connector_config) = state.config.connectors.get(&connector) {
        apply_connector_params(&mut event, connector_config);
    }
    apply_dlr_flag(&mut event);

    let job = MtJob {
        req_id: req_id.clone(),
        connector: connector.clone(),
        pdus: event.pdus,
        dlr: event.dlr,
    };

    let payload = match serde_json::to_string(&job) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(req_id = %req_id, error = %err, "job serialization failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error \"Internal error\"".to_string(),
            );
        }
    };

    let queue_name = state.config.connector_queue(&connector);
    if let Err(err) = state.queues.send(&queue_name, payload).await {
        warn!(req_id = %req_id, error = %err, queue = %queue_name, "failed to enqueue MT job");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Error \"Internal error\"".to_string(),
        );
    }

    info!(req_id = %req_id, connector = %connector, "MT event queued");
    (StatusCode::OK, format!("Success \"{req_id}\""))
}
