//! REST front end for injecting operations into the cluster.
//!
//! Every handler is a direct call into [`ReplicatedStore`]; cluster health is
//! never reported here.

use std::future::Future;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::codec::CodecError;
use crate::store::ReplicatedStore;

/// Body of `POST /put`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValue {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Value")]
    pub value: String,
}

pub fn router(store: Arc<ReplicatedStore>) -> Router {
    Router::new()
        .route("/get/:key", get(get_key))
        .route("/put", post(put_key))
        .route("/delete/:key", delete(delete_key))
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

/// Serves the router on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    store: Arc<ReplicatedStore>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = ?listener.local_addr()?, "http listening");
    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn get_key(State(store): State<Arc<ReplicatedStore>>, Path(key): Path<String>) -> Response {
    match store.get(&key) {
        Some(value) => (StatusCode::OK, value).into_response(),
        None => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}

async fn put_key(
    State(store): State<Arc<ReplicatedStore>>,
    Json(body): Json<KeyValue>,
) -> Response {
    debug!(key = %body.key, "http put");
    match store.put(body.key, body.value) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => rejected(err),
    }
}

async fn delete_key(
    State(store): State<Arc<ReplicatedStore>>,
    Path(key): Path<String>,
) -> Response {
    debug!(%key, "http delete");
    match store.delete(&key) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => rejected(err),
    }
}

fn rejected(err: CodecError) -> Response {
    let status = match err {
        CodecError::LengthExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, err.to_string()).into_response()
}
