use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use count_core::client::FORWARDED_FOR;
use count_core::{resolve_client, ClientError, EventStore, TrustedProxies, Window};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<EventStore>,
    pub proxies: Arc<TrustedProxies>,
    pub window: Window,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountBody {
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    message: String,
}

impl ApiError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<ClientError> for ApiError {
    fn from(err: ClientError) -> Self {
        Self::new(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(message = %self.message, "request failed");
        let body = ErrorBody {
            message: self.message,
        };
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/count", get(count))
        .route("/health", get(health))
        .with_state(state)
}

/// Records the caller and reports how many requests the window holds,
/// this one included.
async fn count(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<CountBody>, ApiError> {
    let forwarded = match headers.get(FORWARDED_FOR) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| ApiError::new("forwarded header is not valid text"))?,
        ),
        None => None,
    };
    let client = resolve_client(peer.ip(), forwarded, &state.proxies)?;
    debug!(%client, "request recorded");
    let count = state.store.insert(client).await;
    Ok(Json(CountBody { count }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "window_secs": state.window.as_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use tower::util::ServiceExt;

    fn app(store: Arc<EventStore>, trusted: Vec<String>) -> Router {
        let state = AppState {
            store,
            proxies: Arc::new(TrustedProxies { trusted }),
            window: Window::default(),
        };
        router(state).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))))
    }

    async fn fetch(app: &Router, uri: &str, forwarded: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().uri(uri);
        if let Some(value) = forwarded {
            req = req.header(FORWARDED_FOR, value);
        }
        let response = app
            .clone()
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn every_request_sees_itself() {
        let store = Arc::new(EventStore::new());
        let app = app(store.clone(), Vec::new());
        for expected in 1..=3 {
            let (status, body) = fetch(&app, "/count", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, serde_json::json!({ "count": expected }));
        }
        assert_eq!(store.snapshot().await[0].client, "127.0.0.1");
    }

    #[tokio::test]
    async fn trusted_proxy_header_names_the_client() {
        let store = Arc::new(EventStore::new());
        let app = app(store.clone(), vec!["127.0.0.0/8".into()]);
        let (status, _) = fetch(&app, "/count", Some("198.51.100.4, 127.0.0.1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(store.snapshot().await[0].client, "198.51.100.4");
    }

    #[tokio::test]
    async fn bad_identity_is_a_server_error() {
        let store = Arc::new(EventStore::new());
        let app = app(store.clone(), vec!["127.0.0.1".into()]);
        let (status, body) = fetch(&app, "/count", Some("not-an-ip")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["message"].as_str().unwrap().contains("not-an-ip"));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn health_reports_window() {
        let app = app(Arc::new(EventStore::new()), Vec::new());
        let (status, body) = fetch(&app, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["window_secs"], 60);
    }
}
