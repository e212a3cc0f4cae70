#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::Extension;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tokio::sync::{watch, Mutex};
use tower::ServiceExt;

use tankalarm_api::config::ServerConfig;
use tankalarm_api::router::build_app_router;
use tankalarm_api::state::AppState;
use tankalarm_core::server::ServerCore;
use tankalarm_db::FileBlobStore;
use tankalarm_events::EventBus;

pub const PIN: &str = "7351";

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config(data_dir: &std::path::Path) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        data_dir: data_dir.to_path_buf(),
        request_timeout_secs: 30,
        liveness_check_interval_secs: 3600,
        overdue_sweep_interval_secs: 300,
        admin_local_only: true,
        bootstrap_pin: Some(PIN.to_string()),
    }
}

/// A router over temp-dir persistence, plus handles on its shared state.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub dir: TempDir,
}

impl TestApp {
    pub async fn get(&self, uri: &str) -> Response<Body> {
        send(self.router.clone(), Request::get(uri).body(Body::empty()).unwrap()).await
    }

    pub async fn post_json(&self, uri: &str, body: serde_json::Value) -> Response<Body> {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        send(self.router.clone(), request).await
    }

    pub async fn post_raw(&self, uri: &str, body: Vec<u8>) -> Response<Body> {
        let request = Request::post(uri).body(Body::from(body)).unwrap();
        send(self.router.clone(), request).await
    }

    pub async fn put_config(&self, pin: Option<&str>, body: serde_json::Value) -> Response<Body> {
        let mut builder = Request::put("/api/v1/config").header("content-type", "application/json");
        if let Some(pin) = pin {
            builder = builder.header("x-admin-pin", pin);
        }
        let request = builder.body(Body::from(body.to_string())).unwrap();
        send(self.router.clone(), request).await
    }
}

/// Build the full application router from a loopback peer.
pub fn build_test_app() -> TestApp {
    build_test_app_from(SocketAddr::from(([127, 0, 0, 1], 40_000)))
}

/// Build the full application router, seeing every request as coming from
/// `peer`.
///
/// This mirrors the router construction in `main.rs` so integration tests
/// exercise the same middleware stack that production uses.
pub fn build_test_app_from(peer: SocketAddr) -> TestApp {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(dir.path());
    let blobs = FileBlobStore::open(dir.path()).expect("blob store");
    let core = ServerCore::bootstrap(Box::new(blobs), config.bootstrap_pin.as_deref());
    let (contacts, _) = watch::channel(core.site_config().contacts.clone());

    let state = AppState {
        core: Arc::new(Mutex::new(core)),
        config: Arc::new(config.clone()),
        event_bus: Arc::new(EventBus::default()),
        contacts: Arc::new(contacts),
    };
    let router = build_app_router(state.clone(), &config).layer(Extension(ConnectInfo(peer)));

    TestApp { router, state, dir }
}

pub async fn send(app: Router, request: Request<Body>) -> Response<Body> {
    app.oneshot(request).await.unwrap()
}

/// Collect a response body as JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// A sync record as the relay would deliver it.
pub fn sync_record(client_id: &str, tank_index: u8, percent: f64, epoch: i64) -> serde_json::Value {
    serde_json::json!({
        "clientId": client_id,
        "tankIndex": tank_index,
        "heightInches": percent,
        "levelInches": percent,
        "percent": percent,
        "vinVoltage": 12.6,
        "epoch": epoch,
    })
}
