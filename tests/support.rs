#![allow(dead_code)]

use std::ffi::OsString;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct EnvRestore {
    saved: Vec<(&'static str, Option<OsString>)>,
}

impl EnvRestore {
    fn save_once(&mut self, key: &'static str) {
        if self.saved.iter().any(|(k, _)| *k == key) {
            return;
        }
        self.saved.push((key, std::env::var_os(key)));
    }

    pub fn set_var(&mut self, key: &'static str, value: impl Into<OsString>) {
        self.save_once(key);
        std::env::set_var(key, value.into());
    }

    pub fn remove_var(&mut self, key: &'static str) {
        self.save_once(key);
        std::env::remove_var(key);
    }
}

impl Drop for EnvRestore {
    fn drop(&mut self) {
        for (key, value) in self.saved.drain(..).rev() {
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
        }
    }
}

/// Backend behaviour knobs shared with the axum handlers.
pub struct MockState {
    pub refresh_hits: AtomicUsize,
    pub api_hits: AtomicUsize,
    pub valid_access: Mutex<String>,
    pub valid_refresh: Mutex<String>,
    pub reject_refresh: Mutex<bool>,
    pub refresh_delay: Mutex<Duration>,
    pub refresh_bodies: Mutex<Vec<Value>>,
}

impl MockState {
    fn new() -> Self {
        Self {
            refresh_hits: AtomicUsize::new(0),
            api_hits: AtomicUsize::new(0),
            valid_access: Mutex::new("access-live".to_string()),
            valid_refresh: Mutex::new("refresh-0".to_string()),
            reject_refresh: Mutex::new(false),
            refresh_delay: Mutex::new(Duration::ZERO),
            refresh_bodies: Mutex::new(Vec::new()),
        }
    }
}

pub struct MockBackend {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
    server: tokio::task::JoinHandle<()>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::new());
        let app = Router::new()
            .route("/api/me", get(me))
            .route("/api/courses", post(create_course))
            .route("/api/auth/refresh", post(refresh))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock backend");
        let addr = listener.local_addr().expect("local addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve mock backend");
        });

        Self {
            addr,
            state,
            server,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/api", self.addr)
    }

    pub fn refresh_hits(&self) -> usize {
        self.state.refresh_hits.load(Ordering::SeqCst)
    }

    pub fn api_hits(&self) -> usize {
        self.state.api_hits.load(Ordering::SeqCst)
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.state.refresh_delay.lock().unwrap() = delay;
    }

    pub fn reject_refresh(&self) {
        *self.state.reject_refresh.lock().unwrap() = true;
    }

    pub fn refresh_bodies(&self) -> Vec<Value> {
        self.state.refresh_bodies.lock().unwrap().clone()
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn authorized(state: &MockState, headers: &HeaderMap) -> bool {
    let expected = format!("Bearer {}", state.valid_access.lock().unwrap());
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected)
}

async fn me(State(state): State<Arc<MockState>>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    state.api_hits.fetch_add(1, Ordering::SeqCst);
    if !authorized(&state, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "token expired"})),
        );
    }
    (StatusCode::OK, Json(json!({"id": 7, "name": "Ada"})))
}

async fn create_course(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.api_hits.fetch_add(1, Ordering::SeqCst);
    if !authorized(&state, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "token expired"})),
        );
    }
    if body.get("title").and_then(Value::as_str).is_none() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": "title is required"})),
        );
    }
    (StatusCode::CREATED, Json(json!({"created": body["title"]})))
}

async fn refresh(
    State(state): State<Arc<MockState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let hit = state.refresh_hits.fetch_add(1, Ordering::SeqCst) + 1;
    state.refresh_bodies.lock().unwrap().push(body.clone());

    let delay = *state.refresh_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let presented = body["refreshToken"].as_str().unwrap_or_default().to_string();
    let rejected = *state.reject_refresh.lock().unwrap();
    {
        let mut valid_refresh = state.valid_refresh.lock().unwrap();
        if rejected || presented != *valid_refresh {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": {"code": "REFRESH_INVALID", "message": "refresh token rejected"}})),
            );
        }
        *valid_refresh = format!("refresh-{hit}");
    }

    let access = format!("access-{hit}");
    *state.valid_access.lock().unwrap() = access.clone();
    (
        StatusCode::OK,
        Json(json!({
            "access_token": access,
            "refresh_token": format!("refresh-{hit}"),
            "expires_at": "1900000000",
        })),
    )
}
