//! HTTP control plane.
//!
//! One router serves both roles: the full route set is mounted on every
//! instance and configuration decides which endpoints are meaningful on a
//! given host. Every route except `/` and `/health` sits behind the
//! API-key middleware.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::{AppConfig, Role};
use crate::error::ServiceError;
use crate::exec;
use crate::health::{self, HealthReport, HealthTracker};
use crate::models::{HeartbeatAck, HeartbeatIn, StatusOut};
use crate::state_machine::{SleeperState, SleeperStateMachine};
use crate::wol;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<AppConfig>,
    pub machine: Arc<SleeperStateMachine>,
    pub checksum: Arc<String>,
    pub health: HealthTracker,
    pub role: Role,
    pub http: reqwest::Client,
}

async fn require_api_key(
    State(app): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let path = req.uri().path();
    if path == "/" || path.starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = app.cfg.common.api_key.as_str();
    let presented = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    let ok = !expected.is_empty() && presented == Some(expected);
    if !ok {
        warn!("rejected request to {path}: invalid or missing API key");
        return Err(ServiceError::Unauthorized);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(welcome))
        .route("/health", get(health_check))
        .route("/waker/config", get(waker_config))
        .route("/waker/wake", get(wake))
        .route("/waker/suspend", get(waker_suspend))
        .route("/waker/status", get(waker_status))
        .route("/waker/heartbeat", post(heartbeat))
        .route("/sleeper/config", get(sleeper_config))
        .route("/sleeper/suspend", get(sleeper_suspend))
        .route("/sleeper/status", get(sleeper_status))
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            require_api_key,
        ))
        .with_state(app_state)
}

async fn welcome() -> &'static str {
    "Welcome to hypnos!"
}

async fn health_check(State(app): State<AppState>) -> Json<HealthReport> {
    Json(health::report(&app.cfg, app.role, &app.health).await)
}

// GET /waker/config
async fn waker_config(State(app): State<AppState>) -> Json<Value> {
    Json(json!(app.cfg.waker))
}

// GET /waker/wake: send the wake signal, then track the pending wake.
async fn wake(State(app): State<AppState>) -> Result<Json<Value>, ServiceError> {
    let outcome = wol::send_wake(&app.cfg).await?;
    let state = app.machine.wake_requested();
    Ok(Json(json!({
        "op": "wake",
        "state": state,
        "sleeper": {
            "name": app.cfg.sleeper.name,
            "mac_address": app.cfg.sleeper.mac_address,
        },
        "subprocess": outcome,
    })))
}

// GET /waker/suspend: arm the heartbeat inhibit, then ask the sleeper to
// actually suspend. The tracked state only changes later, via missed
// heartbeats.
async fn waker_suspend(State(app): State<AppState>) -> Json<Value> {
    let state = app.machine.suspend_requested();
    let mut payload = sleeper_request(&app, "suspend").await;
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("state".to_string(), json!(state));
    }
    Json(payload)
}

// GET /waker/status: the locally tracked record, no live probe.
async fn waker_status(State(app): State<AppState>) -> Json<StatusOut> {
    let snap = app.machine.snapshot();
    let now = app.machine.now();
    Json(StatusOut {
        op: "status".to_string(),
        state: snap.state,
        homekit: homekit_view(snap.state).to_string(),
        last_heartbeat_age_seconds: snap
            .last_heartbeat_at
            .map(|at| now.saturating_sub(at).as_secs()),
        wake_pending_for_seconds: snap
            .wake_requested_at
            .map(|at| now.saturating_sub(at).as_secs()),
    })
}

fn homekit_view(state: SleeperState) -> &'static str {
    match state {
        SleeperState::On => "on",
        SleeperState::Failed => "failed",
        SleeperState::Off | SleeperState::Waking => "off",
    }
}

// POST /waker/heartbeat
async fn heartbeat(
    State(app): State<AppState>,
    Json(body): Json<HeartbeatIn>,
) -> Json<HeartbeatAck> {
    let state = app.machine.heartbeat_received();
    let compatible = body.checksum == *app.checksum;
    if !compatible {
        warn!(
            "sleeper reports config checksum {}, ours is {}",
            body.checksum, app.checksum
        );
    }
    Json(HeartbeatAck {
        op: "heartbeat".to_string(),
        state,
        config_compatible: compatible,
        waker_checksum: (!compatible).then(|| app.checksum.as_ref().clone()),
    })
}

// GET /sleeper/config
async fn sleeper_config(State(app): State<AppState>) -> Json<Value> {
    Json(app.cfg.redacted())
}

// GET /sleeper/suspend
async fn sleeper_suspend(State(app): State<AppState>) -> Result<Json<Value>, ServiceError> {
    let mut argv = systemctl_argv(&app.cfg)?;
    argv.push(app.cfg.sleeper.suspend_verb.clone());
    info!("suspending system via {:?}", argv);
    // Once this starts we race the suspend against writing the response.
    // Deployment adds a short pre-suspend delay so the reply gets out.
    exec::spawn_detached(&argv)?;
    Ok(Json(json!({
        "op": "suspend",
        "subprocess": { "args": argv },
    })))
}

// GET /sleeper/status
async fn sleeper_status(State(app): State<AppState>) -> Result<Json<Value>, ServiceError> {
    let mut argv = systemctl_argv(&app.cfg)?;
    argv.push(app.cfg.sleeper.status_verb.clone());
    let outcome = exec::run(&argv).await?;
    if outcome.returncode != 0 {
        return Err(ServiceError::Command {
            message: "Status command failed".to_string(),
            command: argv.join(" "),
            returncode: outcome.returncode,
            stderr: outcome.stderr,
        });
    }
    Ok(Json(json!({
        "op": "status",
        "status": outcome.stdout.trim(),
        "subprocess": outcome,
    })))
}

fn systemctl_argv(cfg: &AppConfig) -> Result<Vec<String>, ServiceError> {
    let argv = shell_words::split(&cfg.sleeper.systemctl_command).map_err(|e| {
        ServiceError::Configuration(format!("invalid sleeper.systemctl_command: {e}"))
    })?;
    if argv.is_empty() {
        return Err(ServiceError::Configuration(
            "sleeper.systemctl_command is empty".to_string(),
        ));
    }
    Ok(argv)
}

/// Proxy a GET to the sleeper's own API. Transport failures come back as
/// a structured "down" payload rather than a 5xx: an unreachable sleeper
/// is the expected steady state once it suspends.
async fn sleeper_request(app: &AppState, endpoint: &str) -> Value {
    let url = format!("{}/{}", app.cfg.sleeper_url(), endpoint);
    debug!("proxying {endpoint} request to sleeper at {url}");

    let result = app
        .http
        .get(&url)
        .header(API_KEY_HEADER, &app.cfg.common.api_key)
        .send()
        .await;

    match result {
        Ok(res) if res.status().as_u16() == 408 => {
            unreachable_payload(endpoint, "Request to sleeper timed out")
        }
        Ok(res) if !res.status().is_success() => json!({
            "op": endpoint,
            "sleeper_status": "error",
            "error": format!("Sleeper responded with error code {}", res.status().as_u16()),
            "details": res.text().await.unwrap_or_default(),
        }),
        Ok(res) => {
            let status_code = res.status().as_u16();
            let final_url = res.url().to_string();
            let text = res.text().await.unwrap_or_default();
            let body: Value = serde_json::from_str(&text).unwrap_or_else(|_| json!({}));
            json!({
                "op": endpoint,
                "sleeper_response": {
                    "status_code": status_code,
                    "json": body,
                    "text": text,
                    "url": final_url,
                }
            })
        }
        Err(e) if e.is_timeout() => unreachable_payload(endpoint, "Request to sleeper timed out"),
        Err(e) => unreachable_payload(endpoint, &e.to_string()),
    }
}

fn unreachable_payload(endpoint: &str, details: &str) -> Value {
    debug!("sleeper unreachable during {endpoint}: {details}");
    json!({
        "op": endpoint,
        "sleeper_status": "down",
        "error": "Sleeper machine is not reachable",
        "details": details,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::compute_config_checksum;
    use crate::config::test_config;

    async fn spawn_app(mutate: impl FnOnce(&mut AppConfig)) -> (String, AppState) {
        let mut cfg = test_config();
        mutate(&mut cfg);
        let checksum = compute_config_checksum(&cfg).unwrap();
        let state = AppState {
            machine: Arc::new(SleeperStateMachine::from_config(&cfg.common)),
            cfg: Arc::new(cfg),
            checksum: Arc::new(checksum),
            health: HealthTracker::new(),
            role: Role::Waker,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(2))
                .build()
                .unwrap(),
        };
        let router = build_router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}"), state)
    }

    fn client() -> reqwest::Client {
        reqwest::Client::new()
    }

    #[tokio::test]
    async fn protected_endpoints_require_api_key() {
        let (base, _) = spawn_app(|_| {}).await;
        for endpoint in [
            "/waker/config",
            "/waker/wake",
            "/waker/status",
            "/waker/suspend",
            "/sleeper/config",
            "/sleeper/status",
            "/sleeper/suspend",
        ] {
            let res = client().get(format!("{base}{endpoint}")).send().await.unwrap();
            assert_eq!(res.status().as_u16(), 401, "endpoint {endpoint}");
        }

        let res = client()
            .get(format!("{base}/waker/config"))
            .header(API_KEY_HEADER, "wrong-key")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 401);
    }

    #[tokio::test]
    async fn welcome_and_health_are_open() {
        let (base, _) = spawn_app(|_| {}).await;
        let res = client().get(format!("{base}/")).send().await.unwrap();
        assert_eq!(res.status().as_u16(), 200);
        assert!(res.text().await.unwrap().contains("Welcome"));

        let res = client().get(format!("{base}/health")).send().await.unwrap();
        assert_eq!(res.status().as_u16(), 200);
        let body: Value = res.json().await.unwrap();
        assert!(body.get("status").is_some());
        assert!(body.get("config").is_some());
        assert!(body.get("commands").is_some());
    }

    #[tokio::test]
    async fn heartbeat_with_matching_checksum_turns_on() {
        let (base, state) = spawn_app(|_| {}).await;
        let res = client()
            .post(format!("{base}/waker/heartbeat"))
            .header(API_KEY_HEADER, "test-api-key")
            .json(&json!({"checksum": state.checksum.as_str()}))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 200);
        let ack: HeartbeatAck = res.json().await.unwrap();
        assert_eq!(ack.op, "heartbeat");
        assert_eq!(ack.state, SleeperState::On);
        assert!(ack.config_compatible);
        assert!(ack.waker_checksum.is_none());
    }

    #[tokio::test]
    async fn heartbeat_with_foreign_checksum_flags_drift() {
        let (base, state) = spawn_app(|_| {}).await;
        let res = client()
            .post(format!("{base}/waker/heartbeat"))
            .header(API_KEY_HEADER, "test-api-key")
            .json(&json!({"checksum": "0000000000000000"}))
            .send()
            .await
            .unwrap();
        let ack: HeartbeatAck = res.json().await.unwrap();
        // Drift is reported, but the heartbeat still counts as liveness.
        assert_eq!(ack.state, SleeperState::On);
        assert!(!ack.config_compatible);
        assert_eq!(ack.waker_checksum.as_deref(), Some(state.checksum.as_str()));
    }

    #[tokio::test]
    async fn status_reflects_the_tracked_record_only() {
        let (base, state) = spawn_app(|_| {}).await;
        let res = client()
            .get(format!("{base}/waker/status"))
            .header(API_KEY_HEADER, "test-api-key")
            .send()
            .await
            .unwrap();
        let status: StatusOut = res.json().await.unwrap();
        assert_eq!(status.op, "status");
        assert_eq!(status.state, SleeperState::Off);
        assert_eq!(status.homekit, "off");
        assert!(status.last_heartbeat_age_seconds.is_none());

        state.machine.heartbeat_received();
        let res = client()
            .get(format!("{base}/waker/status"))
            .header(API_KEY_HEADER, "test-api-key")
            .send()
            .await
            .unwrap();
        let status: StatusOut = res.json().await.unwrap();
        assert_eq!(status.state, SleeperState::On);
        assert_eq!(status.homekit, "on");
        assert!(status.last_heartbeat_age_seconds.is_some());
    }

    #[tokio::test]
    async fn homekit_has_no_waking_vocabulary() {
        assert_eq!(homekit_view(SleeperState::On), "on");
        assert_eq!(homekit_view(SleeperState::Failed), "failed");
        assert_eq!(homekit_view(SleeperState::Off), "off");
        assert_eq!(homekit_view(SleeperState::Waking), "off");
    }

    #[tokio::test]
    async fn wake_runs_the_command_and_starts_waking() {
        let (base, _) = spawn_app(|cfg| {
            cfg.waker.wol_exec = Some("echo".to_string());
        })
        .await;
        let res = client()
            .get(format!("{base}/waker/wake"))
            .header(API_KEY_HEADER, "test-api-key")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 200);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["op"], "wake");
        assert_eq!(body["state"], "WAKING");
        assert_eq!(body["sleeper"]["mac_address"], "00:11:22:33:44:55");
        assert_eq!(body["subprocess"]["returncode"], 0);
    }

    #[tokio::test]
    async fn failed_wake_command_is_a_500() {
        let (base, state) = spawn_app(|cfg| {
            cfg.waker.wol_exec = Some("false".to_string());
        })
        .await;
        let res = client()
            .get(format!("{base}/waker/wake"))
            .header(API_KEY_HEADER, "test-api-key")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 500);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["error"]["type"], "SystemCommandError");
        // The wake was never tracked as pending.
        assert_eq!(state.machine.state(), SleeperState::Off);
    }

    #[tokio::test]
    async fn suspend_proxies_and_reports_unreachable_sleeper() {
        let (base, state) = spawn_app(|cfg| {
            // Point the proxy at a port nothing listens on.
            cfg.sleeper.name = "127.0.0.1".to_string();
            cfg.common.domain = String::new();
            cfg.common.port = 1;
        })
        .await;
        let res = client()
            .get(format!("{base}/waker/suspend"))
            .header(API_KEY_HEADER, "test-api-key")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 200);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["op"], "suspend");
        assert_eq!(body["sleeper_status"], "down");
        assert_eq!(body["error"], "Sleeper machine is not reachable");
        // The inhibit marker was armed even though the proxy failed.
        assert!(state.machine.snapshot().suspend_requested_at.is_some());
    }

    #[tokio::test]
    async fn sleeper_status_wraps_the_command_output() {
        let (base, _) = spawn_app(|cfg| {
            cfg.sleeper.systemctl_command = "echo".to_string();
            cfg.sleeper.status_verb = "running".to_string();
        })
        .await;
        let res = client()
            .get(format!("{base}/sleeper/status"))
            .header(API_KEY_HEADER, "test-api-key")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 200);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["op"], "status");
        assert_eq!(body["status"], "running");
        assert_eq!(body["subprocess"]["returncode"], 0);
    }

    #[tokio::test]
    async fn sleeper_config_hides_the_api_key() {
        let (base, _) = spawn_app(|_| {}).await;
        let res = client()
            .get(format!("{base}/sleeper/config"))
            .header(API_KEY_HEADER, "test-api-key")
            .send()
            .await
            .unwrap();
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["common"]["api_key"], "***hidden***");
        assert_eq!(body["sleeper"]["name"], "test-sleeper");
    }
}
