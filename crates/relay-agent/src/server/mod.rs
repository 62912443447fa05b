//! Forward-mode HTTP server.
//!
//! `GET /health` is public; `GET /ws` upgrades to the message protocol
//! and sits behind the bearer-token middleware.

mod reaper;
mod ws;

use std::future::Future;
use std::sync::Arc;

use axum::{Json, Router, extract::State, middleware, routing::get};
use log::{info, warn};
use relay_protocol::{HealthLogEntry, HealthStatus};
use serde::Serialize;
use tokio::net::TcpListener;

use crate::auth::{AuthState, require_token};
use crate::error::Result;
use crate::router::MessageRouter;

pub use reaper::{is_init_process, reap_zombies, spawn_reaper};

/// Shared state for the HTTP handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub router: Arc<MessageRouter>,
    pub auth: AuthState,
}

impl AppState {
    pub fn new(router: Arc<MessageRouter>, token: impl Into<String>) -> Self {
        Self {
            router,
            auth: AuthState::new(token),
        }
    }
}

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exited: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthReport>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub failing_streak: u32,
    pub log: Vec<HealthLogEntry>,
}

/// Build the agent's HTTP router.
pub fn router(state: AppState) -> Router {
    let ws_routes = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            require_token,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .merge(ws_routes)
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health_report(&state.router))
}

/// Snapshot the agent's process and health state.
pub fn health_report(router: &MessageRouter) -> HealthResponse {
    let mut resp = HealthResponse {
        status: "ok",
        pid: None,
        exited: None,
        exit_code: None,
        health: None,
    };

    if let Some(main) = router.main_process() {
        resp.pid = Some(main.pid());
        resp.exit_code = main.exit_code();
        resp.exited = Some(resp.exit_code.is_some());
    }

    if let Some(checker) = router.health() {
        resp.health = Some(HealthReport {
            status: checker.status(),
            failing_streak: checker.failing_streak(),
            log: checker.log(),
        });
    }

    resp
}

/// Serve until `shutdown` resolves, then close every live session.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = state.router.clone();
    let app = self::router(state);

    if let Ok(addr) = listener.local_addr() {
        info!("Listening on http://{}", addr);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    shutdown_sessions(&router).await;
    Ok(())
}

/// Stop health checks and close every registered session.
pub async fn shutdown_sessions(router: &MessageRouter) {
    if let Some(checker) = router.health() {
        checker.stop();
    }
    let count = router.registry().len();
    if count > 0 {
        info!("Closing {} active session(s)...", count);
    }
    router.registry().close_all().await;
}

/// Resolve on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{HealthChecker, HealthcheckConfig};
    use crate::process::MainProcess;
    use crate::session::SessionRegistry;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    fn app(main: Option<Arc<MainProcess>>, health: Option<Arc<HealthChecker>>, token: &str) -> Router {
        let router = Arc::new(MessageRouter::new(
            Arc::new(SessionRegistry::new()),
            main,
            health,
        ));
        self::router(AppState::new(router, token))
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_without_main_process() {
        let resp = app(None, None, "secret")
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn health_reports_main_process_and_checker() {
        let main = MainProcess::spawn(&["sh".into(), "-c".into(), "exit 3".into()], &[]).unwrap();
        main.wait().await;
        let checker = HealthChecker::new(HealthcheckConfig {
            test: vec!["CMD".into(), "true".into()],
            ..Default::default()
        });
        checker.check().await;

        let resp = app(Some(main.clone()), Some(checker), "")
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(resp).await;

        assert_eq!(body["status"], "ok");
        assert_eq!(body["pid"], main.pid());
        assert_eq!(body["exited"], true);
        assert_eq!(body["exitCode"], 3);
        assert_eq!(body["health"]["status"], "healthy");
        assert_eq!(body["health"]["failingStreak"], 0);
        assert_eq!(body["health"]["log"][0]["ExitCode"], 0);
    }

    #[tokio::test]
    async fn ws_requires_token() {
        let resp = app(None, None, "secret")
            .oneshot(Request::get("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(resp).await;
        assert_eq!(body["error_code"], "missing_auth_header");

        let resp = app(None, None, "secret")
            .oneshot(
                Request::get("/ws")
                    .header(header::AUTHORIZATION, "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["error_code"], "invalid_token");
    }

    #[tokio::test]
    async fn ws_with_valid_token_reaches_the_upgrade_handler() {
        // Without upgrade headers the extractor rejects the request, which
        // proves authentication passed.
        for req in [
            Request::get("/ws")
                .header(header::AUTHORIZATION, "Bearer secret")
                .body(Body::empty())
                .unwrap(),
            Request::get("/ws?token=secret").body(Body::empty()).unwrap(),
        ] {
            let resp = app(None, None, "secret").oneshot(req).await.unwrap();
            assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
        }
    }
}
