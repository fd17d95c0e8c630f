//! HTTP surface for the sandboxed execution dispatcher
//!
//! Exposes snippet execution (`POST /run`), project archive execution
//! (`POST /run-zip`) and the recent-execution log (`GET /history`) over axum.
//! Handlers only parse requests and shape responses; validation, isolation
//! and history bookkeeping all live in `safexec_core::Dispatcher`.

pub mod error;
pub mod handlers;

pub use error::{Result, ServerError};
pub use handlers::{HealthResponse, RunRequest};

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{middleware, Router};
use safexec_core::Dispatcher;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Enable CORS
    pub enable_cors: bool,
    /// CORS allowed origins (if None, allows any origin)
    pub cors_origins: Option<Vec<String>>,
    /// Maximum request body size in bytes, uploads included
    pub max_body_size: usize,
    /// Enable request logging
    pub enable_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            enable_cors: true,
            cors_origins: None,
            // Room for a 10 MiB archive plus multipart framing.
            max_body_size: 12 * 1024 * 1024,
            enable_logging: true,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Parse and set the bind address from a string.
    pub fn with_bind_addr_str(mut self, addr: &str) -> Result<Self> {
        self.bind_addr = addr
            .parse()
            .map_err(|e| ServerError::config_error(format!("Invalid bind address: {}", e)))?;
        Ok(self)
    }

    pub fn with_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn with_logging(mut self, enable: bool) -> Self {
        self.enable_logging = enable;
        self
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub config: ServerConfig,
}

pub struct SafexecServer {
    dispatcher: Arc<Dispatcher>,
    config: ServerConfig,
}

impl SafexecServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self::with_config(dispatcher, ServerConfig::default())
    }

    pub fn with_config(dispatcher: Arc<Dispatcher>, config: ServerConfig) -> Self {
        Self { dispatcher, config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Build the Axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            dispatcher: self.dispatcher.clone(),
            config: self.config.clone(),
        };

        let mut router = Router::new()
            .route("/", get(handlers::root_handler))
            .route("/health", get(handlers::health_handler))
            .route("/run", post(handlers::run_handler))
            .route("/run-zip", post(handlers::run_zip_handler))
            .route("/history", get(handlers::history_handler))
            .layer(DefaultBodyLimit::max(self.config.max_body_size))
            .with_state(state);

        if self.config.enable_logging {
            router = router.layer(middleware::from_fn(
                |request: axum::http::Request<axum::body::Body>, next: axum::middleware::Next| async {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    let method = request.method().clone();
                    let uri = request.uri().clone();
                    log::info!("Request {} {} {}", request_id, method, uri);

                    let start = std::time::Instant::now();
                    let response = next.run(request).await;
                    log::info!(
                        "Response {} {} in {:?}",
                        request_id,
                        response.status(),
                        start.elapsed()
                    );
                    response
                },
            ));
        }

        router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            let cors_layer = if let Some(ref origins) = self.config.cors_origins {
                let origins: std::result::Result<Vec<_>, _> =
                    origins.iter().map(|s| s.parse()).collect();
                match origins {
                    Ok(origins) => CorsLayer::new()
                        .allow_origin(origins)
                        .allow_methods(Any)
                        .allow_headers(Any),
                    Err(_) => CorsLayer::permissive(),
                }
            } else {
                CorsLayer::permissive()
            };
            router = router.layer(cors_layer);
        }

        router
    }

    /// Start the server with graceful shutdown support.
    pub async fn serve_with_shutdown<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| {
                ServerError::config_error(format!(
                    "Failed to bind to {}: {}",
                    self.config.bind_addr, e
                ))
            })?;

        let provider = self.dispatcher.launcher().provider();
        if !provider.is_available().await {
            log::warn!(
                "Isolation runtime '{}' is not reachable; executions will fail until it is",
                provider.name()
            );
        }

        log::info!("safexec server starting on {}", self.config.bind_addr);
        log::info!("Run endpoint: http://{}/run", self.config.bind_addr);
        log::info!("Project endpoint: http://{}/run-zip", self.config.bind_addr);
        log::info!("History: http://{}/history", self.config.bind_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::internal(format!("Server error: {}", e)))?;

        match provider.list_units().await {
            Ok(units) if !units.is_empty() => {
                log::warn!("Isolation units still present at shutdown: {:?}", units)
            }
            Ok(_) => {}
            Err(e) => log::debug!("Could not list isolation units: {}", e),
        }

        log::info!("safexec server shut down gracefully");
        Ok(())
    }
}

/// Utility function to create a shutdown signal from Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use safexec_core::outcome::REJECTED_EXIT_CODE;
    use safexec_core::sandbox::{Invocation, RawExit, UnitId};
    use safexec_core::{SandboxError, SandboxProvider, ServiceConfig};
    use std::io::{Cursor, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt; // for `oneshot`

    /// Echoes the staged entry file back as stdout; `exit N` scripts fail.
    #[derive(Default)]
    struct EchoProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SandboxProvider for EchoProvider {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn run(&self, invocation: &Invocation) -> std::result::Result<RawExit, SandboxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut path = invocation.mount.host_path.clone();
            if path.is_dir() {
                let entry = invocation.command.last().cloned().unwrap_or_default();
                path = path.join(entry.trim_start_matches("/app/"));
            }
            let script = tokio::fs::read_to_string(&path).await?;
            Ok(match script.strip_prefix("exit ") {
                Some(code) => RawExit {
                    stdout: String::new(),
                    stderr: format!("exited with {}\n", code),
                    exit_code: code.trim().parse().unwrap_or(1),
                },
                None => RawExit {
                    stdout: format!("{}\n", script),
                    stderr: String::new(),
                    exit_code: 0,
                },
            })
        }

        async fn terminate(&self, _unit: &UnitId) -> std::result::Result<(), SandboxError> {
            Ok(())
        }

        async fn list_units(&self) -> std::result::Result<Vec<String>, SandboxError> {
            Ok(Vec::new())
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    fn app() -> (Router, Arc<EchoProvider>) {
        let provider = Arc::new(EchoProvider::default());
        let dispatcher =
            Dispatcher::with_provider(&ServiceConfig::default(), provider.clone()).unwrap();
        let server = SafexecServer::new(Arc::new(dispatcher));
        (server.build_router(), provider)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn run_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/run")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart_request(field: &str, filename: &str, content: &[u8]) -> Request<Body> {
        let boundary = "safexec-test-boundary";
        let mut body = Vec::new();
        write!(
            body,
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/zip\r\n\r\n"
        )
        .unwrap();
        body.extend_from_slice(content);
        write!(body, "\r\n--{boundary}--\r\n").unwrap();

        Request::builder()
            .method("POST")
            .uri("/run-zip")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn zip_of(files: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, content) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[tokio::test]
    async fn test_root_banner() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], handlers::BANNER.as_bytes());
    }

    #[tokio::test]
    async fn test_health_reports_provider() {
        let (app, _) = app();
        let (status, body) = send(&app, Request::builder().uri("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["provider"], "echo");
    }

    #[tokio::test]
    async fn test_run_success_and_failure_shapes() {
        let (app, _) = app();

        let (status, body) = send(&app, run_request(serde_json::json!({"code": "hello"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"output": "hello\n"}));

        let (status, body) = send(
            &app,
            run_request(serde_json::json!({"code": "exit 1", "language": "js"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "exited with 1\n");
        assert_eq!(body["exit_code"], 1);
    }

    #[tokio::test]
    async fn test_run_validation() {
        let (app, provider) = app();

        let (status, body) = send(&app, run_request(serde_json::json!({"language": "python"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, serde_json::json!({"error": "Missing 'code' field"}));

        let (status, body) = send(
            &app,
            run_request(serde_json::json!({"code": "x".repeat(5001)})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Code too long. Max 5000 chars.");

        let (status, body) = send(
            &app,
            run_request(serde_json::json!({"code": "1", "language": "ruby"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Unsupported language: ruby");

        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_zip() {
        let (app, provider) = app();

        let archive = zip_of(&[("index.js", "from node")]);
        let (status, body) = send(&app, multipart_request("file", "project.zip", &archive)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["output"], "from node\n");

        let (status, body) = send(&app, multipart_request("file", "project.tar", &archive)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            serde_json::json!({"error": "File must be a ZIP", "exit_code": REJECTED_EXIT_CODE})
        );

        let (status, body) = send(&app, multipart_request("upload", "project.zip", &archive)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            serde_json::json!({"error": "No ZIP file uploaded", "exit_code": REJECTED_EXIT_CODE})
        );

        let not_multipart = Request::builder()
            .method("POST")
            .uri("/run-zip")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, body) = send(&app, not_multipart).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No ZIP file uploaded");
        assert_eq!(body["exit_code"], REJECTED_EXIT_CODE);

        let no_entry = zip_of(&[("README.md", "hi")]);
        let (status, body) = send(&app, multipart_request("file", "p.zip", &no_entry)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "ZIP must contain main.py or index.js");

        let (status, body) = send(&app, multipart_request("file", "p.zip", b"garbage")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid ZIP structure");

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_history_is_newest_first_and_stable() {
        let (app, _) = app();
        for code in ["first", "second"] {
            send(&app, run_request(serde_json::json!({"code": code}))).await;
        }

        let history = || Request::builder().uri("/history").body(Body::empty()).unwrap();
        let (status, body) = send(&app, history()).await;
        assert_eq!(status, StatusCode::OK);
        let entries = body.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["code"], "second");
        assert_eq!(entries[1]["code"], "first");
        assert_eq!(entries[0]["language"], "python");

        let (_, again) = send(&app, history()).await;
        assert_eq!(again, body);
    }
}
