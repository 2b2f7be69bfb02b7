use std::sync::Arc;

use async_trait::async_trait;
use rearch::CapsuleHandle;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::config::{log_bearer_token_capsule, log_endpoint_capsule};

/// Where log events go when `LOG_ENDPOINT` is not set.
pub const DEFAULT_LOG_ENDPOINT: &str = "http://20.244.56.144/evaluation-service/logs";

const BACKEND_PACKAGES: &[&str] = &[
    "cache",
    "controller",
    "cron_job",
    "db",
    "domain",
    "handler",
    "repository",
    "route",
    "service",
    "auth",
    "config",
    "middleware",
    "utils",
];

const FRONTEND_PACKAGES: &[&str] = &[
    "api",
    "component",
    "hook",
    "page",
    "state",
    "style",
    "auth",
    "config",
    "middleware",
    "utils",
];

pub fn evaluation_logger_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<EvaluationLogger> {
    let endpoint = get.as_ref(log_endpoint_capsule).clone();
    let bearer_token = get.as_ref(log_bearer_token_capsule).clone();
    Arc::new(EvaluationLogger::new(Arc::new(HttpLogTransport::new(
        endpoint,
        bearer_token,
    ))))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stack {
    Backend,
    Frontend,
}

impl Stack {
    fn parse(stack: &str) -> Option<Self> {
        match stack.to_lowercase().as_str() {
            "backend" => Some(Self::Backend),
            "frontend" => Some(Self::Frontend),
            _ => None,
        }
    }

    /// Package names accepted for events tagged with this stack.
    #[must_use]
    pub const fn packages(self) -> &'static [&'static str] {
        match self {
            Self::Backend => BACKEND_PACKAGES,
            Self::Frontend => FRONTEND_PACKAGES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    fn parse(level: &str) -> Option<Self> {
        match level.to_lowercase().as_str() {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "fatal" => Some(Self::Fatal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogValidationError {
    #[error("Invalid stack value: {0}. Must be 'backend' or 'frontend'")]
    InvalidStack(String),
    #[error("Invalid log level: {0}. Must be 'debug', 'info', 'warn', 'error', or 'fatal'")]
    InvalidLevel(String),
    #[error("Invalid package name: {package} for stack: {stack}")]
    InvalidPackage { package: String, stack: String },
}

/// Checks stack, then level, then package, all case-insensitively.
///
/// # Errors
/// Returns the first rule that the inputs violate.
pub fn validate(
    stack: &str,
    level: &str,
    package: &str,
) -> Result<(Stack, Level), LogValidationError> {
    let parsed_stack =
        Stack::parse(stack).ok_or_else(|| LogValidationError::InvalidStack(stack.to_owned()))?;
    let parsed_level =
        Level::parse(level).ok_or_else(|| LogValidationError::InvalidLevel(level.to_owned()))?;

    let normalized_package = package.to_lowercase();
    if !parsed_stack.packages().contains(&normalized_package.as_str()) {
        return Err(LogValidationError::InvalidPackage {
            package: package.to_owned(),
            stack: stack.to_owned(),
        });
    }

    Ok((parsed_stack, parsed_level))
}

/// Wire body of a log request. Fields are sent exactly as the caller wrote them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub stack: String,
    pub level: String,
    pub package: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogResponse {
    #[serde(rename = "logID")]
    pub log_id: String,
    pub message: String,
}

impl LogResponse {
    fn synthesized(prefix: &str, message: String) -> Self {
        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        Self {
            log_id: format!("{prefix}-{millis}"),
            message,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to reach log service: {0}")]
    Request(#[from] reqwest::Error),
    #[error("log service responded with status {status}")]
    Status { status: u16 },
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log validation error: {0}")]
    Validation(#[from] LogValidationError),
    #[error("log transport error: {0}")]
    Transport(#[from] TransportError),
}

#[async_trait]
pub trait LogTransport: Send + Sync {
    /// Delivers one event. Implementations must not retry.
    async fn send(&self, event: &LogEvent) -> Result<LogResponse, TransportError>;
}

/// Posts events as JSON to the evaluation service.
pub struct HttpLogTransport {
    client: reqwest::Client,
    endpoint: Url,
    bearer_token: Option<String>,
}

impl HttpLogTransport {
    #[must_use]
    pub fn new(endpoint: Url, bearer_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            bearer_token,
        }
    }
}

impl std::fmt::Debug for HttpLogTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLogTransport")
            .field("endpoint", &self.endpoint.as_str())
            .field("has_bearer_token", &self.bearer_token.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LogTransport for HttpLogTransport {
    #[instrument(skip(event))]
    async fn send(&self, event: &LogEvent) -> Result<LogResponse, TransportError> {
        let mut request = self.client.post(self.endpoint.clone()).json(event);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}

enum LogSink {
    Console,
    Remote(Arc<dyn LogTransport>),
}

/// Client for the evaluation log service.
///
/// [`EvaluationLogger::log`] reports every failure to the caller.
/// [`EvaluationLogger::log_or_fallback`] never fails and synthesizes a
/// response instead, for callers that must not be disturbed by logging.
pub struct EvaluationLogger {
    sink: LogSink,
}

impl EvaluationLogger {
    /// Remote logger, or console logger when built with the `console-log` feature.
    #[must_use]
    pub fn new(transport: Arc<dyn LogTransport>) -> Self {
        if cfg!(feature = "console-log") {
            Self::console()
        } else {
            Self::remote(transport)
        }
    }

    #[must_use]
    pub fn remote(transport: Arc<dyn LogTransport>) -> Self {
        Self {
            sink: LogSink::Remote(transport),
        }
    }

    /// Writes events through `tracing` and never touches the network.
    #[must_use]
    pub const fn console() -> Self {
        Self {
            sink: LogSink::Console,
        }
    }

    async fn dispatch(
        &self,
        stack: &str,
        level: &str,
        package: &str,
        message: &str,
    ) -> Result<LogResponse, LogError> {
        let (_, parsed_level) = validate(stack, level, package)?;

        match &self.sink {
            LogSink::Console => {
                let line = format!(
                    "[{}][{stack}][{package}] {message}",
                    level.to_uppercase()
                );
                match parsed_level {
                    Level::Debug => debug!("{line}"),
                    Level::Info => info!("{line}"),
                    Level::Warn => warn!("{line}"),
                    Level::Error | Level::Fatal => error!("{line}"),
                }
                Ok(LogResponse::synthesized(
                    "mock",
                    "log created successfully (mock)".to_owned(),
                ))
            }
            LogSink::Remote(transport) => {
                let event = LogEvent {
                    stack: stack.to_owned(),
                    level: level.to_owned(),
                    package: package.to_owned(),
                    message: message.to_owned(),
                };
                Ok(transport.send(&event).await?)
            }
        }
    }

    /// # Errors
    /// Returns [`LogError::Validation`] without sending anything when the
    /// stack, level or package is not allowed, and [`LogError::Transport`]
    /// when the request fails.
    #[instrument(skip(self, message))]
    pub async fn log(
        &self,
        stack: &str,
        level: &str,
        package: &str,
        message: &str,
    ) -> Result<LogResponse, LogError> {
        self.dispatch(stack, level, package, message)
            .await
            .inspect_err(|err| error!(%err, "Logging service error"))
    }

    #[instrument(skip(self, message))]
    pub async fn log_or_fallback(
        &self,
        stack: &str,
        level: &str,
        package: &str,
        message: &str,
    ) -> LogResponse {
        match self.dispatch(stack, level, package, message).await {
            Ok(response) => response,
            Err(LogError::Validation(err)) => {
                error!(%err, "Logging validation error");
                LogResponse::synthesized("error", format!("Log validation error: {err}"))
            }
            Err(LogError::Transport(err)) => {
                warn!(%err, "Logging service unavailable, using fallback logging");
                LogResponse::synthesized(
                    "fallback",
                    "log created successfully (fallback)".to_owned(),
                )
            }
        }
    }

    /// Runs [`Self::log_or_fallback`] on a detached task.
    /// Events sent this way may arrive out of order.
    pub fn spawn_log(
        self: &Arc<Self>,
        stack: &'static str,
        level: &'static str,
        package: &'static str,
        message: String,
    ) -> JoinHandle<LogResponse> {
        let logger = Arc::clone(self);
        tokio::spawn(async move {
            logger
                .log_or_fallback(stack, level, package, &message)
                .await
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use axum::{
        Json, Router,
        extract::State,
        http::{HeaderMap, StatusCode, header},
        routing,
    };
    use mockall::{mock, predicate::*};
    use tokio::net::TcpListener;

    use super::*;

    mock! {
        LogTransport {}

        #[async_trait]
        impl LogTransport for LogTransport {
            async fn send(&self, event: &LogEvent) -> Result<LogResponse, TransportError>;
        }
    }

    fn created(log_id: &str) -> LogResponse {
        LogResponse {
            log_id: log_id.to_owned(),
            message: "log created successfully".to_owned(),
        }
    }

    #[test]
    fn test_validate_accepts_any_case() {
        let (stack, level) = validate("BackEnd", "INFO", "Cron_Job").unwrap();
        assert_eq!(stack, Stack::Backend);
        assert_eq!(level, Level::Info);
    }

    #[test]
    fn test_validate_checks_stack_first() {
        assert_eq!(
            validate("middle", "loud", "nope").unwrap_err(),
            LogValidationError::InvalidStack("middle".to_owned())
        );
    }

    #[test]
    fn test_validate_checks_level_before_package() {
        assert_eq!(
            validate("frontend", "trace", "nope").unwrap_err(),
            LogValidationError::InvalidLevel("trace".to_owned())
        );
    }

    #[test]
    fn test_validate_package_allow_list_depends_on_stack() {
        assert!(validate("backend", "info", "db").is_ok());
        assert!(validate("frontend", "info", "hook").is_ok());
        assert!(validate("backend", "info", "auth").is_ok());
        assert!(validate("frontend", "info", "auth").is_ok());

        assert_eq!(
            validate("frontend", "info", "db").unwrap_err(),
            LogValidationError::InvalidPackage {
                package: "db".to_owned(),
                stack: "frontend".to_owned(),
            }
        );
        assert!(validate("backend", "warn", "hook").is_err());
    }

    #[test]
    fn test_validation_messages() {
        assert_eq!(
            LogValidationError::InvalidStack("x".to_owned()).to_string(),
            "Invalid stack value: x. Must be 'backend' or 'frontend'"
        );
        assert_eq!(
            LogValidationError::InvalidPackage {
                package: "p".to_owned(),
                stack: "backend".to_owned()
            }
            .to_string(),
            "Invalid package name: p for stack: backend"
        );
    }

    #[tokio::test]
    async fn test_log_invalid_input_sends_nothing() {
        let mut transport = MockLogTransport::new();
        transport.expect_send().never();
        let logger = EvaluationLogger::remote(Arc::new(transport));

        for (stack, level, package) in [
            ("sideways", "info", "db"),
            ("backend", "verbose", "db"),
            ("backend", "info", "page"),
            ("frontend", "error", "cron_job"),
        ] {
            let err = logger.log(stack, level, package, "msg").await.unwrap_err();
            assert!(matches!(err, LogError::Validation(_)));
        }
    }

    #[tokio::test]
    async fn test_log_sends_fields_verbatim_once() {
        let mut transport = MockLogTransport::new();
        transport
            .expect_send()
            .with(eq(LogEvent {
                stack: "Backend".to_owned(),
                level: "ERROR".to_owned(),
                package: "Handler".to_owned(),
                message: "received string, expected bool".to_owned(),
            }))
            .once()
            .return_once(|_| Ok(created("abc-123")));
        let logger = EvaluationLogger::remote(Arc::new(transport));

        let response = logger
            .log("Backend", "ERROR", "Handler", "received string, expected bool")
            .await
            .unwrap();
        assert_eq!(response, created("abc-123"));
    }

    #[tokio::test]
    async fn test_log_surfaces_transport_failure() {
        let mut transport = MockLogTransport::new();
        transport
            .expect_send()
            .once()
            .return_once(|_| Err(TransportError::Status { status: 503 }));
        let logger = EvaluationLogger::remote(Arc::new(transport));

        let err = logger
            .log("backend", "fatal", "db", "Critical database connection failure.")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LogError::Transport(TransportError::Status { status: 503 })
        ));
    }

    #[tokio::test]
    async fn test_log_or_fallback_on_transport_failure() {
        let mut transport = MockLogTransport::new();
        transport
            .expect_send()
            .once()
            .return_once(|_| Err(TransportError::Status { status: 500 }));
        let logger = EvaluationLogger::remote(Arc::new(transport));

        let response = logger
            .log_or_fallback("frontend", "warn", "api", "API rate limit approaching")
            .await;
        assert!(response.log_id.starts_with("fallback-"));
        assert_eq!(response.message, "log created successfully (fallback)");
    }

    #[tokio::test]
    async fn test_log_or_fallback_on_validation_failure() {
        let mut transport = MockLogTransport::new();
        transport.expect_send().never();
        let logger = EvaluationLogger::remote(Arc::new(transport));

        let response = logger
            .log_or_fallback("backend", "info", "component", "wrong stack")
            .await;
        assert!(response.log_id.starts_with("error-"));
        assert_eq!(
            response.message,
            "Log validation error: Invalid package name: component for stack: backend"
        );
    }

    #[tokio::test]
    async fn test_log_or_fallback_passes_success_through() {
        let mut transport = MockLogTransport::new();
        transport
            .expect_send()
            .once()
            .return_once(|_| Ok(created("remote-1")));
        let logger = EvaluationLogger::remote(Arc::new(transport));

        let response = logger
            .log_or_fallback("frontend", "info", "component", "User profile updated")
            .await;
        assert_eq!(response.log_id, "remote-1");
    }

    #[tokio::test]
    async fn test_console_logger_returns_mock_response() {
        let logger = EvaluationLogger::console();
        let response = logger
            .log("backend", "debug", "utils", "Cache refresh initiated")
            .await
            .unwrap();
        assert!(response.log_id.starts_with("mock-"));
        assert_eq!(response.message, "log created successfully (mock)");

        assert!(logger.log("backend", "debug", "page", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_log_completes() {
        let logger = Arc::new(EvaluationLogger::console());
        let response = logger
            .spawn_log("backend", "info", "service", "spawned".to_owned())
            .await
            .unwrap();
        assert!(response.log_id.starts_with("mock-"));
    }

    #[derive(Clone)]
    struct FakeLogService {
        requests: Arc<Mutex<Vec<(HeaderMap, serde_json::Value)>>>,
        status: StatusCode,
    }

    async fn record_log(
        State(service): State<FakeLogService>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        service.requests.lock().unwrap().push((headers, body));
        (
            service.status,
            Json(serde_json::json!({
                "logID": "a4aad02e-19d0-4153-86d9-58bf55d4f4c8",
                "message": "log created successfully"
            })),
        )
    }

    async fn spawn_log_service(status: StatusCode) -> (Url, FakeLogService) {
        let service = FakeLogService {
            requests: Arc::default(),
            status,
        };
        let app = Router::new()
            .route("/evaluation-service/logs", routing::post(record_log))
            .with_state(service.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let endpoint = Url::parse(&format!("http://{addr}/evaluation-service/logs")).unwrap();
        (endpoint, service)
    }

    #[tokio::test]
    async fn test_http_transport_posts_json_with_bearer_token() {
        let (endpoint, service) = spawn_log_service(StatusCode::OK).await;
        let transport = HttpLogTransport::new(endpoint, Some("s3cret".to_owned()));
        let event = LogEvent {
            stack: "backend".to_owned(),
            level: "info".to_owned(),
            package: "service".to_owned(),
            message: "hello".to_owned(),
        };

        let response = transport.send(&event).await.unwrap();
        assert_eq!(response.log_id, "a4aad02e-19d0-4153-86d9-58bf55d4f4c8");

        let requests = service.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let (headers, body) = &requests[0];
        assert_eq!(headers[header::AUTHORIZATION], "Bearer s3cret");
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        assert_eq!(
            body,
            &serde_json::json!({
                "stack": "backend",
                "level": "info",
                "package": "service",
                "message": "hello"
            })
        );
    }

    #[tokio::test]
    async fn test_http_transport_without_token_sends_no_authorization() {
        let (endpoint, service) = spawn_log_service(StatusCode::OK).await;
        let logger = EvaluationLogger::remote(Arc::new(HttpLogTransport::new(endpoint, None)));

        logger
            .log("frontend", "info", "page", "Statistics page viewed")
            .await
            .unwrap();

        let requests = service.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].0.contains_key(header::AUTHORIZATION));
    }

    #[tokio::test]
    async fn test_http_transport_error_status() {
        let (endpoint, _service) = spawn_log_service(StatusCode::SERVICE_UNAVAILABLE).await;
        let transport = HttpLogTransport::new(endpoint, None);
        let event = LogEvent {
            stack: "backend".to_owned(),
            level: "info".to_owned(),
            package: "service".to_owned(),
            message: "hello".to_owned(),
        };

        let err = transport.send(&event).await.unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 503 }));
    }

    #[tokio::test]
    async fn test_unreachable_service_falls_back() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint = Url::parse(&format!("http://{addr}/evaluation-service/logs")).unwrap();
        let logger = EvaluationLogger::remote(Arc::new(HttpLogTransport::new(endpoint, None)));

        let err = logger
            .log("backend", "error", "handler", "unreachable")
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::Transport(TransportError::Request(_))));

        let response = logger
            .log_or_fallback("backend", "error", "handler", "unreachable")
            .await;
        assert!(response.log_id.starts_with("fallback-"));
    }

    #[test]
    fn test_http_transport_debug_hides_token() {
        let transport = HttpLogTransport::new(
            Url::parse(DEFAULT_LOG_ENDPOINT).unwrap(),
            Some("s3cret".to_owned()),
        );
        assert!(!format!("{transport:?}").contains("s3cret"));
    }
}
