use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use speedpipe_api::TRANSACTION_ID_HEADER;
use speedpipe_auth::JwtService;
use speedpipe_server::broker::{BrokerError, MessageBroker, MessageHandler};
use speedpipe_server::{
    AppConfig, AppState, BrokerBackend, LatestValueCache, MemoryBroker, ServerBuilder,
    StoreBackend, build_app, build_state,
};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const SECRET: &str = "endpoint-test-secret";

/// Accepts subscriptions and publishes but never delivers anything.
struct SilentBroker;

#[async_trait]
impl MessageBroker for SilentBroker {
    async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn subscribe(
        &self,
        _filter: &str,
        _handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "silent"
    }
}

/// Subscribes fine, refuses every publish.
struct RefusingBroker;

#[async_trait]
impl MessageBroker for RefusingBroker {
    async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), BrokerError> {
        Err(BrokerError::ConnectionLost("connection reset by peer".into()))
    }

    async fn subscribe(
        &self,
        _filter: &str,
        _handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "refusing"
    }
}

/// Acknowledges every publish, but only after `delay`.
struct SlowAckBroker {
    delay: Duration,
}

#[async_trait]
impl MessageBroker for SlowAckBroker {
    async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), BrokerError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn subscribe(
        &self,
        _filter: &str,
        _handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "slow-ack"
    }
}

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.redis.enabled = false;
    cfg.mqtt.backend = BrokerBackend::Memory;
    cfg.pipeline.echo_timeout_ms = 300;
    cfg.auth.secret = SECRET.to_string();
    cfg
}

struct TestApp {
    router: Router,
    state: AppState,
    cache: LatestValueCache,
    shutdown: CancellationToken,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_app(broker: Arc<dyn MessageBroker>) -> TestApp {
    start_app_with(broker, test_config()).await
}

async fn start_app_with(broker: Arc<dyn MessageBroker>, cfg: AppConfig) -> TestApp {
    cfg.validate().expect("test config must be valid");
    let cache = LatestValueCache::new(StoreBackend::new_local(), cfg.redis.key.clone(), None);
    let shutdown = CancellationToken::new();
    let (state, _listener) = build_state(&cfg, broker, cache.clone(), shutdown.clone())
        .await
        .expect("build state");
    TestApp {
        router: build_app(&cfg, state.clone()),
        state,
        cache,
        shutdown,
    }
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Option<String>, Value) {
    let resp = router.clone().oneshot(req).await.expect("response");
    let status = resp.status();
    let trace = resp
        .headers()
        .get(TRANSACTION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = resp.into_body().collect().await.expect("body").to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, trace, body)
}

fn json_post(uri: &str, token: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::post(uri).header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get_latest(token: Option<&str>) -> Request<Body> {
    let mut builder = Request::get("/v1");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn issue_token(router: &Router) -> String {
    let (status, _, body) = send(router, json_post("/v1", None, r#"{"email":"a@b.com"}"#)).await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().expect("token").to_string();
    assert!(!token.is_empty());
    token
}

#[tokio::test]
async fn token_publish_then_read_back() {
    let app = start_app(Arc::new(MemoryBroker::new())).await;
    let token = issue_token(&app.router).await;

    let (status, _, body) = send(
        &app.router,
        json_post("/v1/publish", Some(&token), r#"{"speed":42}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"message": "Published speed data to MQTT Pipeline"}));

    let (status, _, body) = send(&app.router, get_latest(Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"latest_speed": 42}));
}

#[tokio::test]
async fn read_before_any_publish_reports_no_data() {
    let app = start_app(Arc::new(MemoryBroker::new())).await;
    let token = issue_token(&app.router).await;

    let (status, _, body) = send(&app.router, get_latest(Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"latest_speed": "No speed data found"}));
}

#[tokio::test]
async fn token_endpoint_rejects_bad_input() {
    let app = start_app(Arc::new(MemoryBroker::new())).await;

    let (status, _, body) =
        send(&app.router, json_post("/v1", None, r#"{"email":"not-an-email"}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);

    let (status, _, body) = send(&app.router, json_post("/v1", None, "{}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "invalid request received");

    let (status, _, body) = send(&app.router, json_post("/v1", None, "{\"email\":")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "invalid body");

    // Display-name form is accepted
    let (status, _, _) = send(
        &app.router,
        json_post("/v1", None, r#"{"email":"Alice <alice@example.com>"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn publish_requires_a_token() {
    let app = start_app(Arc::new(MemoryBroker::new())).await;

    let (status, trace, body) =
        send(&app.router, json_post("/v1/publish", None, r#"{"speed":10}"#)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 401);
    assert_eq!(body["trace"].as_str(), trace.as_deref());

    let (status, _, _) = send(
        &app.router,
        json_post("/v1/publish", Some("not.a.jwt"), r#"{"speed":10}"#),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = send(&app.router, get_latest(None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn expired_token_is_rejected_on_both_endpoints() {
    let app = start_app(Arc::new(MemoryBroker::new())).await;
    let jwt = JwtService::new(SECRET.as_bytes(), time::Duration::minutes(5));
    let minted = time::OffsetDateTime::now_utc() - time::Duration::minutes(6);
    let expired = jwt.issue_at("a@b.com", minted).unwrap().token;

    let (status, _, body) = send(
        &app.router,
        json_post("/v1/publish", Some(&expired), r#"{"speed":10}"#),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "token expired");

    let (status, _, _) = send(&app.router, get_latest(Some(&expired))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn invalid_speed_is_rejected_without_side_effects() {
    let app = start_app(Arc::new(MemoryBroker::new())).await;
    let token = issue_token(&app.router).await;

    let cases = [
        (r#"{"speed":-1}"#, "speed should be range between 0 and 100"),
        (r#"{"speed":101}"#, "speed should be range between 0 and 100"),
        (r#"{}"#, "invalid request received"),
        (r#"{"speed":"fast"}"#, "invalid body"),
        ("not json", "invalid body"),
    ];
    for (payload, message) in cases {
        let (status, _, body) =
            send(&app.router, json_post("/v1/publish", Some(&token), payload)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "payload {payload}");
        assert_eq!(body["message"], message, "payload {payload}");
    }

    assert_eq!(app.cache.get().await.unwrap(), None);
}

#[tokio::test]
async fn broker_failure_is_a_server_error() {
    let app = start_app(Arc::new(RefusingBroker)).await;
    let token = issue_token(&app.router).await;

    let (status, _, body) = send(
        &app.router,
        json_post("/v1/publish", Some(&token), r#"{"speed":5}"#),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], 500);
    assert!(
        body["message"]
            .as_str()
            .unwrap()
            .starts_with("Unable to send the speed data on the topic")
    );
    assert_eq!(app.state.pipeline.registry().pending_count(), 0);
}

#[tokio::test]
async fn missing_echo_times_out() {
    let app = start_app(Arc::new(SilentBroker)).await;
    let token = issue_token(&app.router).await;

    let started = std::time::Instant::now();
    let (status, _, body) = send(
        &app.router,
        json_post("/v1/publish", Some(&token), r#"{"speed":5}"#),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], 500);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(app.state.pipeline.registry().pending_count(), 0);
    assert_eq!(app.cache.get().await.unwrap(), None);
}

#[tokio::test]
async fn slow_broker_ack_is_a_traced_server_error_not_a_request_timeout() {
    let mut cfg = test_config();
    cfg.server.request_timeout_ms = 400;
    cfg.mqtt.ack_timeout_ms = 150;
    cfg.pipeline.echo_timeout_ms = 200;
    let app = start_app_with(
        Arc::new(SlowAckBroker {
            delay: Duration::from_secs(2),
        }),
        cfg,
    )
    .await;
    let token = issue_token(&app.router).await;

    let (status, trace, body) = send(
        &app.router,
        json_post("/v1/publish", Some(&token), r#"{"speed":5}"#),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], 500);
    assert_eq!(body["trace"].as_str(), trace.as_deref());
    assert!(
        body["message"]
            .as_str()
            .unwrap()
            .starts_with("Unable to send the speed data on the topic")
    );
    assert_eq!(app.state.pipeline.registry().pending_count(), 0);
}

#[tokio::test]
async fn corrupt_cached_value_is_a_server_error() {
    let app = start_app(Arc::new(MemoryBroker::new())).await;
    let token = issue_token(&app.router).await;
    app.cache
        .backend()
        .set(app.cache.key(), b"{\"speed\":".to_vec(), None)
        .await
        .unwrap();

    let (status, _, body) = send(&app.router, get_latest(Some(&token))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], 500);
}

#[tokio::test]
async fn error_trace_is_the_request_transaction_id() {
    let app = start_app(Arc::new(MemoryBroker::new())).await;
    let id = uuid::Uuid::new_v4().to_string();

    let req = Request::post("/v1/publish")
        .header(header::CONTENT_TYPE, "application/json")
        .header(TRANSACTION_ID_HEADER, &id)
        .body(Body::from(r#"{"speed":1}"#))
        .unwrap();
    let (status, trace, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(trace.as_deref(), Some(id.as_str()));
    assert_eq!(body["trace"], id);
}

#[tokio::test]
async fn concurrent_publishes_all_confirm() {
    let app = start_app(Arc::new(MemoryBroker::new())).await;
    let token = issue_token(&app.router).await;

    let mut handles = Vec::new();
    for speed in [3, 14, 15, 92, 65] {
        let router = app.router.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            let body = format!(r#"{{"speed":{speed}}}"#);
            send(&router, json_post("/v1/publish", Some(&token), &body)).await.0
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), StatusCode::OK);
    }

    let latest = app.cache.get().await.unwrap().unwrap().speed();
    assert!([3, 14, 15, 92, 65].contains(&latest));
    assert_eq!(app.state.pipeline.registry().pending_count(), 0);
}

#[tokio::test]
async fn health_endpoints() {
    let app = start_app(Arc::new(MemoryBroker::new())).await;

    let req = Request::get("/healthz").body(Body::empty()).unwrap();
    let (status, trace, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));
    assert!(trace.is_some());

    let req = Request::get("/readyz").body(Body::empty()).unwrap();
    let (status, _, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert_eq!(body["cache"], "ok");
    assert_eq!(body["broker"], "connected");
    assert_eq!(body["confirm"], "correlated");
    assert_eq!(body["echo"]["pending"], 0);
    assert_eq!(body["echo"]["dropped"], 0);
}

#[tokio::test]
async fn readiness_reports_confirmed_echoes() {
    let app = start_app(Arc::new(MemoryBroker::new())).await;
    let token = issue_token(&app.router).await;
    let (status, _, _) = send(
        &app.router,
        json_post("/v1/publish", Some(&token), r#"{"speed":12}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let req = Request::get("/readyz").body(Body::empty()).unwrap();
    let (status, _, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["echo"]["completed"], 1);
    assert_eq!(body["echo"]["pending"], 0);
}

#[tokio::test]
async fn disconnected_broker_is_not_ready() {
    let broker = Arc::new(MemoryBroker::new());
    let app = start_app(broker.clone()).await;
    broker.disconnect().await.unwrap();

    let req = Request::get("/readyz").body(Body::empty()).unwrap();
    let (status, _, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unavailable");
    assert_eq!(body["cache"], "ok");
    assert_eq!(body["broker"], "disconnected");
}

#[tokio::test]
async fn server_stops_when_shutdown_is_requested() {
    let app = start_app(Arc::new(MemoryBroker::new())).await;
    let server = ServerBuilder::new(app.state.clone())
        .with_config(test_config())
        .with_addr((std::net::Ipv4Addr::LOCALHOST, 0).into())
        .build();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(server.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("server should stop")
        .expect("join");
    assert!(result.is_ok());
}
