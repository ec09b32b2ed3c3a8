use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use securewatch::action::{CommandOutput, CommandRunner};
use securewatch::config::MonitorConfig;
use securewatch::event::ServerIdentity;
use securewatch::notification::ChatTransport;
use securewatch::utils::AppError;
use securewatch::{app, AppState, Monitor};

const TEST_SECRET: &str = "test-command-secret";

const CONFIG: &str = r#"
    [general]
    local_only = true
    notification_delay_secs = 0

    [recipients]
    admins = ["100"]
    viewers = ["200"]

    [customization]
    resolve_hostnames = false

    [local]
    use_sudo = false
"#;

// ===== Test Doubles =====

#[derive(Default)]
struct FakeFail2ban {
    calls: AtomicUsize,
}

#[async_trait]
impl CommandRunner for FakeFail2ban {
    async fn run(
        &self,
        _server: &ServerIdentity,
        argv: &[String],
        _timeout: Duration,
    ) -> Result<CommandOutput, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stdout = match argv.get(1).map(String::as_str) {
            Some("set") => "1\n",
            _ => "Status\n|- Number of jail:\t1\n`- Jail list:\tsshd\n",
        };
        Ok(CommandOutput {
            status: Some(0),
            stdout: stdout.as_bytes().to_vec(),
            stderr: String::new(),
        })
    }
}

struct SilentTransport;

#[async_trait]
impl ChatTransport for SilentTransport {
    async fn deliver(&self, _recipients: &[String], _text: &str) -> Result<(), AppError> {
        Ok(())
    }
}

// ===== Helper Functions =====

struct TestApp {
    router: Router,
    runner: Arc<FakeFail2ban>,
    _monitor: Monitor,
}

fn create_test_app() -> TestApp {
    let config = MonitorConfig::from_toml_str(CONFIG).unwrap();
    let runner = Arc::new(FakeFail2ban::default());
    let monitor =
        Monitor::start_with(&config, runner.clone(), Arc::new(SilentTransport), Duration::from_secs(1)).unwrap();

    let state = AppState {
        commands: monitor.commands(),
        command_secret: Arc::from(TEST_SECRET),
    };

    TestApp {
        router: app(state),
        runner,
        _monitor: monitor,
    }
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn command_request(caller_id: &str, text: &str) -> Request<Body> {
    let body = json!({ "callerId": caller_id, "text": text }).to_string();
    Request::builder()
        .method("POST")
        .uri("/api/commands")
        .header("Content-Type", "application/json")
        .header("X-Signature-256", sign(TEST_SECRET, body.as_bytes()))
        .body(Body::from(body))
        .unwrap()
}

async fn parse_response_body(body: Body) -> Value {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

// ===== Health Check Tests =====

mod health {
    use super::*;

    #[tokio::test]
    async fn should_return_ok() {
        let test_app = create_test_app();

        let request = Request::builder()
            .method("GET")
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = test_app.router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}

// ===== Signature Tests =====

mod signature {
    use super::*;

    #[tokio::test]
    async fn should_return_401_without_signature() {
        // Arrange
        let test_app = create_test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/api/commands")
            .header("Content-Type", "application/json")
            .body(Body::from(r#"{"callerId":"100","text":"/status"}"#))
            .unwrap();

        // Act
        let response = test_app.router.oneshot(request).await.unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = parse_response_body(response.into_body()).await;
        assert_eq!(body["isSuccess"], false);
        assert_eq!(body["code"], "AUTH401");
    }

    #[tokio::test]
    async fn should_return_401_with_wrong_secret() {
        // Arrange
        let test_app = create_test_app();
        let body = r#"{"callerId":"100","text":"/status"}"#;
        let request = Request::builder()
            .method("POST")
            .uri("/api/commands")
            .header("X-Signature-256", sign("not-the-secret", body.as_bytes()))
            .body(Body::from(body))
            .unwrap();

        // Act
        let response = test_app.router.oneshot(request).await.unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn should_return_400_for_signed_garbage() {
        let test_app = create_test_app();
        let body = "not json";
        let request = Request::builder()
            .method("POST")
            .uri("/api/commands")
            .header("X-Signature-256", sign(TEST_SECRET, body.as_bytes()))
            .body(Body::from(body))
            .unwrap();

        let response = test_app.router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

// ===== Command Tests =====

mod commands {
    use super::*;

    #[tokio::test]
    async fn should_return_403_for_unknown_caller() {
        // Arrange
        let test_app = create_test_app();

        // Act
        let response = test_app
            .router
            .oneshot(command_request("999", "/status"))
            .await
            .unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = parse_response_body(response.into_body()).await;
        assert_eq!(body["code"], "AUTH403");
    }

    #[tokio::test]
    async fn should_return_status_to_viewer() {
        // Arrange
        let test_app = create_test_app();

        // Act
        let response = test_app
            .router
            .oneshot(command_request("200", "/status"))
            .await
            .unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::OK);
        let body = parse_response_body(response.into_body()).await;
        assert_eq!(body["isSuccess"], true);
        let reply = body["result"]["reply"].as_str().unwrap();
        assert!(reply.contains("local: reachable"));
    }

    #[tokio::test]
    async fn should_reject_viewer_ban_without_touching_fail2ban() {
        // Arrange
        let test_app = create_test_app();
        let runner = Arc::clone(&test_app.runner);

        // Act
        let response = test_app
            .router
            .oneshot(command_request("200", "/fail2ban ban 203.0.113.9 sshd"))
            .await
            .unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn should_ban_for_admin() {
        // Arrange
        let test_app = create_test_app();
        let runner = Arc::clone(&test_app.runner);

        // Act
        let response = test_app
            .router
            .oneshot(command_request("100", "/fail2ban ban 203.0.113.9 sshd"))
            .await
            .unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::OK);
        let body = parse_response_body(response.into_body()).await;
        assert_eq!(
            body["result"]["reply"],
            "Banned 203.0.113.9 in jail sshd on local"
        );
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_return_400_for_invalid_ip() {
        let test_app = create_test_app();

        let response = test_app
            .router
            .oneshot(command_request("100", "/fail2ban ban not-an-ip sshd"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
