//! End-to-end tests over the embedded harness: plaintext SMTP listener,
//! in-memory store, scriptable ESP and the real HTTP control plane, all on
//! random localhost ports.

use base64ct::{Base64, Encoding};
use serde_json::{Value, json};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::api::WebhookSecrets;
use crate::config::{HealthConfig, JwtConfig, QueueConfig, RetryConfig, WorkerConfig};
use crate::models::{
    AccountType, DeliveryState, Group, MessageStatus, NewGroup, NewProvider, NewRoutingRule,
    NewUser, ProviderKind, RuleConditions, User,
};
use crate::providers::ProviderError;
use crate::providers::mock::{MockEsp, MockEspFactory};
use crate::smtp::{SmtpConfig, TlsMode};
use crate::store::{
    DeliveryLogStore, DirectoryStore, DlqStore, MemoryStore, QueueStore, Store,
};
use crate::{run_api_server, run_gateway};

fn random_port() -> u16 {
    rand::random_range(10_000..30_000)
}

struct TestStack {
    store: Arc<MemoryStore>,
    group: Group,
    owner: User,
    esp: Arc<MockEsp>,
    client: reqwest::Client,
    smtp_port: u16,
    http_port: u16,
    _guard: tokio_util::sync::DropGuard,
}

impl TestStack {
    fn api(&self, path: &str) -> String {
        format!("http://localhost:{}{path}", self.http_port)
    }

    async fn login(&self) -> String {
        let response: Value = self
            .client
            .post(self.api("/api/v1/auth/login"))
            .json(&json!({"email": self.owner.email, "password": "pw"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        response["access_token"].as_str().unwrap().to_string()
    }

    async fn wait_for_status(&self, id: crate::models::MessageId, status: MessageStatus) {
        for _ in 0..500 {
            if self
                .store
                .message(id)
                .await
                .unwrap()
                .is_some_and(|m| m.status == status)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("message never reached {status:?}");
    }
}

async fn setup(secrets: WebhookSecrets, max_connections: usize) -> TestStack {
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn Store> = store.clone();

    crate::bootstrap(&dyn_store).await.unwrap();

    let group = store
        .create_group(NewGroup {
            name: "acme".into(),
            monthly_limit: 10_000,
            allow_any_sender: false,
            fallback_providers: vec![],
        })
        .await
        .unwrap();
    let owner = store
        .create_user(NewUser {
            email: "owner@acme.test".into(),
            username: None,
            password: "pw".into(),
            account_type: AccountType::User,
            group_id: None,
            allowed_domains: vec![],
        })
        .await
        .unwrap();
    store
        .add_member(group.id, owner.id, crate::models::MemberRole::Owner)
        .await
        .unwrap();
    store
        .create_user(NewUser {
            email: "smtp_user@acme.test".into(),
            username: Some("smtp_user".into()),
            password: "pw".into(),
            account_type: AccountType::Smtp,
            group_id: Some(group.id),
            allowed_domains: vec!["example.com".into()],
        })
        .await
        .unwrap();

    let provider = store
        .create_provider(
            group.id,
            NewProvider {
                name: "sendgrid-mock".into(),
                kind: ProviderKind::Sendgrid,
                api_key: Some("key".into()),
                smtp_config: json!({}),
                enabled: true,
            },
        )
        .await
        .unwrap();
    store
        .create_rule(
            group.id,
            NewRoutingRule {
                priority: 0,
                conditions: RuleConditions::default(),
                provider_id: provider.id,
                enabled: true,
            },
        )
        .await
        .unwrap();

    let esp = MockEsp::new("sendgrid-mock");
    let factory = MockEspFactory::new();
    factory.register(provider.id, esp.clone());

    let smtp_port = random_port();
    let http_port = random_port();
    let shutdown = CancellationToken::new();

    let smtp_config = SmtpConfig {
        listen_addr: SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), smtp_port).into(),
        server_name: "localhost".into(),
        tls: TlsMode::Plain,
        max_connections,
        max_message_size: 64 * 1024,
        ..SmtpConfig::default()
    };
    run_gateway(
        dyn_store.clone(),
        smtp_config,
        WorkerConfig {
            count: 4,
            send_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
        },
        RetryConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            max_attempts: 5,
        },
        QueueConfig {
            claim_batch: 16,
            visibility_timeout: Duration::from_secs(600),
        },
        HealthConfig::default(),
        Arc::new(factory),
        shutdown.clone(),
    );
    run_api_server(
        dyn_store,
        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), http_port).into(),
        JwtConfig::for_tests("test-signing-key"),
        secrets,
        shutdown.clone(),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(150)).await;

    TestStack {
        store,
        group,
        owner,
        esp,
        client: reqwest::Client::new(),
        smtp_port,
        http_port,
        _guard: shutdown.drop_guard(),
    }
}

/// Minimal SMTP client speaking raw commands, enough to drive the
/// plaintext listener deterministically.
struct RawSmtpClient {
    stream: BufStream<TcpStream>,
}

impl RawSmtpClient {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut client = Self {
            stream: BufStream::new(stream),
        };
        let (code, _) = client.read_reply().await;
        assert_eq!(code, 220, "expected a greeting");
        client
    }

    async fn read_reply(&mut self) -> (u16, String) {
        let mut text = String::new();
        loop {
            let mut line = String::new();
            self.stream.read_line(&mut line).await.unwrap();
            assert!(!line.is_empty(), "connection closed mid-reply");
            let code: u16 = line.get(..3).and_then(|c| c.parse().ok()).unwrap();
            let done = line.as_bytes().get(3) != Some(&b'-');
            text.push_str(line[4..].trim_end());
            if done {
                return (code, text);
            }
            text.push('\n');
        }
    }

    async fn cmd(&mut self, line: &str) -> (u16, String) {
        self.stream.write_all(line.as_bytes()).await.unwrap();
        self.stream.write_all(b"\r\n").await.unwrap();
        self.stream.flush().await.unwrap();
        self.read_reply().await
    }

    async fn authenticate(&mut self, username: &str, password: &str) -> (u16, String) {
        let encoded = Base64::encode_string(format!("\0{username}\0{password}").as_bytes());
        self.cmd(&format!("AUTH PLAIN {encoded}")).await
    }

    async fn send_data(&mut self, body: &str) -> (u16, String) {
        let (code, _) = self.cmd("DATA").await;
        assert_eq!(code, 354);
        self.stream.write_all(body.as_bytes()).await.unwrap();
        self.stream.write_all(b"\r\n.\r\n").await.unwrap();
        self.stream.flush().await.unwrap();
        self.read_reply().await
    }
}

async fn submit_message(stack: &TestStack) -> crate::models::MessageId {
    let mut smtp = RawSmtpClient::connect(stack.smtp_port).await;
    let (code, _) = smtp.cmd("EHLO client.test").await;
    assert_eq!(code, 250);
    let (code, _) = smtp.authenticate("smtp_user", "pw").await;
    assert_eq!(code, 235);
    let (code, _) = smtp.cmd("MAIL FROM:<alice@example.com>").await;
    assert_eq!(code, 250);
    let (code, _) = smtp.cmd("RCPT TO:<bob@dest.com>").await;
    assert_eq!(code, 250);
    let (code, reply) = smtp.send_data("Subject: Hi\r\n\r\nhello").await;
    assert_eq!(code, 250);
    smtp.cmd("QUIT").await;

    // the reply echoes the queue id
    let id = reply.rsplit(' ').next().unwrap();
    id.parse().unwrap()
}

#[tokio::test]
async fn submission_to_delivery_happy_path() {
    let stack = setup(WebhookSecrets::default(), 1000).await;
    let id = submit_message(&stack).await;

    stack.wait_for_status(id, MessageStatus::Delivered).await;

    let message = stack.store.message(id).await.unwrap().unwrap();
    assert_eq!(message.envelope.sender, "alice@example.com");
    assert_eq!(message.envelope.subject, "Hi");
    assert_eq!(message.retry_count, 0);

    let logs = stack.store.logs_for_message(id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, DeliveryState::Sent);
    assert!(logs[0].provider_message_id.is_some());
    assert_eq!(stack.esp.sent_count(), 1);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn disallowed_sender_domain_leaves_no_message() {
    let stack = setup(WebhookSecrets::default(), 1000).await;

    let mut smtp = RawSmtpClient::connect(stack.smtp_port).await;
    smtp.cmd("EHLO client.test").await;
    let (code, _) = smtp.authenticate("smtp_user", "pw").await;
    assert_eq!(code, 235);
    let (code, reply) = smtp.cmd("MAIL FROM:<eve@other.com>").await;
    assert_eq!(code, 550, "{reply}");
    assert!(reply.contains("5.7.1"));
    smtp.cmd("QUIT").await;

    assert_eq!(stack.store.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn connection_cap_turns_away_with_421() {
    let stack = setup(WebhookSecrets::default(), 1).await;

    // first session occupies the only slot
    let _held = RawSmtpClient::connect(stack.smtp_port).await;

    let stream = TcpStream::connect(("127.0.0.1", stack.smtp_port))
        .await
        .unwrap();
    let mut stream = BufStream::new(stream);
    let mut line = String::new();
    stream.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("421"), "got: {line}");
}

#[tokio::test]
async fn webhook_reconciles_and_is_idempotent() {
    let stack = setup(WebhookSecrets::default(), 1000).await;
    let id = submit_message(&stack).await;
    stack.wait_for_status(id, MessageStatus::Delivered).await;

    let pid = stack.store.logs_for_message(id).await.unwrap()[0]
        .provider_message_id
        .clone()
        .unwrap();

    let event = json!([{"event": "bounce", "sg_message_id": pid, "reason": "550"}]);
    for _ in 0..2 {
        let response = stack
            .client
            .post(stack.api("/api/v1/webhooks/sendgrid"))
            .json(&event)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let log = stack
            .store
            .log_by_provider_message_id(&pid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(log.status, DeliveryState::Bounced);
        assert_eq!(log.last_error.as_deref(), Some("550"));
        // the reconciler never touches the message itself
        assert_eq!(
            stack.store.message(id).await.unwrap().unwrap().status,
            MessageStatus::Delivered
        );
    }
}

#[tokio::test]
async fn webhook_with_bad_signature_changes_nothing() {
    let secrets = WebhookSecrets {
        sendgrid: Some("whsec".into()),
        ..Default::default()
    };
    let stack = setup(secrets, 1000).await;
    let id = submit_message(&stack).await;
    stack.wait_for_status(id, MessageStatus::Delivered).await;
    let pid = stack.store.logs_for_message(id).await.unwrap()[0]
        .provider_message_id
        .clone()
        .unwrap();

    let response = stack
        .client
        .post(stack.api("/api/v1/webhooks/sendgrid"))
        .header("X-Webhook-Signature", "deadbeef")
        .json(&json!([{"event": "bounce", "sg_message_id": pid}]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert_eq!(
        stack
            .store
            .log_by_provider_message_id(&pid)
            .await
            .unwrap()
            .unwrap()
            .status,
        DeliveryState::Sent
    );
}

#[tokio::test]
async fn permanent_failure_reaches_dlq_and_reprocesses_via_api() {
    let stack = setup(WebhookSecrets::default(), 1000).await;
    stack
        .esp
        .push_error(ProviderError::permanent("400 bad request").with_code(400));

    let id = submit_message(&stack).await;
    stack.wait_for_status(id, MessageStatus::Dead).await;
    assert!(stack
        .store
        .dlq_entry_for_message(stack.group.id, id)
        .await
        .unwrap()
        .is_some());

    let token = stack.login().await;
    let response = stack
        .client
        .post(stack.api("/api/v1/dlq/reprocess"))
        .bearer_auth(&token)
        .json(&json!({"message_ids": [id]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["reprocessed"], 1);
    assert_eq!(body["total"], 1);

    // the entry is consumed, a second reprocess does nothing
    let body: Value = stack
        .client
        .post(stack.api("/api/v1/dlq/reprocess"))
        .bearer_auth(&token)
        .json(&json!({"message_ids": [id]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["reprocessed"], 0);

    // an empty batch is a validation error
    let response = stack
        .client
        .post(stack.api("/api/v1/dlq/reprocess"))
        .bearer_auth(&token)
        .json(&json!({"message_ids": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn auth_flow_and_provider_crud() {
    let stack = setup(WebhookSecrets::default(), 1000).await;

    // bad password is a 401
    let response = stack
        .client
        .post(stack.api("/api/v1/auth/login"))
        .json(&json!({"email": stack.owner.email, "password": "wrong"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // unauthenticated provider access is a 401
    let response = stack
        .client
        .get(stack.api("/api/v1/providers"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let token = stack.login().await;
    let created: Value = stack
        .client
        .post(stack.api("/api/v1/providers"))
        .bearer_auth(&token)
        .json(&json!({
            "name": "mailgun-backup",
            "type": "mailgun",
            "api_key": "key-123",
            "smtp_config": {"domain": "mg.acme.test"},
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["kind"], "mailgun");
    // credentials never serialize back out
    assert!(created.get("api_key").is_none());

    let listed: Value = stack
        .client
        .get(stack.api("/api/v1/providers"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 2);

    // invalid provider type is a 400
    let response = stack
        .client
        .post(stack.api("/api/v1/providers"))
        .bearer_auth(&token)
        .json(&json!({"name": "x", "type": "pigeon"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // duplicate name in the same group is a 409
    let response = stack
        .client
        .post(stack.api("/api/v1/providers"))
        .bearer_auth(&token)
        .json(&json!({"name": "mailgun-backup", "type": "mailgun", "api_key": "k"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn refresh_rotates_and_logout_revokes() {
    let stack = setup(WebhookSecrets::default(), 1000).await;
    let pair: Value = stack
        .client
        .post(stack.api("/api/v1/auth/login"))
        .json(&json!({"email": stack.owner.email, "password": "pw"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let refresh = pair["refresh_token"].as_str().unwrap().to_string();

    let response = stack
        .client
        .post(stack.api("/api/v1/auth/refresh"))
        .json(&json!({"refresh_token": refresh}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // the rotated-out token is spent
    let response = stack
        .client
        .post(stack.api("/api/v1/auth/refresh"))
        .json(&json!({"refresh_token": refresh}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let pair: Value = stack
        .client
        .post(stack.api("/api/v1/auth/login"))
        .json(&json!({"email": stack.owner.email, "password": "pw"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let refresh = pair["refresh_token"].as_str().unwrap().to_string();
    let response = stack
        .client
        .post(stack.api("/api/v1/auth/logout"))
        .json(&json!({"refresh_token": refresh}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
    let response = stack
        .client
        .post(stack.api("/api/v1/auth/refresh"))
        .json(&json!({"refresh_token": refresh}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn last_owner_is_protected_over_the_api() {
    let stack = setup(WebhookSecrets::default(), 1000).await;
    let token = stack.login().await;

    let response = stack
        .client
        .patch(stack.api(&format!(
            "/api/v1/groups/{}/members/{}",
            stack.group.id, stack.owner.id
        )))
        .bearer_auth(&token)
        .json(&json!({"role": "member"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);

    let response = stack
        .client
        .delete(stack.api(&format!(
            "/api/v1/groups/{}/members/{}",
            stack.group.id, stack.owner.id
        )))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn health_and_correlation_header() {
    let stack = setup(WebhookSecrets::default(), 1000).await;

    let response = stack.client.get(stack.api("/healthz")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let response = stack.client.get(stack.api("/readyz")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    // a supplied correlation id is echoed back
    let response = stack
        .client
        .get(stack.api("/healthz"))
        .header("X-Correlation-ID", "trace-me-123")
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.headers().get("X-Correlation-ID").unwrap(),
        "trace-me-123"
    );

    // and minted when absent
    let response = stack.client.get(stack.api("/healthz")).send().await.unwrap();
    assert!(response.headers().contains_key("X-Correlation-ID"));
}

#[tokio::test]
async fn transient_then_success_over_smtp() {
    let stack = setup(WebhookSecrets::default(), 1000).await;
    stack
        .esp
        .push_error(ProviderError::transient("503 upstream").with_code(503));
    stack
        .esp
        .push_error(ProviderError::transient("503 upstream").with_code(503));

    let id = submit_message(&stack).await;
    stack.wait_for_status(id, MessageStatus::Delivered).await;

    let message = stack.store.message(id).await.unwrap().unwrap();
    assert_eq!(message.retry_count, 2);
    assert_eq!(stack.store.logs_for_message(id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn message_listing_is_group_scoped() {
    let stack = setup(WebhookSecrets::default(), 1000).await;
    let id = submit_message(&stack).await;
    stack.wait_for_status(id, MessageStatus::Delivered).await;

    let token = stack.login().await;
    let messages: Value = stack
        .client
        .get(stack.api("/api/v1/messages"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let messages = messages.as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["sender"], "alice@example.com");
    // listings are metadata only
    assert!(messages[0].get("body").is_none());
    assert!(messages[0].get("headers").is_none());
}
