mod connection;
pub mod ratelimit;
pub mod server;
mod session;

pub use server::{SmtpServer, SmtpServerError};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// Plaintext listener; development and the embedded harness.
    Plain,
    #[default]
    Implicit,
    StartTls,
}

impl FromStr for TlsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(TlsMode::Plain),
            "implicit" => Ok(TlsMode::Implicit),
            "starttls" => Ok(TlsMode::StartTls),
            other => Err(format!("unknown TLS mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub listen_addr: SocketAddr,
    pub server_name: String,
    pub tls: TlsMode,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub max_connections: usize,
    pub max_message_size: usize,
    pub session_idle_timeout: Duration,
    pub shutdown_grace: Duration,
    pub auth_fail_limit: u32,
    pub auth_fail_window: Duration,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:2525".parse().expect("static address"),
            server_name: "mailbridge".to_string(),
            tls: TlsMode::default(),
            cert_file: "cert.pem".into(),
            key_file: "key.pem".into(),
            max_connections: 1000,
            max_message_size: 25 * 1024 * 1024,
            session_idle_timeout: Duration::from_secs(5 * 60),
            shutdown_grace: Duration::from_secs(30),
            auth_fail_limit: 10,
            auth_fail_window: Duration::from_secs(10 * 60),
        }
    }
}

impl SmtpConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        let parse = |key: &str| std::env::var(key).ok();
        Self {
            listen_addr: parse("MAILBRIDGE_SMTP_LISTEN_ADDR")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.listen_addr),
            server_name: parse("MAILBRIDGE_SMTP_SERVER_NAME").unwrap_or(default.server_name),
            tls: parse("MAILBRIDGE_SMTP_TLS_MODE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.tls),
            cert_file: parse("MAILBRIDGE_SMTP_CERT_FILE")
                .map(PathBuf::from)
                .unwrap_or(default.cert_file),
            key_file: parse("MAILBRIDGE_SMTP_KEY_FILE")
                .map(PathBuf::from)
                .unwrap_or(default.key_file),
            max_connections: parse("MAILBRIDGE_SMTP_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_connections),
            max_message_size: parse("MAILBRIDGE_SMTP_MAX_MESSAGE_SIZE_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_message_size),
            session_idle_timeout: parse("MAILBRIDGE_SMTP_SESSION_IDLE_TIMEOUT")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.session_idle_timeout),
            shutdown_grace: parse("MAILBRIDGE_SMTP_SHUTDOWN_GRACE")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.shutdown_grace),
            auth_fail_limit: parse("MAILBRIDGE_SMTP_AUTH_FAIL_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.auth_fail_limit),
            auth_fail_window: parse("MAILBRIDGE_SMTP_AUTH_FAIL_WINDOW")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.auth_fail_window),
        }
    }
}
