use std::{fs::File, io, sync::Arc};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::Semaphore;
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        self,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use super::connection::{ConnectionError, LoopOutcome, run_loop};
use super::ratelimit::AuthRateLimiter;
use super::session::SmtpSession;
use super::{SmtpConfig, TlsMode};
use crate::store::Store;

#[derive(Debug, Error)]
pub enum SmtpServerError {
    #[error("failed to load private key: {0}")]
    PrivateKey(io::Error),
    #[error("no private key found in the key file")]
    PrivateKeyNotFound,
    #[error("failed to load certificate: {0}")]
    Certificate(io::Error),
    #[error("failed to listen on address: {0}")]
    Listen(io::Error),
    #[error("failed to configure TLS: {0}")]
    Tls(rustls::Error),
}

pub struct SmtpServer {
    store: Arc<dyn Store>,
    limiter: Arc<AuthRateLimiter>,
    config: Arc<SmtpConfig>,
    shutdown: CancellationToken,
}

impl SmtpServer {
    pub fn new(store: Arc<dyn Store>, config: Arc<SmtpConfig>, shutdown: CancellationToken) -> Self {
        let limiter = Arc::new(AuthRateLimiter::new(
            config.auth_fail_limit,
            config.auth_fail_window,
        ));
        SmtpServer {
            store,
            limiter,
            config,
            shutdown,
        }
    }

    fn load_tls_config(
        &self,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), SmtpServerError> {
        let mut cert_reader = io::BufReader::new(
            File::open(&self.config.cert_file).map_err(SmtpServerError::Certificate)?,
        );
        let mut key_reader = io::BufReader::new(
            File::open(&self.config.key_file).map_err(SmtpServerError::PrivateKey)?,
        );

        let certs = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, io::Error>>()
            .map_err(SmtpServerError::Certificate)?;
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(SmtpServerError::PrivateKey)?
            .ok_or(SmtpServerError::PrivateKeyNotFound)?;

        Ok((certs, key))
    }

    fn build_tls_acceptor(&self) -> Result<TlsAcceptor, SmtpServerError> {
        let (certs, key) = self.load_tls_config()?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(SmtpServerError::Tls)?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    pub async fn serve(self) -> Result<(), SmtpServerError> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(SmtpServerError::Listen)?;

        let acceptor = match self.config.tls {
            TlsMode::Plain => None,
            TlsMode::Implicit | TlsMode::StartTls => Some(self.build_tls_acceptor()?),
        };

        info!("smtp server on {}", self.config.listen_addr);

        let permits = Arc::new(Semaphore::new(self.config.max_connections));
        let sessions = TaskTracker::new();

        loop {
            select! {
                _ = self.shutdown.cancelled() => {
                    info!("smtp server stops accepting connections");
                    break;
                }
                result = listener.accept() => match result {
                    Ok((mut stream, peer_addr)) => {
                        trace!(
                            source_ip = peer_addr.ip().to_string(),
                            source_port = peer_addr.port(),
                            "new TCP connection"
                        );

                        let Ok(permit) = permits.clone().try_acquire_owned() else {
                            debug!(peer = %peer_addr, "connection cap reached, turning away");
                            tokio::spawn(async move {
                                stream
                                    .write_all(b"421 4.7.0 Too many connections, try again later\r\n")
                                    .await
                                    .ok();
                                stream.shutdown().await.ok();
                            });
                            continue;
                        };

                        let store = self.store.clone();
                        let limiter = self.limiter.clone();
                        let config = self.config.clone();
                        let acceptor = acceptor.clone();

                        sessions.spawn(async move {
                            let _permit = permit;
                            let result =
                                handle_connection(stream, peer_addr, store, limiter, config, acceptor)
                                    .await;
                            if let Err(err) = result {
                                match err {
                                    ConnectionError::Dropped => {
                                        trace!(peer = %peer_addr, "connection dropped")
                                    }
                                    err => debug!(peer = %peer_addr, "connection failed: {err}"),
                                }
                            }
                        });
                    }
                    Err(err) => {
                        error!("failed to accept connection: {err}");
                    }
                },
            }
        }

        sessions.close();
        if tokio::time::timeout(self.config.shutdown_grace, sessions.wait())
            .await
            .is_err()
        {
            warn!("smtp sessions did not drain within the grace period");
        }
        Ok(())
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async {
            if let Err(e) = self.serve().await {
                error!("smtp server error: {e:?}");
            }
        })
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: std::net::SocketAddr,
    store: Arc<dyn Store>,
    limiter: Arc<AuthRateLimiter>,
    config: Arc<SmtpConfig>,
    acceptor: Option<TlsAcceptor>,
) -> Result<(), ConnectionError> {
    let mut session = SmtpSession::new(
        peer_addr,
        store,
        limiter,
        config.clone(),
        matches!(config.tls, TlsMode::Implicit),
        matches!(config.tls, TlsMode::StartTls),
    );

    match config.tls {
        TlsMode::Plain => {
            run_loop(stream, &mut session, &config, true).await?;
        }
        TlsMode::Implicit => {
            let acceptor = acceptor.expect("implicit TLS requires an acceptor");
            let tls_stream = acceptor
                .accept(stream)
                .await
                .map_err(ConnectionError::Accept)?;
            run_loop(tls_stream, &mut session, &config, true).await?;
        }
        TlsMode::StartTls => {
            let acceptor = acceptor.expect("STARTTLS requires an acceptor");
            if let LoopOutcome::Upgrade(stream) =
                run_loop(stream, &mut session, &config, true).await?
            {
                let tls_stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(ConnectionError::Accept)?;
                session.reset_after_upgrade();
                // RFC 3207: no second greeting after the handshake
                run_loop(tls_stream, &mut session, &config, false).await?;
            }
        }
    }

    Ok(())
}
