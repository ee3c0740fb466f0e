use base64ct::Encoding;
use email_address::EmailAddress;
use mail_parser::MessageParser;
use smtp_proto::{
    AUTH_PLAIN, EXT_8BIT_MIME, EXT_AUTH, EXT_ENHANCED_STATUS_CODES, EXT_SIZE, EXT_START_TLS,
    EhloResponse, Request,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace};

use super::{SmtpConfig, ratelimit::AuthRateLimiter};
use crate::models::{Envelope, Group, NewMessage, User};
use crate::store::Store;

/// One SMTP submission session:
/// `Connected -> Authenticated -> MailFrom -> RcptTo -> Data`, where RSET
/// and a finished DATA drop back to Authenticated. Invalid sequencing
/// answers 503.
pub struct SmtpSession {
    store: Arc<dyn Store>,
    limiter: Arc<AuthRateLimiter>,
    config: Arc<SmtpConfig>,

    peer_addr: SocketAddr,
    peer_name: Option<String>,
    tls_active: bool,
    starttls_available: bool,
    auth: Option<AuthBinding>,
    state: Transaction,
}

/// What a successful AUTH binds: the account, its tenant and thereby the
/// allowed-domain set.
struct AuthBinding {
    user: User,
    group: Group,
}

enum Transaction {
    Idle,
    MailFrom {
        sender: String,
    },
    RcptTo {
        sender: String,
        recipients: Vec<String>,
    },
    Data {
        sender: String,
        recipients: Vec<String>,
        buffer: Vec<u8>,
        oversized: bool,
    },
}

pub enum SessionReply {
    ReplyAndContinue(u16, String),
    ReplyAndStop(u16, String),
    RawReply(Vec<u8>),
    IngestData(u16, String),
    IngestAuth(u16, String),
    /// Reply, then wrap the connection in TLS and reset the session.
    UpgradeTls(u16, String),
}

pub enum DataReply {
    ReplyAndContinue(u16, String),
    ContinueIngest,
}

struct AttemptedAuth<'a> {
    username: &'a str,
    password: &'a str,
}

const DATA_END: &[u8] = b"\r\n.\r\n";

impl SmtpSession {
    const RESPONSE_OK: &'static str = "2.0.0 Ok";
    const RESPONSE_BYE: &'static str = "2.0.0 Goodbye";
    const RESPONSE_FROM_OK: &'static str = "2.1.0 Originator ok";
    const RESPONSE_TO_OK: &'static str = "2.1.5 Recipient ok";
    const RESPONSE_AUTH_OK: &'static str = "2.7.0 Authentication succeeded";
    const RESPONSE_START_DATA: &'static str = "Start mail input; end with <CRLF>.<CRLF>";
    const RESPONSE_READY_TLS: &'static str = "2.0.0 Ready to start TLS";
    const RESPONSE_SYNTAX_ERROR: &'static str = "5.5.2 Syntax error";
    const RESPONSE_BAD_SEQUENCE: &'static str = "5.5.1 Bad sequence of commands";
    const RESPONSE_HELLO_FIRST: &'static str = "5.5.1 Say EHLO first";
    const RESPONSE_AUTH_FIRST: &'static str = "5.5.1 Authenticate first";
    const RESPONSE_MAIL_FIRST: &'static str = "5.5.1 Use MAIL first";
    const RESPONSE_NESTED_MAIL: &'static str = "5.5.1 Nested MAIL command";
    const RESPONSE_ALREADY_AUTHENTICATED: &'static str = "5.5.1 Already authenticated";
    const RESPONSE_NOT_IMPLEMENTED: &'static str = "5.5.1 Command not implemented";
    const RESPONSE_MUST_USE_ESMTP: &'static str = "5.5.1 Use EHLO";
    const RESPONSE_AUTH_FAILED: &'static str = "5.7.8 Authentication credentials invalid";
    const RESPONSE_AUTH_THROTTLED: &'static str =
        "4.7.0 Too many authentication failures, try again later";
    const RESPONSE_INVALID_SENDER: &'static str = "5.1.7 Invalid sender address";
    const RESPONSE_INVALID_RECIPIENT: &'static str = "5.1.1 Invalid recipient address";
    const RESPONSE_DOMAIN_DENIED: &'static str = "5.7.1 Sender domain not permitted";
    const RESPONSE_TOO_LARGE: &'static str = "5.3.4 Message exceeds the size limit";
    const RESPONSE_STORAGE_FAILURE: &'static str =
        "4.3.0 Temporary storage failure, try again later";

    pub fn new(
        peer_addr: SocketAddr,
        store: Arc<dyn Store>,
        limiter: Arc<AuthRateLimiter>,
        config: Arc<SmtpConfig>,
        tls_active: bool,
        starttls_available: bool,
    ) -> Self {
        Self {
            store,
            limiter,
            config,
            peer_addr,
            peer_name: None,
            tls_active,
            starttls_available,
            auth: None,
            state: Transaction::Idle,
        }
    }

    pub fn peer(&self) -> &SocketAddr {
        &self.peer_addr
    }

    /// RFC 3207: a finished TLS handshake discards everything learned
    /// before it.
    pub fn reset_after_upgrade(&mut self) {
        self.peer_name = None;
        self.auth = None;
        self.state = Transaction::Idle;
        self.tls_active = true;
    }

    pub async fn handle(
        &mut self,
        request: Result<Request<String>, smtp_proto::Error>,
    ) -> SessionReply {
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                debug!("failed to parse request: {e}");
                return SessionReply::ReplyAndContinue(
                    502,
                    Self::RESPONSE_NOT_IMPLEMENTED.into(),
                );
            }
        };

        if let Request::Auth { mechanism, .. } = request {
            // Request's Debug would print the credential payload
            trace!("received AUTH with mechanism {mechanism} from {}", self.peer_addr);
        } else {
            trace!("received request: {request:?} from {}", self.peer_addr);
        }

        match request {
            Request::Ehlo { host } => {
                let mut response = EhloResponse::new(host.as_str());
                response.capabilities =
                    EXT_ENHANCED_STATUS_CODES | EXT_8BIT_MIME | EXT_AUTH | EXT_SIZE;
                if self.starttls_available && !self.tls_active {
                    response.capabilities |= EXT_START_TLS;
                }
                response.auth_mechanisms = AUTH_PLAIN;
                response.size = self.config.max_message_size;

                let mut buf = Vec::with_capacity(128);
                response.write(&mut buf).ok();

                self.peer_name = Some(host);
                self.state = Transaction::Idle;

                SessionReply::RawReply(buf)
            }
            Request::Helo { host: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_MUST_USE_ESMTP.into())
            }
            Request::Quit => SessionReply::ReplyAndStop(221, Self::RESPONSE_BYE.into()),
            Request::Noop { value: _ } => {
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            Request::StartTls => {
                if self.tls_active {
                    SessionReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into())
                } else if !self.starttls_available {
                    SessionReply::ReplyAndContinue(502, Self::RESPONSE_NOT_IMPLEMENTED.into())
                } else {
                    SessionReply::UpgradeTls(220, Self::RESPONSE_READY_TLS.into())
                }
            }
            Request::Rset => {
                self.state = Transaction::Idle;
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            _ignored if self.peer_name.is_none() => {
                SessionReply::ReplyAndContinue(503, Self::RESPONSE_HELLO_FIRST.into())
            }
            Request::Auth {
                mechanism,
                initial_response,
            } => {
                if self.auth.is_some() {
                    return SessionReply::ReplyAndContinue(
                        503,
                        Self::RESPONSE_ALREADY_AUTHENTICATED.into(),
                    );
                }
                if mechanism != AUTH_PLAIN {
                    debug!("unsupported AUTH mechanism requested");
                    return SessionReply::ReplyAndContinue(535, Self::RESPONSE_AUTH_FAILED.into());
                }
                if initial_response.is_empty() {
                    return SessionReply::IngestAuth(334, String::new());
                }
                self.handle_plain_auth(&mut initial_response.into_bytes())
                    .await
            }
            Request::Mail { from } => {
                if self.auth.is_none() {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_AUTH_FIRST.into());
                }
                if !matches!(self.state, Transaction::Idle) {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_NESTED_MAIL.into());
                }
                let Ok(sender) = from.address.parse::<EmailAddress>() else {
                    return SessionReply::ReplyAndContinue(
                        550,
                        Self::RESPONSE_INVALID_SENDER.into(),
                    );
                };

                let binding = self.auth.as_ref().expect("checked above");
                if !binding
                    .user
                    .sender_domain_allowed(&binding.group, sender.domain())
                {
                    debug!(
                        domain = sender.domain(),
                        "sender domain rejected for this tenant"
                    );
                    return SessionReply::ReplyAndContinue(
                        550,
                        Self::RESPONSE_DOMAIN_DENIED.into(),
                    );
                }

                self.state = Transaction::MailFrom {
                    sender: from.address,
                };
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_FROM_OK.into())
            }
            Request::Rcpt { to } => {
                if to.address.parse::<EmailAddress>().is_err() {
                    return match self.state {
                        Transaction::MailFrom { .. } | Transaction::RcptTo { .. } => {
                            SessionReply::ReplyAndContinue(
                                550,
                                Self::RESPONSE_INVALID_RECIPIENT.into(),
                            )
                        }
                        _ => SessionReply::ReplyAndContinue(503, Self::RESPONSE_MAIL_FIRST.into()),
                    };
                }
                match std::mem::replace(&mut self.state, Transaction::Idle) {
                    Transaction::MailFrom { sender } => {
                        self.state = Transaction::RcptTo {
                            sender,
                            recipients: vec![to.address],
                        };
                        SessionReply::ReplyAndContinue(250, Self::RESPONSE_TO_OK.into())
                    }
                    Transaction::RcptTo {
                        sender,
                        mut recipients,
                    } => {
                        recipients.push(to.address);
                        self.state = Transaction::RcptTo { sender, recipients };
                        SessionReply::ReplyAndContinue(250, Self::RESPONSE_TO_OK.into())
                    }
                    other => {
                        self.state = other;
                        SessionReply::ReplyAndContinue(503, Self::RESPONSE_MAIL_FIRST.into())
                    }
                }
            }
            Request::Data => match std::mem::replace(&mut self.state, Transaction::Idle) {
                Transaction::RcptTo { sender, recipients } => {
                    self.state = Transaction::Data {
                        sender,
                        recipients,
                        buffer: Vec::new(),
                        oversized: false,
                    };
                    SessionReply::IngestData(354, Self::RESPONSE_START_DATA.into())
                }
                other => {
                    self.state = other;
                    SessionReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into())
                }
            },
            _ => SessionReply::ReplyAndContinue(502, Self::RESPONSE_NOT_IMPLEMENTED.into()),
        }
    }

    fn decode_plain_auth(data: &mut [u8]) -> Option<AttemptedAuth<'_>> {
        let trimmed = data.trim_ascii_end().len();
        let data = &mut data[..trimmed];

        let decoded = base64ct::Base64::decode_in_place(data).ok()?;
        let mut parts = decoded.split(|&b| b == 0);

        let authcid = parts.next()?;
        if !authcid.is_empty() {
            trace!("ignoring authorization identity");
        }
        let username = parts.next()?;
        let password = parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        Some(AttemptedAuth {
            username: std::str::from_utf8(username).ok()?,
            password: std::str::from_utf8(password).ok()?,
        })
    }

    pub(super) async fn handle_plain_auth(&mut self, data: &mut [u8]) -> SessionReply {
        if self.limiter.is_blocked(self.peer_addr.ip()) {
            debug!(ip = %self.peer_addr.ip(), "authentication throttled");
            return SessionReply::ReplyAndStop(421, Self::RESPONSE_AUTH_THROTTLED.into());
        }

        let Some(AttemptedAuth { username, password }) = Self::decode_plain_auth(data) else {
            return SessionReply::ReplyAndContinue(501, Self::RESPONSE_SYNTAX_ERROR.into());
        };

        trace!("authentication attempt for {username}");

        match self.store.smtp_user_by_login(username).await {
            Ok(Some((user, group)))
                if user.is_active_smtp()
                    && group.status == crate::models::GroupStatus::Active
                    && user.verify_password(password) =>
            {
                debug!(user = %user.email, group = %group.name, "authenticated");
                self.auth = Some(AuthBinding { user, group });
                SessionReply::ReplyAndContinue(235, Self::RESPONSE_AUTH_OK.into())
            }
            Ok(_) => {
                self.limiter.record_failure(self.peer_addr.ip());
                SessionReply::ReplyAndContinue(535, Self::RESPONSE_AUTH_FAILED.into())
            }
            Err(e) => {
                debug!("credential lookup failed: {e}");
                SessionReply::ReplyAndContinue(451, Self::RESPONSE_STORAGE_FAILURE.into())
            }
        }
    }

    pub async fn handle_data(&mut self, chunk: &[u8]) -> DataReply {
        let max = self.config.max_message_size;
        let Transaction::Data {
            buffer, oversized, ..
        } = &mut self.state
        else {
            return DataReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
        };

        buffer.extend_from_slice(chunk);

        let terminated = buffer.ends_with(DATA_END) || buffer == &DATA_END[2..];

        if !terminated {
            // content length is buffer minus the eventual 5-byte terminator
            if buffer.len() > max + DATA_END.len() {
                *oversized = true;
                // keep only enough to spot the terminator
                let excess = buffer.len() - DATA_END.len();
                buffer.drain(..excess);
            }
            return DataReply::ContinueIngest;
        }

        let Transaction::Data {
            sender,
            recipients,
            mut buffer,
            oversized,
        } = std::mem::replace(&mut self.state, Transaction::Idle)
        else {
            unreachable!("matched above");
        };

        buffer.truncate(buffer.len().saturating_sub(DATA_END.len()));

        if oversized || buffer.len() > max {
            debug!("message rejected: exceeds the advertised SIZE");
            return DataReply::ReplyAndContinue(552, Self::RESPONSE_TOO_LARGE.into());
        }

        let body = unstuff(&buffer);
        let (subject, headers) = extract_headers(&body);
        trace!("received message ({} bytes)", body.len());

        let binding = self.auth.as_ref().expect("Data state requires auth");
        let envelope = Envelope {
            sender,
            recipients,
            subject,
            headers,
            body,
        };

        match self
            .store
            .enqueue(NewMessage {
                group_id: binding.group.id,
                envelope,
            })
            .await
        {
            Ok(id) => DataReply::ReplyAndContinue(250, format!("2.6.0 Message queued as {id}")),
            Err(e) => {
                debug!("failed to enqueue message: {e}");
                DataReply::ReplyAndContinue(451, Self::RESPONSE_STORAGE_FAILURE.into())
            }
        }
    }
}

/// Removes the transparency dot the client prepended to lines starting with
/// a dot (RFC 5321, 4.5.2).
fn unstuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut at_line_start = true;
    for &byte in data {
        if at_line_start && byte == b'.' {
            at_line_start = false;
            continue;
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }
    out
}

/// Subject and a header map for the stored envelope; the body itself stays
/// opaque bytes.
fn extract_headers(body: &[u8]) -> (String, BTreeMap<String, String>) {
    let Some(parsed) = MessageParser::default().parse(body) else {
        return (String::new(), BTreeMap::new());
    };
    let subject = parsed.subject().unwrap_or_default().to_string();
    let mut headers = BTreeMap::new();
    for header in parsed.headers() {
        // offset_start..offset_end covers the raw value after the colon
        let raw = body
            .get(header.offset_start() as usize..header.offset_end() as usize)
            .unwrap_or_default();
        headers.insert(
            header.name().to_string(),
            String::from_utf8_lossy(raw).trim().to_string(),
        );
    }
    (subject, headers)
}
