use smtp_proto::Request;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tracing::{debug, trace};

use super::SmtpConfig;
use super::session::{DataReply, SessionReply, SmtpSession};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),
    #[error("failed to write to the stream: {0}")]
    Write(std::io::Error),
    #[error("failed to read from the stream: {0}")]
    Read(std::io::Error),
    #[error("connection dropped unexpectedly")]
    Dropped,
}

const LINE_SIZE: u64 = 1024;
const CHUNK_SIZE: u64 = 8192;
const CODE_READY: u16 = 220;

pub enum LoopOutcome<S> {
    Closed,
    /// STARTTLS accepted: the caller wraps the returned stream and re-enters
    /// the loop.
    Upgrade(S),
}

/// Command/reply loop over one (possibly TLS) stream. Returns when the
/// client quits, the connection drops, or a STARTTLS upgrade is requested.
pub async fn run_loop<S>(
    stream: S,
    session: &mut SmtpSession,
    config: &SmtpConfig,
    greet: bool,
) -> Result<LoopOutcome<S>, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufStream::new(stream);
    let idle = config.session_idle_timeout;
    let mut buffer = Vec::with_capacity(LINE_SIZE as usize);

    trace!("handling connection with {}", session.peer());

    if greet {
        write_reply(
            &mut stream,
            CODE_READY,
            &format!("{} ESMTP ready", config.server_name),
        )
        .await?;
    }

    'session: loop {
        if read_line(&mut stream, &mut buffer, idle).await?.is_none() {
            write_reply(&mut stream, 421, "4.4.2 Idle timeout, closing").await?;
            break;
        }

        let request = Request::parse(&mut buffer.iter()).map(Request::into_owned);

        match session.handle(request).await {
            SessionReply::ReplyAndContinue(code, message) => {
                write_reply(&mut stream, code, &message).await?;
            }
            SessionReply::ReplyAndStop(code, message) => {
                write_reply(&mut stream, code, &message).await?;
                break;
            }
            SessionReply::RawReply(reply) => {
                stream
                    .write_all(&reply)
                    .await
                    .map_err(ConnectionError::Write)?;
                stream.flush().await.map_err(ConnectionError::Write)?;
            }
            SessionReply::IngestData(code, message) => {
                write_reply(&mut stream, code, &message).await?;

                loop {
                    if read_chunk(&mut stream, &mut buffer, idle).await?.is_none() {
                        write_reply(&mut stream, 421, "4.4.2 Idle timeout, closing").await?;
                        break 'session;
                    }
                    match session.handle_data(&buffer).await {
                        DataReply::ContinueIngest => continue,
                        DataReply::ReplyAndContinue(code, message) => {
                            write_reply(&mut stream, code, &message).await?;
                            continue 'session;
                        }
                    }
                }
            }
            SessionReply::IngestAuth(code, message) => {
                write_reply(&mut stream, code, &message).await?;
                if read_line(&mut stream, &mut buffer, idle).await?.is_none() {
                    write_reply(&mut stream, 421, "4.4.2 Idle timeout, closing").await?;
                    break;
                }
                match session.handle_plain_auth(&mut buffer).await {
                    SessionReply::ReplyAndContinue(code, message) => {
                        write_reply(&mut stream, code, &message).await?;
                    }
                    SessionReply::ReplyAndStop(code, message) => {
                        write_reply(&mut stream, code, &message).await?;
                        break;
                    }
                    _ => unreachable!("auth continuation only replies"),
                }
            }
            SessionReply::UpgradeTls(code, message) => {
                write_reply(&mut stream, code, &message).await?;
                return Ok(LoopOutcome::Upgrade(stream.into_inner()));
            }
        }
    }

    stream.shutdown().await.ok();
    Ok(LoopOutcome::Closed)
}

/// `Ok(None)` signals an idle timeout.
async fn read_line(
    mut reader: impl AsyncBufRead + Unpin,
    buffer: &mut Vec<u8>,
    idle: Duration,
) -> Result<Option<usize>, ConnectionError> {
    buffer.clear();

    let read = tokio::time::timeout(
        idle,
        (&mut reader).take(LINE_SIZE).read_until(b'\n', buffer),
    )
    .await;
    match read {
        Err(_) => Ok(None),
        Ok(Err(e)) => Err(ConnectionError::Read(e)),
        Ok(Ok(0)) => Err(ConnectionError::Dropped),
        Ok(Ok(n)) => Ok(Some(n)),
    }
}

async fn read_chunk(
    mut reader: impl AsyncRead + Unpin,
    buffer: &mut Vec<u8>,
    idle: Duration,
) -> Result<Option<usize>, ConnectionError> {
    buffer.clear();

    let read = tokio::time::timeout(idle, (&mut reader).take(CHUNK_SIZE).read_buf(buffer)).await;
    match read {
        Err(_) => Ok(None),
        Ok(Err(e)) => Err(ConnectionError::Read(e)),
        Ok(Ok(0)) => Err(ConnectionError::Dropped),
        Ok(Ok(n)) => Ok(Some(n)),
    }
}

async fn write_reply(
    mut sink: impl AsyncWrite + Unpin,
    code: u16,
    message: &str,
) -> Result<(), ConnectionError> {
    sink.write_all(format!("{code} {message}\r\n").as_bytes())
        .await
        .map_err(ConnectionError::Write)?;
    sink.flush().await.map_err(ConnectionError::Write)?;

    debug!("sent: {code} {message}");

    Ok(())
}
