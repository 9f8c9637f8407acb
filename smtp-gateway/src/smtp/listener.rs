//! Minimal SMTP listener driving gateway sessions.
//!
//! Speaks just enough SMTP for mail clients and MTAs to hand over a message:
//! greeting, HELO/EHLO, AUTH PLAIN, MAIL, RCPT, DATA, RSET, NOOP and QUIT.
//! Everything past the wire format is delegated to [`Session`].

use std::future::Future;
use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::session::{Backend, Session, SessionState};

/// Maximum length of a command line, including CRLF.
const MAX_COMMAND_LINE: usize = 4096;

/// Listener settings taken from [`Config`].
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Hostname announced in the greeting and HELO/EHLO replies
    pub hostname: String,
    /// Largest DATA payload accepted
    pub max_message_bytes: usize,
    /// How long to wait for a single line from the client
    pub read_timeout: Duration,
}

impl ListenerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            hostname: config.smtp_hostname.clone(),
            max_message_bytes: config.max_message_bytes,
            read_timeout: Duration::from_secs(config.read_timeout_secs),
        }
    }
}

enum Line {
    /// A line including its terminator
    Text(Vec<u8>),
    /// Longer than the limit; the rest of it was discarded
    TooLong,
    Closed,
    TimedOut,
}

enum DataOutcome {
    Complete(Vec<u8>),
    TooLarge,
    Closed,
    TimedOut,
}

/// Accept connections until `shutdown` completes, one task per connection.
pub async fn serve<F>(
    listener: TcpListener,
    backend: Backend,
    settings: ListenerSettings,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let address = listener
        .local_addr()
        .context("Failed to read listener address")?;
    info!(address = %address, hostname = %settings.hostname, "smtp_server_listening");

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("smtp_server_stopping");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote_addr)) => {
                        let backend = backend.clone();
                        let settings = settings.clone();

                        tokio::spawn(async move {
                            debug!(remote_addr = %remote_addr, "smtp_connection_opened");
                            if let Err(e) = handle_connection(stream, backend, &settings).await {
                                warn!(remote_addr = %remote_addr, error = %e, "smtp_connection_error");
                            }
                            debug!(remote_addr = %remote_addr, "smtp_connection_closed");
                        });
                    }
                    Err(e) => error!(error = %e, "smtp_accept_failed"),
                }
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    backend: Backend,
    settings: &ListenerSettings,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut session: Option<Session> = None;

    write_reply(&mut writer, 220, &format!("{} ESMTP ready", settings.hostname)).await?;

    loop {
        let line = match read_line(&mut reader, settings.read_timeout, MAX_COMMAND_LINE).await? {
            Line::Text(line) => String::from_utf8_lossy(trim_line_ending(&line)).into_owned(),
            Line::TooLong => {
                write_reply(&mut writer, 500, "Line too long").await?;
                continue;
            }
            Line::Closed => break,
            Line::TimedOut => {
                write_reply(&mut writer, 421, "Timeout exceeded, closing connection").await?;
                break;
            }
        };

        let (verb, arg) = split_command(&line);

        match verb.as_str() {
            "HELO" | "EHLO" => {
                if let Some(session) = &session {
                    session.reset().await;
                }
                if verb == "HELO" {
                    write_reply(&mut writer, 250, &settings.hostname).await?;
                } else {
                    let size = format!("SIZE {}", settings.max_message_bytes);
                    write_multiline(
                        &mut writer,
                        250,
                        &[settings.hostname.as_str(), size.as_str(), "8BITMIME", "AUTH PLAIN"],
                    )
                    .await?;
                }
            }
            "AUTH" => {
                let mut parts = arg.split_whitespace();
                let mechanism = parts.next().unwrap_or_default();
                if !mechanism.eq_ignore_ascii_case("PLAIN") {
                    write_reply(&mut writer, 504, "Unrecognized authentication type").await?;
                    continue;
                }

                let response = match parts.next() {
                    Some(response) => response.to_string(),
                    None => {
                        write_reply(&mut writer, 334, "").await?;
                        match read_line(&mut reader, settings.read_timeout, MAX_COMMAND_LINE).await? {
                            Line::Text(line) => {
                                String::from_utf8_lossy(trim_line_ending(&line)).into_owned()
                            }
                            Line::TooLong => {
                                write_reply(&mut writer, 500, "Line too long").await?;
                                continue;
                            }
                            Line::Closed => break,
                            Line::TimedOut => {
                                write_reply(&mut writer, 421, "Timeout exceeded, closing connection")
                                    .await?;
                                break;
                            }
                        }
                    }
                };

                match decode_plain_credentials(&response) {
                    Some((username, password)) => {
                        session = Some(backend.login(&username, &password));
                        write_reply(&mut writer, 235, "Authentication successful").await?;
                    }
                    None => {
                        write_reply(&mut writer, 501, "Invalid AUTH PLAIN response").await?;
                    }
                }
            }
            "MAIL" => {
                let from = match parse_path(arg, "FROM") {
                    Some(from) => from,
                    None => {
                        write_reply(&mut writer, 501, "Syntax error in MAIL parameters").await?;
                        continue;
                    }
                };

                let current = session.get_or_insert_with(|| backend.anonymous_login());
                match current.mail(&from) {
                    Ok(()) => write_reply(&mut writer, 250, "OK").await?,
                    Err(e) => write_reply(&mut writer, e.reply_code(), &e.reply_text()).await?,
                }
            }
            "RCPT" => {
                let current = match &session {
                    Some(session) => session,
                    None => {
                        write_reply(&mut writer, 503, "Bad sequence of commands: MAIL first")
                            .await?;
                        continue;
                    }
                };

                let to = match parse_path(arg, "TO") {
                    Some(to) => to,
                    None => {
                        write_reply(&mut writer, 501, "Syntax error in RCPT parameters").await?;
                        continue;
                    }
                };

                match current.rcpt(&to).await {
                    Ok(()) => write_reply(&mut writer, 250, "OK").await?,
                    Err(e) => write_reply(&mut writer, e.reply_code(), &e.reply_text()).await?,
                }
            }
            "DATA" => {
                let ready = match &session {
                    Some(session) => has_recipient(session).await,
                    None => false,
                };
                let current = match &session {
                    Some(session) if ready => session,
                    _ => {
                        write_reply(&mut writer, 503, "Bad sequence of commands: RCPT first")
                            .await?;
                        continue;
                    }
                };

                write_reply(&mut writer, 354, "End data with <CR><LF>.<CR><LF>").await?;

                let outcome = match read_data(&mut reader, settings).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        current.abort_data(e).await;
                        break;
                    }
                };

                match outcome {
                    DataOutcome::Complete(body) => match current.data(&body[..]).await {
                        Ok(()) => write_reply(&mut writer, 250, "OK: message published").await?,
                        Err(e) => {
                            write_reply(&mut writer, e.reply_code(), &e.reply_text()).await?
                        }
                    },
                    DataOutcome::TooLarge => {
                        warn!(
                            max_message_bytes = settings.max_message_bytes,
                            "smtp_data_too_large"
                        );
                        current
                            .abort_data(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "message exceeds maximum size",
                            ))
                            .await;
                        write_reply(&mut writer, 552, "Message exceeds maximum size").await?;
                    }
                    DataOutcome::Closed => {
                        current
                            .abort_data(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed during DATA",
                            ))
                            .await;
                        break;
                    }
                    DataOutcome::TimedOut => {
                        current
                            .abort_data(io::Error::new(
                                io::ErrorKind::TimedOut,
                                "timed out during DATA",
                            ))
                            .await;
                        write_reply(&mut writer, 421, "Timeout exceeded, closing connection")
                            .await?;
                        break;
                    }
                }
            }
            "RSET" => {
                if let Some(session) = &session {
                    session.reset().await;
                }
                write_reply(&mut writer, 250, "OK").await?;
            }
            "NOOP" => write_reply(&mut writer, 250, "OK").await?,
            "QUIT" => {
                write_reply(&mut writer, 221, "Bye").await?;
                break;
            }
            _ => write_reply(&mut writer, 500, "Syntax error, command unrecognized").await?,
        }
    }

    if let Some(session) = &session {
        session.logout().await?;
    }

    Ok(())
}

async fn has_recipient(session: &Session) -> bool {
    matches!(session.state().await, SessionState::RecipientAccepted(_))
}

/// Read one line, terminator included, bounded by `limit` bytes and `read_timeout`.
///
/// A line that does not end within `limit` bytes is consumed up to its newline
/// and reported as [`Line::TooLong`].
async fn read_line<R>(reader: &mut R, read_timeout: Duration, limit: usize) -> io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut limited = (&mut *reader).take(limit as u64);
    let read = limited.read_until(b'\n', &mut buf);
    let result = timeout(read_timeout, read).await;

    match result {
        Err(_) => Ok(Line::TimedOut),
        Ok(Ok(0)) => Ok(Line::Closed),
        Ok(Ok(n)) if n >= limit && !buf.ends_with(b"\n") => {
            match timeout(read_timeout, discard_line(reader)).await {
                Err(_) => Ok(Line::TimedOut),
                Ok(result) => result.map(|()| Line::TooLong),
            }
        }
        Ok(Ok(_)) => Ok(Line::Text(buf)),
        Ok(Err(e)) => Err(e),
    }
}

/// Skip input up to and including the next newline.
async fn discard_line<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let (consumed, found) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(index) => (index + 1, true),
                None => (available.len(), false),
            }
        };

        reader.consume(consumed);
        if found {
            return Ok(());
        }
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Read a DATA payload up to the terminating `<CRLF>.<CRLF>`, undoing dot-stuffing.
///
/// Only lines that follow a CRLF count as line starts; a `.` after a bare LF is
/// message content.
async fn read_data<R>(reader: &mut R, settings: &ListenerSettings) -> io::Result<DataOutcome>
where
    R: AsyncBufRead + Unpin,
{
    let line_limit = settings.max_message_bytes.max(MAX_COMMAND_LINE) + 2;
    let mut body = Vec::new();
    let mut too_large = false;
    let mut after_crlf = true;

    loop {
        let mut line = match read_line(reader, settings.read_timeout, line_limit).await? {
            Line::Text(line) => line,
            Line::TooLong => {
                too_large = true;
                body.clear();
                after_crlf = true;
                continue;
            }
            Line::Closed => return Ok(DataOutcome::Closed),
            Line::TimedOut => return Ok(DataOutcome::TimedOut),
        };

        let at_line_start = after_crlf;
        after_crlf = line.ends_with(b"\r\n");

        if at_line_start {
            if line == b".\r\n" {
                break;
            }
            if line.starts_with(b"..") {
                line.remove(0);
            }
        }

        if too_large {
            continue;
        }
        if body.len() + line.len() > settings.max_message_bytes {
            too_large = true;
            body.clear();
            continue;
        }
        body.extend_from_slice(&line);
    }

    if too_large {
        Ok(DataOutcome::TooLarge)
    } else {
        Ok(DataOutcome::Complete(body))
    }
}

/// Split a command line into its uppercased verb and the remaining argument.
fn split_command(line: &str) -> (String, &str) {
    let line = line.trim();
    match line.split_once(' ') {
        Some((verb, arg)) => (verb.to_ascii_uppercase(), arg.trim()),
        None => (line.to_ascii_uppercase(), ""),
    }
}

/// Extract the path from `FROM:<path>` / `TO:<path>`, ignoring ESMTP parameters.
fn parse_path(arg: &str, keyword: &str) -> Option<String> {
    let (head, rest) = arg.split_once(':')?;
    if !head.trim().eq_ignore_ascii_case(keyword) {
        return None;
    }

    let rest = rest.trim_start();
    match rest.strip_prefix('<') {
        Some(inner) => inner.split_once('>').map(|(path, _)| path.to_string()),
        None => rest.split_whitespace().next().map(str::to_string),
    }
}

/// Decode an `AUTH PLAIN` response (`authzid NUL authcid NUL passwd`).
fn decode_plain_credentials(response: &str) -> Option<(String, String)> {
    let decoded = STANDARD.decode(response.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;

    let mut fields = decoded.split('\0');
    let _authzid = fields.next()?;
    let username = fields.next()?;
    let password = fields.next()?;
    if fields.next().is_some() {
        return None;
    }

    Some((username.to_string(), password.to_string()))
}

async fn write_reply<W>(writer: &mut W, code: u16, text: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(format!("{} {}\r\n", code, text).as_bytes())
        .await?;
    writer.flush().await
}

async fn write_multiline<W>(writer: &mut W, code: u16, lines: &[&str]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut reply = String::new();
    for (i, line) in lines.iter().enumerate() {
        let separator = if i + 1 == lines.len() { ' ' } else { '-' };
        reply.push_str(&format!("{}{}{}\r\n", code, separator, line));
    }
    writer.write_all(reply.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::sync::oneshot;

    use super::*;
    use crate::config::DEFAULT_TOPIC_PATTERN;
    use crate::process::TopicResolver;
    use crate::queue::publisher::testing::RecordingPublisher;
    use crate::session::{Counts, DeliveryCounters};

    struct Client {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (reader, writer) = stream.into_split();
            let mut client = Self {
                reader: BufReader::new(reader),
                writer,
            };
            assert!(client.reply().await.starts_with("220 "));
            client
        }

        /// Read a complete (possibly multi-line) reply and return its last line.
        async fn reply(&mut self) -> String {
            loop {
                let mut line = String::new();
                self.reader.read_line(&mut line).await.unwrap();
                if line.len() < 4 || line.as_bytes()[3] != b'-' {
                    return line.trim_end().to_string();
                }
            }
        }

        async fn send(&mut self, command: &str) -> String {
            self.writer
                .write_all(format!("{}\r\n", command).as_bytes())
                .await
                .unwrap();
            self.reply().await
        }
    }

    struct Harness {
        addr: SocketAddr,
        backend: Backend,
        publisher: Arc<RecordingPublisher>,
        _shutdown: oneshot::Sender<()>,
    }

    async fn start(max_message_bytes: usize) -> Harness {
        let publisher = Arc::new(RecordingPublisher::default());
        let resolver = TopicResolver::new("ntfy.sh", "ntfy-", DEFAULT_TOPIC_PATTERN).unwrap();
        let backend = Backend::new(
            resolver,
            4096,
            publisher.clone(),
            Arc::new(DeliveryCounters::new()),
        );

        let settings = ListenerSettings {
            hostname: "mail.ntfy.sh".to_string(),
            max_message_bytes,
            read_timeout: Duration::from_secs(5),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();

        let server_backend = backend.clone();
        tokio::spawn(async move {
            serve(listener, server_backend, settings, async move {
                let _ = rx.await;
            })
            .await
            .unwrap();
        });

        Harness {
            addr,
            backend,
            publisher,
            _shutdown: tx,
        }
    }

    #[tokio::test]
    async fn test_full_conversation() {
        let harness = start(1024 * 1024).await;
        let mut client = Client::connect(harness.addr).await;

        assert_eq!(client.send("EHLO client.example.com").await, "250 AUTH PLAIN");
        assert!(client.send("MAIL FROM:<cron@example.com> SIZE=120").await.starts_with("250"));
        assert!(client.send("RCPT TO:<ntfy-backups@ntfy.sh>").await.starts_with("250"));
        assert!(client.send("DATA").await.starts_with("354"));

        client
            .writer
            .write_all(
                b"Subject: Nightly backup\r\nContent-Type: text/plain\r\n\r\n..hidden files copied\r\n.\r\n",
            )
            .await
            .unwrap();
        assert!(client.reply().await.starts_with("250"));
        assert!(client.send("QUIT").await.starts_with("221"));

        let published = harness.publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "backups");
        assert_eq!(published[0].title, "Nightly backup");
        assert_eq!(published[0].message, ".hidden files copied");
        assert_eq!(
            harness.backend.counters().await,
            Counts { success: 1, failure: 0 }
        );
    }

    #[tokio::test]
    async fn test_rejected_recipient_blocks_data() {
        let harness = start(1024 * 1024).await;
        let mut client = Client::connect(harness.addr).await;

        client.send("HELO client").await;
        client.send("MAIL FROM:<cron@example.com>").await;
        assert!(client.send("RCPT TO:<backups@ntfy.sh>").await.starts_with("550"));
        assert!(client.send("DATA").await.starts_with("503"));
        client.send("QUIT").await;

        assert!(harness.publisher.published().is_empty());
        assert_eq!(
            harness.backend.counters().await,
            Counts { success: 0, failure: 1 }
        );
    }

    #[tokio::test]
    async fn test_rcpt_before_mail() {
        let harness = start(1024 * 1024).await;
        let mut client = Client::connect(harness.addr).await;

        assert!(client.send("RCPT TO:<ntfy-backups@ntfy.sh>").await.starts_with("503"));
    }

    #[tokio::test]
    async fn test_oversized_message() {
        let harness = start(64).await;
        let mut client = Client::connect(harness.addr).await;

        client.send("HELO client").await;
        client.send("MAIL FROM:<cron@example.com>").await;
        client.send("RCPT TO:<ntfy-backups@ntfy.sh>").await;
        assert!(client.send("DATA").await.starts_with("354"));

        let body = format!(
            "Content-Type: text/plain\r\n\r\n{}\r\n.\r\n",
            "x".repeat(200)
        );
        client.writer.write_all(body.as_bytes()).await.unwrap();
        assert!(client.reply().await.starts_with("552"));

        assert!(client.send("DATA").await.starts_with("503"));
        assert!(harness.publisher.published().is_empty());
        assert_eq!(
            harness.backend.counters().await,
            Counts { success: 0, failure: 1 }
        );
    }

    #[tokio::test]
    async fn test_disconnect_during_data_counts_failure() {
        let harness = start(1024 * 1024).await;
        let mut client = Client::connect(harness.addr).await;

        client.send("HELO client").await;
        client.send("MAIL FROM:<cron@example.com>").await;
        client.send("RCPT TO:<ntfy-backups@ntfy.sh>").await;
        assert!(client.send("DATA").await.starts_with("354"));
        client
            .writer
            .write_all(b"Content-Type: text/plain\r\n\r\nhalf a mess")
            .await
            .unwrap();
        drop(client);

        let counts = timeout(Duration::from_secs(5), async {
            loop {
                let counts = harness.backend.counters().await;
                if counts.failure > 0 {
                    return counts;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(counts, Counts { success: 0, failure: 1 });
        assert!(harness.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_bare_lf_dot_does_not_end_data() {
        let harness = start(1024 * 1024).await;
        let mut client = Client::connect(harness.addr).await;

        client.send("HELO client").await;
        client.send("MAIL FROM:<cron@example.com>").await;
        client.send("RCPT TO:<ntfy-backups@ntfy.sh>").await;
        assert!(client.send("DATA").await.starts_with("354"));

        client
            .writer
            .write_all(b"Content-Type: text/plain\r\n\r\nfirst\n.\nsecond\r\n.\r\n")
            .await
            .unwrap();
        assert!(client.reply().await.starts_with("250"));

        let published = harness.publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].message, "first\n.\nsecond");
    }

    #[tokio::test]
    async fn test_overlong_command_line() {
        let harness = start(1024 * 1024).await;
        let mut client = Client::connect(harness.addr).await;

        let line = format!("NOOP {}", "x".repeat(MAX_COMMAND_LINE * 2));
        assert_eq!(client.send(&line).await, "500 Line too long");
        assert!(client.send("NOOP").await.starts_with("250"));
    }

    #[tokio::test]
    async fn test_auth_plain() {
        let harness = start(1024 * 1024).await;
        let mut client = Client::connect(harness.addr).await;

        client.send("EHLO client").await;
        assert!(client.send("AUTH PLAIN AHBoaWwAc2VjcmV0").await.starts_with("235"));
        assert!(client.send("AUTH PLAIN").await.starts_with("334"));
        assert!(client.send("AHBoaWwAc2VjcmV0").await.starts_with("235"));
        assert!(client.send("AUTH LOGIN").await.starts_with("504"));
        assert!(client.send("AUTH PLAIN !!!").await.starts_with("501"));
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let harness = start(1024 * 1024).await;
        let mut client = Client::connect(harness.addr).await;

        assert!(client.send("VRFY root").await.starts_with("500"));
        assert!(client.send("NOOP").await.starts_with("250"));
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(parse_path("FROM:<a@b.c>", "FROM"), Some("a@b.c".to_string()));
        assert_eq!(parse_path("from: <a@b.c> SIZE=10", "FROM"), Some("a@b.c".to_string()));
        assert_eq!(parse_path("TO:a@b.c", "TO"), Some("a@b.c".to_string()));
        assert_eq!(parse_path("FROM:<>", "FROM"), Some(String::new()));
        assert_eq!(parse_path("TO:<a@b.c>", "FROM"), None);
        assert_eq!(parse_path("<a@b.c>", "TO"), None);
    }

    #[test]
    fn test_trim_line_ending() {
        assert_eq!(trim_line_ending(b"NOOP\r\n"), b"NOOP");
        assert_eq!(trim_line_ending(b"NOOP\n"), b"NOOP");
        assert_eq!(trim_line_ending(b"NOOP"), b"NOOP");
    }

    #[test]
    fn test_decode_plain_credentials() {
        assert_eq!(
            decode_plain_credentials("AHBoaWwAc2VjcmV0"),
            Some(("phil".to_string(), "secret".to_string()))
        );
        assert_eq!(decode_plain_credentials("cGhpbA=="), None);
        assert_eq!(decode_plain_credentials("%%%"), None);
    }
}
