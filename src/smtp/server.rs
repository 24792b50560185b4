//! SMTP server implementation

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::domains::DomainPolicy;
use crate::smtp::auth::AuthConfig;
use crate::smtp::commands::SmtpCommandHandler;
use crate::smtp::delivery::MailDelivery;
use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::response::SmtpResponse;
use crate::smtp::session::SmtpSession;
use crate::store::MailStore;

/// Pause after a failed accept so a full fd table doesn't spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Settings for the SMTP intake listener
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    /// Name announced in the greeting and HELO/EHLO replies
    pub hostname: String,
    pub domains: DomainPolicy,
    pub auth: AuthConfig,
    /// How long a stored message stays visible
    pub message_ttl: chrono::Duration,
    /// Maximum wait for the next line from a client
    pub idle_timeout: Duration,
}

impl SmtpConfig {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_owned(),
            domains: DomainPolicy::open(),
            auth: AuthConfig::disabled(),
            message_ttl: chrono::Duration::hours(24),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Accepts SMTP connections and stores every accepted message
#[derive(Clone)]
pub struct SmtpServer {
    config: Arc<SmtpConfig>,
    delivery: MailDelivery,
}

impl SmtpServer {
    /// Create a new SMTP server writing into `store`
    pub fn new(config: SmtpConfig, store: Arc<dyn MailStore>) -> Self {
        let delivery = MailDelivery::new(store, config.message_ttl);
        Self {
            config: Arc::new(config),
            delivery,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    /// Bind `addr` and serve until `shutdown` fires
    pub async fn start(&self, addr: &str, shutdown: CancellationToken) -> Result<(), SmtpError> {
        let listener = TcpListener::bind(addr).await?;
        self.run(listener, shutdown).await
    }

    /// Serve on an existing listener until `shutdown` fires.
    ///
    /// After cancellation no new connections are accepted; connections in
    /// the middle of a command or delivery finish it, idle ones get a 421.
    /// Returns once every connection has ended.
    pub async fn run(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), SmtpError> {
        info!(addr = %listener.local_addr()?, "SMTP server listening");

        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        let shutdown = shutdown.clone();
                        tracker.spawn(
                            async move {
                                debug!("connection opened");
                                if let Err(e) = server.handle_client(stream, shutdown).await {
                                    warn!(error = %e, "error handling client");
                                }
                                debug!("connection closed");
                            }
                            .instrument(info_span!("smtp", %peer)),
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "error accepting connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        tracker.close();
        info!(open = tracker.len(), "SMTP server draining connections");
        tracker.wait().await;
        info!("SMTP server stopped");

        Ok(())
    }

    /// Handle a client connection
    async fn handle_client(
        &self,
        stream: TcpStream,
        shutdown: CancellationToken,
    ) -> Result<(), SmtpError> {
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut session = SmtpSession::new();
        let handler = SmtpCommandHandler::new(
            &self.config.hostname,
            &self.config.auth,
            &self.config.domains,
        );

        send_response(&mut writer, &SmtpResponse::greeting(&self.config.hostname)).await?;

        let mut line_buffer = Vec::new();
        loop {
            line_buffer.clear();

            let read = tokio::select! {
                biased;
                _ = shutdown.cancelled(), if !session.in_data_mode => {
                    send_response(&mut writer, &SmtpResponse::from_error(&SmtpError::ShuttingDown)).await?;
                    break;
                }
                read = timeout(self.config.idle_timeout, read_line(&mut reader, &mut line_buffer)) => read,
            };

            let read = match read {
                Ok(read) => read?,
                Err(_elapsed) => {
                    debug!("idle timeout");
                    send_response(&mut writer, &SmtpResponse::from_error(&SmtpError::Timeout)).await?;
                    break;
                }
            };

            if read == 0 {
                if session.in_data_mode {
                    debug!(bytes = session.current_data_size(), "client left during DATA, discarding");
                }
                break;
            }

            if !line_buffer.ends_with(b"\n") && read >= SmtpLimits::READ_LINE_HARD_LIMIT {
                let err = SmtpError::LineTooLong {
                    max: SmtpLimits::READ_LINE_HARD_LIMIT,
                };
                send_response(&mut writer, &SmtpResponse::from_error(&err)).await?;
                break;
            }

            let line = strip_line_ending(&line_buffer);

            // Handle data mode specially
            if session.in_data_mode {
                // An unterminated line here means EOF arrived before CRLF.CRLF
                if !line_buffer.ends_with(b"\n") {
                    debug!(bytes = session.current_data_size(), "client left during DATA, discarding");
                    break;
                }
                if line == b"." {
                    let response = self.finish_transaction(&mut session).await;
                    send_response(&mut writer, &response).await?;
                } else {
                    session.add_data_line(line);
                }
                continue;
            }

            let command = String::from_utf8_lossy(line);
            let command = command.trim();
            if command.is_empty() {
                continue;
            }

            match handler.process_command(command, &mut session) {
                Ok(response) => {
                    send_response(&mut writer, &response).await?;
                    if response.code == "221" {
                        break; // QUIT command
                    }
                }
                Err(e) => {
                    debug!(error = %e, "command rejected");
                    send_response(&mut writer, &SmtpResponse::from_error(&e)).await?;
                    if e.is_fatal() {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Close DATA, deliver, and build the final reply for the transaction
    async fn finish_transaction(&self, session: &mut SmtpSession) -> SmtpResponse {
        let envelope = match session.finish_data_collection() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "message rejected");
                return SmtpResponse::from_error(&e);
            }
        };

        match self
            .delivery
            .deliver(envelope)
            .await
            .and_then(|report| report.into_result())
        {
            Ok(report) => {
                info!(
                    transaction = %report.transaction,
                    recipients = report.stored.len(),
                    "message accepted"
                );
                SmtpResponse::delivered(&report.transaction.to_string())
            }
            Err(e) => {
                warn!(error = %e, "delivery failed");
                SmtpResponse::from_error(&e)
            }
        }
    }
}

/// Read one line, giving up after the hard per-read cap
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    reader
        .take(SmtpLimits::READ_LINE_HARD_LIMIT as u64)
        .read_until(b'\n', buf)
        .await
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Send a response to the client
async fn send_response<W>(stream: &mut W, response: &SmtpResponse) -> Result<(), SmtpError>
where
    W: AsyncWrite + Unpin,
{
    // Ensure response doesn't exceed maximum line length
    let formatted = response.format();
    if formatted.len() > SmtpLimits::REPLY_LINE_MAX_LENGTH && response.multiline.is_none() {
        let truncated_response = SmtpResponse::new(&response.code, "Response too long (truncated)");
        stream
            .write_all(truncated_response.format().as_bytes())
            .await?;
    } else {
        stream.write_all(formatted.as_bytes()).await?;
    }
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use chrono::Utc;
    use std::net::SocketAddr;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    struct Client {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> (Self, String) {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, writer) = stream.into_split();
            let mut client = Self {
                reader: BufReader::new(read_half),
                writer,
            };
            let greeting = client.read_reply().await;
            (client, greeting)
        }

        async fn read_reply(&mut self) -> String {
            let mut reply = String::new();
            loop {
                let mut line = String::new();
                self.reader.read_line(&mut line).await.unwrap();
                let last = line.len() < 4 || line.as_bytes()[3] != b'-';
                reply.push_str(line.trim_end());
                if last {
                    return reply;
                }
                reply.push('\n');
            }
        }

        async fn send_command(&mut self, command: &str) -> String {
            self.send_line(command).await;
            self.read_reply().await
        }

        async fn send_line(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\r\n").as_bytes())
                .await
                .unwrap();
        }
    }

    async fn start_test_server(
        config: SmtpConfig,
    ) -> (SocketAddr, Arc<SqliteStore>, CancellationToken) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = SmtpServer::new(config, store.clone());
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        tokio::spawn(async move { server.run(listener, token).await });

        (addr, store, shutdown)
    }

    #[test]
    fn test_server_creation() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let server = SmtpServer::new(SmtpConfig::new("test.local"), store);
        assert_eq!(server.hostname(), "test.local");
    }

    #[test]
    fn test_strip_line_ending() {
        assert_eq!(strip_line_ending(b"abc\r\n"), b"abc");
        assert_eq!(strip_line_ending(b"abc\n"), b"abc");
        assert_eq!(strip_line_ending(b"abc"), b"abc");
        assert_eq!(strip_line_ending(b"\r\n"), b"");
    }

    #[tokio::test]
    async fn test_complete_smtp_session() {
        let mut config = SmtpConfig::new("test.local");
        config.domains = DomainPolicy::parse("temp.example");
        let (addr, store, _shutdown) = start_test_server(config).await;

        let (mut client, greeting) = Client::connect(addr).await;
        assert!(greeting.starts_with("220"));

        let response = client.send_command("EHLO client.local").await;
        assert!(response.starts_with("250"));
        assert!(response.contains("PIPELINING"));
        assert!(!response.contains("AUTH"));

        assert!(client
            .send_command("MAIL FROM:<test@example.com>")
            .await
            .starts_with("250"));
        assert!(client
            .send_command("RCPT TO:<user@temp.example>")
            .await
            .starts_with("250"));
        assert!(client.send_command("DATA").await.starts_with("354"));

        client.send_line("Subject: Test Email").await;
        client.send_line("").await;
        client.send_line("This is a test email.").await;
        let final_response = client.send_command(".").await;
        assert!(final_response.starts_with("250"));
        assert!(final_response.contains("queued as"));

        assert!(client.send_command("QUIT").await.starts_with("221"));

        let messages = store
            .messages_for_recipient("user@temp.example", Utc::now(), 10, 0)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].subject, "Test Email");
        assert_eq!(messages[0].body_text.trim_end(), "This is a test email.");
    }

    #[tokio::test]
    async fn test_error_handling() {
        let (addr, _store, _shutdown) = start_test_server(SmtpConfig::new("test.local")).await;
        let (mut client, _) = Client::connect(addr).await;

        assert!(client.send_command("INVALID").await.starts_with("500"));
        assert!(client
            .send_command("MAIL FROM:<test@example.com>")
            .await
            .starts_with("503"));
        assert!(client.send_command("QUIT").await.starts_with("221"));
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_connection() {
        let mut config = SmtpConfig::new("test.local");
        config.idle_timeout = Duration::from_millis(100);
        let (addr, _store, _shutdown) = start_test_server(config).await;

        let (mut client, _) = Client::connect(addr).await;
        let reply = client.read_reply().await;
        assert!(reply.starts_with("421"));

        let mut rest = String::new();
        let read = client.reader.read_line(&mut rest).await.unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_unterminated_final_dot_discards_message() {
        let (addr, store, _shutdown) = start_test_server(SmtpConfig::new("test.local")).await;
        let (mut client, _) = Client::connect(addr).await;

        assert!(client.send_command("HELO c").await.starts_with("250"));
        assert!(client
            .send_command("MAIL FROM:<a@x.com>")
            .await
            .starts_with("250"));
        assert!(client
            .send_command("RCPT TO:<u@temp.example>")
            .await
            .starts_with("250"));
        assert!(client.send_command("DATA").await.starts_with("354"));

        client
            .writer
            .write_all(b"Subject: s\r\n\r\nbody\r\n.")
            .await
            .unwrap();
        client.writer.shutdown().await.unwrap();

        let mut rest = String::new();
        let read = client.reader.read_line(&mut rest).await.unwrap();
        assert_eq!(read, 0, "unexpected reply {rest:?}");

        let messages = store
            .messages_for_recipient("u@temp.example", Utc::now(), 10, 0)
            .await
            .unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_notifies_idle_clients() {
        let (addr, _store, shutdown) = start_test_server(SmtpConfig::new("test.local")).await;

        let (mut client, _) = Client::connect(addr).await;
        assert!(client
            .send_command("HELO client.local")
            .await
            .starts_with("250"));

        shutdown.cancel();
        let reply = client.read_reply().await;
        assert!(reply.starts_with("421"));
    }
}
