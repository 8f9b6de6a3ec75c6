//! Per-connection protocol state machine: command dispatch, data capture,
//! the AUTH sub-protocol, and the STARTTLS transport upgrade.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::time::{self, Instant};

use crate::commands::{parse_address, Command};
use crate::envelope::Envelope;
use crate::framer::{FramerError, LineFramer};
use crate::response::{Responder, Response};
use crate::retry::{classify, ErrorClass, RETRY_BACKOFF};
use crate::server::{ConnHandle, ServerContext};
use crate::store::Direction;

const SERVICE_CLOSING: &str = "Service closing transmission channel";
const SERVICE_NOT_AVAILABLE: &str = "Service not available, closing transmission channel";
const AUTH_SUCCESSFUL: &str = "2.7.0 Authentication successful";

/// What a dispatched command means for the read loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandResult {
    Ok,
    Error,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuthMechanism {
    Login,
    Plain,
}

/// Protocol state between commands.
///
/// `AuthContinuation` holds the chosen mechanism and how many credential
/// lines have been collected so far.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionState {
    Command,
    DataCapture,
    AuthContinuation { mechanism: AuthMechanism, stage: u8 },
}

pub struct Connection {
    id: u64,
    remote: SocketAddr,
    framer: LineFramer,
    state: SessionState,
    envelope: Envelope,
    auth_lines: Vec<String>,
    handle: Arc<ConnHandle>,
    context: Arc<ServerContext>,
}

impl Connection {
    pub fn new(
        id: u64,
        remote: SocketAddr,
        framer: LineFramer,
        handle: Arc<ConnHandle>,
        context: Arc<ServerContext>,
    ) -> Self {
        Self {
            id,
            remote,
            framer,
            state: SessionState::Command,
            envelope: Envelope::new(),
            auth_lines: Vec::new(),
            handle,
            context,
        }
    }

    pub async fn send_banner(&mut self) {
        let banner = format!(
            "{} ESMTP {}",
            self.context.config.banner_host, self.context.config.banner_name,
        );
        self.send_batch(vec![Response::new(220, banner)]).await;
    }

    /// The command loop: read a line, dispatch it, flush the reply batch,
    /// repeat. Every read is bounded by the read deadline, which doubles
    /// as the checkpoint for the disconnect flag and the lifetime limit.
    pub async fn wait_for_commands(&mut self) {
        let deadline = Instant::now() + self.context.config.connection_time_limit;

        loop {
            if Instant::now() >= deadline {
                self.context
                    .logger
                    .log_client(&self.remote, "connection time limit reached")
                    .await;
                return;
            }

            match self.framer.read_line().await {
                Ok(line) => {
                    if self.handle_command(&line).await == CommandResult::Disconnect {
                        return;
                    }
                }
                Err(error) => match classify(&error) {
                    ErrorClass::TransientTimeout => {
                        if self.handle.is_disconnecting() {
                            self.send_batch(vec![Response::new(421, SERVICE_NOT_AVAILABLE)])
                                .await;
                            return;
                        }
                    }
                    ErrorClass::TransientOther => {
                        self.context
                            .logger
                            .log_client(&self.remote, &format!("read failed, retrying: {}", error))
                            .await;
                        time::sleep(RETRY_BACKOFF).await;
                        if self.handle.is_disconnecting() {
                            return;
                        }
                    }
                    ErrorClass::Fatal => {
                        if !matches!(error, FramerError::Closed) {
                            self.context
                                .logger
                                .log_client(&self.remote, &format!("read failed: {}", error))
                                .await;
                        }
                        return;
                    }
                },
            }
        }
    }

    async fn handle_command(&mut self, input: &str) -> CommandResult {
        self.context
            .logger
            .log_client(&self.remote, &format!("< {}", input))
            .await;
        self.record(Direction::In, input).await;

        let mut responder = Responder::new();
        let result = self.dispatch(input, &mut responder).await;
        self.flush(&mut responder).await;
        result
    }

    async fn dispatch(&mut self, input: &str, responder: &mut Responder) -> CommandResult {
        if self.handle.is_disconnecting() {
            responder.respond(Response::new(421, SERVICE_NOT_AVAILABLE));
            return CommandResult::Disconnect;
        }

        match self.state {
            SessionState::DataCapture => return self.handle_payload(input, responder).await,
            SessionState::AuthContinuation { mechanism, stage } => {
                return self.handle_auth_payload(mechanism, stage, input, responder)
            }
            SessionState::Command => {}
        }

        if input.is_empty() {
            // Client hangup.
            return CommandResult::Disconnect;
        }

        match Command::parse(input) {
            Command::Auth(arguments) => self.handle_auth(arguments, responder),
            Command::Data => self.handle_data(responder),
            Command::Ehlo => self.handle_ehlo(responder),
            Command::Helo => self.handle_helo(responder),
            Command::Help => {
                responder.respond(Response::new(214, "I'm sorry Dave, I'm afraid I can't do that"));
                CommandResult::Ok
            }
            Command::Mail(arguments) => self.handle_mail(arguments, responder),
            Command::Noop => {
                responder.respond(Response::new(250, "OK"));
                CommandResult::Ok
            }
            Command::Quit => {
                responder.respond(Response::new(221, SERVICE_CLOSING));
                CommandResult::Disconnect
            }
            Command::Rcpt(arguments) => self.handle_rcpt(arguments, responder),
            Command::Rset => {
                self.envelope.reset();
                responder.respond(Response::new(250, "OK"));
                CommandResult::Ok
            }
            Command::StartTls => self.handle_starttls(responder).await,
            Command::Vrfy => {
                responder.respond(Response::new(252, "Cannot VRFY"));
                CommandResult::Ok
            }
            Command::Unknown => {
                responder.respond(Response::new(500, "Command not recognized"));
                CommandResult::Error
            }
        }
    }

    fn handle_ehlo(&mut self, responder: &mut Responder) -> CommandResult {
        responder.respond(Response::partial(
            250,
            self.context.config.banner_host.clone(),
        ));
        responder.respond(Response::partial(250, "PIPELINING"));
        responder.respond(Response::partial(250, "AUTH LOGIN PLAIN"));
        if self.context.config.tls.is_some() && !self.framer.is_encrypted() {
            responder.respond(Response::partial(250, "STARTTLS"));
        }
        responder.respond(Response::new(250, "HELP"));
        CommandResult::Ok
    }

    fn handle_helo(&mut self, responder: &mut Responder) -> CommandResult {
        responder.respond(Response::new(
            250,
            self.context.config.banner_host.clone(),
        ));
        CommandResult::Ok
    }

    fn handle_mail(&mut self, arguments: &str, responder: &mut Responder) -> CommandResult {
        let address = arguments
            .strip_prefix("FROM:")
            .and_then(parse_address);

        match address {
            Some(address) => {
                self.envelope.set_sender(address.to_string());
                responder.respond(Response::new(250, "OK"));
                CommandResult::Ok
            }
            None => {
                responder.respond(Response::new(501, "Syntax: MAIL FROM:<address>"));
                CommandResult::Error
            }
        }
    }

    fn handle_rcpt(&mut self, arguments: &str, responder: &mut Responder) -> CommandResult {
        let address = arguments.strip_prefix("TO:").and_then(parse_address);

        match address {
            Some(address) => {
                self.envelope.add_recipient(address.to_string());
                responder.respond(Response::new(250, "OK"));
                CommandResult::Ok
            }
            None => {
                responder.respond(Response::new(501, "Syntax: RCPT TO:<address>"));
                CommandResult::Error
            }
        }
    }

    fn handle_data(&mut self, responder: &mut Responder) -> CommandResult {
        if !self.envelope.is_ready() {
            responder.respond(Response::new(503, "Bad sequence of commands"));
            return CommandResult::Error;
        }

        responder.respond(Response::new(354, "End data with <CRLF>.<CRLF>"));
        self.state = SessionState::DataCapture;
        CommandResult::Ok
    }

    async fn handle_payload(&mut self, input: &str, responder: &mut Responder) -> CommandResult {
        if input != "." {
            self.envelope.append_line(input);
            return CommandResult::Ok;
        }

        self.state = SessionState::Command;
        self.context
            .logger
            .log_client(
                &self.remote,
                &format!(
                    "< {} byte message from {} to {:?}",
                    self.envelope.data.len(),
                    self.envelope.from.as_deref().unwrap_or(""),
                    self.envelope.to,
                ),
            )
            .await;

        // Without a data directory there is no mail file and no reason to
        // burn a mail id.
        if self.context.store.is_enabled() {
            if let Err(error) = self
                .context
                .store
                .record_mail(self.id, &self.envelope)
                .await
            {
                self.context
                    .logger
                    .log_client(&self.remote, &format!("failed to record mail: {}", error))
                    .await;
            }
        }

        self.envelope.reset();
        responder.respond(Response::new(250, "OK"));
        CommandResult::Ok
    }

    fn handle_auth(&mut self, arguments: &str, responder: &mut Responder) -> CommandResult {
        let (mechanism, credentials) = match arguments.split_once(' ') {
            Some((mechanism, rest)) => (mechanism, rest),
            None => (arguments, ""),
        };

        match mechanism {
            "LOGIN" => {
                self.auth_lines.clear();
                self.state = SessionState::AuthContinuation {
                    mechanism: AuthMechanism::Login,
                    stage: 0,
                };
                responder.respond(Response::new(334, base64::encode("Username:")));
                CommandResult::Ok
            }
            "PLAIN" => {
                // Credentials are recorded, never verified.
                self.auth_lines = vec![credentials.to_string()];
                responder.respond(Response::new(235, AUTH_SUCCESSFUL));
                CommandResult::Ok
            }
            _ => {
                responder.respond(Response::new(500, "Command not recognized"));
                CommandResult::Error
            }
        }
    }

    fn handle_auth_payload(
        &mut self,
        mechanism: AuthMechanism,
        stage: u8,
        input: &str,
        responder: &mut Responder,
    ) -> CommandResult {
        debug_assert_eq!(mechanism, AuthMechanism::Login);

        self.auth_lines.push(input.to_string());
        if stage == 0 {
            responder.respond(Response::new(334, base64::encode("Password:")));
            self.state = SessionState::AuthContinuation {
                mechanism,
                stage: 1,
            };
        } else {
            responder.respond(Response::new(235, AUTH_SUCCESSFUL));
            self.state = SessionState::Command;
        }
        CommandResult::Ok
    }

    async fn handle_starttls(&mut self, responder: &mut Responder) -> CommandResult {
        let acceptor = match &self.context.config.tls {
            Some(acceptor) if !self.framer.is_encrypted() => acceptor.clone(),
            _ => {
                responder.respond(Response::new(502, "Command not implemented"));
                return CommandResult::Error;
            }
        };

        responder.respond(Response::new(220, "Ready to start TLS"));
        self.flush(responder).await;

        match self.framer.upgrade(&acceptor).await {
            Ok(()) => {
                self.context
                    .logger
                    .log_client(&self.remote, "TLS session established")
                    .await;
                CommandResult::Ok
            }
            Err(error) => {
                self.context
                    .logger
                    .log_client(&self.remote, &format!("TLS handshake failed: {}", error))
                    .await;
                // The failed handshake consumed the stream; the 550 is
                // attempted but its write failure is swallowed.
                responder.respond(Response::new(550, "Failed to start TLS"));
                CommandResult::Disconnect
            }
        }
    }

    async fn send_batch(&mut self, batch: Vec<Response>) {
        let mut responder = Responder::new();
        for response in batch {
            responder.respond(response);
        }
        self.flush(&mut responder).await;
    }

    /// Writes every queued response in order and empties the batch.
    async fn flush(&mut self, responder: &mut Responder) {
        if responder.is_empty() {
            return;
        }

        for response in responder.take() {
            let line = response.format();

            self.context
                .logger
                .log_client(&self.remote, &format!("> {}", line))
                .await;
            self.record(Direction::Out, &line).await;

            // 221 answers QUIT; the client often closes before reading it,
            // so its write failure is not an error.
            if self.framer.write_line(&line).await.is_err() && response.code != 221 {
                self.context
                    .logger
                    .log_client(&self.remote, &format!("failed to send {}", response.code))
                    .await;
            }
        }
    }

    async fn record(&self, direction: Direction, data: &str) {
        if let Err(error) = self.context.store.record_message(self.id, direction, data).await {
            self.context
                .logger
                .log_client(&self.remote, &format!("failed to record message: {}", error))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::logger::Logger;
    use crate::store::MessageStore;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    fn test_context() -> Arc<ServerContext> {
        Arc::new(ServerContext {
            config: Config {
                listen_host: "127.0.0.1".to_string(),
                listen_port: 0,
                banner_host: "mail.test.local".to_string(),
                banner_name: "mailsink".to_string(),
                connection_time_limit: Duration::from_secs(30),
                read_timeout: Duration::from_secs(5),
                implicit_tls: false,
                tls: None,
                data_dir: None,
                log_file: None,
            },
            logger: Logger::new(None).unwrap(),
            store: MessageStore::new(None).unwrap(),
        })
    }

    async fn test_connection() -> (Connection, BufReader<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let client = TcpStream::connect(address).await.unwrap();
        let (server, remote) = listener.accept().await.unwrap();

        let connection = Connection::new(
            1,
            remote,
            LineFramer::plain(server, Duration::from_secs(5)),
            Arc::new(ConnHandle::new(1)),
            test_context(),
        );
        (connection, BufReader::new(client))
    }

    async fn reply(client: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    #[tokio::test]
    async fn auth_login_collects_two_lines_then_succeeds() {
        let (mut connection, mut client) = test_connection().await;

        assert_eq!(
            connection.handle_command("AUTH LOGIN").await,
            CommandResult::Ok
        );
        assert_eq!(reply(&mut client).await, "334 VXNlcm5hbWU6");

        assert_eq!(connection.handle_command("dXNlcg==").await, CommandResult::Ok);
        assert_eq!(reply(&mut client).await, "334 UGFzc3dvcmQ6");

        assert_eq!(connection.handle_command("cGFzcw==").await, CommandResult::Ok);
        assert_eq!(reply(&mut client).await, "235 2.7.0 Authentication successful");

        assert_eq!(connection.state, SessionState::Command);
        assert_eq!(connection.auth_lines, vec!["dXNlcg==", "cGFzcw=="]);
    }

    #[tokio::test]
    async fn repeated_rcpt_keeps_one_recipient() {
        let (mut connection, mut client) = test_connection().await;

        connection.handle_command("MAIL FROM:<a@example.com>").await;
        reply(&mut client).await;
        connection.handle_command("RCPT TO:<b@example.com>").await;
        reply(&mut client).await;
        connection.handle_command("RCPT TO:<b@example.com>").await;
        reply(&mut client).await;

        assert_eq!(connection.envelope.to, vec!["b@example.com"]);
    }

    #[tokio::test]
    async fn malformed_mail_leaves_sender_unset() {
        let (mut connection, mut client) = test_connection().await;

        assert_eq!(
            connection.handle_command("MAIL FROM:noprefix").await,
            CommandResult::Error
        );
        assert_eq!(reply(&mut client).await, "501 Syntax: MAIL FROM:<address>");
        assert!(connection.envelope.from.is_none());
    }

    #[tokio::test]
    async fn data_capture_unstuffs_and_terminates() {
        let (mut connection, mut client) = test_connection().await;

        connection.handle_command("MAIL FROM:<a@example.com>").await;
        reply(&mut client).await;
        connection.handle_command("RCPT TO:<b@example.com>").await;
        reply(&mut client).await;
        connection.handle_command("DATA").await;
        assert_eq!(
            reply(&mut client).await,
            "354 End data with <CRLF>.<CRLF>"
        );
        assert_eq!(connection.state, SessionState::DataCapture);

        connection.handle_command("..hello").await;
        assert_eq!(connection.envelope.data, ".hello\n");

        connection.handle_command(".").await;
        assert_eq!(reply(&mut client).await, "250 OK");
        assert_eq!(connection.state, SessionState::Command);
        assert_eq!(connection.envelope, Envelope::new());
    }

    #[tokio::test]
    async fn disconnecting_flag_forces_421() {
        let (mut connection, mut client) = test_connection().await;
        connection.handle.mark_disconnecting();

        assert_eq!(
            connection.handle_command("NOOP").await,
            CommandResult::Disconnect
        );
        assert_eq!(
            reply(&mut client).await,
            "421 Service not available, closing transmission channel"
        );
    }

    #[tokio::test]
    async fn starttls_without_material_keeps_session_open() {
        let (mut connection, mut client) = test_connection().await;

        connection.handle_command("MAIL FROM:<a@example.com>").await;
        reply(&mut client).await;

        assert_eq!(
            connection.handle_command("STARTTLS").await,
            CommandResult::Error
        );
        assert_eq!(reply(&mut client).await, "502 Command not implemented");
        assert_eq!(connection.state, SessionState::Command);
        assert_eq!(connection.envelope.from.as_deref(), Some("a@example.com"));
    }
}
