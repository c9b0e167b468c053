//! Outbound LMTP/SMTP proxy client (C8/C9): one [`SubClient`] per
//! `(host, port, protocol, timeout)` destination, pipelining `RCPT TO`
//! commands as recipients are routed to it and streaming the DATA body
//! with dot-stuffing and bare-LF normalisation, producing one reply per
//! recipient in LMTP mode or one shared reply in SMTP mode.
//!
//! Unlike the single-recipient `Sender` this crate's teacher shipped (one
//! `MAIL FROM`/`RCPT TO`/`DATA` per destination *mailbox*), a `SubClient`
//! here is multi-recipient: `lmtpd`'s recipient resolver adds recipients to
//! the same sub-client one by one, in RCPT order, exactly as each inbound
//! `RCPT TO` is classified as proxied to that destination, and relays each
//! upstream `RCPT` reply straight back as the inbound reply — this *is*
//! the pipelining the spec asks for, since the upstream connection is
//! already open and EHLO/MAIL FROM already negotiated by the time a second
//! recipient arrives.

use std::{cmp, io, net::SocketAddr, ops::Range, sync::Arc, time::Duration};

use chrono::Utc;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use smol::net::TcpStream;
use tracing::trace;

use lmtp_message::{
    nom, Command, Email, EnhancedReplyCodeSubject, EscapingDataWriter, Hostname, ParameterName,
    Parameters, Reply, ReplyCodeKind,
};

const RDBUF_SIZE: usize = 16 * 1024;
const DATABUF_SIZE: usize = 16 * 1024;
const MINIMUM_FREE_BUFSPACE: usize = 128;
const ZERO_DURATION: Duration = Duration::from_secs(0);

/// Which wire protocol a destination speaks, and therefore how many DATA
/// replies to expect once the body has been sent (§4.9).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Protocol {
    /// One DATA reply per recipient, in RCPT order (RFC 2033).
    Lmtp,
    /// One DATA reply shared by every recipient (RFC 5321).
    Smtp,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Lmtp => 24,
            Protocol::Smtp => 25,
        }
    }
}

pub trait Config: Send + Sync {
    fn ehlo_hostname(&self) -> Hostname<String>;

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn banner_read_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(2)
    }

    fn command_write_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(2)
    }

    fn hello_reply_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(2)
    }

    fn mail_reply_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    fn rcpt_reply_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    fn data_init_reply_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(2)
    }

    fn data_block_write_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(3)
    }

    fn data_end_reply_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(10)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connecting to ‘{0}’")]
    Connecting(SocketAddr, #[source] io::Error),

    #[error("timed out connecting to ‘{0}’")]
    TimedOutConnecting(SocketAddr),

    #[error("receiving reply bytes")]
    ReceivingReplyBytes(#[source] io::Error),

    #[error("timed out while waiting for a reply")]
    TimedOutWaitingForReply,

    #[error("connection aborted")]
    ConnectionAborted,

    #[error("reply does not fit in buffer: ‘{0}’")]
    TooLongReply(String),

    #[error("syntax error parsing a reply: ‘{0}’")]
    SyntaxError(String),

    #[error("timed out while sending a command")]
    TimedOutSendingCommand,

    #[error("sending command")]
    SendingCommand(#[source] io::Error),

    #[error("mail-level transient issue: {0}")]
    TransientMail(Reply),

    #[error("mailbox-level transient issue: {0}")]
    TransientMailbox(Reply),

    #[error("mail system-level transient issue: {0}")]
    TransientMailSystem(Reply),

    #[error("mail-level permanent issue: {0}")]
    PermanentMail(Reply),

    #[error("mailbox-level permanent issue: {0}")]
    PermanentMailbox(Reply),

    #[error("mail system-level permanent issue: {0}")]
    PermanentMailSystem(Reply),

    #[error("unexpected reply code: {0}")]
    UnexpectedReplyCode(Reply),

    #[error("timed out while sending data")]
    TimedOutSendingData,

    #[error("sending data")]
    SendingData(#[source] io::Error),

    #[error("reading the body stream")]
    ReadingBody(#[source] io::Error),

    #[error("tried to add a recipient after the DATA phase had already started")]
    TooLateToAddRecipient,

    #[error("tried to add a recipient before MAIL FROM was sent")]
    RecipientBeforeMailFrom,
}

pub enum TransportErrorSeverity {
    Local,
    NetworkTransient,
    MailTransient,
    MailboxTransient,
    MailSystemTransient,
    MailPermanent,
    MailboxPermanent,
    MailSystemPermanent,
}

impl TransportError {
    /// Coarse classifier used by the caller (`lmtpd`'s response router) to
    /// pick a `451`/`551`-style reply code family when a sub-client fails
    /// outright rather than relaying an explicit upstream reply line.
    pub fn severity(&self) -> TransportErrorSeverity {
        use TransportErrorSeverity::*;
        match self {
            TransportError::Connecting(_, _) => NetworkTransient,
            TransportError::TimedOutConnecting(_) => NetworkTransient,
            TransportError::ReceivingReplyBytes(_) => NetworkTransient,
            TransportError::TimedOutWaitingForReply => NetworkTransient,
            TransportError::ConnectionAborted => NetworkTransient,
            TransportError::TooLongReply(_) => NetworkTransient,
            TransportError::SyntaxError(_) => MailSystemTransient,
            TransportError::TimedOutSendingCommand => NetworkTransient,
            TransportError::SendingCommand(_) => NetworkTransient,
            TransportError::TransientMail(_) => MailTransient,
            TransportError::TransientMailbox(_) => MailboxTransient,
            TransportError::TransientMailSystem(_) => MailSystemTransient,
            TransportError::PermanentMail(_) => MailPermanent,
            TransportError::PermanentMailbox(_) => MailboxPermanent,
            TransportError::PermanentMailSystem(_) => MailSystemPermanent,
            TransportError::UnexpectedReplyCode(_) => NetworkTransient,
            TransportError::TimedOutSendingData => NetworkTransient,
            TransportError::SendingData(_) => NetworkTransient,
            TransportError::ReadingBody(_) => Local,
            TransportError::TooLateToAddRecipient => Local,
            TransportError::RecipientBeforeMailFrom => Local,
        }
    }
}

/// Outcome of pipelining a single `RCPT TO` to a sub-client.
#[derive(Debug)]
pub struct RcptOutcome {
    pub accepted: bool,
    pub reply: Reply,
}

/// Outcome of the DATA phase for a single recipient that was accepted at
/// the RCPT phase. `None` if the sub-client failed outright (connection
/// error, protocol violation) before a reply for this recipient arrived;
/// the caller should then synthesise a temporary-remote-failure reply from
/// the originating [`TransportError`] instead.
pub type DataOutcome = Option<Reply>;

async fn with_timeout<T>(
    fut: impl std::future::Future<Output = io::Result<T>>,
    since: chrono::DateTime<Utc>,
    timeout: chrono::Duration,
    on_err: impl FnOnce(io::Error) -> TransportError,
    on_timeout: TransportError,
) -> Result<T, TransportError> {
    smol::future::or(
        async { fut.await.map_err(on_err) },
        async {
            let max_delay: Duration = (since + timeout - Utc::now())
                .to_std()
                .unwrap_or(ZERO_DURATION);
            smol::Timer::after(max_delay).await;
            Err(on_timeout)
        },
    )
    .await
}

async fn read_reply(
    io: &mut TcpStream,
    rdbuf: &mut [u8; RDBUF_SIZE],
    unhandled: &mut Range<usize>,
    timeout: chrono::Duration,
) -> Result<Reply, TransportError> {
    let start = Utc::now();
    if unhandled.is_empty() {
        *unhandled = 0..with_timeout(
            io.read(rdbuf),
            start,
            timeout,
            TransportError::ReceivingReplyBytes,
            TransportError::TimedOutWaitingForReply,
        )
        .await?;
        if unhandled.is_empty() {
            return Err(TransportError::ConnectionAborted);
        }
    }
    loop {
        trace!(
            buf = String::from_utf8_lossy(&rdbuf[unhandled.clone()]).as_ref(),
            "trying to parse a reply"
        );
        match Reply::<&str>::parse(&rdbuf[unhandled.clone()]) {
            Err(nom::Err::Incomplete(n)) => {
                if unhandled.start != 0 {
                    let missing = match n {
                        nom::Needed::Unknown => MINIMUM_FREE_BUFSPACE,
                        nom::Needed::Size(s) => cmp::max(MINIMUM_FREE_BUFSPACE, s.into()),
                    };
                    if missing > rdbuf.len() - unhandled.end {
                        rdbuf.copy_within(unhandled.clone(), 0);
                        unhandled.end -= unhandled.start;
                        unhandled.start = 0;
                    }
                }
                if unhandled.end == rdbuf.len() {
                    return Err(TransportError::TooLongReply(
                        String::from_utf8_lossy(&rdbuf[unhandled.clone()]).to_string(),
                    ));
                }
                let read = with_timeout(
                    io.read(&mut rdbuf[unhandled.end..]),
                    start,
                    timeout,
                    TransportError::ReceivingReplyBytes,
                    TransportError::TimedOutWaitingForReply,
                )
                .await?;
                if read == 0 {
                    return Err(TransportError::ConnectionAborted);
                }
                unhandled.end += read;
            }
            Err(_) => {
                return Err(TransportError::SyntaxError(
                    String::from_utf8_lossy(&rdbuf[unhandled.clone()]).to_string(),
                ));
            }
            Ok((rem, reply)) => {
                unhandled.start = unhandled.end - rem.len();
                return Ok(reply.into_owned());
            }
        }
    }
}

fn verify_reply(r: Reply, expected: ReplyCodeKind) -> Result<Reply, TransportError> {
    use EnhancedReplyCodeSubject::*;
    use ReplyCodeKind::*;
    use TransportError::*;
    match (r.code.kind(), r.ecode.as_ref().map(|e| e.subject())) {
        (k, _) if k == expected => Ok(r),
        (TransientNegative, Some(Mailbox)) => Err(TransientMailbox(r)),
        (PermanentNegative, Some(Mailbox)) => Err(PermanentMailbox(r)),
        (TransientNegative, Some(MailSystem)) => Err(TransientMailSystem(r)),
        (PermanentNegative, Some(MailSystem)) => Err(PermanentMailSystem(r)),
        (TransientNegative, _) => Err(TransientMail(r)),
        (PermanentNegative, _) => Err(PermanentMail(r)),
        (_, _) => Err(UnexpectedReplyCode(r)),
    }
}

/// Sends a pre-rendered line verbatim, for the one spot (the `LHLO`/`EHLO`
/// greeting) where the wire text can't be produced by [`Command::as_io_slices`].
async fn send_raw_line(
    io: &mut TcpStream,
    line: &[u8],
    timeout: chrono::Duration,
) -> Result<(), TransportError> {
    trace!(cmd = String::from_utf8_lossy(line).as_ref(), "sending command");
    smol::future::or(
        async {
            io.write_all(line)
                .await
                .map_err(TransportError::SendingCommand)
        },
        async {
            smol::Timer::after(timeout.to_std().unwrap_or(ZERO_DURATION)).await;
            Err(TransportError::TimedOutSendingCommand)
        },
    )
    .await
}

async fn send_command<S>(
    io: &mut TcpStream,
    cmd: Command<S>,
    timeout: chrono::Duration,
) -> Result<(), TransportError>
where
    S: AsRef<str>,
{
    trace!(
        cmd = String::from_utf8_lossy(
            &cmd.as_io_slices()
                .flat_map(|s| s.to_vec().into_iter())
                .collect::<Vec<_>>()
        )
        .as_ref(),
        "sending command"
    );
    smol::future::or(
        async {
            io.write_all_vectored(&mut cmd.as_io_slices().collect::<Vec<_>>())
                .await
                .map_err(TransportError::SendingCommand)
        },
        async {
            smol::Timer::after(timeout.to_std().unwrap_or(ZERO_DURATION)).await;
            Err(TransportError::TimedOutSendingCommand)
        },
    )
    .await
}

/// One outbound connection to a single `(host, port, protocol, timeout)`
/// destination (§3 "outbound proxy object", one sub-client per tuple).
///
/// Lifecycle: [`SubClient::connect`], then [`SubClient::mail_from`] once,
/// then [`SubClient::add_rcpt`] once per recipient routed here (in RCPT
/// order, interleaved with the inbound session's own RCPT processing),
/// then [`SubClient::send_data`] once the inbound DATA body is available.
pub struct SubClient<Cfg> {
    io: TcpStream,
    rdbuf: Box<[u8; RDBUF_SIZE]>,
    unhandled: Range<usize>,
    cfg: Arc<Cfg>,
    protocol: Protocol,
    timeout: Duration,
    mail_from_sent: bool,
    /// Recipients accepted at the RCPT phase, in RCPT order; only these
    /// receive a DATA outcome.
    accepted_recipients: usize,
    data_phase_started: bool,
}

impl<Cfg> SubClient<Cfg>
where
    Cfg: Config,
{
    /// Connects to `addr` and completes the greeting/hello handshake.
    /// `timeout` is the sub-client's `proxy_timeout` (§3), applied to every
    /// subsequent round trip on this connection.
    pub async fn connect(
        addr: SocketAddr,
        protocol: Protocol,
        timeout: Duration,
        cfg: Arc<Cfg>,
    ) -> Result<Self, TransportError> {
        let chrono_timeout = chrono::Duration::from_std(timeout)
            .unwrap_or_else(|_| cfg.banner_read_timeout());

        let io = smol::future::or(
            async {
                TcpStream::connect(addr)
                    .await
                    .map_err(|e| TransportError::Connecting(addr, e))
            },
            async {
                smol::Timer::after(cfg.connect_timeout()).await;
                Err(TransportError::TimedOutConnecting(addr))
            },
        )
        .await?;

        let mut client = SubClient {
            io,
            rdbuf: Box::new([0; RDBUF_SIZE]),
            unhandled: 0..0,
            cfg,
            protocol,
            timeout,
            mail_from_sent: false,
            accepted_recipients: 0,
            data_phase_started: false,
        };

        let reply = read_reply(
            &mut client.io,
            &mut client.rdbuf,
            &mut client.unhandled,
            chrono_timeout,
        )
        .await?;
        verify_reply(reply, ReplyCodeKind::PositiveCompletion)?;

        let hostname = client.cfg.ehlo_hostname();
        let greeting = match protocol {
            // `Command::Ehlo::as_io_slices` always renders the literal
            // `EHLO `, which is wrong for LMTP's `LHLO`; the hello keyword
            // is the one place the two protocols differ on the wire, so it
            // is hand-rendered here instead of going through `send_command`.
            Protocol::Lmtp => format!("LHLO {}\r\n", hostname.raw()),
            Protocol::Smtp => format!("EHLO {}\r\n", hostname.raw()),
        };
        send_raw_line(&mut client.io, greeting.as_bytes(), client.cfg.command_write_timeout())
            .await?;
        let reply = read_reply(
            &mut client.io,
            &mut client.rdbuf,
            &mut client.unhandled,
            client.cfg.hello_reply_timeout(),
        )
        .await?;
        verify_reply(reply, ReplyCodeKind::PositiveCompletion)?;

        Ok(client)
    }

    /// Converts this sub-client's configured per-destination `proxy_timeout`
    /// (§3) to the `chrono::Duration` the reply-reading helpers expect,
    /// falling back to the config's default mail-reply timeout on overflow.
    fn chrono_timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.timeout).unwrap_or_else(|_| self.cfg.mail_reply_timeout())
    }

    /// Sends `MAIL FROM:<sender>[ BODY=...]`. Must be called exactly once,
    /// before any [`SubClient::add_rcpt`].
    pub async fn mail_from(
        &mut self,
        from: Option<&Email<String>>,
        body_8bitmime: bool,
    ) -> Result<(), TransportError> {
        let cmd: Command<String> = Command::Mail {
            path: None,
            email: from.cloned(),
            params: if body_8bitmime {
                Parameters(vec![(
                    ParameterName("BODY".to_owned()),
                    Some("8BITMIME".to_owned()),
                )])
            } else {
                Parameters(Vec::new())
            },
        };
        send_command(&mut self.io, cmd, self.chrono_timeout()).await?;
        let reply = read_reply(
            &mut self.io,
            &mut self.rdbuf,
            &mut self.unhandled,
            self.chrono_timeout(),
        )
        .await?;
        verify_reply(reply, ReplyCodeKind::PositiveCompletion)?;
        self.mail_from_sent = true;
        Ok(())
    }

    /// Pipelines a single `RCPT TO:<addr>` and returns the upstream's
    /// verdict, to be relayed straight back as the inbound session's reply
    /// to the matching `RCPT TO` (§4.6 step 9, §4.9 "RCPT phase").
    pub async fn add_rcpt(&mut self, addr: &Email<String>) -> Result<RcptOutcome, TransportError> {
        if !self.mail_from_sent {
            return Err(TransportError::RecipientBeforeMailFrom);
        }
        if self.data_phase_started {
            return Err(TransportError::TooLateToAddRecipient);
        }
        let cmd: Command<String> = Command::Rcpt {
            path: None,
            email: addr.clone(),
            params: Parameters(Vec::new()),
        };
        send_command(&mut self.io, cmd, self.chrono_timeout()).await?;
        let reply = read_reply(
            &mut self.io,
            &mut self.rdbuf,
            &mut self.unhandled,
            self.chrono_timeout(),
        )
        .await?;
        let accepted = reply.code.kind() == ReplyCodeKind::PositiveCompletion;
        if accepted {
            self.accepted_recipients += 1;
        }
        Ok(RcptOutcome { accepted, reply })
    }

    /// Whether it is still legal to call [`SubClient::add_rcpt`] (Open
    /// Question §9: adding a recipient after the body phase starts is
    /// rejected rather than silently dropped).
    pub fn can_add_rcpt(&self) -> bool {
        !self.data_phase_started
    }

    /// Streams `body` (the raw, not-yet-escaped message, including the
    /// injected headers) as the DATA phase, and returns one outcome per
    /// *accepted* recipient, in the order they were added.
    pub async fn send_data<R>(&mut self, mut body: R) -> Result<Vec<DataOutcome>, TransportError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.data_phase_started = true;

        if self.accepted_recipients == 0 {
            return Ok(Vec::new());
        }

        send_command(&mut self.io, Command::<String>::Data, self.chrono_timeout()).await?;
        let reply = read_reply(
            &mut self.io,
            &mut self.rdbuf,
            &mut self.unhandled,
            self.chrono_timeout(),
        )
        .await?;
        if verify_reply(reply, ReplyCodeKind::PositiveIntermediate).is_err() {
            // Every accepted recipient fails identically: the server refused
            // to let us even start the body.
            return Ok((0..self.accepted_recipients).map(|_| None).collect());
        }

        stream_body(&mut self.io, &mut body, self.chrono_timeout()).await?;

        match self.protocol {
            Protocol::Lmtp => {
                let mut out = Vec::with_capacity(self.accepted_recipients);
                for _ in 0..self.accepted_recipients {
                    let reply = read_reply(
                        &mut self.io,
                        &mut self.rdbuf,
                        &mut self.unhandled,
                        self.chrono_timeout(),
                    )
                    .await;
                    match reply {
                        Ok(r) => out.push(Some(r)),
                        Err(_) => {
                            // Connection died mid-replies: everyone still
                            // waiting gets no reply.
                            while out.len() < self.accepted_recipients {
                                out.push(None);
                            }
                            break;
                        }
                    }
                }
                Ok(out)
            }
            Protocol::Smtp => {
                let reply = read_reply(
                    &mut self.io,
                    &mut self.rdbuf,
                    &mut self.unhandled,
                    self.chrono_timeout(),
                )
                .await;
                let shared = reply.ok();
                Ok((0..self.accepted_recipients).map(|_| shared.clone()).collect())
            }
        }
    }
}

/// Reads `body` to completion, normalising bare `LF` to `CRLF` and
/// dot-stuffing through [`EscapingDataWriter`], yielding on buffer pressure
/// per §4.9.
async fn stream_body<R>(
    io: &mut TcpStream,
    body: &mut R,
    write_timeout: chrono::Duration,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut writer = EscapingDataWriter::new(&mut *io);
    let mut databuf = [0u8; DATABUF_SIZE];
    let mut last_was_cr = false;
    loop {
        let n = body
            .read(&mut databuf)
            .await
            .map_err(TransportError::ReadingBody)?;
        if n == 0 {
            break;
        }
        let normalised = normalise_crlf(&databuf[..n], &mut last_was_cr);
        smol::future::or(
            async {
                writer
                    .write_all(&normalised)
                    .await
                    .map_err(TransportError::SendingData)
            },
            async {
                smol::Timer::after(write_timeout.to_std().unwrap_or(ZERO_DURATION)).await;
                Err(TransportError::TimedOutSendingData)
            },
        )
        .await?;
    }
    writer.finish().await.map_err(TransportError::SendingData)
}

/// Rewrites bare `LF` (not preceded by `CR`) to `CRLF`, tracking
/// cross-chunk state in `last_was_cr`.
fn normalise_crlf(buf: &[u8], last_was_cr: &mut bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len());
    for &b in buf {
        if b == b'\n' && !*last_was_cr {
            out.push(b'\r');
        }
        out.push(b);
        *last_was_cr = b == b'\r';
    }
    out
}

/// In-memory stand-ins and helpers used only by tests.
#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use super::*;

    pub struct TestConfig {
        pub hostname: String,
    }

    impl Config for TestConfig {
        fn ehlo_hostname(&self) -> Hostname<String> {
            let mut terminated = self.hostname.clone();
            terminated.push('\r');
            Hostname::<&str>::parse_until(b"\r")(terminated.as_bytes())
                .expect("failed parsing static hostname")
                .1
                .to_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalise_crlf_inserts_missing_cr() {
        let mut last_was_cr = false;
        let out = normalise_crlf(b"a\nb\r\nc\n", &mut last_was_cr);
        assert_eq!(out, b"a\r\nb\r\nc\r\n");
    }

    #[test]
    fn normalise_crlf_does_not_double_existing_cr() {
        let mut last_was_cr = false;
        let out = normalise_crlf(b"a\r\nb\r\n", &mut last_was_cr);
        assert_eq!(out, b"a\r\nb\r\n");
    }

    #[test]
    fn normalise_crlf_tracks_state_across_chunks() {
        let mut last_was_cr = false;
        let first = normalise_crlf(b"a\r", &mut last_was_cr);
        assert!(last_was_cr);
        let second = normalise_crlf(b"\nb", &mut last_was_cr);
        assert_eq!([first, second].concat(), b"a\r\nb");
    }

    #[test]
    fn default_ports() {
        assert_eq!(Protocol::Lmtp.default_port(), 24);
        assert_eq!(Protocol::Smtp.default_port(), 25);
    }

    #[test]
    fn full_lmtp_round_trip_two_recipients() {
        smol::block_on(async {
            use futures::io::Cursor;
            use smol::net::TcpListener;

            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let server = smol::spawn(async move {
                let (mut sock, _) = listener.accept().await.unwrap();
                use futures::io::{AsyncBufReadExt, BufReader};
                sock.write_all(b"220 mx.example ready\r\n").await.unwrap();
                let (r, mut w) = sock.split();
                let mut r = BufReader::new(r);
                let mut line = String::new();

                r.read_line(&mut line).await.unwrap(); // LHLO
                w.write_all(b"250 mx.example\r\n").await.unwrap();

                line.clear();
                r.read_line(&mut line).await.unwrap(); // MAIL FROM
                w.write_all(b"250 2.1.0 OK\r\n").await.unwrap();

                line.clear();
                r.read_line(&mut line).await.unwrap(); // RCPT 1
                w.write_all(b"250 2.1.5 OK\r\n").await.unwrap();

                line.clear();
                r.read_line(&mut line).await.unwrap(); // RCPT 2
                w.write_all(b"550 5.1.1 unknown\r\n").await.unwrap();

                line.clear();
                r.read_line(&mut line).await.unwrap(); // DATA
                w.write_all(b"354 go ahead\r\n").await.unwrap();

                // Drain the body until the dot-terminator.
                loop {
                    line.clear();
                    let n = r.read_line(&mut line).await.unwrap();
                    if n == 0 || line == ".\r\n" {
                        break;
                    }
                }
                // Only one recipient was accepted at RCPT phase.
                w.write_all(b"250 2.0.0 Saved\r\n").await.unwrap();
            });

            let cfg = Arc::new(test_util::TestConfig {
                hostname: "client.example".into(),
            });
            let mut client = SubClient::connect(addr, Protocol::Lmtp, Duration::from_secs(5), cfg)
                .await
                .unwrap();

            let from = Email::<&str>::parse_until(b">", b"@>")(b"sender@x>")
                .unwrap()
                .1
                .to_owned();
            client.mail_from(Some(&from), false).await.unwrap();

            let rcpt1 = Email::<&str>::parse_until(b">", b"@>")(b"alice@y>")
                .unwrap()
                .1
                .to_owned();
            let rcpt2 = Email::<&str>::parse_until(b">", b"@>")(b"nobody@y>")
                .unwrap()
                .1
                .to_owned();

            let out1 = client.add_rcpt(&rcpt1).await.unwrap();
            assert!(out1.accepted);
            let out2 = client.add_rcpt(&rcpt2).await.unwrap();
            assert!(!out2.accepted);

            let body = Cursor::new(b"Subject: hi\r\n\r\nhello\r\n".to_vec());
            let results = client.send_data(body).await.unwrap();
            assert_eq!(results.len(), 1);
            assert!(results[0].is_some());

            server.await;
        });
    }
}
