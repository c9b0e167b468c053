#![type_length_limit = "200000000"]

mod spool;

pub use spool::{BodySpool, BodySpoolReader};

use std::{borrow::Cow, cmp, io, ops::Range, pin::Pin, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use smol::future::FutureExt;

use lmtp_message::{
    next_crlf, nom, xtext_decode, Command, Email, EscapedDataReader, Hostname, MaybeUtf8,
    NextCrLfState, Parameters, Reply,
};
use lmtp_server_types::{
    reply as replies, ConnectionMetadata, Decision, HelloInfo, MailMetadata, Recipient,
    RecipientClass,
};

pub const RDBUF_SIZE: usize = 16 * 1024;
const MINIMUM_FREE_BUFSPACE: usize = 128;

/// A single-hop LMTP relay is on its own network and has no DNS entry to
/// speak of; this is the hostname advertised in the greeting/EHLO when a
/// [`Config`] doesn't override [`Config::hostname`] with something more
/// specific.
fn email_addr_string(e: &Email<&str>) -> String {
    match &e.hostname {
        Some(h) => format!("{}@{}", e.localpart.raw(), h.raw()),
        None => e.localpart.raw().to_string(),
    }
}

fn owned<S: AsRef<str>>(r: Reply<S>) -> Reply {
    Reply {
        code: r.code,
        ecode: r.ecode,
        text: r
            .text
            .into_iter()
            .map(|t| match t {
                MaybeUtf8::Ascii(s) => MaybeUtf8::Ascii(s.as_ref().to_owned()),
                MaybeUtf8::Utf8(s) => MaybeUtf8::Utf8(s.as_ref().to_owned()),
            })
            .collect(),
    }
}

#[async_trait]
pub trait Config: Send + Sync {
    type ConnectionUserMeta: Send;
    type MailUserMeta: Send;

    // TODO: this could have a default implementation if we were able to have a
    // default type of () for MailUserMeta without requiring unstable
    async fn new_mail(
        &self,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Self::MailUserMeta;

    #[allow(unused_variables)]
    async fn filter_hello(
        &self,
        is_ehlo: bool,
        hostname: &mut Hostname<&str>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision<()> {
        Decision::Accept {
            reply: owned(replies::okay_hello(
                is_ehlo,
                &self.hostname(),
                &self.banner(),
                self.can_do_tls(conn_meta),
                conn_meta.is_trusted,
            )),
            res: (),
        }
    }

    #[allow(unused_variables)]
    fn can_do_tls(&self, conn_meta: &ConnectionMetadata<Self::ConnectionUserMeta>) -> bool {
        !conn_meta.is_encrypted && conn_meta.hello.as_ref().map(|h| h.is_ehlo).unwrap_or(false)
    }

    /// Whether this connection has TLS available to offer at all, regardless
    /// of whether it's already active or the peer has said EHLO. Lets
    /// `STARTTLS` tell "454 4.7.0 TLS not available" apart from a plain
    /// "502 not supported"; overridden by implementations with no TLS
    /// acceptor configured.
    #[allow(unused_variables)]
    fn tls_configured(&self, conn_meta: &ConnectionMetadata<Self::ConnectionUserMeta>) -> bool {
        true
    }

    /// Whether `XCLIENT` is accepted from this peer. Defaults to whatever
    /// `conn_meta.is_trusted` was initialised to by the caller of
    /// [`interact`].
    fn is_trusted(&self, conn_meta: &ConnectionMetadata<Self::ConnectionUserMeta>) -> bool {
        conn_meta.is_trusted
    }

    // TODO: when GATs are here, we can remove the trait object and return
    // Self::TlsStream<IO> (or maybe we should refactor Config to be Config<IO>? but
    // that's ugly). At that time we can probably get rid of all that duplexify
    // mess... or maybe when we can do trait objects with more than one trait
    /// Note: if you don't want to implement TLS, you should override
    /// `can_do_tls` to return `false` so that STARTTLS is not advertized. This
    /// being said, returning an error here should have the same result in
    /// practice, except clients will try STARTTLS and fail
    async fn tls_accept<IO>(
        &self,
        io: IO,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> io::Result<
        duplexify::Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>,
    >
    where
        IO: 'static + Unpin + Send + AsyncRead + AsyncWrite;

    async fn filter_from(
        &self,
        from: &mut Option<Email<&str>>,
        meta: &mut MailMetadata<Self::MailUserMeta>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision<()>;

    /// Resolves a single `RCPT TO`. Besides accept/reject, the caller needs
    /// to know whether this recipient is handled locally or proxied onward,
    /// so that mixing the two within one transaction can be rejected.
    /// `params` carries the RCPT-level ESMTP parameters (notably `ORCPT=`).
    async fn filter_to(
        &self,
        to: &mut Email<&str>,
        params: &Parameters<&str>,
        meta: &mut MailMetadata<Self::MailUserMeta>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision<RecipientClass>;

    #[allow(unused_variables)]
    async fn filter_data(
        &self,
        meta: &mut MailMetadata<Self::MailUserMeta>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision<()> {
        Decision::Accept {
            reply: owned(replies::okay_data()),
            res: (),
        }
    }

    /// Called once the whole body has been received into `body`, with
    /// `meta.to` already holding one entry per accepted recipient.
    ///
    /// Unlike a single whole-envelope decision, this returns one
    /// [`Decision`] per recipient, in the same order as `meta.to`: LMTP
    /// requires exactly one `DATA` reply per `RCPT`, since each recipient
    /// may proxy to, or be delivered by, a different backend and fail
    /// independently.
    async fn handle_mail(
        &self,
        body: &BodySpool,
        meta: MailMetadata<Self::MailUserMeta>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Vec<Decision<()>>;

    #[allow(unused_variables)]
    async fn handle_rset(
        &self,
        meta: &mut Option<MailMetadata<Self::MailUserMeta>>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision<()> {
        Decision::Accept {
            reply: owned(replies::okay_rset()),
            res: (),
        }
    }

    #[allow(unused_variables)]
    async fn handle_starttls(
        &self,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision<()> {
        if self.can_do_tls(conn_meta) {
            Decision::Accept {
                reply: owned(replies::okay_starttls()),
                res: (),
            }
        } else {
            Decision::Reject {
                reply: owned(replies::command_not_supported()),
            }
        }
    }

    /// `XCLIENT ADDR=... PORT=... TTL=... TIMEOUT=...`: lets a trusted front
    /// proxy override the peer identity this session reports downstream.
    /// Default implementation applies the four well-known attributes and
    /// resets HELO state (matching `STARTTLS`'s reset, since the identity
    /// just changed), rejecting outright if the peer isn't trusted.
    async fn handle_xclient(
        &self,
        params: Parameters<&str>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision<()> {
        if !self.is_trusted(conn_meta) {
            return Decision::Reject {
                reply: owned(replies::xclient_not_trusted()),
            };
        }
        if let Some(Some(addr)) = params.get("ADDR") {
            if let Ok(ip) = addr.parse() {
                conn_meta.peer_addr.set_ip(ip);
            }
        }
        if let Some(Some(port)) = params.get("PORT") {
            if let Ok(port) = port.parse() {
                conn_meta.peer_addr.set_port(port);
            }
        }
        if let Some(Some(ttl)) = params.get("TTL") {
            if let Ok(ttl) = ttl.parse() {
                conn_meta.proxy_ttl = ttl;
            }
        }
        if let Some(Some(timeout)) = params.get("TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                conn_meta.peer_timeout = Some(std::time::Duration::from_secs(secs));
            }
        }
        Decision::Accept {
            reply: owned(replies::okay(
                lmtp_message::EnhancedReplyCode::SUCCESS_UNDEFINED,
            )),
            res: (),
        }
    }

    #[allow(unused_variables)]
    async fn handle_expn(
        &self,
        name: MaybeUtf8<&str>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision<()> {
        Decision::Reject {
            reply: owned(replies::command_unimplemented()),
        }
    }

    #[allow(unused_variables)]
    async fn handle_vrfy(
        &self,
        name: MaybeUtf8<&str>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision<()> {
        Decision::Accept {
            reply: owned(replies::ignore_vrfy()),
            res: (),
        }
    }

    #[allow(unused_variables)]
    async fn handle_help(
        &self,
        subject: MaybeUtf8<&str>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision<()> {
        Decision::Accept {
            reply: owned(replies::ignore_help()),
            res: (),
        }
    }

    #[allow(unused_variables)]
    async fn handle_noop(
        &self,
        string: MaybeUtf8<&str>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision<()> {
        Decision::Accept {
            reply: owned(replies::okay_noop()),
            res: (),
        }
    }

    #[allow(unused_variables)]
    async fn handle_quit(
        &self,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision<()> {
        Decision::Kill {
            reply: Some(owned(replies::okay_quit())),
            res: Ok(()),
        }
    }

    fn hostname(&self) -> Cow<'static, str>;

    fn banner(&self) -> Cow<'static, str> {
        "Service ready".into()
    }

    fn welcome_banner(&self) -> Reply {
        owned(replies::welcome_banner(&self.hostname(), &self.banner()))
    }

    fn bad_sequence(&self) -> Reply {
        owned(replies::bad_sequence())
    }

    fn line_too_long(&self) -> Reply {
        owned(replies::line_too_long())
    }

    fn command_unrecognized(&self) -> Reply {
        owned(replies::command_unrecognized())
    }

    fn command_not_supported(&self) -> Reply {
        owned(replies::command_not_supported())
    }

    fn pipeline_forbidden_after_starttls(&self) -> Reply {
        owned(replies::pipeline_forbidden_after_starttls())
    }

    fn internal_server_error(&self) -> Reply {
        owned(replies::internal_server_error())
    }

    fn handle_mail_did_not_call_complete(&self) -> Reply {
        owned(replies::handle_mail_did_not_call_complete())
    }

    fn no_valid_recipients(&self) -> Reply {
        owned(replies::no_valid_recipients())
    }

    fn class_mixing(&self, addr: &str) -> Reply {
        replies::class_mixing(addr)
    }

    fn reply_write_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    fn command_read_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    /// Directory a DATA body spills below once it crosses
    /// [`spool::MEMORY_THRESHOLD`] (C3). Defaults to the OS temp directory;
    /// override to honor an operator-configured spool directory.
    fn spool_dir(&self) -> std::path::PathBuf {
        std::env::temp_dir()
    }
}

async fn advance_until_crlf<R>(
    r: &mut R,
    buf: &mut [u8],
    unhandled: &mut Range<usize>,
) -> io::Result<()>
where
    R: Unpin + AsyncRead,
{
    let mut state = NextCrLfState::Start;
    loop {
        if let Some(p) = next_crlf(&buf[unhandled.clone()], &mut state) {
            unhandled.start += p + 1;
            return Ok(());
        } else {
            let read = r.read(buf).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "connection shutdown while waiting for crlf after invalid command",
                ));
            }
            *unhandled = 0..read;
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub enum IsAlreadyTls {
    Yes,
    No,
}

pub async fn interact<IO, Cfg>(
    io: IO,
    is_already_tls: IsAlreadyTls,
    mut conn_meta: ConnectionMetadata<Cfg::ConnectionUserMeta>,
    cfg: Arc<Cfg>,
) -> io::Result<()>
where
    IO: 'static + Send + AsyncRead + AsyncWrite,
    Cfg: Config,
{
    let (io_r, io_w) = io.split();
    let mut io = duplexify::Duplex::new(
        Box::pin(io_r) as Pin<Box<dyn Send + AsyncRead>>,
        Box::pin(io_w) as Pin<Box<dyn Send + AsyncWrite>>,
    );

    let rdbuf = &mut [0; RDBUF_SIZE];
    let mut unhandled = 0..0;

    conn_meta.is_encrypted = is_already_tls == IsAlreadyTls::Yes;
    let mut mail_meta: Option<MailMetadata<Cfg::MailUserMeta>> = None;

    let mut waiting_for_command_since = Utc::now();

    macro_rules! read_for_command {
        ($e:expr) => {
            $e.or(async {
                let max_delay: std::time::Duration =
                    (waiting_for_command_since + cfg.command_read_timeout() - Utc::now())
                        .to_std()
                        .unwrap_or(std::time::Duration::from_secs(0));
                smol::Timer::after(max_delay).await;
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timed out waiting for a command",
                ))
            })
        };
    }

    macro_rules! send_reply {
        ($writer:expr, $reply:expr) => {
            smol::future::or(
                async {
                    let reply: Reply = $reply;
                    $writer.write_all(&reply.render()).await?;
                    waiting_for_command_since = Utc::now();
                    Ok(())
                },
                async {
                    smol::Timer::after(
                        cfg.reply_write_timeout()
                            .to_std()
                            .unwrap_or(std::time::Duration::from_secs(0)),
                    )
                    .await;
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out sending a reply",
                    ))
                },
            )
        };
    }

    macro_rules! simple_handler {
        ($handler:expr) => {
            match $handler {
                Decision::Accept { reply, .. } => send_reply!(io, reply).await?,
                Decision::Reject { reply } => send_reply!(io, reply).await?,
                Decision::Kill { reply, res } => {
                    if let Some(r) = reply {
                        send_reply!(io, r).await?;
                    }
                    return res;
                }
            }
        };
    }

    send_reply!(io, cfg.welcome_banner()).await?;

    loop {
        if unhandled.is_empty() {
            unhandled = 0..read_for_command!(io.read(rdbuf)).await?;
            if unhandled.is_empty() {
                return Ok(());
            }
        }

        let cmd = match Command::<&str>::parse(&rdbuf[unhandled.clone()]) {
            Err(nom::Err::Incomplete(n)) => {
                // Don't have enough data to handle command, let's fetch more
                if unhandled.start != 0 {
                    let missing = match n {
                        nom::Needed::Unknown => MINIMUM_FREE_BUFSPACE,
                        nom::Needed::Size(s) => cmp::max(MINIMUM_FREE_BUFSPACE, s.into()),
                    };
                    if missing > rdbuf.len() - unhandled.end {
                        rdbuf.copy_within(unhandled.clone(), 0);
                        unhandled.end = unhandled.len();
                        unhandled.start = 0;
                    }
                }
                if unhandled.end == rdbuf.len() {
                    read_for_command!(advance_until_crlf(&mut io, rdbuf, &mut unhandled)).await?;
                    send_reply!(io, cfg.line_too_long()).await?;
                } else {
                    let read = read_for_command!(io.read(&mut rdbuf[unhandled.end..])).await?;
                    if read == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "connection shutdown with partial command",
                        ));
                    }
                    unhandled.end += read;
                }
                None
            }
            Err(_) => {
                read_for_command!(advance_until_crlf(&mut io, rdbuf, &mut unhandled)).await?;
                send_reply!(io, cfg.command_unrecognized()).await?;
                None
            }
            Ok((rem, cmd)) => {
                unhandled.start = unhandled.end - rem.len();
                Some(cmd)
            }
        };

        match cmd {
            None => (),

            Some(Command::Ehlo { mut hostname }) => match conn_meta.hello {
                Some(_) => {
                    send_reply!(io, cfg.bad_sequence()).await?;
                }
                None => match cfg.filter_hello(true, &mut hostname, &mut conn_meta).await {
                    Decision::Reject { reply } => {
                        send_reply!(io, reply).await?;
                    }
                    Decision::Kill { reply, res } => {
                        if let Some(r) = reply {
                            send_reply!(io, r).await?;
                        }
                        return res;
                    }
                    Decision::Accept { reply, .. } => {
                        conn_meta.hello = Some(HelloInfo {
                            is_ehlo: true,
                            hostname: hostname.to_owned(),
                        });
                        send_reply!(io, reply).await?;
                    }
                },
            },

            Some(Command::Helo { mut hostname }) => match conn_meta.hello {
                Some(_) => {
                    send_reply!(io, cfg.bad_sequence()).await?;
                }
                None => match cfg.filter_hello(false, &mut hostname, &mut conn_meta).await {
                    Decision::Reject { reply } => {
                        send_reply!(io, reply).await?;
                    }
                    Decision::Kill { reply, res } => {
                        if let Some(r) = reply {
                            send_reply!(io, r).await?;
                        }
                        return res;
                    }
                    Decision::Accept { reply, .. } => {
                        conn_meta.hello = Some(HelloInfo {
                            is_ehlo: false,
                            hostname: hostname.to_owned(),
                        });
                        send_reply!(io, reply).await?;
                    }
                },
            },

            Some(Command::Xclient { params }) => {
                match cfg.handle_xclient(params, &mut conn_meta).await {
                    Decision::Reject { reply } => {
                        send_reply!(io, reply).await?;
                    }
                    Decision::Kill { reply, res } => {
                        if let Some(r) = reply {
                            send_reply!(io, r).await?;
                        }
                        return res;
                    }
                    Decision::Accept { reply, .. } => {
                        conn_meta.hello = None;
                        send_reply!(io, reply).await?;
                    }
                }
            }

            Some(Command::Mail {
                path: _path,
                mut email,
                params,
            }) => {
                if conn_meta.hello.is_none() {
                    send_reply!(io, cfg.bad_sequence()).await?;
                } else {
                    match mail_meta {
                        Some(_) => {
                            // Both postfix and OpenSMTPD just return an error and ignore further
                            // MAIL FROM when there is already a MAIL FROM running
                            send_reply!(io, cfg.bad_sequence()).await?;
                        }
                        None => {
                            let body_8bitmime = matches!(
                                params.get("BODY"),
                                Some(Some(v)) if v.eq_ignore_ascii_case("8BITMIME")
                            );
                            let mut mail_metadata = MailMetadata::new(
                                cfg.new_mail(&mut conn_meta).await,
                                None,
                                body_8bitmime,
                            );
                            match cfg
                                .filter_from(&mut email, &mut mail_metadata, &mut conn_meta)
                                .await
                            {
                                Decision::Reject { reply } => {
                                    send_reply!(io, reply).await?;
                                }
                                Decision::Kill { reply, res } => {
                                    if let Some(r) = reply {
                                        send_reply!(io, r).await?;
                                    }
                                    return res;
                                }
                                Decision::Accept { reply, .. } => {
                                    mail_metadata.from = email.map(|e| e.to_owned());
                                    mail_meta = Some(mail_metadata);
                                    send_reply!(io, reply).await?;
                                }
                            }
                        }
                    }
                }
            }

            Some(Command::Rcpt {
                path: _path,
                mut email,
                params,
            }) => match mail_meta {
                None => {
                    send_reply!(io, cfg.bad_sequence()).await?;
                }
                Some(ref mut mail_meta_unw) => {
                    match cfg
                        .filter_to(&mut email, &params, mail_meta_unw, &mut conn_meta)
                        .await
                    {
                        Decision::Reject { reply } => {
                            send_reply!(io, reply).await?;
                        }
                        Decision::Kill { reply, res } => {
                            if let Some(r) = reply {
                                send_reply!(io, r).await?;
                            }
                            return res;
                        }
                        Decision::Accept {
                            reply,
                            res: class,
                        } => {
                            let addr_str = email_addr_string(&email);
                            if let Some(existing) = mail_meta_unw.class {
                                if existing != class {
                                    send_reply!(io, cfg.class_mixing(&addr_str)).await?;
                                    continue;
                                }
                            }
                            mail_meta_unw.class = Some(class);
                            let sid = format!(
                                "{}:{}",
                                conn_meta.session_id,
                                mail_meta_unw.to.len()
                            );
                            let mut recipient = Recipient::new(email.to_owned(), sid);
                            recipient.orcpt = params
                                .get("ORCPT")
                                .and_then(|v| v.as_ref())
                                .and_then(|v| xtext_decode(v))
                                .and_then(|bytes| String::from_utf8(bytes).ok());
                            mail_meta_unw.to.push(recipient);
                            send_reply!(io, reply).await?;
                        }
                    }
                }
            },

            Some(Command::Data) => match mail_meta.take() {
                None => {
                    send_reply!(io, cfg.bad_sequence()).await?;
                }
                Some(mail_meta_unw) if mail_meta_unw.to.is_empty() => {
                    mail_meta = Some(mail_meta_unw);
                    send_reply!(io, cfg.no_valid_recipients()).await?;
                }
                Some(mut mail_meta_unw) => {
                    match cfg.filter_data(&mut mail_meta_unw, &mut conn_meta).await {
                        Decision::Reject { reply } => {
                            mail_meta = Some(mail_meta_unw);
                            send_reply!(io, reply).await?;
                        }
                        Decision::Kill { reply, res } => {
                            if let Some(r) = reply {
                                send_reply!(io, r).await?;
                            }
                            return res;
                        }
                        Decision::Accept { reply, .. } => {
                            send_reply!(io, reply).await?;
                            let mut reader =
                                EscapedDataReader::new(rdbuf, unhandled.clone(), &mut io);
                            let mut body = BodySpool::new(cfg.spool_dir());
                            let mut chunk = [0u8; RDBUF_SIZE];
                            loop {
                                match read_for_command!(reader.read(&mut chunk)).await {
                                    Ok(0) => break,
                                    Ok(n) => body.write_all(&chunk[..n])?,
                                    Err(e) => return Err(e),
                                }
                            }
                            // `Ok(0)` above is only returned once the dot-terminator has been
                            // seen (see EscapedDataReader::poll_read_vectored), so the reader is
                            // always finished at this point.
                            reader.complete();
                            unhandled = reader.get_unhandled().unwrap();

                            let n_recipients = mail_meta_unw.to.len();
                            let decisions =
                                cfg.handle_mail(&body, mail_meta_unw, &mut conn_meta).await;
                            if decisions.len() != n_recipients {
                                send_reply!(io, cfg.internal_server_error()).await?;
                                continue;
                            }
                            for decision in decisions {
                                match decision {
                                    Decision::Accept { reply, .. } => {
                                        send_reply!(io, reply).await?;
                                    }
                                    Decision::Reject { reply } => {
                                        send_reply!(io, reply).await?;
                                    }
                                    Decision::Kill { reply, res } => {
                                        if let Some(r) = reply {
                                            send_reply!(io, r).await?;
                                        }
                                        return res;
                                    }
                                }
                            }
                        }
                    }
                }
            },

            Some(Command::Rset) => match cfg.handle_rset(&mut mail_meta, &mut conn_meta).await {
                Decision::Accept { reply, .. } => {
                    mail_meta = None;
                    send_reply!(io, reply).await?;
                }
                Decision::Reject { reply } => {
                    send_reply!(io, reply).await?;
                }
                Decision::Kill { reply, res } => {
                    if let Some(r) = reply {
                        send_reply!(io, r).await?;
                    }
                    return res;
                }
            },

            Some(Command::Starttls) => {
                if conn_meta.is_encrypted {
                    send_reply!(io, owned(replies::tls_already_active())).await?;
                } else if !cfg.tls_configured(&conn_meta) {
                    send_reply!(io, owned(replies::tls_not_available())).await?;
                } else if !cfg.can_do_tls(&conn_meta) {
                    send_reply!(io, cfg.command_not_supported()).await?;
                } else if !unhandled.is_empty() {
                    send_reply!(io, cfg.pipeline_forbidden_after_starttls()).await?;
                } else {
                    match cfg.handle_starttls(&mut conn_meta).await {
                        Decision::Reject { reply } => {
                            send_reply!(io, reply).await?;
                        }
                        Decision::Kill { reply, res } => {
                            if let Some(r) = reply {
                                send_reply!(io, r).await?;
                            }
                            return res;
                        }
                        Decision::Accept { reply, .. } => {
                            send_reply!(io, reply).await?;
                            io = cfg.tls_accept(io, &mut conn_meta).await?;
                            mail_meta = None;
                            conn_meta.is_encrypted = true;
                            conn_meta.hello = None;
                        }
                    }
                }
            }

            Some(Command::Expn { name }) => {
                simple_handler!(cfg.handle_expn(name, &mut conn_meta).await)
            }
            Some(Command::Vrfy { name }) => {
                simple_handler!(cfg.handle_vrfy(name, &mut conn_meta).await)
            }
            Some(Command::Help { subject }) => {
                simple_handler!(cfg.handle_help(subject, &mut conn_meta).await)
            }
            Some(Command::Noop { string }) => {
                simple_handler!(cfg.handle_noop(string, &mut conn_meta).await)
            }
            Some(Command::Quit) => simple_handler!(cfg.handle_quit(&mut conn_meta).await),
        }
    }
}
