//! [`lmtp_server::Config`] implementation: the recipient resolver (directory
//! lookup, proxy routing, address translation, quota/concurrency gating)
//! and the post-DATA fan-out to local storage and outbound proxy
//! sub-clients.

use std::{borrow::Cow, collections::HashMap, io, net::ToSocketAddrs, pin::Pin, sync::Arc};

use async_tls::TlsAcceptor;
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, Cursor};
use tracing::warn;

use lmtp_broker::ConcurrencyBroker;
use lmtp_client::{Protocol, SubClient, TransportError, TransportErrorSeverity};
use lmtp_directory::{
    DeliveryError, Directory, DirectoryError, DirectoryLookup, MailStore, ProxyProtocol,
    QuotaStatus, ServiceUser, ServiceUserError, SourceHint,
};
use lmtp_message::{Email, Hostname, Localpart, Parameters, Reply, ReplyCodeKind};
use lmtp_server::{BodySpool, Config};
use lmtp_server_types::{reply as replies, ConnectionMetadata, Decision, MailMetadata, RecipientClass};

use crate::{
    address_translate,
    client_config::ClientConfig,
    config::{DeliveredToPolicy, FileConfig, OperatorSettings},
};

/// One outbound destination, keyed the way `filter_to` groups recipients
/// onto a shared sub-client (one connection per tuple).
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct SubClientKey {
    host: String,
    port: u16,
    protocol_is_lmtp: bool,
    timeout_ms: u64,
}

/// What `filter_to` decided for one accepted recipient, recorded so
/// `handle_mail` doesn't have to redo the directory lookup.
enum RecipientResolution {
    Local {
        service_user: ServiceUser,
        mailbox: String,
    },
    Proxy {
        key: SubClientKey,
    },
}

/// Per-transaction state threaded through `filter_from`/`filter_to`/
/// `handle_mail` as `MailMetadata::user`.
#[derive(Default)]
pub struct MailState {
    resolutions: Vec<RecipientResolution>,
    proxy_clients: HashMap<SubClientKey, SubClient<ClientConfig>>,
    /// `mail_max_lock_timeout`, clamped against any front-proxy `XCLIENT
    /// TIMEOUT=` at DATA time (§4.7 step 3, §9); `None` until `filter_data`
    /// runs.
    lock_timeout: Option<std::time::Duration>,
}

/// `lock = clamp(1, T-1, existing_lock)` (§9 design note): a front proxy's
/// advertised idle timeout `T` trims the mailbox-lock wait so a local
/// delivery returns before the proxy gives up and disconnects, but never
/// below one second and never *above* the operator's own configured
/// ceiling.
fn clamp_lock_timeout(existing: std::time::Duration, peer_timeout: Option<std::time::Duration>) -> std::time::Duration {
    match peer_timeout {
        Some(t) if t.as_secs() > 0 => {
            let trimmed = t.as_secs().saturating_sub(1).max(1);
            std::time::Duration::from_secs(trimmed.min(existing.as_secs().max(1)))
        }
        _ => existing,
    }
}

pub struct ServerConfig<D, M, B> {
    my_hostname: String,
    my_domain: String,
    directory: D,
    mail_store: M,
    broker: B,
    broker_service: String,
    client_config: Arc<ClientConfig>,
    tls_acceptor: Option<TlsAcceptor>,
    operator: OperatorSettings,
    spool_dir: std::path::PathBuf,
}

impl<D, M, B> ServerConfig<D, M, B> {
    pub fn new(
        file_config: &FileConfig,
        directory: D,
        mail_store: M,
        broker: B,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Self {
        ServerConfig {
            my_hostname: file_config.my_hostname.clone(),
            my_domain: file_config.my_domain.clone(),
            directory,
            mail_store,
            broker,
            broker_service: file_config.broker_service.clone(),
            client_config: Arc::new(ClientConfig::new(file_config)),
            tls_acceptor,
            operator: file_config.operator.clone(),
            spool_dir: file_config.spool_dir.clone(),
        }
    }
}

fn plain_email(local: &str, domain: &str) -> Email {
    Email {
        localpart: Localpart::Ascii {
            raw: local.to_owned(),
        },
        hostname: if domain.is_empty() {
            None
        } else {
            Some(Hostname::AsciiDomain {
                raw: domain.to_owned(),
            })
        },
    }
}

fn email_to_string(e: &Email) -> String {
    match &e.hostname {
        Some(h) => format!("{}@{}", e.localpart.raw(), h.raw()),
        None => e.localpart.raw().clone(),
    }
}

fn addr_display(e: &Email<&str>) -> String {
    match &e.hostname {
        Some(h) => format!("{}@{}", e.localpart.raw(), h.raw()),
        None => (*e.localpart.raw()).to_owned(),
    }
}

fn looks_like_email(s: &str) -> bool {
    match s.split_once('@') {
        Some((l, d)) => !l.is_empty() && !d.is_empty(),
        None => false,
    }
}

/// Plain `getaddrinfo`-style resolution of a directory-supplied `host:port`
/// pair. There is no MX-style routing decision to make here (the directory
/// already handed us an explicit destination), so this shells out to the
/// blocking standard-library resolver on a thread-pool thread rather than
/// pulling in a dedicated async DNS resolver crate.
async fn resolve_one(host: String, port: u16) -> io::Result<std::net::SocketAddr> {
    smol::unblock(move || {
        (host.as_str(), port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address found"))
    })
    .await
}

/// Synthesises a reply for a proxy sub-client failure that never produced
/// an explicit upstream reply line to relay (connect refused, timeout,
/// protocol violation). Every such failure is surfaced as a transient
/// per-recipient error: without a real reply line to inspect, guessing at
/// a permanent-vs-transient split from `TransportErrorSeverity` alone would
/// be more confident than the information actually supports.
fn temp_remote_failure(addr: &str, err: &TransportError) -> Reply {
    match err.severity() {
        TransportErrorSeverity::Local => replies::internal_server_error().into_owned(),
        _ => replies::temp_recipient_failure(addr, &err.to_string()),
    }
}

async fn prefixed_body<'a>(
    header: &'a [u8],
    body: &BodySpool,
) -> io::Result<impl AsyncRead + Unpin + Send + 'a> {
    let reader = body.reader()?;
    Ok(Cursor::new(header).chain(reader))
}

#[async_trait]
impl<D, M, B> Config for ServerConfig<D, M, B>
where
    D: Directory + 'static,
    M: MailStore + 'static,
    B: ConcurrencyBroker + 'static,
{
    type ConnectionUserMeta = ();
    type MailUserMeta = MailState;

    async fn new_mail(&self, _conn_meta: &mut ConnectionMetadata<()>) -> MailState {
        MailState::default()
    }

    fn can_do_tls(&self, conn_meta: &ConnectionMetadata<()>) -> bool {
        self.tls_acceptor.is_some()
            && !conn_meta.is_encrypted
            && conn_meta.hello.as_ref().map(|h| h.is_ehlo).unwrap_or(false)
    }

    fn tls_configured(&self, _conn_meta: &ConnectionMetadata<()>) -> bool {
        self.tls_acceptor.is_some()
    }

    fn spool_dir(&self) -> std::path::PathBuf {
        self.spool_dir.clone()
    }

    async fn tls_accept<IO>(
        &self,
        io: IO,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> io::Result<duplexify::Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>>
    where
        IO: 'static + Unpin + Send + AsyncRead + AsyncWrite,
    {
        let acceptor = self
            .tls_acceptor
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "TLS not configured"))?;
        let io = acceptor.accept(io).await?;
        let (r, w) = io.split();
        Ok(duplexify::Duplex::new(
            Box::pin(r) as Pin<Box<dyn Send + AsyncRead>>,
            Box::pin(w) as Pin<Box<dyn Send + AsyncWrite>>,
        ))
    }

    async fn filter_from(
        &self,
        _from: &mut Option<Email<&str>>,
        _meta: &mut MailMetadata<MailState>,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> Decision<()> {
        Decision::Accept {
            reply: replies::okay_from().into_owned(),
            res: (),
        }
    }

    async fn filter_to(
        &self,
        to: &mut Email<&str>,
        params: &Parameters<&str>,
        meta: &mut MailMetadata<MailState>,
        conn_meta: &mut ConnectionMetadata<()>,
    ) -> Decision<RecipientClass> {
        let _ = params;
        let addr_str = addr_display(to);
        let delimiter = self.operator.recipient_delimiter;
        let (base, detail) = match delimiter {
            Some(d) => to.localpart.split_detail(d as u8),
            None => (to.localpart.unquote(), None),
        };
        let username = base.as_str().to_owned();
        let domain = to
            .hostname
            .as_ref()
            .map(|h| (*h.raw()).to_owned())
            .unwrap_or_default();

        if !self.operator.lmtp_proxy {
            return self
                .resolve_local(&username, &domain, detail, &addr_str, meta, conn_meta)
                .await;
        }

        let peer = (conn_meta.peer_addr.ip(), conn_meta.peer_addr.port());
        match self.directory.lookup(&username, peer).await {
            Ok(DirectoryLookup::NotFound) | Ok(DirectoryLookup::Local) => {
                self.resolve_local(&username, &domain, detail, &addr_str, meta, conn_meta)
                    .await
            }
            Err(DirectoryError::Temporary(msg)) => Decision::Reject {
                reply: replies::temp_recipient_failure(&addr_str, &msg),
            },
            Ok(DirectoryLookup::Proxy(route)) => {
                if let Some(RecipientClass::Local) = meta.class {
                    return Decision::Reject {
                        reply: replies::class_mixing(&addr_str),
                    };
                }

                let new_ttl = conn_meta.proxy_ttl.saturating_sub(1);
                if new_ttl == 0 {
                    return Decision::Reject {
                        reply: replies::loop_detected(&addr_str),
                    };
                }
                conn_meta.proxy_ttl = new_ttl;

                let key = SubClientKey {
                    host: route.host.clone(),
                    port: route.port,
                    protocol_is_lmtp: matches!(route.protocol, ProxyProtocol::Lmtp),
                    timeout_ms: route.timeout.as_millis() as u64,
                };
                let protocol = if key.protocol_is_lmtp {
                    Protocol::Lmtp
                } else {
                    Protocol::Smtp
                };

                let rewritten_email = match &route.rewritten_user {
                    Some(new_user) => {
                        let (new_local, new_domain) = match new_user.split_once('@') {
                            Some((l, d)) => (l.to_owned(), d.to_owned()),
                            None => (new_user.clone(), domain.clone()),
                        };
                        let new_local = match &detail {
                            Some(d) if !d.is_empty() => {
                                let sep = delimiter.unwrap_or('+');
                                format!("{}{}{}", new_local, sep, d)
                            }
                            _ => new_local,
                        };
                        plain_email(&new_local, &new_domain)
                    }
                    None => to.to_owned(),
                };

                if !meta.user.proxy_clients.contains_key(&key) {
                    let sub_addr = match resolve_one(route.host.clone(), route.port).await {
                        Ok(addr) => addr,
                        Err(e) => {
                            return Decision::Reject {
                                reply: replies::temp_recipient_failure(&addr_str, &e.to_string()),
                            };
                        }
                    };

                    if sub_addr.ip() == conn_meta.local_addr.ip() && sub_addr.port() == conn_meta.local_addr.port()
                    {
                        return Decision::Reject {
                            reply: replies::proxy_loops_to_self(&addr_str),
                        };
                    }
                    match SubClient::connect(sub_addr, protocol, route.timeout, self.client_config.clone())
                        .await
                    {
                        Ok(mut sc) => {
                            if let Err(e) = sc.mail_from(meta.from.as_ref(), meta.body_8bitmime).await {
                                return Decision::Reject {
                                    reply: temp_remote_failure(&addr_str, &e),
                                };
                            }
                            meta.user.proxy_clients.insert(key.clone(), sc);
                        }
                        Err(e) => {
                            return Decision::Reject {
                                reply: temp_remote_failure(&addr_str, &e),
                            };
                        }
                    }
                }

                let sc = meta
                    .user
                    .proxy_clients
                    .get_mut(&key)
                    .expect("just inserted or already present");
                match sc.add_rcpt(&rewritten_email).await {
                    Ok(outcome) if outcome.accepted => {
                        meta.user.resolutions.push(RecipientResolution::Proxy { key });
                        Decision::Accept {
                            reply: outcome.reply,
                            res: RecipientClass::Proxy,
                        }
                    }
                    Ok(outcome) => Decision::Reject { reply: outcome.reply },
                    Err(e) => Decision::Reject {
                        reply: temp_remote_failure(&addr_str, &e),
                    },
                }
            }
        }
    }

    async fn filter_data(
        &self,
        meta: &mut MailMetadata<MailState>,
        conn_meta: &mut ConnectionMetadata<()>,
    ) -> Decision<()> {
        meta.added_headers = Some(self.render_added_headers(meta, conn_meta));
        meta.user.lock_timeout = Some(clamp_lock_timeout(
            std::time::Duration::from_secs(self.operator.mail_max_lock_timeout),
            conn_meta.peer_timeout,
        ));
        Decision::Accept {
            reply: replies::okay_data().into_owned(),
            res: (),
        }
    }

    async fn handle_mail(
        &self,
        body: &BodySpool,
        mut meta: MailMetadata<MailState>,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> Vec<Decision<()>> {
        let added_headers = meta.added_headers.take().unwrap_or_default();
        let lock_timeout = meta
            .user
            .lock_timeout
            .unwrap_or_else(|| std::time::Duration::from_secs(self.operator.mail_max_lock_timeout));
        let n = meta.to.len();
        let mut decisions: Vec<Option<Decision<()>>> = (0..n).map(|_| None).collect();

        let mut by_key: Vec<(SubClientKey, Vec<usize>)> = Vec::new();
        for (i, res) in meta.user.resolutions.iter().enumerate() {
            if let RecipientResolution::Proxy { key } = res {
                match by_key.iter_mut().find(|(k, _)| k == key) {
                    Some(entry) => entry.1.push(i),
                    None => by_key.push((key.clone(), vec![i])),
                }
            }
        }

        for (key, indices) in &by_key {
            let sc = match meta.user.proxy_clients.get_mut(key) {
                Some(sc) => sc,
                None => continue,
            };
            let reader = match prefixed_body(&added_headers, body).await {
                Ok(r) => r,
                Err(e) => {
                    for &slot in indices {
                        decisions[slot] = Some(Decision::Reject {
                            reply: replies::delivery_tempfail(
                                &email_to_string(&meta.to[slot].email),
                                &e.to_string(),
                            ),
                        });
                    }
                    continue;
                }
            };
            match sc.send_data(reader).await {
                Ok(outcomes) => {
                    for (&slot, outcome) in indices.iter().zip(outcomes.into_iter()) {
                        decisions[slot] = Some(match outcome {
                            Some(reply) if reply.code.kind() == ReplyCodeKind::PositiveCompletion => {
                                Decision::Accept { reply, res: () }
                            }
                            Some(reply) => Decision::Reject { reply },
                            None => Decision::Reject {
                                reply: replies::temp_recipient_failure(
                                    &email_to_string(&meta.to[slot].email),
                                    "Remote server closed the connection mid-delivery",
                                ),
                            },
                        });
                    }
                }
                Err(e) => {
                    for &slot in indices {
                        decisions[slot] = Some(Decision::Reject {
                            reply: temp_remote_failure(&email_to_string(&meta.to[slot].email), &e),
                        });
                    }
                }
            }
        }

        let mut first_local_mailbox: Option<String> = None;
        for (i, res) in meta.user.resolutions.iter().enumerate() {
            let (service_user, mailbox) = match res {
                RecipientResolution::Local { service_user, mailbox } => (service_user, mailbox),
                RecipientResolution::Proxy { .. } => continue,
            };
            let addr = email_to_string(&meta.to[i].email);
            let mut reader = match prefixed_body(&added_headers, body).await {
                Ok(r) => r,
                Err(e) => {
                    decisions[i] = Some(Decision::Reject {
                        reply: replies::delivery_tempfail(&addr, &e.to_string()),
                    });
                    continue;
                }
            };
            let src_hint = match &first_local_mailbox {
                Some(m) => SourceHint::PreviouslySaved { mailbox: m },
                None => SourceHint::None,
            };
            decisions[i] = Some(
                match self
                    .mail_store
                    .deliver(service_user, mailbox, &mut reader, src_hint, lock_timeout)
                    .await
                {
                    Ok(outcome) => {
                        if first_local_mailbox.is_none() {
                            first_local_mailbox = Some(mailbox.clone());
                        }
                        Decision::Accept {
                            reply: replies::okay_saved(&addr, &outcome.session_id),
                            res: (),
                        }
                    }
                    Err(DeliveryError::Quota(msg)) => Decision::Reject {
                        reply: if self.operator.quota_full_tempfail {
                            replies::quota_tempfail(&addr, &msg)
                        } else {
                            replies::quota_hardfail(&addr, &msg)
                        },
                    },
                    Err(DeliveryError::Temporary(msg)) => Decision::Reject {
                        reply: replies::delivery_tempfail(&addr, &msg),
                    },
                },
            );
        }

        decisions
            .into_iter()
            .map(|d| d.unwrap_or_else(|| Decision::Reject { reply: self.internal_server_error() }))
            .collect()
    }

    fn hostname(&self) -> Cow<'static, str> {
        self.my_hostname.clone().into()
    }
}

impl<D, M, B> ServerConfig<D, M, B>
where
    D: Directory,
    M: MailStore,
    B: ConcurrencyBroker,
{
    /// Applies the operator's `lmtp_address_translate` template (§4.2), if
    /// configured, to the envelope `username@domain`.
    fn apply_translation(&self, username: &str, domain: &str) -> Option<(String, String)> {
        self.operator
            .lmtp_address_translate
            .as_deref()
            .and_then(|template| address_translate::translate(template, username, domain))
    }

    async fn resolve_local(
        &self,
        username: &str,
        domain: &str,
        detail: Option<String>,
        addr_str: &str,
        meta: &mut MailMetadata<MailState>,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> Decision<RecipientClass> {
        if let Some(RecipientClass::Proxy) = meta.class {
            return Decision::Reject {
                reply: replies::class_mixing(addr_str),
            };
        }

        let service_user = match self.directory.lookup_service_user(username).await {
            Ok(u) => u,
            Err(ServiceUserError::NotFound(_)) => {
                return Decision::Reject {
                    reply: replies::user_unknown(addr_str, username),
                };
            }
            Err(ServiceUserError::Temporary { source, .. }) => {
                return Decision::Reject {
                    reply: replies::temp_recipient_failure(addr_str, &source),
                };
            }
        };

        // Step 6: the translated address is purely the `<addr>` surfaced in
        // every reply from here on; it never changes which `ServiceUser` or
        // mailbox the message lands in, since those were already pinned by
        // the directory lookup above.
        let translated = self
            .apply_translation(username, domain)
            .map(|(u, d)| if d.is_empty() { u } else { format!("{}@{}", u, d) });
        let addr_str = translated.as_deref().unwrap_or(addr_str);

        if self.operator.lmtp_rcpt_check_quota {
            match self.mail_store.quota_status(&service_user).await {
                Ok(QuotaStatus::Ok) => {}
                Ok(QuotaStatus::Exceeded { hard }) => {
                    let msg = "Mailbox is full";
                    return Decision::Reject {
                        reply: if hard && !self.operator.quota_full_tempfail {
                            replies::quota_hardfail(addr_str, msg)
                        } else {
                            replies::quota_tempfail(addr_str, msg)
                        },
                    };
                }
                Err(DeliveryError::Temporary(msg)) => {
                    return Decision::Reject {
                        reply: replies::temp_recipient_failure(addr_str, &msg),
                    };
                }
                Err(DeliveryError::Quota(msg)) => {
                    return Decision::Reject {
                        reply: replies::quota_tempfail(addr_str, &msg),
                    };
                }
            }
        }

        if self.operator.lmtp_user_concurrency_limit > 0 {
            match self.broker.lookup(&self.broker_service, &service_user.username).await {
                Ok(n) if n >= self.operator.lmtp_user_concurrency_limit => {
                    return Decision::Reject {
                        reply: replies::too_many_concurrent_deliveries(addr_str),
                    };
                }
                Ok(_) => {
                    if let Err(e) = self
                        .broker
                        .connect(std::process::id(), &self.broker_service, &service_user.username)
                        .await
                    {
                        warn!(error = %e, "concurrency broker CONNECT failed");
                        return Decision::Reject {
                            reply: replies::temp_recipient_failure(addr_str, &e.to_string()),
                        };
                    }
                }
                Err(e) => {
                    return Decision::Reject {
                        reply: replies::temp_recipient_failure(addr_str, &e.to_string()),
                    };
                }
            }
        }

        // The actual `mail_max_lock_timeout` clamp against a trusted front
        // proxy's `XCLIENT TIMEOUT=` (§4.7 step 3) is computed once at DATA
        // time in `filter_data`, since `conn_meta.peer_timeout` may still
        // change via a later `XCLIENT` before DATA is reached.

        let mailbox = if self.operator.lmtp_save_to_detail_mailbox {
            match &detail {
                Some(d) if !d.is_empty() => format!("{}{}", service_user.inbox_namespace, d),
                _ => "INBOX".to_owned(),
            }
        } else {
            "INBOX".to_owned()
        };

        meta.user.resolutions.push(RecipientResolution::Local { service_user, mailbox });

        Decision::Accept {
            reply: replies::okay_to().into_owned(),
            res: RecipientClass::Local,
        }
    }

    fn render_added_headers(
        &self,
        meta: &MailMetadata<MailState>,
        conn_meta: &ConnectionMetadata<()>,
    ) -> Vec<u8> {
        let mut out = Vec::new();

        let sender = meta.from.as_ref().map(email_to_string).unwrap_or_default();
        out.extend_from_slice(format!("Return-Path: <{}>\r\n", sender).as_bytes());

        if meta.to.len() == 1 && self.operator.parsed_lmtp_hdr_delivery_address != DeliveredToPolicy::None {
            let rcpt = &meta.to[0];
            let addr = match self.operator.parsed_lmtp_hdr_delivery_address {
                DeliveredToPolicy::Final => email_to_string(&rcpt.email),
                DeliveredToPolicy::Original => rcpt
                    .orcpt
                    .as_deref()
                    .filter(|o| looks_like_email(o))
                    .map(|o| o.to_owned())
                    .unwrap_or_else(|| email_to_string(&rcpt.email)),
                DeliveredToPolicy::None => unreachable!(),
            };
            out.extend_from_slice(format!("Delivered-To: <{}>\r\n", addr).as_bytes());
        }

        let tls_desc = if conn_meta.is_encrypted { "TLS" } else { "plaintext" };
        let lhlo = conn_meta
            .hello
            .as_ref()
            .map(|h| h.hostname.raw().clone())
            .unwrap_or_default();
        let mut received = format!(
            "Received: from {} ([{}])\r\n\t(using {})\r\n\tby {} with LMTP id {}\r\n",
            lhlo,
            conn_meta.peer_addr.ip(),
            tls_desc,
            self.my_domain,
            conn_meta.session_id,
        );
        if meta.to.len() == 1 {
            received.push_str(&format!("\tfor <{}>; ", email_to_string(&meta.to[0].email)));
        } else {
            received.push('\t');
        }
        received.push_str(&chrono::Utc::now().to_rfc2822());
        received.push_str("\r\n");
        out.extend_from_slice(received.as_bytes());

        out
    }
}

#[cfg(test)]
mod lock_timeout_tests {
    use super::clamp_lock_timeout;
    use std::time::Duration;

    #[test]
    fn peer_timeout_of_one_clamps_to_one_second() {
        let existing = Duration::from_secs(55);
        let clamped = clamp_lock_timeout(existing, Some(Duration::from_secs(1)));
        assert_eq!(clamped, Duration::from_secs(1));
    }

    #[test]
    fn unset_peer_timeout_leaves_existing_value() {
        let existing = Duration::from_secs(55);
        assert_eq!(clamp_lock_timeout(existing, None), existing);
    }

    #[test]
    fn zero_peer_timeout_leaves_existing_value() {
        let existing = Duration::from_secs(55);
        assert_eq!(clamp_lock_timeout(existing, Some(Duration::from_secs(0))), existing);
    }

    #[test]
    fn peer_timeout_never_exceeds_operator_ceiling() {
        let existing = Duration::from_secs(10);
        let clamped = clamp_lock_timeout(existing, Some(Duration::from_secs(120)));
        assert_eq!(clamped, Duration::from_secs(10));
    }
}

/// End-to-end scenarios (spec §8) driving the real [`lmtp_server::interact`]
/// loop against this crate's [`ServerConfig`] wired to the in-memory test
/// doubles from `lmtp-directory`/`lmtp-broker`, following the same
/// leaked-buffer `Duplex` harness the teacher's own `smtp-server` tests use
/// to get a `'static` pipe out of a borrowed response buffer.
#[cfg(test)]
mod scenario_tests {
    use std::{net::SocketAddr, sync::Arc};

    use duplexify::Duplex;
    use futures::io::Cursor;

    use lmtp_broker::test_util::InMemoryBroker;
    use lmtp_directory::{
        test_util::{InMemoryDirectory, InMemoryMailStore},
        ProxyProtocol, ProxyRoute,
    };
    use lmtp_server::IsAlreadyTls;
    use lmtp_server_types::ConnectionMetadata;

    use super::ServerConfig;
    use crate::config::FileConfig;

    fn base_config(toml_extra: &str) -> FileConfig {
        let toml = format!(
            r#"
            listen_addr = "127.0.0.1:24"
            my_hostname = "mx.example.org"
            my_domain = "example.org"
            broker_socket = "/run/lmtpd/anvil.sock"
            spool_dir = "/tmp"
            mail_dir = "/tmp"
            {}
        "#,
            toml_extra
        );
        toml::from_str(&toml).unwrap()
    }

    fn conn_meta() -> ConnectionMetadata<()> {
        let local: SocketAddr = "127.0.0.1:24".parse().unwrap();
        let peer: SocketAddr = "203.0.113.9:51234".parse().unwrap();
        ConnectionMetadata::new((), local, peer, "t1".to_owned())
    }

    fn run(
        cfg: Arc<ServerConfig<InMemoryDirectory, InMemoryMailStore, InMemoryBroker>>,
        input: &'static [u8],
        meta: ConnectionMetadata<()>,
    ) -> String {
        let resp: &'static mut Vec<u8> = Box::leak(Box::new(Vec::new()));
        let resp2 = unsafe { &mut *(resp as *mut Vec<u8>) };
        let io = Duplex::new(Cursor::new(input), Cursor::new(resp2));
        smol::block_on(lmtp_server::interact(io, IsAlreadyTls::No, meta, cfg)).unwrap();
        String::from_utf8_lossy(resp).into_owned()
    }

    fn run_with_tls_state(
        cfg: Arc<ServerConfig<InMemoryDirectory, InMemoryMailStore, InMemoryBroker>>,
        input: &'static [u8],
        meta: ConnectionMetadata<()>,
        is_already_tls: IsAlreadyTls,
    ) -> String {
        let resp: &'static mut Vec<u8> = Box::leak(Box::new(Vec::new()));
        let resp2 = unsafe { &mut *(resp as *mut Vec<u8>) };
        let io = Duplex::new(Cursor::new(input), Cursor::new(resp2));
        smol::block_on(lmtp_server::interact(io, is_already_tls, meta, cfg)).unwrap();
        String::from_utf8_lossy(resp).into_owned()
    }

    /// S1 — minimal local delivery: one accepted recipient, one `Saved`
    /// reply, ending in `QUIT`.
    #[test]
    fn s1_minimal_local_delivery() {
        let file_config = base_config("");
        let directory = InMemoryDirectory::new().with_local("alice");
        let mail_store = InMemoryMailStore::new();
        let broker = InMemoryBroker::new();
        let cfg = Arc::new(ServerConfig::new(&file_config, directory, mail_store, broker, None));

        let input: &'static [u8] = b"LHLO test\r\n\
            MAIL FROM:<a@x>\r\n\
            RCPT TO:<alice@y>\r\n\
            DATA\r\n\
            Subject: t\r\n\
            \r\n\
            hi\r\n\
            .\r\n\
            QUIT\r\n";
        let resp = run(cfg, input, conn_meta());

        assert!(resp.contains("250 2.1.0"), "MAIL FROM not acked: {}", resp);
        assert!(resp.contains("250 2.1.5"), "RCPT not acked: {}", resp);
        assert!(resp.contains("354 "), "DATA go-ahead missing: {}", resp);
        assert!(
            resp.contains("250 2.0.0 alice@y") && resp.contains("Saved"),
            "delivery reply missing: {}",
            resp
        );
        assert!(resp.trim_end().ends_with("221 2.0.0 Bye"), "no clean QUIT: {}", resp);
    }

    /// S2 — unknown user: the recipient is rejected `550 5.1.1`, the
    /// session otherwise continues normally.
    #[test]
    fn s2_unknown_user() {
        let file_config = base_config("");
        let directory = InMemoryDirectory::new();
        let mail_store = InMemoryMailStore::new();
        let broker = InMemoryBroker::new();
        let cfg = Arc::new(ServerConfig::new(&file_config, directory, mail_store, broker, None));

        let input: &'static [u8] = b"LHLO test\r\n\
            MAIL FROM:<a@x>\r\n\
            RCPT TO:<nobody@y>\r\n\
            QUIT\r\n";
        let resp = run(cfg, input, conn_meta());

        assert!(
            resp.contains("550 5.1.1 nobody@y User doesn't exist: nobody"),
            "unexpected reply: {}",
            resp
        );
    }

    /// S3 — class mixing: once a local recipient has been accepted, a
    /// proxy-routed recipient in the same transaction is rejected `451
    /// 4.3.0`, without ever opening an outbound connection.
    #[test]
    fn s3_class_mixing() {
        let file_config = base_config("[operator]\nlmtp_proxy = true\n");
        let directory = InMemoryDirectory::new().with_local("alice").with_proxy(
            "bob",
            ProxyRoute {
                host: "relay.example".into(),
                port: 24,
                protocol: ProxyProtocol::Lmtp,
                timeout: std::time::Duration::from_secs(30),
                rewritten_user: None,
            },
        );
        let mail_store = InMemoryMailStore::new();
        let broker = InMemoryBroker::new();
        let cfg = Arc::new(ServerConfig::new(&file_config, directory, mail_store, broker, None));

        let input: &'static [u8] = b"LHLO test\r\n\
            MAIL FROM:<a@x>\r\n\
            RCPT TO:<alice@y>\r\n\
            RCPT TO:<bob@y>\r\n\
            QUIT\r\n";
        let resp = run(cfg, input, conn_meta());

        assert!(resp.contains("250 2.1.5"), "local RCPT not accepted: {}", resp);
        assert!(
            resp.contains("451 4.3.0 bob@y Can't handle mixed proxy/non-proxy destinations"),
            "class mixing not rejected: {}",
            resp
        );
    }

    /// S4 — TTL exhaustion: a proxy route is rejected `554 5.4.6` when the
    /// session's remaining hop count is already at 1, without resolving or
    /// connecting to the destination.
    #[test]
    fn s4_ttl_exhaustion() {
        let file_config = base_config("[operator]\nlmtp_proxy = true\n");
        let directory = InMemoryDirectory::new().with_proxy(
            "bob",
            ProxyRoute {
                host: "relay.example".into(),
                port: 24,
                protocol: ProxyProtocol::Lmtp,
                timeout: std::time::Duration::from_secs(30),
                rewritten_user: None,
            },
        );
        let mail_store = InMemoryMailStore::new();
        let broker = InMemoryBroker::new();
        let cfg = Arc::new(ServerConfig::new(&file_config, directory, mail_store, broker, None));

        let mut meta = conn_meta();
        meta.proxy_ttl = 1;

        let input: &'static [u8] = b"LHLO test\r\n\
            MAIL FROM:<a@x>\r\n\
            RCPT TO:<bob@y>\r\n\
            QUIT\r\n";
        let resp = run(cfg, input, meta);

        assert!(
            resp.contains("554 5.4.6 bob@y Proxying appears to be looping (TTL=0)"),
            "TTL exhaustion not rejected: {}",
            resp
        );
    }

    /// S5 — concurrency limit: a broker already at the configured limit
    /// rejects the recipient `451 4.3.0`; below the limit, it's accepted
    /// and the broker's count goes up by one.
    #[test]
    fn s5_concurrency_limit_rejects_at_capacity() {
        let file_config = base_config(
            "[operator]\nlmtp_proxy = false\nlmtp_user_concurrency_limit = 2\n",
        );
        let directory = InMemoryDirectory::new().with_local("alice");
        let mail_store = InMemoryMailStore::new();
        let broker = InMemoryBroker::new();
        smol::block_on(async {
            broker.connect(1, "lmtp", "alice").await.unwrap();
            broker.connect(2, "lmtp", "alice").await.unwrap();
        });
        let cfg = Arc::new(ServerConfig::new(&file_config, directory, mail_store, broker, None));

        let input: &'static [u8] = b"LHLO test\r\n\
            MAIL FROM:<a@x>\r\n\
            RCPT TO:<alice@y>\r\n\
            QUIT\r\n";
        let resp = run(cfg, input, conn_meta());

        assert!(
            resp.contains("451 4.3.0 alice@y Too many concurrent deliveries for user"),
            "concurrency limit not enforced: {}",
            resp
        );
    }

    #[test]
    fn s5_concurrency_below_limit_accepts_and_registers() {
        let file_config = base_config(
            "[operator]\nlmtp_proxy = false\nlmtp_user_concurrency_limit = 2\n",
        );
        let directory = InMemoryDirectory::new().with_local("alice");
        let mail_store = InMemoryMailStore::new();
        let broker = InMemoryBroker::new();
        smol::block_on(async {
            broker.connect(1, "lmtp", "alice").await.unwrap();
        });
        let cfg = Arc::new(ServerConfig::new(&file_config, directory, mail_store, broker, None));

        let input: &'static [u8] = b"LHLO test\r\n\
            MAIL FROM:<a@x>\r\n\
            RCPT TO:<alice@y>\r\n\
            QUIT\r\n";
        let resp = run(cfg.clone(), input, conn_meta());

        assert!(resp.contains("250 2.1.5"), "recipient not accepted: {}", resp);
        let count = smol::block_on(cfg.broker.lookup("lmtp", "alice")).unwrap();
        assert_eq!(count, 2, "broker CONNECT was not registered");
    }

    /// `STARTTLS` with no TLS acceptor configured replies `454 4.7.0`
    /// (TLS not available), not the generic `502` command-not-supported.
    #[test]
    fn starttls_without_acceptor_returns_454_tls_not_available() {
        let file_config = base_config("");
        let directory = InMemoryDirectory::new();
        let mail_store = InMemoryMailStore::new();
        let broker = InMemoryBroker::new();
        let cfg = Arc::new(ServerConfig::new(&file_config, directory, mail_store, broker, None));

        let input: &'static [u8] = b"LHLO test\r\nSTARTTLS\r\nQUIT\r\n";
        let resp = run(cfg, input, conn_meta());

        assert!(
            resp.contains("454 4.7.0"),
            "expected 454 4.7.0 TLS not available: {}",
            resp
        );
    }

    /// A second `STARTTLS` once the connection is already encrypted replies
    /// `443 5.5.1` (TLS already active), not `502`.
    #[test]
    fn starttls_while_already_encrypted_returns_443_tls_already_active() {
        let file_config = base_config("");
        let directory = InMemoryDirectory::new();
        let mail_store = InMemoryMailStore::new();
        let broker = InMemoryBroker::new();
        let cfg = Arc::new(ServerConfig::new(&file_config, directory, mail_store, broker, None));

        let input: &'static [u8] = b"LHLO test\r\nSTARTTLS\r\nQUIT\r\n";
        let resp = run_with_tls_state(cfg, input, conn_meta(), IsAlreadyTls::Yes);

        assert!(
            resp.contains("443 5.5.1"),
            "expected 443 5.5.1 TLS already active: {}",
            resp
        );
    }
}
