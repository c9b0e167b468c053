//! Narrow interfaces to the two "external collaborators" the recipient
//! resolver (C6) and local delivery fan-out (C7) consult: the user
//! directory (passdb/userdb-style lookups, including proxy routing hints)
//! and the mail store (actual delivery + quota).

use std::{net::IpAddr, time::Duration};

use async_trait::async_trait;
use futures::io::AsyncRead;

/// Outbound proxy protocol a directory lookup may route a recipient to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProxyProtocol {
    Lmtp,
    Smtp,
}

impl ProxyProtocol {
    pub fn default_port(self) -> u16 {
        match self {
            ProxyProtocol::Lmtp => 24,
            ProxyProtocol::Smtp => 25,
        }
    }
}

/// Routing hint carried on a directory "found, with `proxy`" result.
#[derive(Clone, Debug)]
pub struct ProxyRoute {
    pub host: String,
    pub port: u16,
    pub protocol: ProxyProtocol,
    pub timeout: Duration,
    /// `user`/`destuser`-style rewrite of the username, if the directory
    /// asked for one.
    pub rewritten_user: Option<String>,
}

/// Outcome of looking up `username` in the directory for the purposes of
/// deciding whether a recipient is local or proxied (§4.6 step 3).
#[derive(Clone, Debug)]
pub enum DirectoryLookup {
    NotFound,
    Proxy(ProxyRoute),
    /// Found, but with no `proxy` routing hint: handled locally.
    Local,
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("temporary user lookup failure: {0}")]
    Temporary(String),
}

/// A resolved local mailbox user, returned by [`Directory::lookup_service_user`].
#[derive(Clone, Debug)]
pub struct ServiceUser {
    pub username: String,
    /// The namespace prefix under which `INBOX` and detail mailboxes live,
    /// e.g. for `lmtp_save_to_detail_mailbox`.
    pub inbox_namespace: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceUserError {
    #[error("user doesn't exist: {0}")]
    NotFound(String),
    #[error("temporary internal error looking up {username}: {source}")]
    Temporary { username: String, source: String },
}

/// The user/passdb directory, consulted once per `RCPT TO`.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Passdb-style lookup deciding whether `username` routes to a proxy
    /// destination, a local mailbox, or doesn't exist at all.
    async fn lookup(
        &self,
        username: &str,
        peer: (IpAddr, u16),
    ) -> Result<DirectoryLookup, DirectoryError>;

    /// Userdb-style lookup of the local mailbox owner for a recipient this
    /// session has already decided is local.
    async fn lookup_service_user(&self, username: &str) -> Result<ServiceUser, ServiceUserError>;
}

/// Per-user mailbox quota state, as reported by [`MailStore::quota_status`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QuotaStatus {
    Ok,
    /// Over quota; `hard` distinguishes a hard reject (`552`) from an
    /// operator-configured soft tempfail (`452`).
    Exceeded { hard: bool },
}

/// Result of a single successful delivery attempt.
#[derive(Clone, Debug)]
pub struct DeliveryOutcome {
    /// Per-recipient session id echoed in the `250 2.0.0 <addr> <sid> Saved`
    /// reply.
    pub session_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("{0}")]
    Temporary(String),
    #[error("over quota: {0}")]
    Quota(String),
}

/// A hint the storage backend can use to hard-link a newly written message
/// rather than re-serialise the body, once a previous recipient in the same
/// transaction has already been saved (§4.7 step 7).
pub enum SourceHint<'a> {
    None,
    PreviouslySaved { mailbox: &'a str },
}

/// The mail store, consulted once per local recipient after DATA completes.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Delivers `body` (already including the injected headers) into
    /// `mailbox` for `user`.
    ///
    /// `lock_timeout` is the operator's `mail_max_lock_timeout`, already
    /// clamped against any front-proxy-advertised idle timeout (§4.7 step 3,
    /// §9) — how long the store may block waiting for a mailbox lock before
    /// giving up and reporting a temporary failure.
    async fn deliver(
        &self,
        user: &ServiceUser,
        mailbox: &str,
        body: &mut (dyn AsyncRead + Send + Unpin),
        src_hint: SourceHint<'_>,
        lock_timeout: Duration,
    ) -> Result<DeliveryOutcome, DeliveryError>;

    async fn quota_status(&self, user: &ServiceUser) -> Result<QuotaStatus, DeliveryError>;
}

/// In-memory stand-ins used only by tests.
#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use std::{collections::HashMap, sync::Mutex};

    use async_trait::async_trait;
    use futures::{io::AsyncReadExt, AsyncRead};

    use super::*;

    #[derive(Default)]
    pub struct InMemoryDirectory {
        pub routes: HashMap<String, DirectoryLookup>,
    }

    impl InMemoryDirectory {
        pub fn new() -> Self {
            InMemoryDirectory::default()
        }

        pub fn with_local(mut self, username: &str) -> Self {
            self.routes.insert(username.to_owned(), DirectoryLookup::Local);
            self
        }

        pub fn with_proxy(mut self, username: &str, route: ProxyRoute) -> Self {
            self.routes
                .insert(username.to_owned(), DirectoryLookup::Proxy(route));
            self
        }
    }

    #[async_trait]
    impl Directory for InMemoryDirectory {
        async fn lookup(
            &self,
            username: &str,
            _peer: (IpAddr, u16),
        ) -> Result<DirectoryLookup, DirectoryError> {
            Ok(self
                .routes
                .get(username)
                .cloned()
                .unwrap_or(DirectoryLookup::NotFound))
        }

        async fn lookup_service_user(&self, username: &str) -> Result<ServiceUser, ServiceUserError> {
            match self.routes.get(username) {
                Some(DirectoryLookup::Local) | Some(DirectoryLookup::NotFound) | None => {
                    if self.routes.contains_key(username) {
                        Ok(ServiceUser {
                            username: username.to_owned(),
                            inbox_namespace: String::new(),
                        })
                    } else {
                        Err(ServiceUserError::NotFound(username.to_owned()))
                    }
                }
                Some(DirectoryLookup::Proxy(_)) => Ok(ServiceUser {
                    username: username.to_owned(),
                    inbox_namespace: String::new(),
                }),
            }
        }
    }

    impl Clone for DirectoryLookup {
        fn clone(&self) -> Self {
            match self {
                DirectoryLookup::NotFound => DirectoryLookup::NotFound,
                DirectoryLookup::Local => DirectoryLookup::Local,
                DirectoryLookup::Proxy(r) => DirectoryLookup::Proxy(r.clone()),
            }
        }
    }

    #[derive(Default)]
    pub struct InMemoryMailStore {
        pub delivered: Mutex<Vec<(String, String, Vec<u8>)>>,
    }

    impl InMemoryMailStore {
        pub fn new() -> Self {
            InMemoryMailStore::default()
        }
    }

    #[async_trait]
    impl MailStore for InMemoryMailStore {
        async fn deliver(
            &self,
            user: &ServiceUser,
            mailbox: &str,
            body: &mut (dyn AsyncRead + Send + Unpin),
            _src_hint: SourceHint<'_>,
            _lock_timeout: Duration,
        ) -> Result<DeliveryOutcome, DeliveryError> {
            let mut buf = Vec::new();
            body.read_to_end(&mut buf)
                .await
                .map_err(|e| DeliveryError::Temporary(e.to_string()))?;
            self.delivered
                .lock()
                .unwrap()
                .push((user.username.clone(), mailbox.to_owned(), buf));
            Ok(DeliveryOutcome {
                session_id: format!("{}-{}", user.username, mailbox),
            })
        }

        async fn quota_status(&self, _user: &ServiceUser) -> Result<QuotaStatus, DeliveryError> {
            Ok(QuotaStatus::Ok)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{test_util::*, *};
    use futures::io::Cursor;

    #[test]
    fn in_memory_directory_routes() {
        smol::block_on(async {
            let dir = InMemoryDirectory::new()
                .with_local("alice")
                .with_proxy(
                    "bob",
                    ProxyRoute {
                        host: "relay.example".into(),
                        port: 24,
                        protocol: ProxyProtocol::Lmtp,
                        timeout: std::time::Duration::from_secs(30),
                        rewritten_user: None,
                    },
                );
            let peer = ("127.0.0.1".parse().unwrap(), 0);
            matches!(dir.lookup("alice", peer).await.unwrap(), DirectoryLookup::Local);
            matches!(
                dir.lookup("bob", peer).await.unwrap(),
                DirectoryLookup::Proxy(_)
            );
            matches!(
                dir.lookup("carol", peer).await.unwrap(),
                DirectoryLookup::NotFound
            );
        });
    }

    #[test]
    fn in_memory_mail_store_records_delivery() {
        smol::block_on(async {
            let store = InMemoryMailStore::new();
            let user = ServiceUser {
                username: "alice".into(),
                inbox_namespace: String::new(),
            };
            let mut body = Cursor::new(b"Subject: hi\r\n\r\nhello\r\n".to_vec());
            let outcome = store
                .deliver(&user, "INBOX", &mut body, SourceHint::None, Duration::from_secs(30))
                .await
                .unwrap();
            assert!(!outcome.session_id.is_empty());
            assert_eq!(store.delivered.lock().unwrap().len(), 1);
        });
    }
}
