use std::{io, net::SocketAddr, time::Duration};

use lmtp_message::{Email, Hostname, Reply};

pub mod reply;

// TODO: add sanity checks that Accept is a 2xx reply, and Reject/Kill are not
#[must_use]
#[derive(Debug)]
pub enum Decision<T> {
    Accept { reply: Reply, res: T },
    Reject { reply: Reply },
    Kill {
        reply: Option<Reply>,
        res: io::Result<()>,
    },
}

// TODO: merge with Decision (blocked on https://github.com/serde-rs/serde/issues/1940)
#[must_use]
#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub enum SerializableDecision<T> {
    Accept { reply: Reply, res: T },
    Reject { reply: Reply },
    Kill {
        reply: Option<Reply>,
        res: Result<(), String>,
    },
}

impl<T> From<SerializableDecision<T>> for Decision<T> {
    fn from(d: SerializableDecision<T>) -> Decision<T> {
        match d {
            SerializableDecision::Accept { reply, res } => Decision::Accept { reply, res },
            SerializableDecision::Reject { reply } => Decision::Reject { reply },
            SerializableDecision::Kill { reply, res } => Decision::Kill {
                reply,
                res: res.map_err(|msg| io::Error::new(io::ErrorKind::Other, msg)),
            },
        }
    }
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct HelloInfo {
    /// Whether the peer greeted with `EHLO`/`LHLO` (extended) rather than
    /// plain `HELO`.
    pub is_ehlo: bool,
    pub hostname: Hostname,
}

/// Per-connection state that outlives any single mail transaction: peer
/// identity, trust, TLS state, and the proxy bookkeeping `XCLIENT` can
/// override.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct ConnectionMetadata<U> {
    pub user: U,
    pub hello: Option<HelloInfo>,
    pub is_encrypted: bool,
    /// Whether the peer is on a network configured to be allowed to issue
    /// `XCLIENT`.
    pub is_trusted: bool,
    /// Hops remaining before a proxied RCPT is refused as a loop.
    pub proxy_ttl: u32,
    /// Advertised by a front proxy via `XCLIENT TIMEOUT=`, used to trim
    /// `mail_max_lock_timeout`.
    pub peer_timeout: Option<Duration>,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub session_id: String,
}

impl<U> ConnectionMetadata<U> {
    pub fn new(user: U, local_addr: SocketAddr, peer_addr: SocketAddr, session_id: String) -> Self {
        ConnectionMetadata {
            user,
            hello: None,
            is_encrypted: false,
            is_trusted: false,
            proxy_ttl: u32::MAX,
            peer_timeout: None,
            local_addr,
            peer_addr,
            session_id,
        }
    }
}

/// Whether an envelope's recipients are all handled locally or all proxied
/// onward; mixing the two within one transaction is rejected (§3 invariant).
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum RecipientClass {
    Local,
    Proxy,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct Recipient<U> {
    pub email: Email,
    pub detail: Option<String>,
    /// First recipient inherits the envelope's session id; later ones
    /// append `:N`.
    pub session_id: String,
    pub orcpt: Option<String>,
    pub user: Option<U>,
    pub concurrency_confirmed: bool,
    pub concurrency_registered: bool,
}

impl<U> Recipient<U> {
    pub fn new(email: Email, session_id: String) -> Self {
        Recipient {
            email,
            detail: None,
            session_id,
            orcpt: None,
            user: None,
            concurrency_confirmed: false,
            concurrency_registered: false,
        }
    }
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct MailMetadata<U> {
    pub user: U,
    pub from: Option<Email>,
    pub body_8bitmime: bool,
    pub to: Vec<Recipient<U>>,
    /// Locked in by the first accepted recipient; further RCPTs of the
    /// other class are rejected `451 4.3.0`.
    pub class: Option<RecipientClass>,
    /// Rendered once at DATA time (`Return-Path`/`Delivered-To`/`Received`)
    /// and prepended to every delivery attempt's view of the body.
    pub added_headers: Option<Vec<u8>>,
}

impl<U> MailMetadata<U> {
    pub fn new(user: U, from: Option<Email>, body_8bitmime: bool) -> Self {
        MailMetadata {
            user,
            from,
            body_8bitmime,
            to: Vec::new(),
            class: None,
            added_headers: None,
        }
    }
}
