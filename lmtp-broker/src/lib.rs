//! Client for the concurrency-counting broker ("anvil") used to cap the
//! number of parallel deliveries per user (§6, §9 "coroutine-style anvil
//! pause").
//!
//! The wire protocol is a tiny tab-separated line protocol over a Unix
//! socket:
//!
//! - `LOOKUP\t<service>/<username>\n` → one line back, a decimal integer.
//! - `CONNECT\t<pid>\t<service>/<username>\n` → no reply, registers a
//!   delivery as in progress.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::{
    io::{AsyncWriteExt, BufReader},
    AsyncBufReadExt,
};
use smol::net::unix::UnixStream;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to connect to the concurrency broker at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error talking to the concurrency broker: {0}")]
    Io(#[from] std::io::Error),

    #[error("the concurrency broker closed the connection before answering")]
    UnexpectedEof,

    #[error("the concurrency broker sent a non-numeric LOOKUP reply: {0:?}")]
    MalformedReply(String),
}

/// Narrow async interface to the broker, so the server session FSM never
/// has to know the wire protocol directly.
#[async_trait]
pub trait ConcurrencyBroker: Send + Sync {
    /// Number of deliveries currently registered for `service/username`.
    async fn lookup(&self, service: &str, username: &str) -> Result<u32, BrokerError>;

    /// Registers a new delivery for `service/username`, owned by `pid`.
    async fn connect(&self, pid: u32, service: &str, username: &str) -> Result<(), BrokerError>;
}

/// Tab- and backslash-escapes `s` the way the wire protocol requires, since
/// usernames may themselves legally contain bytes that would otherwise be
/// mistaken for a field separator.
fn tab_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out
}

/// Concrete [`ConcurrencyBroker`] speaking the wire protocol over a Unix
/// domain socket below the configured base directory. Opens (and drops) one
/// connection per call, matching the teacher's short-lived connection style
/// for ancillary services rather than holding a long-lived multiplexed
/// session.
pub struct UnixSocketBroker {
    path: PathBuf,
}

impl UnixSocketBroker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        UnixSocketBroker { path: path.into() }
    }

    async fn connect_socket(&self) -> Result<UnixStream, BrokerError> {
        UnixStream::connect(&self.path)
            .await
            .map_err(|source| BrokerError::Connect {
                path: self.path.clone(),
                source,
            })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConcurrencyBroker for UnixSocketBroker {
    async fn lookup(&self, service: &str, username: &str) -> Result<u32, BrokerError> {
        let mut sock = self.connect_socket().await?;
        let line = format!(
            "LOOKUP\t{}/{}\n",
            tab_escape(service),
            tab_escape(username)
        );
        sock.write_all(line.as_bytes()).await?;
        sock.flush().await?;

        let mut reader = BufReader::new(sock);
        let mut reply = String::new();
        let n = reader.read_line(&mut reply).await?;
        if n == 0 {
            return Err(BrokerError::UnexpectedEof);
        }
        tracing::trace!(broker = %self.path().display(), %service, %username, reply = %reply.trim_end(), "LOOKUP reply");
        reply
            .trim_end_matches(['\n', '\r'])
            .parse::<u32>()
            .map_err(|_| BrokerError::MalformedReply(reply))
    }

    async fn connect(&self, pid: u32, service: &str, username: &str) -> Result<(), BrokerError> {
        let mut sock = self.connect_socket().await?;
        let line = format!(
            "CONNECT\t{}\t{}/{}\n",
            pid,
            tab_escape(service),
            tab_escape(username)
        );
        sock.write_all(line.as_bytes()).await?;
        sock.flush().await?;
        tracing::trace!(broker = %self.path().display(), %service, %username, pid, "CONNECT sent");
        Ok(())
    }
}

/// In-memory stand-in used by tests: counts registered deliveries per
/// `service/username` key without talking to any socket.
#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use std::{collections::HashMap, sync::Mutex};

    use async_trait::async_trait;

    use super::{BrokerError, ConcurrencyBroker};

    #[derive(Default)]
    pub struct InMemoryBroker {
        counts: Mutex<HashMap<String, u32>>,
    }

    impl InMemoryBroker {
        pub fn new() -> Self {
            InMemoryBroker::default()
        }

        fn key(service: &str, username: &str) -> String {
            format!("{}/{}", service, username)
        }
    }

    #[async_trait]
    impl ConcurrencyBroker for InMemoryBroker {
        async fn lookup(&self, service: &str, username: &str) -> Result<u32, BrokerError> {
            let counts = self.counts.lock().unwrap();
            Ok(*counts.get(&Self::key(service, username)).unwrap_or(&0))
        }

        async fn connect(&self, _pid: u32, service: &str, username: &str) -> Result<(), BrokerError> {
            let mut counts = self.counts.lock().unwrap();
            *counts.entry(Self::key(service, username)).or_insert(0) += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tab_escape_roundtrip_shape() {
        assert_eq!(tab_escape("plain"), "plain");
        assert_eq!(tab_escape("a\tb"), "a\\tb");
        assert_eq!(tab_escape("a\\b"), "a\\\\b");
    }

    #[test]
    fn in_memory_broker_counts() {
        use test_util::InMemoryBroker;
        smol::block_on(async {
            let broker = InMemoryBroker::new();
            assert_eq!(broker.lookup("lmtp", "alice").await.unwrap(), 0);
            broker.connect(123, "lmtp", "alice").await.unwrap();
            assert_eq!(broker.lookup("lmtp", "alice").await.unwrap(), 1);
            broker.connect(124, "lmtp", "alice").await.unwrap();
            assert_eq!(broker.lookup("lmtp", "alice").await.unwrap(), 2);
            assert_eq!(broker.lookup("lmtp", "bob").await.unwrap(), 0);
        });
    }
}
