//! Static, file-based [`Directory`] (C6 collaborator): a small TOML user
//! table mapping usernames to local mailboxes or proxy routes. Replaces the
//! teacher's pluggable WASM passdb/userdb hooks (see DESIGN.md), reusing the
//! same serde/toml idiom `config.rs` already uses for the rest of the static
//! configuration rather than inventing a second configuration mechanism.

use std::{collections::HashMap, net::IpAddr, path::Path, time::Duration};

use anyhow::Context;
use async_trait::async_trait;

use lmtp_directory::{
    Directory, DirectoryError, DirectoryLookup, ProxyProtocol, ProxyRoute, ServiceUser,
    ServiceUserError,
};

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
enum FileProtocol {
    Lmtp,
    Smtp,
}

impl From<FileProtocol> for ProxyProtocol {
    fn from(p: FileProtocol) -> Self {
        match p {
            FileProtocol::Lmtp => ProxyProtocol::Lmtp,
            FileProtocol::Smtp => ProxyProtocol::Smtp,
        }
    }
}

#[derive(Clone, Debug, serde::Deserialize)]
struct ProxyEntry {
    host: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    protocol: Option<FileProtocol>,
    #[serde(default)]
    proxy_timeout: Option<u64>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    destuser: Option<String>,
}

#[derive(Clone, Debug, Default, serde::Deserialize)]
struct UserEntry {
    #[serde(default)]
    inbox_namespace: Option<String>,
    #[serde(default)]
    proxy: Option<ProxyEntry>,
}

#[derive(Clone, Debug, Default, serde::Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: HashMap<String, UserEntry>,
}

/// A passdb/userdb stand-in read once at startup from a TOML file such as:
///
/// ```toml
/// [users.alice]
/// inbox_namespace = "alice."
///
/// [users.bob]
/// [users.bob.proxy]
/// host = "backend.example.org"
/// protocol = "lmtp"
/// ```
pub struct StaticDirectory {
    users: HashMap<String, UserEntry>,
}

impl StaticDirectory {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading user directory ‘{}’", path.display()))?;
        let file: UsersFile = toml::from_str(&contents)
            .with_context(|| format!("parsing user directory ‘{}’", path.display()))?;
        Ok(StaticDirectory { users: file.users })
    }

    pub fn empty() -> Self {
        StaticDirectory {
            users: HashMap::new(),
        }
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn lookup(
        &self,
        username: &str,
        _peer: (IpAddr, u16),
    ) -> Result<DirectoryLookup, DirectoryError> {
        match self.users.get(username) {
            None => Ok(DirectoryLookup::NotFound),
            Some(entry) => match &entry.proxy {
                None => Ok(DirectoryLookup::Local),
                Some(proxy) => {
                    let protocol: ProxyProtocol =
                        proxy.protocol.clone().unwrap_or(FileProtocol::Lmtp).into();
                    let port = proxy.port.unwrap_or_else(|| protocol.default_port());
                    Ok(DirectoryLookup::Proxy(ProxyRoute {
                        host: proxy.host.clone(),
                        port,
                        protocol,
                        timeout: Duration::from_secs(proxy.proxy_timeout.unwrap_or(30)),
                        rewritten_user: proxy.user.clone().or_else(|| proxy.destuser.clone()),
                    }))
                }
            },
        }
    }

    async fn lookup_service_user(&self, username: &str) -> Result<ServiceUser, ServiceUserError> {
        let entry = self
            .users
            .get(username)
            .ok_or_else(|| ServiceUserError::NotFound(username.to_owned()))?;
        Ok(ServiceUser {
            username: username.to_owned(),
            inbox_namespace: entry.inbox_namespace.clone().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> StaticDirectory {
        let toml = r#"
            [users.alice]
            inbox_namespace = "alice."

            [users.bob.proxy]
            host = "backend.example.org"
            protocol = "smtp"
            user = "bob.internal"
        "#;
        let file: UsersFile = toml::from_str(toml).unwrap();
        StaticDirectory { users: file.users }
    }

    #[test]
    fn local_user_resolves_without_proxy() {
        smol::block_on(async {
            let dir = directory();
            let peer = ("127.0.0.1".parse().unwrap(), 0);
            match dir.lookup("alice", peer).await.unwrap() {
                DirectoryLookup::Local => {}
                other => panic!("expected Local, got {:?}", other),
            }
            let user = dir.lookup_service_user("alice").await.unwrap();
            assert_eq!(user.inbox_namespace, "alice.");
        });
    }

    #[test]
    fn proxy_user_resolves_with_default_port() {
        smol::block_on(async {
            let dir = directory();
            let peer = ("127.0.0.1".parse().unwrap(), 0);
            match dir.lookup("bob", peer).await.unwrap() {
                DirectoryLookup::Proxy(route) => {
                    assert_eq!(route.host, "backend.example.org");
                    assert_eq!(route.port, ProxyProtocol::Smtp.default_port());
                    assert_eq!(route.rewritten_user.as_deref(), Some("bob.internal"));
                }
                other => panic!("expected Proxy, got {:?}", other),
            }
        });
    }

    #[test]
    fn unknown_user_is_not_found() {
        smol::block_on(async {
            let dir = directory();
            let peer = ("127.0.0.1".parse().unwrap(), 0);
            matches!(
                dir.lookup("carol", peer).await.unwrap(),
                DirectoryLookup::NotFound
            );
            assert!(dir.lookup_service_user("carol").await.is_err());
        });
    }
}
