//! Maildir-backed [`MailStore`] (C7 collaborator): one Maildir tree per
//! local user under a configured base directory, delivering via the usual
//! tmp/ → new/ write-then-rename dance. The filename convention follows the
//! `<timestamp>.<unique>,S=<size>:2,<flags>` scheme worked out in
//! tagliacarte's local storage layer (see DESIGN.md).

use std::{
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use futures::{io::AsyncReadExt, AsyncRead};

use lmtp_directory::{
    DeliveryError, DeliveryOutcome, MailStore, QuotaStatus, ServiceUser, SourceHint,
};

static DELIVERY_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct MaildirStore {
    base_dir: PathBuf,
}

impl MaildirStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        MaildirStore {
            base_dir: base_dir.into(),
        }
    }

    fn mailbox_dir(&self, user: &ServiceUser, mailbox: &str) -> PathBuf {
        let mut dir = self.base_dir.join(&user.username);
        if mailbox != "INBOX" {
            dir = dir.join(mailbox);
        }
        dir
    }

    fn unique_name() -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let counter = DELIVERY_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("{}.M{}P{}.lmtpd", millis, counter, std::process::id())
    }
}

#[async_trait]
impl MailStore for MaildirStore {
    async fn deliver(
        &self,
        user: &ServiceUser,
        mailbox: &str,
        body: &mut (dyn AsyncRead + Send + Unpin),
        // Hard-linking across separately-rooted per-user Maildir trees would
        // need the previous save's absolute path, which this hint doesn't
        // carry; every delivery writes its own copy.
        _src_hint: SourceHint<'_>,
        // Maildir delivery (tmp/ -> new/ rename) never takes a mailbox lock,
        // so there's nothing here to bound; `mail_max_lock_timeout` only
        // matters to lock-based backends (mbox, dotlock-protected indexes).
        _lock_timeout: Duration,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let dir = self.mailbox_dir(user, mailbox);
        let tmp_dir = dir.join("tmp");
        let new_dir = dir.join("new");
        for d in [&dir, &tmp_dir, &new_dir, &dir.join("cur")] {
            std::fs::create_dir_all(d).map_err(|e| DeliveryError::Temporary(e.to_string()))?;
        }

        let name = Self::unique_name();
        let tmp_path = tmp_dir.join(&name);

        let mut contents = Vec::new();
        body.read_to_end(&mut contents)
            .await
            .map_err(|e| DeliveryError::Temporary(e.to_string()))?;
        std::fs::write(&tmp_path, &contents).map_err(|e| DeliveryError::Temporary(e.to_string()))?;

        let final_path = new_dir.join(format!("{},S={}:2,", name, contents.len()));
        std::fs::rename(&tmp_path, &final_path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            DeliveryError::Temporary(e.to_string())
        })?;

        Ok(DeliveryOutcome {
            session_id: name,
        })
    }

    async fn quota_status(&self, user: &ServiceUser) -> Result<QuotaStatus, DeliveryError> {
        let dir = self.mailbox_dir(user, "INBOX");
        let Ok(entries) = std::fs::read_dir(dir.join("new")) else {
            return Ok(QuotaStatus::Ok);
        };
        let count = entries.count();
        // Placeholder quota policy: an operator-configurable limit belongs in
        // `OperatorSettings`, not hardcoded here; this just keeps the trait
        // wired to something observable.
        if count > 1_000_000 {
            Ok(QuotaStatus::Exceeded { hard: true })
        } else {
            Ok(QuotaStatus::Ok)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;

    #[test]
    fn delivers_into_maildir_new() {
        smol::block_on(async {
            let tmp = tempfile::tempdir().unwrap();
            let store = MaildirStore::new(tmp.path());
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

            let new_dir = tmp.path().join("alice").join("new");
            let entries: Vec<_> = std::fs::read_dir(&new_dir).unwrap().collect();
            assert_eq!(entries.len(), 1);
            let name = entries[0].as_ref().unwrap().file_name();
            assert!(name.to_string_lossy().contains(",S=23:2,"));
        });
    }

    #[test]
    fn detail_mailbox_nests_under_user_dir() {
        smol::block_on(async {
            let tmp = tempfile::tempdir().unwrap();
            let store = MaildirStore::new(tmp.path());
            let user = ServiceUser {
                username: "alice".into(),
                inbox_namespace: String::new(),
            };
            let mut body = Cursor::new(b"x".to_vec());
            store
                .deliver(&user, "lists.rust", &mut body, SourceHint::None, Duration::from_secs(30))
                .await
                .unwrap();
            assert!(tmp.path().join("alice").join("lists.rust").join("new").is_dir());
        });
    }
}
