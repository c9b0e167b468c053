//! Operator-facing configuration: the `structopt` command line and the
//! `serde`/`toml` static file it points at, replacing the teacher's
//! WASM-plugin configuration scheme (see DESIGN.md).

use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;
use structopt::StructOpt;

#[derive(structopt::StructOpt)]
#[structopt(
    name = "lmtpd",
    about = "An LMTP server proxying selected recipients to remote LMTP/SMTP destinations."
)]
pub struct Opt {
    /// Path to the TOML configuration file.
    #[structopt(short, long, parse(from_os_str), default_value = "/etc/lmtpd/config.toml")]
    pub config: PathBuf,
}

/// How the `Delivered-To` header (§6) is derived, per recipient.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveredToPolicy {
    None,
    Final,
    Original,
}

impl Default for DeliveredToPolicy {
    fn default() -> Self {
        DeliveredToPolicy::None
    }
}

/// The named "operator settings" of §6 "Environment inputs".
#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct OperatorSettings {
    pub lmtp_proxy: bool,
    pub lmtp_user_concurrency_limit: u32,
    pub lmtp_rcpt_check_quota: bool,
    pub lmtp_save_to_detail_mailbox: bool,
    /// `literal%u…%d…`-style rewrite template (§4.2 "Address translation").
    pub lmtp_address_translate: Option<String>,
    pub parsed_lmtp_hdr_delivery_address: DeliveredToPolicy,
    /// Single-byte local-part detail delimiter, e.g. `'+'`.
    pub recipient_delimiter: Option<char>,
    /// Whether an over-quota mailbox temp-fails (`452`) rather than hard
    /// fails (`552`).
    pub quota_full_tempfail: bool,
    pub lda_original_recipient_header: Option<String>,
    /// Seconds; clamped against a front proxy's `XCLIENT TIMEOUT=` (§5).
    pub mail_max_lock_timeout: u64,
}

/// The on-disk configuration file: `listen_addr`, the broker socket, the
/// spool directory, TLS material, and the operator settings above.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct FileConfig {
    pub listen_addr: SocketAddr,
    pub my_hostname: String,
    pub my_domain: String,
    pub broker_socket: PathBuf,
    pub spool_dir: PathBuf,
    /// Base directory under which each local user's Maildir tree lives.
    pub mail_dir: PathBuf,
    /// TOML user table consulted by the static directory (see
    /// `static_directory.rs`); with none configured every recipient is
    /// treated as not found by the directory lookup.
    #[serde(default)]
    pub users_file: Option<PathBuf>,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
    /// Peers allowed to issue `XCLIENT` (§4.5).
    #[serde(default)]
    pub trusted_networks: Vec<std::net::IpAddr>,
    /// Name advertised to the concurrency broker as the `service` half of
    /// `service/username` (§6).
    #[serde(default = "default_broker_service")]
    pub broker_service: String,
    #[serde(default)]
    pub operator: OperatorSettings,
}

fn default_broker_service() -> String {
    "lmtp".to_owned()
}

pub fn load(path: &std::path::Path) -> anyhow::Result<FileConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading configuration file ‘{}’", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("parsing configuration file ‘{}’", path.display()))
}

pub fn opt() -> Opt {
    Opt::from_args()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
            listen_addr = "127.0.0.1:2424"
            my_hostname = "mx.example.org"
            my_domain = "example.org"
            broker_socket = "/run/lmtpd/anvil.sock"
            spool_dir = "/var/spool/lmtpd"
            mail_dir = "/var/mail/lmtpd"
        "#;
        let cfg: FileConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.broker_service, "lmtp");
        assert_eq!(cfg.operator.lmtp_user_concurrency_limit, 0);
        assert_eq!(cfg.operator.parsed_lmtp_hdr_delivery_address, DeliveredToPolicy::None);
    }

    #[test]
    fn parses_full_operator_settings() {
        let toml = r#"
            listen_addr = "0.0.0.0:24"
            my_hostname = "mx.example.org"
            my_domain = "example.org"
            broker_socket = "/run/lmtpd/anvil.sock"
            spool_dir = "/var/spool/lmtpd"
            mail_dir = "/var/mail/lmtpd"
            trusted_networks = ["10.0.0.1"]

            [operator]
            lmtp_proxy = true
            lmtp_user_concurrency_limit = 5
            lmtp_save_to_detail_mailbox = true
            lmtp_address_translate = "%u@%d"
            parsed_lmtp_hdr_delivery_address = "original"
            recipient_delimiter = "+"
            mail_max_lock_timeout = 55
        "#;
        let cfg: FileConfig = toml::from_str(toml).unwrap();
        assert!(cfg.operator.lmtp_proxy);
        assert_eq!(cfg.operator.lmtp_user_concurrency_limit, 5);
        assert_eq!(cfg.operator.recipient_delimiter, Some('+'));
        assert_eq!(
            cfg.operator.parsed_lmtp_hdr_delivery_address,
            DeliveredToPolicy::Original
        );
        assert_eq!(cfg.trusted_networks, vec!["10.0.0.1".parse().unwrap()]);
    }
}
