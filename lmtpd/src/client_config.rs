//! [`lmtp_client::Config`] implementation: just the advertised hostname, plus
//! timeout overrides sourced from the static configuration file.

use std::time::Duration;

use lmtp_message::Hostname;

use crate::config::FileConfig;

pub struct ClientConfig {
    my_hostname: String,
    proxy_timeout: Duration,
}

impl ClientConfig {
    pub fn new(file_config: &FileConfig) -> Self {
        ClientConfig {
            my_hostname: file_config.my_hostname.clone(),
            proxy_timeout: Duration::from_secs(file_config.operator.mail_max_lock_timeout.max(1)),
        }
    }
}

impl lmtp_client::Config for ClientConfig {
    fn ehlo_hostname(&self) -> Hostname<String> {
        let mut terminated = self.my_hostname.clone();
        terminated.push('\r');
        Hostname::<&str>::parse_until(b"\r")(terminated.as_bytes())
            .expect("configured my_hostname failed to parse as a Hostname")
            .1
            .to_owned()
    }

    fn connect_timeout(&self) -> Duration {
        self.proxy_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file_config() -> FileConfig {
        FileConfig {
            listen_addr: "127.0.0.1:2424".parse().unwrap(),
            my_hostname: "mx.example.org".into(),
            my_domain: "example.org".into(),
            broker_socket: PathBuf::from("/run/lmtpd/anvil.sock"),
            spool_dir: PathBuf::from("/var/spool/lmtpd"),
            mail_dir: PathBuf::from("/var/mail/lmtpd"),
            users_file: None,
            tls_cert_file: None,
            tls_key_file: None,
            trusted_networks: Vec::new(),
            broker_service: "lmtp".into(),
            operator: Default::default(),
        }
    }

    #[test]
    fn ehlo_hostname_matches_configured_value() {
        let cfg = ClientConfig::new(&file_config());
        let hostname = lmtp_client::Config::ehlo_hostname(&cfg);
        assert_eq!(hostname.raw(), "mx.example.org");
    }
}
