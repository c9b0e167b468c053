// TODO: figure out a better shutdown story than brutally killing the server
// (ie. drop(signal) when the user wants to stop the server)

use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Context;
use easy_parallel::Parallel;
use futures::StreamExt;
use tracing::{debug, info};

mod address_translate;
mod client_config;
pub mod config;
mod maildir_store;
mod server_config;
mod static_directory;

use config::{FileConfig, Opt};
use lmtp_broker::UnixSocketBroker;
use maildir_store::MaildirStore;
use server_config::ServerConfig;
use static_directory::StaticDirectory;

const NUM_THREADS: usize = 4;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A short per-connection id for log correlation (§3 "Session"), distinct
/// from the per-recipient id `lmtp-server-types::Recipient::session_id`
/// derives from it.
fn next_session_id() -> String {
    let n = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}p{}", n, std::process::id())
}

fn build_tls_acceptor(file_config: &FileConfig) -> anyhow::Result<Option<async_tls::TlsAcceptor>> {
    let (cert_file, key_file) = match (&file_config.tls_cert_file, &file_config.tls_key_file) {
        (Some(c), Some(k)) => (c.clone(), k.clone()),
        (None, None) => return Ok(None),
        _ => anyhow::bail!("tls_cert_file and tls_key_file must be configured together"),
    };

    let certs = rustls_pemfile::certs(&mut io::BufReader::new(
        std::fs::File::open(&cert_file)
            .with_context(|| format!("opening the certificate file '{}'", cert_file.display()))?,
    ))
    .with_context(|| format!("parsing the TLS certificate file '{}'", cert_file.display()))?
    .into_iter()
    .map(rustls::Certificate)
    .collect::<Vec<_>>();
    debug!(num_certs = certs.len(), "parsed certificates");

    let keys = rustls_pemfile::pkcs8_private_keys(&mut io::BufReader::new(
        std::fs::File::open(&key_file)
            .with_context(|| format!("opening the key file '{}'", key_file.display()))?,
    ))
    .with_context(|| format!("parsing the key file '{}'", key_file.display()))?;
    anyhow::ensure!(
        keys.len() == 1,
        "key file did not have exactly one key, but had {}",
        keys.len()
    );
    let key = rustls::PrivateKey(keys.into_iter().next().unwrap());

    let tls_server_cfg = rustls::ServerConfig::builder()
        .with_cipher_suites(&rustls::ALL_CIPHER_SUITES)
        .with_kx_groups(&rustls::ALL_KX_GROUPS)
        .with_protocol_versions(&rustls::ALL_VERSIONS)
        .context("configuring the rustls server")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("setting the key and certificates")?;

    Ok(Some(async_tls::TlsAcceptor::from(Arc::new(tls_server_cfg))))
}

pub fn run(opt: &Opt, shutdown: smol::channel::Receiver<()>) -> anyhow::Result<()> {
    info!("lmtpd starting up");

    let file_config = config::load(&opt.config)?;

    let listener =
        std::net::TcpListener::bind(file_config.listen_addr).context("binding on the listening port")?;

    let directory = match &file_config.users_file {
        Some(path) => StaticDirectory::load(path)?,
        None => StaticDirectory::empty(),
    };
    let mail_store = MaildirStore::new(file_config.mail_dir.clone());
    let broker = UnixSocketBroker::new(file_config.broker_socket.clone());

    let ex = &Arc::new(smol::Executor::new());

    let (stop_signal, local_shutdown) = smol::channel::unbounded::<()>();

    let (_, res): (_, anyhow::Result<()>) = Parallel::new()
        .each(0..NUM_THREADS, |_| {
            smol::block_on(ex.run(async {
                shutdown
                    .recv()
                    .or(local_shutdown.recv())
                    .await
                    .context("receiving shutdown notification")
            }))
        })
        .finish(move || {
            smol::block_on(async move {
                debug!("preparing the TLS configuration");
                let tls_acceptor = build_tls_acceptor(&file_config)?;

                let server_cfg = Arc::new(ServerConfig::new(
                    &file_config,
                    directory,
                    mail_store,
                    broker,
                    tls_acceptor,
                ));

                debug!("reopening the listener as async");
                let listener =
                    smol::net::TcpListener::try_from(listener).context("making listener async")?;
                let mut incoming = listener.incoming();

                info!("server up, waiting for connections");
                while let Some(stream) = incoming.next().await {
                    let stream = stream.context("receiving a new incoming stream")?;
                    let local_addr = stream.local_addr().context("reading local address")?;
                    let peer_addr = stream.peer_addr().context("reading peer address")?;
                    let is_trusted = file_config
                        .trusted_networks
                        .iter()
                        .any(|net| *net == peer_addr.ip());
                    let mut conn_meta = lmtp_server_types::ConnectionMetadata::new(
                        (),
                        local_addr,
                        peer_addr,
                        next_session_id(),
                    );
                    conn_meta.is_trusted = is_trusted;

                    tracing::trace!(%peer_addr, "new incoming stream");
                    ex.spawn(lmtp_server::interact(
                        stream,
                        lmtp_server::IsAlreadyTls::No,
                        conn_meta,
                        server_cfg.clone(),
                    ))
                    .detach();
                }

                std::mem::drop(stop_signal);

                Ok(())
            })
        });

    res
}
