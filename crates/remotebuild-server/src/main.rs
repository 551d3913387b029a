//! remotebuild server
//!
//! Accepts app uploads over HTTPS, builds them one at a time with
//! platform-specific workers, and issues client certificates against PINs.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use tracing::{info, warn};

use remotebuild_certs::CertificateStore;
use remotebuild_core::config::load_config;
use remotebuild_core::{DefaultMessages, Localizer, ServerConf};
use remotebuild_server::api::{AppState, build_router};
use remotebuild_server::build::{BuildManager, ManagerConf};
use remotebuild_server::purge::{PURGE_INTERVAL, spawn_pin_purge};
use remotebuild_server::redirect::RequestRedirector;
use remotebuild_server::tls;

#[derive(Parser, Debug)]
#[command(name = "remotebuild")]
#[command(version, about = "remotebuild - remote app build server")]
struct Args {
    /// Configuration file (JSON), merged over ~/.remotebuild/config.json
    #[arg(long, global = true, env = "REMOTEBUILD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, global = true, default_value = "info", env = "REMOTEBUILD_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON.
    #[arg(long, global = true, env = "REMOTEBUILD_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the build server (default)
    Serve {
        /// Listen port
        #[arg(long)]
        port: Option<u16>,

        /// Directory for certificates and builds
        #[arg(long)]
        server_dir: Option<PathBuf>,

        /// Serve plain HTTP without client certificates
        #[arg(long)]
        insecure: bool,
    },
    /// Regenerate the server certificate
    Certreset {
        /// Do not ask for confirmation
        #[arg(long, short)]
        yes: bool,
    },
    /// Issue a client certificate and print its PIN
    Certgenerate,
}

fn cert_store(conf: &ServerConf) -> CertificateStore {
    CertificateStore::new(conf.certs_dir(), &conf.hostname)
        .with_validity_days(conf.cert_expiration_days)
        .with_bundle_password(conf.bundle_password.clone())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    remotebuild_core::tracing_init::init_tracing(&args.log_level, args.log_json)
        .context("Invalid log filter")?;

    let mut conf = load_config(args.config.as_deref()).context("Failed to load configuration")?;

    match args.command.unwrap_or(Command::Serve {
        port: None,
        server_dir: None,
        insecure: false,
    }) {
        Command::Serve {
            port,
            server_dir,
            insecure,
        } => {
            if let Some(port) = port {
                conf.port = port;
            }
            if let Some(dir) = server_dir {
                conf.server_dir = remotebuild_core::config::expand_home(&dir);
            }
            if insecure {
                conf.secure = false;
            }
            serve(conf).await
        }
        Command::Certreset { yes } => cert_reset(&conf, yes),
        Command::Certgenerate => cert_generate(&conf),
    }
}

async fn serve(conf: ServerConf) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = conf.port,
        secure = conf.secure,
        server_dir = %conf.server_dir.display(),
        "Starting remotebuild"
    );

    let certs = Arc::new(cert_store(&conf));
    let tls_config = if conf.secure {
        let created = certs.initialize_server_certs()?;
        if created.new_certs {
            info!(ca = %created.ca_cert.display(), "Generated new server certificates");
        }
        Some(tls::server_tls_config(&certs.get_server_certs()?)?)
    } else {
        warn!("Running without TLS, build routes are unauthenticated");
        None
    };

    let localizer: Arc<dyn Localizer> = Arc::new(DefaultMessages);
    let redirector = RequestRedirector::new(&conf.modules)?;
    let manager = BuildManager::new(ManagerConf::from(&conf), redirector, Arc::clone(&localizer));
    let app = build_router(
        AppState {
            manager: Arc::clone(&manager),
            certs: Arc::clone(&certs),
            localizer,
            lang: conf.lang.clone(),
            pin_timeout: conf.pin_timeout,
        },
        conf.secure,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let purge_handle = spawn_pin_purge(
        Arc::clone(&certs),
        conf.pin_timeout,
        PURGE_INTERVAL,
        shutdown_tx.subscribe(),
    );

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), conf.port);
    let mut server = tokio::spawn(tls::serve(addr, app, tls_config, shutdown_rx));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let mut server_done = false;
    tokio::select! {
        result = &mut server => {
            server_done = true;
            result?.context("Server stopped unexpectedly")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    if !server_done {
        server.await??;
    }
    let _ = purge_handle.await;
    manager.shutdown().await;

    info!("remotebuild stopped");
    Ok(())
}

fn cert_reset(conf: &ServerConf, yes: bool) -> anyhow::Result<()> {
    let certs = cert_store(conf);
    let confirm = |question: &str| {
        yes || Confirm::new()
            .with_prompt(question)
            .default(false)
            .interact()
            .unwrap_or(false)
    };
    if certs.reset_server_cert(&confirm)? {
        info!("Server certificate regenerated");
    } else {
        info!("Server certificate left unchanged");
    }
    Ok(())
}

#[allow(clippy::print_stdout)]
fn cert_generate(conf: &ServerConf) -> anyhow::Result<()> {
    let certs = cert_store(conf);
    certs.initialize_server_certs()?;
    let pin = certs.generate_client_cert()?;
    println!("PIN: {pin}");
    println!(
        "Valid for {} minutes. Fetch the client bundle from /certs/{pin} on port {}.",
        conf.pin_timeout, conf.port
    );
    Ok(())
}
