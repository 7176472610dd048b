#![deny(unsafe_code)]

use std::os::unix::io::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bmcgate_lib::auth::pam::StaticCredentials;
use bmcgate_lib::session::persistence::PersistentStore;
use bmcgate_lib::{load_from_path, Acceptor, AppRouter, Config, SessionStore, WebRoutes};

#[derive(Parser, Debug)]
#[command(author, version, about = "Management-controller web gateway")]
struct Cli {
    /// Path to configuration TOML file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

/// Adopt a listening socket the service manager opened for us.
#[allow(unsafe_code)]
fn adopt_listener(fd: RawFd) -> std::net::TcpListener {
    // SAFETY: the descriptor was validated by the config loader and is
    // an inherited listening socket this process owns exclusively;
    // ownership transfers to the returned listener.
    unsafe { std::net::TcpListener::from_raw_fd(fd) }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => match load_from_path(&path) {
            Ok(config) => config,
            Err(err) => {
                error!(%err, "failed to load configuration");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    let config = Arc::new(config);
    info!(
        listen = %config.listen,
        port = config.port(),
        listen_fd = config.listen_fd,
        "configuration loaded"
    );

    let store = Arc::new(SessionStore::new());
    let persistent = Arc::new(PersistentStore::new(config.persistence.clone()));
    if let Err(err) = persistent.load(&store) {
        error!(%err, "failed to restore persistent state");
    }

    let verifier = Arc::new(StaticCredentials::new(config.credentials.clone()));

    let mut webroutes = WebRoutes::new();
    for route in &config.webroutes {
        webroutes.insert(route.clone());
    }
    let router = Arc::new(
        AppRouter::new(Arc::clone(&store), verifier.clone()).with_webroutes(webroutes),
    );

    let acceptor = Acceptor::new(Arc::clone(&config), store, router, verifier)
        .with_persistence(persistent);
    let result = match config.listen_fd {
        Some(fd) => acceptor.run_with_listener(adopt_listener(fd)).await,
        None => acceptor.run().await,
    };
    if let Err(err) = result {
        error!(%err, "gateway exited with error");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
