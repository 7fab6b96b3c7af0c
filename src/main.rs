#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use gitkit::ssh::config::{
    resolve_authorized_keys, resolve_git_binary, resolve_key_dir, resolve_latency,
    resolve_listen_addr, resolve_repo_dir, resolve_timeout,
};
use gitkit::ssh::{AuthorizedKeys, Config, Error, GitSshServer};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let listen_addr = resolve_listen_addr(None);
    let repo_dir = resolve_repo_dir(None);
    let key_dir = resolve_key_dir(None);
    let authorized_keys_path = resolve_authorized_keys(None, &key_dir);

    let authorized_keys = AuthorizedKeys::load(&authorized_keys_path).map_err(|e| {
        error!(
            "Cannot read authorized keys from {}: {}",
            authorized_keys_path.display(),
            e
        );
        e
    })?;
    info!(
        "Loaded {} authorized key(s) from {}",
        authorized_keys.len(),
        authorized_keys_path.display()
    );

    let mut config = Config::new(repo_dir, key_dir, authorized_keys)
        .with_git_binary(resolve_git_binary(None));
    config.timeout = resolve_timeout(None);
    config.latency = resolve_latency(None);

    let server = Arc::new(GitSshServer::new(config)?);
    info!("Host key fingerprint: {}", server.host_key_fingerprint());

    let serving = Arc::clone(&server);
    let mut serve_task =
        tokio::spawn(async move { serving.listen_and_serve(&listen_addr).await });

    let result = tokio::select! {
        joined = &mut serve_task => joined?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
            server.shutdown().await;
            serve_task.await?
        }
    };

    match result {
        Ok(()) | Err(Error::ServerClosed) => {
            info!("Git SSH server exited");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
