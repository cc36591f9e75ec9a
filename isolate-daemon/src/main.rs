//! Binary entrypoint: parse CLI flags, wire the registry, run the accept
//! loop until ctrl-c.

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use isolate_daemon::config::Config;
use isolate_daemon::daemon::Daemon;
use isolate_daemon::error::{DaemonError, DaemonResult};
use isolate_daemon::isolate::{LoadedSource, ModuleLoaderClient};
use isolate_daemon::registry::IsolateRegistry;

/// Placeholder module resolution until a real client-backed loader is
/// wired in: every isolate's `createRuntime` call can still supply its
/// own loader through the registry once that hookup lands, but the
/// daemon needs *something* non-panicking to construct isolates with.
struct NoModulesLoader;

impl ModuleLoaderClient for NoModulesLoader {
    fn load(&self, specifier: &str, _importer_resolve_dir: &str) -> DaemonResult<LoadedSource> {
        Err(DaemonError::ProtocolError(format!(
            "no module loader configured for specifier '{specifier}'"
        )))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_filter.clone()))
        .init();

    info!(listen = %config.listen, "isolate daemon starting");

    let registry = Arc::new(IsolateRegistry::new(config.clone(), Arc::new(NoModulesLoader)));
    let daemon = Daemon::new(config, registry);

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, draining connections");
            let _ = shutdown_tx.send(());
        }
    });

    daemon.run(shutdown_rx).await?;
    Ok(())
}
