use script_exec_connector::{ConnectorError, ConnectorSet, ScriptExecConnector};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(err) = run().await {
        error!("connector exiting: {err}");
        eprintln!("connector exiting: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ConnectorError> {
    let set = ConnectorSet::from_env()?;

    let mut executors = Vec::new();
    for source in set.sources() {
        if let Some(conn) = set.connection_for_source(source) {
            info!(source = %source, "creating script executor for source");
            let executor = ScriptExecConnector::new(conn);
            executor.establish_handlers();
            executors.push(executor);
        }
    }

    let in_kubernetes = std::env::var_os("KUBERNETES_SERVICE_HOST").is_some();
    if in_kubernetes {
        set.declare_healthy().await?;
    }
    info!(
        sources = %set.sources().join(","),
        kubernetes = in_kubernetes,
        "running {} connector(s)",
        set.sources().len()
    );

    set.run_connectors().await?;
    set.close().await;
    Ok(())
}
