use crate::config::{ConfigError, ServerConfig};
use crate::connection::{
    CloseHandler, ConnectHandler, ConnectorError, PublishHandler, QueryHandler, SourceConnection,
};

use futures::future::try_join_all;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Declared health of the connector process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// No declaration has been made yet.
    Undeclared,
    Healthy,
    Unhealthy,
}

struct ProbeServer {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

/// The set of source connections managed by one process, built from a
/// single configuration.
///
/// Also owns the TCP health probe: a listener whose openability is the
/// liveness signal for orchestrators such as Kubernetes.
pub struct ConnectorSet {
    config: ServerConfig,
    sources: Vec<String>,
    connections: HashMap<String, Arc<SourceConnection>>,
    health: StdMutex<HealthState>,
    /// Serializes probe lifecycle transitions across all sources.
    probe: Mutex<Option<ProbeServer>>,
}

impl ConnectorSet {
    /// Builds the set from an already-loaded configuration, one connection
    /// per configured source.
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &std::sync::Weak<ConnectorSet>| {
            let sources = config.sources.clone();
            let mut connections = HashMap::new();
            for source in &sources {
                let conn = Arc::new(SourceConnection::new(source.clone(), config.clone()));
                conn.attach_set(weak.clone());
                connections.insert(source.clone(), conn);
            }
            ConnectorSet {
                config,
                sources,
                connections,
                health: StdMutex::new(HealthState::Undeclared),
                probe: Mutex::new(None),
            }
        })
    }

    /// Builds the set from the standard `server.config` search paths.
    pub fn from_env() -> Result<Arc<Self>, ConfigError> {
        Ok(Self::new(ServerConfig::load()?))
    }

    /// The configured source names, in configuration order.
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// All connections, indexed by source name.
    pub fn connections(&self) -> &HashMap<String, Arc<SourceConnection>> {
        &self.connections
    }

    /// The connection for one source, if the source is configured.
    pub fn connection_for_source(&self, source_name: &str) -> Option<Arc<SourceConnection>> {
        self.connections.get(source_name).cloned()
    }

    /// Provides the same handlers for every connection in this set.
    pub fn configure_handlers_for_all(
        &self,
        close: Option<CloseHandler>,
        connect: Option<ConnectHandler>,
        publish: Option<PublishHandler>,
        query: Option<QueryHandler>,
    ) {
        for conn in self.connections.values() {
            conn.configure_handlers(
                close.clone(),
                connect.clone(),
                publish.clone(),
                query.clone(),
            );
        }
    }

    /// Runs every connection's connect loop in parallel. Returns when a
    /// loop surfaces a fatal error, or when all loops complete.
    pub async fn run_connectors(&self) -> Result<(), ConnectorError> {
        info!("starting {} connectors", self.sources.len());
        let runs = self.sources.iter().filter_map(|source| {
            self.connections.get(source).map(|conn| {
                let conn = conn.clone();
                async move { conn.run().await }
            })
        });
        try_join_all(runs).await?;
        Ok(())
    }

    /// Declares the connector healthy and ensures the probe listener is up.
    pub async fn declare_healthy(&self) -> Result<(), ConnectorError> {
        *self.health.lock().expect("health lock poisoned") = HealthState::Healthy;

        let mut probe = self.probe.lock().await;
        if probe.is_none() {
            let listener = TcpListener::bind(("0.0.0.0", self.config.tcp_probe_port)).await?;
            let local_addr = listener.local_addr()?;
            let shutdown = Arc::new(Notify::new());
            let task = spawn_probe(listener, shutdown.clone());
            info!(addr = %local_addr, "health probe listening");
            *probe = Some(ProbeServer {
                local_addr,
                shutdown,
                task,
            });
        }
        Ok(())
    }

    /// Declares the connector unhealthy; the probe listener is closed so
    /// subsequent probe attempts fail to connect.
    pub async fn declare_unhealthy(&self) {
        *self.health.lock().expect("health lock poisoned") = HealthState::Unhealthy;

        let mut probe = self.probe.lock().await;
        warn!("connector is unhealthy");
        if let Some(server) = probe.take() {
            warn!("connector is unhealthy, disabling health probe");
            stop_probe(server).await;
        }
    }

    /// Declared health; `None` until the first declaration.
    pub fn is_healthy(&self) -> Option<bool> {
        match *self.health.lock().expect("health lock poisoned") {
            HealthState::Undeclared => None,
            HealthState::Healthy => Some(true),
            HealthState::Unhealthy => Some(false),
        }
    }

    pub fn health_state(&self) -> HealthState {
        *self.health.lock().expect("health lock poisoned")
    }

    /// Address the probe listener is bound to, when it is up. Useful when
    /// the configured port is 0 (ephemeral).
    pub async fn health_probe_addr(&self) -> Option<SocketAddr> {
        self.probe.lock().await.as_ref().map(|p| p.local_addr)
    }

    /// Closes every connection and tears down the probe listener.
    pub async fn close(&self) {
        for source in &self.sources {
            if let Some(conn) = self.connections.get(source) {
                conn.close().await;
            }
        }
        let mut probe = self.probe.lock().await;
        if let Some(server) = probe.take() {
            stop_probe(server).await;
        }
    }
}

/// Accepts and immediately drops probe connections; only socket
/// openability is the signal.
fn spawn_probe(listener: TcpListener, shutdown: Arc<Notify>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((_socket, _addr)) => {}
                    Err(e) => {
                        warn!("health probe accept failed: {e}");
                        break;
                    }
                },
                _ = shutdown.notified() => break,
            }
        }
    })
}

async fn stop_probe(server: ProbeServer) {
    server.shutdown.notify_waiters();
    // Wait for closure so the port is released before returning.
    let _ = server.task.await;
}
