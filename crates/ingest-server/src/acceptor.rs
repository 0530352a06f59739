use crate::config::{ServerConfig, SessionConfig};
use crate::session::DeviceSession;
use device_registry::{CommandSink, DeviceRegistry, RegistryService};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept so a persistent error (fd exhaustion) does
/// not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Admits connections up to `max_devices` and spawns one session task each.
pub struct ConnectionAcceptor {
    listener: TcpListener,
    registry: DeviceRegistry,
    sink: CommandSink,
    max_devices: usize,
    login_timeout: Duration,
    session: SessionConfig,
}

impl ConnectionAcceptor {
    pub async fn bind(
        config: &ServerConfig,
        registry: DeviceRegistry,
        sink: CommandSink,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_address()).await?;
        Ok(Self::from_listener(listener, config, registry, sink))
    }

    pub fn from_listener(
        listener: TcpListener,
        config: &ServerConfig,
        registry: DeviceRegistry,
        sink: CommandSink,
    ) -> Self {
        Self {
            listener,
            registry,
            sink,
            max_devices: config.max_devices,
            login_timeout: config.login_timeout(),
            session: config.session(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept forever. Accept errors are logged and the loop continues.
    pub async fn run(self) {
        info!(
            addr = ?self.listener.local_addr().ok(),
            max_devices = self.max_devices,
            "accepting device connections"
        );
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) => {
                    error!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let connected = self.registry.count();
        if connected >= self.max_devices {
            warn!(%peer, connected, "admission cap reached, closing connection");
            if let Some(m) = self.registry.metrics() {
                m.admission_rejected.inc();
            }
            drop(stream);
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "set_nodelay failed");
        }

        let deadline = Instant::now() + self.login_timeout;
        let session = DeviceSession::new(stream, self.sink.clone(), self.session, deadline)
            .with_peer(peer);
        tokio::spawn(session.run());
    }
}

/// A listening server with its registry service running.
pub struct RunningServer {
    pub local_addr: SocketAddr,
    pub acceptor: JoinHandle<()>,
    pub registry_service: JoinHandle<()>,
}

impl RunningServer {
    pub fn abort(&self) {
        self.acceptor.abort();
        self.registry_service.abort();
    }
}

/// Bind the listener and spawn the registry service and the acceptor on the
/// current runtime.
pub async fn start(config: &ServerConfig, registry: DeviceRegistry) -> io::Result<RunningServer> {
    let (service, sink) = RegistryService::new(registry.clone(), config.command_queue_capacity);
    let acceptor = ConnectionAcceptor::bind(config, registry, sink).await?;
    let local_addr = acceptor.local_addr()?;
    let registry_service = tokio::spawn(service.run());
    let acceptor = tokio::spawn(acceptor.run());
    Ok(RunningServer {
        local_addr,
        acceptor,
        registry_service,
    })
}
