use crate::error::{RegistryError, Result};
use crate::registry::DeviceRegistry;
use crate::types::SessionCommand;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Cloneable handle sessions use to submit commands.
///
/// `send` waits for queue space, so a slow registry slows every session.
#[derive(Clone, Debug)]
pub struct CommandSink {
    tx: mpsc::Sender<SessionCommand>,
}

impl CommandSink {
    pub async fn send(&self, command: SessionCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| RegistryError::ServiceStopped)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Single writer: drains the command queue and applies each command in
/// arrival order.
pub struct RegistryService {
    registry: DeviceRegistry,
    commands: mpsc::Receiver<SessionCommand>,
}

impl RegistryService {
    pub fn new(registry: DeviceRegistry, capacity: usize) -> (Self, CommandSink) {
        let (tx, commands) = mpsc::channel(capacity.max(1));
        (Self { registry, commands }, CommandSink { tx })
    }

    /// Start the service on the current tokio runtime.
    pub fn spawn(registry: DeviceRegistry, capacity: usize) -> (CommandSink, JoinHandle<()>) {
        let (service, sink) = Self::new(registry, capacity);
        let handle = tokio::spawn(service.run());
        (sink, handle)
    }

    /// Runs until every `CommandSink` has been dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            let _ = self.apply(command);
        }
        debug!("all command senders dropped, registry service exiting");
    }

    /// Apply one command and log its failure. Errors never stop the loop.
    pub fn apply(&self, command: SessionCommand) -> Result<()> {
        let kind = command.kind();
        let identity = command.identity();
        let result = match command {
            SessionCommand::Login { identity, reply } => self.registry.register(identity, reply),
            SessionCommand::Logout { identity } => self.registry.deregister(identity),
            SessionCommand::Reading { identity, payload } => {
                self.registry.handle_reading(identity, &payload)
            }
        };
        if let Err(e) = &result {
            match e {
                RegistryError::InternalFault { .. } => {
                    error!(%identity, command = kind, error = %e, "command failed")
                }
                _ => warn!(%identity, command = kind, error = %e, "command rejected"),
            }
        }
        result
    }
}
