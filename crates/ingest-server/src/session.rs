//! Per-connection lifecycle.
//!
//! ```text
//! AwaitingLogin --15 bytes, valid--> AwaitingWelcome --Welcome--> Authenticated
//!       |                                 |                          |
//!       +--- short / timeout / bad ---+---+--- Kill -----------------+--- EOF, timeout,
//!                                     v                                   error, Kill
//!                                 Terminated <----------------------------+
//! ```
//!
//! Only an authenticated session sends `Logout`, and only when it ended on
//! its own side (end of stream, liveness timeout, read error).

use crate::config::{SessionConfig, ShortReadPolicy};
use crate::error::SessionError;
use device_registry::{reply_channel, CommandSink, RegistryReply, ReplyReceiver, SessionCommand};
use std::io;
use std::net::SocketAddr;
use telemetry_wire::{decode_identity, Identity, IDENTITY_FRAME_LEN, MEASUREMENT_FRAME_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, field, info, info_span, warn, Instrument, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingLogin,
    AwaitingWelcome,
    Authenticated,
    Terminated,
}

/// How and where a session ended.
#[derive(Debug)]
pub struct SessionEnd {
    pub identity: Option<Identity>,
    /// Last state before `Terminated`.
    pub ended_in: SessionState,
    pub reason: SessionError,
    /// A `Logout` command reached the registry queue.
    pub logged_out: bool,
}

pub struct DeviceSession<S> {
    stream: S,
    peer: Option<SocketAddr>,
    sink: CommandSink,
    config: SessionConfig,
    login_deadline: Instant,
    state: SessionState,
    identity: Option<Identity>,
    frame: [u8; MEASUREMENT_FRAME_LEN],
}

impl<S> DeviceSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// `login_deadline` bounds the wait for the login frame.
    pub fn new(stream: S, sink: CommandSink, config: SessionConfig, login_deadline: Instant) -> Self {
        Self {
            stream,
            peer: None,
            sink,
            config,
            login_deadline,
            state: SessionState::AwaitingLogin,
            identity: None,
            frame: [0u8; MEASUREMENT_FRAME_LEN],
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Drive the connection to completion. The stream is shut down exactly
    /// once, whichever way the session ends.
    pub async fn run(self) -> SessionEnd {
        let span = info_span!("session", peer = field::Empty, identity = field::Empty);
        if let Some(peer) = self.peer {
            span.record("peer", field::display(peer));
        }
        self.run_to_end().instrument(span).await
    }

    async fn run_to_end(mut self) -> SessionEnd {
        let (reason, logged_out) = self.drive().await;
        let ended_in = self.state;
        self.transition(SessionState::Terminated);

        if let Err(e) = self.stream.shutdown().await {
            debug!(error = %e, "shutdown on closed stream");
        }

        match &reason {
            SessionError::ConnectionClosed => info!("device disconnected"),
            SessionError::Killed => info!("session evicted"),
            SessionError::ReadTimeout(after) => warn!(?after, "device went silent, dropped"),
            SessionError::Rejected => warn!("duplicate login rejected"),
            other => warn!(error = %other, ?ended_in, "session terminated"),
        }

        SessionEnd {
            identity: self.identity,
            ended_in,
            reason,
            logged_out,
        }
    }

    async fn drive(&mut self) -> (SessionError, bool) {
        let identity = match self.receive_login().await {
            Ok(identity) => identity,
            Err(e) => return (e, false),
        };
        self.identity = Some(identity);
        Span::current().record("identity", field::display(identity));

        self.transition(SessionState::AwaitingWelcome);
        let mut replies = match self.request_login(identity).await {
            Ok(replies) => replies,
            Err(e) => return (e, false),
        };

        self.transition(SessionState::Authenticated);
        let reason = self.receive_readings(identity, &mut replies).await;

        // An eviction that raced the end of the read loop still wins: the
        // entry may already belong to a newer session for this identity.
        let reason = match replies.try_recv() {
            Ok(RegistryReply::Kill) | Err(TryRecvError::Disconnected)
                if reason.requires_logout() =>
            {
                SessionError::Killed
            }
            _ => reason,
        };

        let mut logged_out = false;
        if reason.requires_logout() {
            match self.sink.send(SessionCommand::Logout { identity }).await {
                Ok(()) => logged_out = true,
                Err(e) => warn!(error = %e, "could not send logout"),
            }
        }
        (reason, logged_out)
    }

    async fn receive_login(&mut self) -> Result<Identity, SessionError> {
        let mut login = [0u8; IDENTITY_FRAME_LEN];
        let filled = timeout_at(self.login_deadline, read_full(&mut self.stream, &mut login))
            .await
            .map_err(|_| SessionError::LoginTimeout)??;
        if filled < IDENTITY_FRAME_LEN {
            return Err(SessionError::ShortLoginRead(filled));
        }
        Ok(decode_identity(&login)?)
    }

    async fn request_login(&mut self, identity: Identity) -> Result<ReplyReceiver, SessionError> {
        let (reply, mut replies) = reply_channel();
        self.sink
            .send(SessionCommand::Login { identity, reply })
            .await
            .map_err(|_| SessionError::RegistryUnavailable)?;

        match replies.recv().await {
            Some(RegistryReply::Welcome) => {
                debug!("login accepted");
                Ok(replies)
            }
            Some(RegistryReply::Kill) => Err(SessionError::Rejected),
            None => Err(SessionError::RegistryUnavailable),
        }
    }

    async fn receive_readings(
        &mut self,
        identity: Identity,
        replies: &mut ReplyReceiver,
    ) -> SessionError {
        loop {
            let liveness = self.config.liveness_timeout;
            let deadline = Instant::now() + liveness;
            let read = tokio::select! {
                biased;
                () = evicted(replies) => return SessionError::Killed,
                read = timeout_at(deadline, self.stream.read(&mut self.frame)) => read,
            };
            let n = match read {
                Err(_) => return SessionError::ReadTimeout(liveness),
                Ok(Err(e)) => return SessionError::Io(e),
                Ok(Ok(0)) => return SessionError::ConnectionClosed,
                Ok(Ok(n)) => n,
            };

            if n < MEASUREMENT_FRAME_LEN {
                match self.config.short_read_policy {
                    ShortReadPolicy::Forward => {
                        warn!(bytes = n, "short reading frame, forwarding with stale tail");
                    }
                    ShortReadPolicy::Disconnect => return SessionError::ShortRead(n),
                    ShortReadPolicy::Reassemble => {
                        let rest = &mut self.frame[n..];
                        let wanted = rest.len();
                        let read = tokio::select! {
                            biased;
                            () = evicted(replies) => return SessionError::Killed,
                            read = timeout_at(deadline, read_full(&mut self.stream, rest)) => read,
                        };
                        match read {
                            Err(_) => return SessionError::ReadTimeout(liveness),
                            Ok(Err(e)) => return SessionError::Io(e),
                            Ok(Ok(m)) if m < wanted => return SessionError::ConnectionClosed,
                            Ok(Ok(_)) => debug!(first = n, "reassembled split reading frame"),
                        }
                    }
                }
            }

            let command = SessionCommand::Reading {
                identity,
                payload: self.frame,
            };
            if self.sink.send(command).await.is_err() {
                return SessionError::RegistryUnavailable;
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "session state");
        self.state = next;
    }
}

/// Resolves once the registry sends `Kill` or drops our reply channel.
async fn evicted(replies: &mut ReplyReceiver) {
    loop {
        match replies.recv().await {
            Some(RegistryReply::Welcome) => debug!("stray welcome ignored"),
            Some(RegistryReply::Kill) | None => return,
        }
    }
}

/// Read until `buf` is full or the peer closes. Returns the bytes read.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use device_registry::{DeviceRegistry, RegistryService};
    use std::time::Duration;
    use telemetry_wire::{encode_measurement, MeasurementRecord};
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    const LOGIN: [u8; 15] = [4, 9, 0, 1, 5, 4, 2, 0, 3, 2, 3, 7, 5, 1, 8];

    fn device() -> Identity {
        "490154203237518".parse().unwrap()
    }

    fn sample() -> MeasurementRecord {
        MeasurementRecord {
            temperature: 10.0,
            altitude: 20.0,
            latitude: 30.0,
            longitude: 40.0,
            battery_level: 50.0,
        }
    }

    struct Harness {
        registry: DeviceRegistry,
        sink: CommandSink,
        service: JoinHandle<()>,
    }

    impl Harness {
        fn new() -> Self {
            let registry = DeviceRegistry::default();
            let (sink, service) = RegistryService::spawn(registry.clone(), 16);
            Self {
                registry,
                sink,
                service,
            }
        }

        fn session(&self, policy: ShortReadPolicy) -> (DuplexStream, DeviceSession<DuplexStream>) {
            let (client, server) = tokio::io::duplex(1024);
            let config = SessionConfig {
                liveness_timeout: Duration::from_secs(2),
                short_read_policy: policy,
            };
            let deadline = Instant::now() + Duration::from_secs(1);
            let session = DeviceSession::new(server, self.sink.clone(), config, deadline);
            (client, session)
        }

        /// Wait for every queued command to be applied.
        async fn settle(self) -> DeviceRegistry {
            drop(self.sink);
            self.service.await.unwrap();
            self.registry
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_reading_and_disconnect() {
        let harness = Harness::new();
        let (mut client, session) = harness.session(ShortReadPolicy::Forward);
        let task = tokio::spawn(session.run());

        client.write_all(&LOGIN).await.unwrap();
        client.write_all(&encode_measurement(&sample())).await.unwrap();
        wait_until(|| harness.registry.last_reading(device()).is_some()).await;
        drop(client);

        let end = task.await.unwrap();
        assert_eq!(end.identity, Some(device()));
        assert_eq!(end.ended_in, SessionState::Authenticated);
        assert!(matches!(end.reason, SessionError::ConnectionClosed));
        assert!(end.logged_out);

        let registry = harness.settle().await;
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_checksum_never_reaches_registry() {
        let harness = Harness::new();
        let (mut client, session) = harness.session(ShortReadPolicy::Forward);
        let mut login = LOGIN;
        login[14] = 1;
        client.write_all(&login).await.unwrap();

        let end = session.run().await;
        assert!(matches!(
            end.reason,
            SessionError::Protocol(telemetry_wire::WireError::ChecksumMismatch)
        ));
        assert_eq!(end.ended_in, SessionState::AwaitingLogin);
        assert_eq!(end.identity, None);
        assert!(!end.logged_out);

        let registry = harness.settle().await;
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_login_read() {
        let harness = Harness::new();
        let (mut client, session) = harness.session(ShortReadPolicy::Forward);
        client.write_all(&LOGIN[..5]).await.unwrap();
        drop(client);

        let end = session.run().await;
        assert!(matches!(end.reason, SessionError::ShortLoginRead(5)));
        assert!(!end.logged_out);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_deadline() {
        let harness = Harness::new();
        let (mut client, session) = harness.session(ShortReadPolicy::Forward);

        let end = session.run().await;
        assert!(matches!(end.reason, SessionError::LoginTimeout));

        // The server side was shut down.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_login_is_rejected_without_logout() {
        let harness = Harness::new();
        let (existing, _existing_rx) = reply_channel();
        harness.registry.register(device(), existing).unwrap();

        let (mut client, session) = harness.session(ShortReadPolicy::Forward);
        client.write_all(&LOGIN).await.unwrap();

        let end = session.run().await;
        assert!(matches!(end.reason, SessionError::Rejected));
        assert_eq!(end.ended_in, SessionState::AwaitingWelcome);
        assert!(!end.logged_out);

        let registry = harness.settle().await;
        assert!(registry.is_connected(device()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_is_dropped() {
        let harness = Harness::new();
        let (mut client, session) = harness.session(ShortReadPolicy::Forward);
        client.write_all(&LOGIN).await.unwrap();

        let started = Instant::now();
        let end = session.run().await;
        assert!(matches!(end.reason, SessionError::ReadTimeout(_)));
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(end.logged_out);

        let registry = harness.settle().await;
        assert_eq!(registry.count(), 0);
        drop(client);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_read_forward_stores_partial_frame() {
        let harness = Harness::new();
        let (mut client, session) = harness.session(ShortReadPolicy::Forward);
        let task = tokio::spawn(session.run());

        client.write_all(&LOGIN).await.unwrap();
        let frame = encode_measurement(&sample());
        client.write_all(&frame[..24]).await.unwrap();
        wait_until(|| harness.registry.last_reading(device()).is_some()).await;

        let (_, stored) = harness.registry.last_reading(device()).unwrap();
        assert_eq!(stored.temperature, 10.0);
        assert_eq!(stored.latitude, 30.0);
        assert_eq!(stored.longitude, 0.0);
        assert_eq!(stored.battery_level, 0.0);

        drop(client);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_read_reassembled() {
        let harness = Harness::new();
        let (mut client, session) = harness.session(ShortReadPolicy::Reassemble);
        let task = tokio::spawn(session.run());

        client.write_all(&LOGIN).await.unwrap();
        wait_until(|| harness.registry.is_connected(device())).await;
        let frame = encode_measurement(&sample());
        client.write_all(&frame[..24]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.write_all(&frame[24..]).await.unwrap();
        wait_until(|| harness.registry.last_reading(device()).is_some()).await;

        let (_, stored) = harness.registry.last_reading(device()).unwrap();
        assert_eq!(stored, sample());

        drop(client);
        let end = task.await.unwrap();
        assert!(matches!(end.reason, SessionError::ConnectionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_read_disconnects() {
        let harness = Harness::new();
        let (mut client, session) = harness.session(ShortReadPolicy::Disconnect);
        client.write_all(&LOGIN).await.unwrap();
        let frame = encode_measurement(&sample());
        client.write_all(&frame[..24]).await.unwrap();

        let end = session.run().await;
        assert!(matches!(end.reason, SessionError::ShortRead(24)));
        assert!(end.logged_out);

        let registry = harness.settle().await;
        assert_eq!(registry.count(), 0);
        drop(client);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_ends_loop_without_logout() {
        let harness = Harness::new();
        let (mut client, session) = harness.session(ShortReadPolicy::Forward);
        let task = tokio::spawn(session.run());

        client.write_all(&LOGIN).await.unwrap();
        wait_until(|| harness.registry.is_connected(device())).await;
        let evicted_at = Instant::now();
        harness.registry.evict(device()).unwrap();

        // No frame is needed to notice the Kill.
        let end = task.await.unwrap();
        assert!(matches!(end.reason, SessionError::Killed));
        assert!(evicted_at.elapsed() < Duration::from_secs(2));
        assert!(!end.logged_out);
        assert_eq!(harness.registry.count(), 0);
        drop(client);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicted_session_leaves_newer_login_alone() {
        let harness = Harness::new();
        let (mut first, evicted_session) = harness.session(ShortReadPolicy::Forward);
        let first_task = tokio::spawn(evicted_session.run());
        first.write_all(&LOGIN).await.unwrap();
        wait_until(|| harness.registry.is_connected(device())).await;

        harness.registry.evict(device()).unwrap();

        let (mut second, session) = harness.session(ShortReadPolicy::Forward);
        let second_task = tokio::spawn(session.run());
        second.write_all(&LOGIN).await.unwrap();
        second.write_all(&encode_measurement(&sample())).await.unwrap();
        wait_until(|| harness.registry.last_reading(device()).is_some()).await;

        // The first device stays silent; its session must not log out the
        // identity now owned by the second one.
        let end = first_task.await.unwrap();
        assert!(matches!(end.reason, SessionError::Killed));
        assert!(!end.logged_out);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(harness.registry.is_connected(device()));
        assert_eq!(harness.registry.count(), 1);

        drop(second);
        let end = second_task.await.unwrap();
        assert!(end.logged_out);
        drop(first);
        let registry = harness.settle().await;
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_frame_split_across_writes() {
        let harness = Harness::new();
        let (mut client, session) = harness.session(ShortReadPolicy::Forward);
        let task = tokio::spawn(session.run());

        client.write_all(&LOGIN[..7]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!harness.registry.is_connected(device()));
        client.write_all(&LOGIN[7..]).await.unwrap();
        wait_until(|| harness.registry.is_connected(device())).await;

        drop(client);
        let end = task.await.unwrap();
        assert_eq!(end.identity, Some(device()));
        assert!(matches!(end.reason, SessionError::ConnectionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_gone_before_login() {
        let registry = DeviceRegistry::default();
        let (service, sink) = RegistryService::new(registry, 4);
        drop(service);

        let (mut client, server) = tokio::io::duplex(64);
        let session = DeviceSession::new(
            server,
            sink,
            SessionConfig::default(),
            Instant::now() + Duration::from_secs(1),
        );
        client.write_all(&LOGIN).await.unwrap();

        let end = session.run().await;
        assert!(matches!(end.reason, SessionError::RegistryUnavailable));
        assert_eq!(end.ended_in, SessionState::AwaitingWelcome);
    }
}
