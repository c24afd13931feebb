//! Connection manager with handshake, heartbeats and reconnection inside the
//! overseer's re-attach window

use crate::command::CommandExecutor;
use crate::transport::{TransportConnector, TransportStream};
use anyhow::{anyhow, bail, Result};
use hive_shared::codec::{self, FrameDecoder};
use hive_shared::{error_code, timeouts, Envelope, Payload, TerminateCode, CONTROL_CHANNEL};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Identity sent in the handshake; assigned by the overseer at spawn
    pub drone_id: String,
    pub heartbeat_interval: Duration,
    /// Reconnection delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
    pub connect_timeout: Duration,
    /// How long the drone keeps trying after losing its overseer. The
    /// overseer forgets a drone that stays away longer than its spawn timeout.
    pub reattach_window: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            drone_id: "drone".into(),
            heartbeat_interval: Duration::from_millis(timeouts::HEARTBEAT_INTERVAL_MS),
            reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            reattach_window: Duration::from_millis(timeouts::SPAWN_TIMEOUT_MS),
        }
    }
}

/// Terminate received from the overseer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub code: TerminateCode,
    pub reason: String,
}

/// Keeps the drone connected to its overseer and serves invoke streams
pub struct ConnectionManager {
    config: ConnectionConfig,
    executor: Arc<CommandExecutor>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, executor: Arc<CommandExecutor>) -> Self {
        Self { config, executor }
    }

    pub fn drone_id(&self) -> &str {
        &self.config.drone_id
    }

    /// Connect, serve until the overseer sends terminate, and reconnect with
    /// exponential backoff whenever the connection drops
    ///
    /// Fails once the overseer has been unreachable for the whole re-attach
    /// window.
    pub async fn run<C: TransportConnector>(&self, connector: &C) -> Result<Termination> {
        let mut reconnect_delay = self.config.reconnect_delay;
        let mut unreachable_since: Option<Instant> = None;

        loop {
            match timeout(self.config.connect_timeout, connector.connect()).await {
                Ok(Ok(stream)) => {
                    info!(
                        "[CONNECTION] connected to {} over {}",
                        connector.endpoint(),
                        connector.name()
                    );
                    reconnect_delay = self.config.reconnect_delay;
                    unreachable_since = None;

                    match self.handle_connection(stream).await {
                        Ok(termination) => return Ok(termination),
                        Err(e) => {
                            warn!("[CONNECTION] disconnected: {:#}", e);
                            unreachable_since = Some(Instant::now());
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!("[CONNECTION] {} connect failed: {:#}", connector.name(), e);
                }
                Err(_) => {
                    warn!("[CONNECTION] {} connect timed out", connector.name());
                }
            }

            let since = *unreachable_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= self.config.reattach_window {
                bail!(
                    "overseer unreachable for {:?}, giving up",
                    self.config.reattach_window
                );
            }

            tokio::time::sleep(reconnect_delay).await;
            reconnect_delay = std::cmp::min(reconnect_delay * 2, self.config.max_reconnect_delay);
        }
    }

    /// Serve one connection: hand-shake, heartbeat, run invokes
    ///
    /// Returns once the overseer sends terminate (after acknowledging it) and
    /// fails when the connection is lost.
    pub async fn handle_connection<S: TransportStream>(&self, stream: S) -> Result<Termination> {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let mut invocations = Invocations::new(self.executor.clone(), outbound_tx);

        let mut decoder = FrameDecoder::new();
        let mut read_buf = vec![0u8; 4096];

        let handshake = Payload::handshake(self.config.drone_id.as_str());
        write_envelope(&mut writer, &Envelope::new(CONTROL_CHANNEL, handshake)).await?;
        info!("[CONNECTION] hand-shake sent as {}", self.config.drone_id);

        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    write_envelope(&mut writer, &Envelope::new(CONTROL_CHANNEL, Payload::heartbeat())).await?;
                }

                Some(envelope) = outbound_rx.recv() => {
                    write_envelope(&mut writer, &envelope).await?;
                }

                read = reader.read(&mut read_buf) => {
                    let n = read?;
                    if n == 0 {
                        return Err(anyhow!("overseer closed the connection"));
                    }
                    decoder.extend(&read_buf[..n]);

                    while let Some(envelope) = decoder.decode_next()? {
                        let Some(termination) = self.on_envelope(envelope, &mut invocations)? else {
                            continue;
                        };

                        invocations.abort_all();
                        while let Ok(envelope) = outbound_rx.try_recv() {
                            write_envelope(&mut writer, &envelope).await?;
                        }
                        let ack = Payload::terminate(TerminateCode::TerminateNormal, "terminated");
                        write_envelope(&mut writer, &Envelope::new(CONTROL_CHANNEL, ack)).await?;

                        let mut stream = reader.unsplit(writer);
                        if let Err(e) = TransportStream::shutdown(&mut stream).await {
                            debug!("[CONNECTION] shutdown after terminate: {}", e);
                        }
                        return Ok(termination);
                    }
                }
            }
        }
    }

    fn on_envelope(
        &self,
        envelope: Envelope,
        invocations: &mut Invocations,
    ) -> Result<Option<Termination>> {
        let (Some(channel), Some(payload)) = (envelope.channel_id(), envelope.payload) else {
            warn!("[CONNECTION] dropping envelope without header or payload");
            return Ok(None);
        };

        if channel != CONTROL_CHANNEL {
            invocations.on_message(channel, payload);
            return Ok(None);
        }

        match payload {
            Payload::Terminate(t) => {
                let code = TerminateCode::try_from(t.code).unwrap_or(TerminateCode::TerminateUnknown);
                info!("[CONNECTION] terminate received: {:?} {}", code, t.reason);
                Ok(Some(Termination {
                    code,
                    reason: t.reason,
                }))
            }
            Payload::Heartbeat(_) => {
                debug!("[CONNECTION] heartbeat from overseer");
                Ok(None)
            }
            Payload::Error(e) => Err(anyhow!(
                "overseer refused the control channel ({}): {}",
                e.code,
                e.reason
            )),
            other => {
                warn!(
                    "[CONNECTION] unexpected {:?} on the control channel",
                    other.message_type()
                );
                Ok(None)
            }
        }
    }
}

/// State of one invoke stream
enum Invocation {
    /// Request body still arriving
    Collecting { event: String, body: Vec<Vec<u8>> },
    /// Handler running; its task writes the response
    Running(JoinHandle<()>),
}

/// Invoke streams of one connection, by channel
struct Invocations {
    executor: Arc<CommandExecutor>,
    outbound: mpsc::UnboundedSender<Envelope>,
    entries: HashMap<u64, Invocation>,
}

impl Invocations {
    fn new(executor: Arc<CommandExecutor>, outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            executor,
            outbound,
            entries: HashMap::new(),
        }
    }

    fn send(&self, channel: u64, payload: Payload) {
        let _ = self.outbound.send(Envelope::new(channel, payload));
    }

    fn on_message(&mut self, channel: u64, payload: Payload) {
        match payload {
            Payload::Invoke(invoke) => {
                self.entries
                    .retain(|_, inv| !matches!(inv, Invocation::Running(task) if task.is_finished()));
                if self.entries.contains_key(&channel) {
                    warn!("[CONNECTION] invoke on busy channel {}", channel);
                    return;
                }
                debug!("[CONNECTION] channel {} invokes '{}'", channel, invoke.event);
                self.entries.insert(
                    channel,
                    Invocation::Collecting {
                        event: invoke.event,
                        body: Vec::new(),
                    },
                );
            }
            Payload::Chunk(chunk) => match self.entries.get_mut(&channel) {
                Some(Invocation::Collecting { body, .. }) => body.push(chunk.data),
                _ => warn!("[CONNECTION] chunk on channel {} outside a request", channel),
            },
            Payload::Choke(_) => match self.entries.remove(&channel) {
                Some(Invocation::Collecting { event, body }) => {
                    let executor = self.executor.clone();
                    let outbound = self.outbound.clone();
                    let task = tokio::spawn(async move {
                        for payload in executor.execute(channel, &event, body).await {
                            let _ = outbound.send(Envelope::new(channel, payload));
                        }
                    });
                    self.entries.insert(channel, Invocation::Running(task));
                }
                Some(running) => {
                    warn!("[CONNECTION] duplicate choke on channel {}", channel);
                    self.entries.insert(channel, running);
                }
                None => warn!("[CONNECTION] choke on unknown channel {}", channel),
            },
            Payload::Error(e) => self.cancel(channel, e.code, &e.reason),
            other => warn!(
                "[CONNECTION] unexpected {:?} on channel {}",
                other.message_type(),
                channel
            ),
        }
    }

    /// The overseer failed the request, usually because its client went away
    fn cancel(&mut self, channel: u64, code: i32, reason: &str) {
        match self.entries.remove(&channel) {
            Some(Invocation::Collecting { event, .. }) => {
                info!("[CONNECTION] '{}' on channel {} cancelled ({}): {}", event, channel, code, reason);
            }
            Some(Invocation::Running(task)) => {
                if task.is_finished() {
                    return;
                }
                task.abort();
                info!("[CONNECTION] running request on channel {} cancelled ({}): {}", channel, code, reason);
            }
            None => {
                debug!("[CONNECTION] error for finished channel {}", channel);
                return;
            }
        }
        self.send(channel, Payload::error(error_code::CANCELLED, "cancelled"));
    }

    fn abort_all(&mut self) {
        for (_, invocation) in self.entries.drain() {
            if let Invocation::Running(task) = invocation {
                task.abort();
            }
        }
    }
}

async fn write_envelope<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    let encoded = codec::encode(envelope)?;
    writer.write_all(&encoded).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::handlers::{Handler, HandlerContext};
    use crate::command::CommandResult;
    use async_trait::async_trait;
    use hive_shared::OUTBOUND_CHANNEL_BASE;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    const INVOKE_CHANNEL: u64 = OUTBOUND_CHANNEL_BASE;

    #[async_trait]
    impl TransportStream for DuplexStream {
        async fn shutdown(&mut self) -> Result<()> {
            AsyncWriteExt::shutdown(self).await?;
            Ok(())
        }
    }

    /// Handler that never finishes on its own
    struct Stall;

    #[async_trait]
    impl Handler for Stall {
        async fn handle(&self, _ctx: &HandlerContext, _body: Vec<Vec<u8>>) -> CommandResult {
            std::future::pending::<()>().await;
            CommandResult::Completed { chunks: Vec::new() }
        }
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            drone_id: "w1".into(),
            heartbeat_interval: Duration::from_millis(50),
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(40),
            connect_timeout: Duration::from_secs(1),
            reattach_window: Duration::from_millis(300),
        }
    }

    fn manager() -> Arc<ConnectionManager> {
        let mut executor = CommandExecutor::with_builtins("w1", "app");
        executor.register("stall", Arc::new(Stall));
        Arc::new(ConnectionManager::new(config(), Arc::new(executor)))
    }

    /// Overseer end of a drone connection
    struct FakeOverseer {
        stream: DuplexStream,
        decoder: FrameDecoder,
    }

    impl FakeOverseer {
        fn new(stream: DuplexStream) -> Self {
            Self {
                stream,
                decoder: FrameDecoder::new(),
            }
        }

        async fn send(&mut self, channel: u64, payload: Payload) {
            write_envelope(&mut self.stream, &Envelope::new(channel, payload))
                .await
                .expect("write");
        }

        async fn recv(&mut self) -> Option<(u64, Payload)> {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(envelope) = self.decoder.decode_next().expect("decode") {
                    let channel = envelope.channel_id().expect("header");
                    return Some((channel, envelope.payload.expect("payload")));
                }
                let read = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                    .await
                    .expect("drone went quiet");
                match read {
                    Ok(0) | Err(_) => return None,
                    Ok(n) => self.decoder.extend(&buf[..n]),
                }
            }
        }

        /// Next message that is not a heartbeat
        async fn expect(&mut self) -> (u64, Payload) {
            loop {
                match self.recv().await.expect("connection closed") {
                    (CONTROL_CHANNEL, Payload::Heartbeat(_)) => continue,
                    message => return message,
                }
            }
        }

        async fn expect_handshake(&mut self) {
            assert_eq!(
                self.expect().await,
                (CONTROL_CHANNEL, Payload::handshake("w1"))
            );
        }

        async fn terminate(&mut self) {
            self.send(
                CONTROL_CHANNEL,
                Payload::terminate(TerminateCode::TerminateNormal, "despawn"),
            )
            .await;
            let (channel, payload) = self.expect().await;
            assert_eq!(channel, CONTROL_CHANNEL);
            assert!(matches!(payload, Payload::Terminate(_)));
        }
    }

    fn connect(manager: &Arc<ConnectionManager>) -> (FakeOverseer, JoinHandle<Result<Termination>>) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let manager = manager.clone();
        let task = tokio::spawn(async move { manager.handle_connection(local).await });
        (FakeOverseer::new(remote), task)
    }

    fn assert_error(payload: Payload, code: i32) {
        match payload {
            Payload::Error(e) => assert_eq!(e.code, code, "unexpected error: {}", e.reason),
            other => panic!("expected error {}, got {:?}", code, other),
        }
    }

    #[tokio::test]
    async fn test_handshake_then_heartbeats() {
        let (mut overseer, task) = connect(&manager());
        assert_eq!(
            overseer.recv().await,
            Some((CONTROL_CHANNEL, Payload::handshake("w1")))
        );
        for _ in 0..2 {
            assert_eq!(
                overseer.recv().await,
                Some((CONTROL_CHANNEL, Payload::heartbeat()))
            );
        }

        overseer.terminate().await;
        let termination = task.await.expect("join").expect("terminated");
        assert_eq!(termination.code, TerminateCode::TerminateNormal);
        assert_eq!(termination.reason, "despawn");
        assert_eq!(overseer.recv().await, None);
    }

    #[tokio::test]
    async fn test_invoke_streams_response() {
        let (mut overseer, task) = connect(&manager());
        overseer.expect_handshake().await;

        overseer.send(INVOKE_CHANNEL, Payload::invoke("echo")).await;
        overseer.send(INVOKE_CHANNEL, Payload::chunk(b"a".to_vec())).await;
        overseer.send(INVOKE_CHANNEL, Payload::chunk(b"b".to_vec())).await;
        overseer.send(INVOKE_CHANNEL, Payload::choke()).await;

        assert_eq!(overseer.expect().await, (INVOKE_CHANNEL, Payload::chunk(b"a".to_vec())));
        assert_eq!(overseer.expect().await, (INVOKE_CHANNEL, Payload::chunk(b"b".to_vec())));
        assert_eq!(overseer.expect().await, (INVOKE_CHANNEL, Payload::choke()));

        overseer.terminate().await;
        task.await.expect("join").expect("terminated");
    }

    #[tokio::test]
    async fn test_concurrent_invokes_keep_channels_apart() {
        let (mut overseer, task) = connect(&manager());
        overseer.expect_handshake().await;

        let second = INVOKE_CHANNEL + 1;
        overseer.send(INVOKE_CHANNEL, Payload::invoke("uppercase")).await;
        overseer.send(second, Payload::invoke("uppercase")).await;
        overseer.send(second, Payload::chunk(b"two".to_vec())).await;
        overseer.send(INVOKE_CHANNEL, Payload::chunk(b"one".to_vec())).await;
        overseer.send(second, Payload::choke()).await;
        overseer.send(INVOKE_CHANNEL, Payload::choke()).await;

        let mut answers = HashMap::new();
        while answers.len() < 2 {
            let (channel, payload) = overseer.expect().await;
            if let Payload::Chunk(chunk) = payload {
                answers.insert(channel, chunk.data);
            }
        }
        assert_eq!(answers[&INVOKE_CHANNEL], b"ONE");
        assert_eq!(answers[&second], b"TWO");

        overseer.terminate().await;
        task.await.expect("join").expect("terminated");
    }

    #[tokio::test]
    async fn test_unknown_event_is_not_implemented() {
        let (mut overseer, task) = connect(&manager());
        overseer.expect_handshake().await;

        overseer.send(INVOKE_CHANNEL, Payload::invoke("resize")).await;
        overseer.send(INVOKE_CHANNEL, Payload::choke()).await;
        let (channel, payload) = overseer.expect().await;
        assert_eq!(channel, INVOKE_CHANNEL);
        assert_error(payload, error_code::NOT_IMPLEMENTED);

        overseer.terminate().await;
        task.await.expect("join").expect("terminated");
    }

    #[tokio::test]
    async fn test_cancel_while_collecting() {
        let (mut overseer, task) = connect(&manager());
        overseer.expect_handshake().await;

        overseer.send(INVOKE_CHANNEL, Payload::invoke("echo")).await;
        overseer.send(INVOKE_CHANNEL, Payload::chunk(b"a".to_vec())).await;
        overseer
            .send(INVOKE_CHANNEL, Payload::error(error_code::CANCELLED, "client left"))
            .await;

        let (channel, payload) = overseer.expect().await;
        assert_eq!(channel, INVOKE_CHANNEL);
        assert_error(payload, error_code::CANCELLED);

        overseer.terminate().await;
        task.await.expect("join").expect("terminated");
    }

    #[tokio::test]
    async fn test_cancel_aborts_running_handler() {
        let (mut overseer, task) = connect(&manager());
        overseer.expect_handshake().await;

        overseer.send(INVOKE_CHANNEL, Payload::invoke("stall")).await;
        overseer.send(INVOKE_CHANNEL, Payload::choke()).await;
        overseer
            .send(INVOKE_CHANNEL, Payload::error(error_code::CANCELLED, "client left"))
            .await;

        let (channel, payload) = overseer.expect().await;
        assert_eq!(channel, INVOKE_CHANNEL);
        assert_error(payload, error_code::CANCELLED);

        // The channel is free again
        overseer.send(INVOKE_CHANNEL, Payload::invoke("ping")).await;
        overseer.send(INVOKE_CHANNEL, Payload::choke()).await;
        assert_eq!(
            overseer.expect().await,
            (INVOKE_CHANNEL, Payload::chunk(b"pong from w1".to_vec()))
        );

        overseer.terminate().await;
        task.await.expect("join").expect("terminated");
    }

    #[tokio::test]
    async fn test_control_error_ends_connection() {
        let (mut overseer, task) = connect(&manager());
        overseer.expect_handshake().await;
        overseer
            .send(
                CONTROL_CHANNEL,
                Payload::error(error_code::PROTOCOL_VIOLATION, "unknown drone"),
            )
            .await;

        let err = task.await.expect("join").expect_err("connection should fail");
        assert!(err.to_string().contains("unknown drone"));
    }

    #[tokio::test]
    async fn test_closed_connection_is_an_error() {
        let (mut overseer, task) = connect(&manager());
        overseer.expect_handshake().await;
        drop(overseer);
        assert!(task.await.expect("join").is_err());
    }

    /// Connector handing out prepared streams; `None` fails the attempt
    struct ScriptedConnector {
        script: Mutex<VecDeque<Option<DuplexStream>>>,
        attempts: AtomicUsize,
    }

    impl ScriptedConnector {
        fn new(script: Vec<Option<DuplexStream>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                attempts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TransportConnector for ScriptedConnector {
        type Stream = DuplexStream;

        async fn connect(&self) -> Result<Self::Stream> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().expect("script lock").pop_front().flatten();
            next.ok_or_else(|| anyhow!("connection refused"))
        }

        fn name(&self) -> &'static str {
            "scripted"
        }

        fn endpoint(&self) -> String {
            "memory".into()
        }
    }

    #[tokio::test]
    async fn test_run_reconnects_with_same_identity() {
        let (first, first_remote) = tokio::io::duplex(64 * 1024);
        let (second, second_remote) = tokio::io::duplex(64 * 1024);
        let connector = Arc::new(ScriptedConnector::new(vec![None, Some(first), Some(second)]));

        let manager = manager();
        let run = {
            let connector = connector.clone();
            tokio::spawn(async move { manager.run(connector.as_ref()).await })
        };

        let mut overseer = FakeOverseer::new(first_remote);
        overseer.expect_handshake().await;
        drop(overseer);

        let mut overseer = FakeOverseer::new(second_remote);
        overseer.expect_handshake().await;
        overseer.terminate().await;

        let termination = run.await.expect("join").expect("terminated");
        assert_eq!(termination.reason, "despawn");
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_reattach_window() {
        let connector = ScriptedConnector::new(Vec::new());
        let err = manager().run(&connector).await.expect_err("nobody listens");
        assert!(err.to_string().contains("giving up"));
        assert!(connector.attempts.load(Ordering::SeqCst) > 1);
    }
}
