//! Helpers shared by the overseer's tests

use crate::config::OverseerConfig;
use crate::dispatch::{AppDispatch, ControlChannel, StreamingDispatch};
use crate::error::IsolateError;
use crate::isolate::{Isolate, ProcessHandle};
use crate::overseer::pool::{DroneEntry, PendingRequest};
use crate::overseer::{Balancer, Overseer, StaticBalancer};
use crate::session::{Session, SessionHandle, Upstream};
use async_trait::async_trait;
use hive_shared::codec::{self, FrameDecoder};
use hive_shared::state_machine::LifecycleEvent;
use hive_shared::{Envelope, Payload, CONTROL_CHANNEL};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Poll `$cond` until it holds, failing the test after a few seconds
macro_rules! wait_for {
    ($cond:expr) => {{
        let mut satisfied = false;
        for _ in 0..500 {
            if $cond {
                satisfied = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(satisfied, "condition never held: {}", stringify!($cond));
    }};
}
pub(crate) use wait_for;

/// Isolation backend that starts nothing and records what it was asked
#[derive(Default)]
pub struct FakeIsolate {
    spawned: Mutex<Vec<String>>,
    released: Arc<AtomicUsize>,
    fail: AtomicBool,
}

impl FakeIsolate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every later spawn fail
    pub fn fail_spawns(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn spawned(&self) -> Vec<String> {
        self.spawned.lock().expect("spawned lock").clone()
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Isolate for FakeIsolate {
    async fn spool(&self) -> Result<(), IsolateError> {
        Ok(())
    }

    async fn spawn(&self, id: &str, _args: &[String]) -> Result<Box<dyn ProcessHandle>, IsolateError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(IsolateError::Spawn {
                id: id.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no drone image"),
            });
        }
        self.spawned.lock().expect("spawned lock").push(id.to_string());
        Ok(Box::new(FakeProcess {
            released: self.released.clone(),
        }))
    }
}

struct FakeProcess {
    released: Arc<AtomicUsize>,
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn release(self: Box<Self>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn new_overseer(config: OverseerConfig, isolate: &Arc<FakeIsolate>) -> Arc<Overseer> {
    overseer_with(config, isolate, Box::new(StaticBalancer::new(0)))
}

pub fn overseer_with(
    config: OverseerConfig,
    isolate: &Arc<FakeIsolate>,
    balancer: Box<dyn Balancer>,
) -> Arc<Overseer> {
    Overseer::new(config, isolate.clone(), balancer)
}

/// Remote end of a session, speaking raw frames
pub struct Peer {
    pub handle: SessionHandle,
    stream: DuplexStream,
    decoder: FrameDecoder,
}

impl Peer {
    /// A peer connected to a session that has not started yet
    pub fn start(name: &str) -> (Self, Session<DuplexStream>) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (handle, session) = Session::new(local, name);
        let peer = Self {
            handle,
            stream: remote,
            decoder: FrameDecoder::new(),
        };
        (peer, session)
    }

    /// A connection accepted on the drone listener
    pub async fn drone(overseer: &Arc<Overseer>) -> Self {
        let (peer, session) = Self::start("drone");
        overseer.attach(&peer.handle).await.expect("attach");
        tokio::spawn(session.run());
        peer
    }

    /// A drone connection that has completed its handshake as `id`
    pub async fn attached_drone(overseer: &Arc<Overseer>, id: &str) -> Self {
        let mut peer = Self::drone(overseer).await;
        peer.send(CONTROL_CHANNEL, Payload::handshake(id)).await;
        let expected = Some(hive_shared::state_machine::DroneState::Attached);
        wait_for!(overseer.state_of(id).await == expected);
        peer
    }

    /// A connection accepted on the client listener
    pub async fn client(overseer: &Arc<Overseer>) -> Self {
        let (peer, session) = Self::start("client");
        peer.handle
            .inject(Arc::new(AppDispatch::new(overseer.clone())))
            .await
            .expect("inject");
        tokio::spawn(session.run());
        peer
    }

    pub async fn send(&mut self, channel: u64, payload: Payload) {
        let frame = codec::encode(&Envelope::new(channel, payload)).expect("encode");
        self.stream.write_all(&frame).await.expect("write");
    }

    /// Next envelope, or None once the overseer closed the connection
    pub async fn recv(&mut self) -> Option<Envelope> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(envelope) = self.decoder.decode_next().expect("decode") {
                return Some(envelope);
            }
            let read = tokio::time::timeout(Duration::from_secs(60), self.stream.read(&mut buf))
                .await
                .expect("peer waited too long");
            match read {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.decoder.extend(&buf[..n]),
            }
        }
    }

    /// Next message as (channel, payload)
    pub async fn expect(&mut self) -> (u64, Payload) {
        let envelope = self.recv().await.expect("connection closed");
        let channel = envelope.channel_id().expect("header");
        (channel, envelope.payload.expect("payload"))
    }
}

/// Client upstream on a session nobody reads
pub fn detached_upstream() -> Upstream {
    let (local, _remote) = tokio::io::duplex(1024);
    let (handle, _session) = Session::new(local, "detached");
    handle.upstream(1)
}

/// Pool entry that has completed a handshake
pub fn attached_entry(id: &str) -> DroneEntry {
    let (local, _remote) = tokio::io::duplex(1024);
    let (handle, _session) = Session::new(local, id);
    let control = Arc::new(ControlChannel::new(
        "test",
        id,
        handle.upstream(CONTROL_CHANNEL),
        Weak::new(),
    ));
    let mut entry = DroneEntry::new(id);
    entry.process_event(LifecycleEvent::HandshakeAccepted);
    entry.attach(control, handle);
    entry
}

pub fn pending_request(id: u64, event: &str, tag: &str) -> PendingRequest {
    let request = Arc::new(StreamingDispatch::request("test", id, Weak::new()));
    let response = Arc::new(StreamingDispatch::response(
        "test",
        id,
        detached_upstream(),
        Weak::new(),
    ));
    PendingRequest::new(id, event, tag, request, response)
}
