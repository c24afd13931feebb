//! Individual session handling

use crate::dispatch::{Dispatch, Outcome};
use crate::error::SessionError;
use hive_shared::{codec::{self, FrameDecoder}, Envelope, Payload, OUTBOUND_CHANNEL_BASE};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Dispatches installed on a session
#[derive(Default)]
struct ChannelTable {
    /// Handles the first message of channels the peer opens
    root: Option<Arc<dyn Dispatch>>,
    channels: HashMap<u64, Arc<dyn Dispatch>>,
    closed: bool,
}

struct Shared {
    id: u64,
    peer: String,
    outbound: mpsc::UnboundedSender<Envelope>,
    table: Mutex<ChannelTable>,
    next_channel: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// Cloneable handle to a session
///
/// Holding a handle does not keep the connection open; once the session
/// ends every send fails with [`SessionError::Closed`].
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer)
            .finish()
    }
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// Queue an envelope for the writer task
    pub fn send(&self, envelope: Envelope) -> Result<(), SessionError> {
        self.shared
            .outbound
            .send(envelope)
            .map_err(|_| SessionError::Closed)
    }

    /// Reply path for one channel of this session
    pub fn upstream(&self, channel_id: u64) -> Upstream {
        Upstream {
            session: self.clone(),
            channel_id,
        }
    }

    /// Allocate a channel id for a stream opened from this side
    pub fn open_channel(&self) -> u64 {
        OUTBOUND_CHANNEL_BASE + self.shared.next_channel.fetch_add(1, Ordering::SeqCst)
    }

    /// Install the dispatch that receives channels opened by the peer
    pub async fn inject(&self, dispatch: Arc<dyn Dispatch>) -> Result<(), SessionError> {
        let mut table = self.shared.table.lock().await;
        if table.closed {
            return Err(SessionError::Closed);
        }
        debug!("[SESSION {}] injecting {}", self.shared.id, dispatch.name());
        table.root = Some(dispatch);
        Ok(())
    }

    /// Route all further messages on `channel_id` to `dispatch`
    pub async fn install(
        &self,
        channel_id: u64,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<(), SessionError> {
        let mut table = self.shared.table.lock().await;
        if table.closed {
            return Err(SessionError::Closed);
        }
        table.channels.insert(channel_id, dispatch);
        Ok(())
    }

    /// Ask the session to shut down; installed dispatches are discarded
    pub fn close(&self) {
        let _ = self.shared.shutdown.send(true);
    }

    pub async fn is_closed(&self) -> bool {
        self.shared.table.lock().await.closed
    }

    /// Number of channels with an installed dispatch
    pub async fn channel_count(&self) -> usize {
        self.shared.table.lock().await.channels.len()
    }

    async fn lookup(&self, channel_id: u64) -> Option<(Arc<dyn Dispatch>, bool)> {
        let table = self.shared.table.lock().await;
        if let Some(dispatch) = table.channels.get(&channel_id) {
            return Some((dispatch.clone(), false));
        }
        table.root.clone().map(|root| (root, true))
    }

    async fn retire_root(&self) {
        self.shared.table.lock().await.root = None;
    }

    async fn finish(&self, channel_id: u64) {
        self.shared.table.lock().await.channels.remove(&channel_id);
    }

    /// Mark closed and hand back everything still installed
    async fn teardown(&self) -> Vec<Arc<dyn Dispatch>> {
        let mut table = self.shared.table.lock().await;
        table.closed = true;
        let mut dispatches: Vec<_> = table.channels.drain().map(|(_, d)| d).collect();
        dispatches.extend(table.root.take());
        dispatches
    }
}

/// Reply path for one stream: a session plus the channel to write on
#[derive(Clone, Debug)]
pub struct Upstream {
    session: SessionHandle,
    channel_id: u64,
}

impl Upstream {
    pub fn send(&self, payload: Payload) -> Result<(), SessionError> {
        self.session.send(Envelope::new(self.channel_id, payload))
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }
}

/// Active session over one accepted connection
pub struct Session<S> {
    handle: SessionHandle,
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    outbound_rx: mpsc::UnboundedReceiver<Envelope>,
    shutdown_rx: watch::Receiver<bool>,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a connection. Inject a root dispatch through the returned
    /// handle before calling [`Session::run`].
    pub fn new(stream: S, peer: impl Into<String>) -> (SessionHandle, Self) {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = SessionHandle {
            shared: Arc::new(Shared {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                peer: peer.into(),
                outbound: outbound_tx,
                table: Mutex::new(ChannelTable::default()),
                next_channel: AtomicU64::new(0),
                shutdown: shutdown_tx,
            }),
        };

        let session = Self {
            handle: handle.clone(),
            reader,
            writer,
            outbound_rx,
            shutdown_rx,
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; 4096],
        };
        (handle, session)
    }

    /// Drive the session until either side closes it
    pub async fn run(self) {
        let Session {
            handle,
            mut reader,
            writer,
            outbound_rx,
            mut shutdown_rx,
            mut decoder,
            mut read_buf,
        } = self;

        let id = handle.id();
        let writer_task = tokio::spawn(write_loop(
            id,
            writer,
            outbound_rx,
            shutdown_rx.clone(),
        ));

        let reason = read_loop(
            &handle,
            &mut reader,
            &mut decoder,
            &mut read_buf,
            &mut shutdown_rx,
        )
        .await;
        debug!("[SESSION {}] {} closing: {}", id, handle.peer(), reason);

        for dispatch in handle.teardown().await {
            dispatch.discard(&reason).await;
        }

        handle.close();
        let _ = writer_task.await;
    }
}

enum Flow {
    Continue,
    Stop(String),
}

async fn read_loop<R: AsyncRead + Unpin>(
    handle: &SessionHandle,
    reader: &mut R,
    decoder: &mut FrameDecoder,
    read_buf: &mut [u8],
    shutdown_rx: &mut watch::Receiver<bool>,
) -> String {
    loop {
        // First drain every complete frame already buffered
        loop {
            match decoder.decode_next() {
                Ok(Some(envelope)) => {
                    if let Flow::Stop(reason) = route(handle, envelope).await {
                        return reason;
                    }
                }
                Ok(None) => break,
                Err(e) => return format!("decode error: {}", e),
            }
        }

        if *shutdown_rx.borrow() {
            return "closed locally".into();
        }

        tokio::select! {
            _ = shutdown_rx.changed() => return "closed locally".into(),
            result = reader.read(read_buf) => match result {
                Ok(0) => return "peer closed connection".into(),
                Ok(n) => decoder.extend(&read_buf[..n]),
                Err(e) => return format!("read error: {}", e),
            },
        }
    }
}

async fn route(handle: &SessionHandle, envelope: Envelope) -> Flow {
    let Some(channel_id) = envelope.channel_id() else {
        return Flow::Stop("envelope without header".into());
    };
    let Some(payload) = envelope.payload else {
        debug!("[SESSION {}] empty envelope on channel {}", handle.id(), channel_id);
        return Flow::Continue;
    };

    let Some((dispatch, is_root)) = handle.lookup(channel_id).await else {
        debug!(
            "[SESSION {}] dropping {:?} on unknown channel {}",
            handle.id(),
            payload.message_type(),
            channel_id
        );
        return Flow::Continue;
    };

    match dispatch.process(payload, handle.upstream(channel_id)).await {
        Ok(Outcome::Continue) => Flow::Continue,
        Ok(Outcome::Switch(next)) => {
            debug!(
                "[SESSION {}] channel {}: {} -> {}",
                handle.id(),
                channel_id,
                dispatch.name(),
                next.name()
            );
            if is_root && dispatch.transient() {
                handle.retire_root().await;
            }
            if let Err(e) = handle.install(channel_id, next.clone()).await {
                next.discard(&e.to_string()).await;
                return Flow::Stop("closed while switching dispatch".into());
            }
            Flow::Continue
        }
        Ok(Outcome::Finish) => {
            handle.finish(channel_id).await;
            Flow::Continue
        }
        Ok(Outcome::Close) => Flow::Stop(format!("{} closed the connection", dispatch.name())),
        Err(e) => {
            warn!("[SESSION {}] {}: {}", handle.id(), dispatch.name(), e);
            Flow::Stop(e.to_string())
        }
    }
}

async fn write_loop<W: AsyncWrite>(
    id: u64,
    mut writer: WriteHalf<W>,
    mut outbound_rx: mpsc::UnboundedReceiver<Envelope>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let envelope = tokio::select! {
            // Drain queued messages before honouring shutdown
            biased;
            Some(envelope) = outbound_rx.recv() => envelope,
            _ = shutdown_rx.changed() => break,
            else => break,
        };

        if let Err(e) = write_envelope(&mut writer, &envelope).await {
            warn!("[SESSION {}] write failed: {}", id, e);
            break;
        }
    }

    // Flush what was queued before the shutdown signal
    while let Ok(envelope) = outbound_rx.try_recv() {
        if write_envelope(&mut writer, &envelope).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_envelope<W: AsyncWrite>(
    writer: &mut WriteHalf<W>,
    envelope: &Envelope,
) -> Result<(), SessionError> {
    let frame = codec::encode(envelope)?;
    writer.write_all(&frame).await?;
    Ok(())
}
