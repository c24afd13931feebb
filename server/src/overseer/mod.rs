//! Overseer: supervises the drone pool of one application
//!
//! The pool and the pending request set live behind a single lock. Every
//! operation takes the lock once, decides, and releases it before doing any
//! I/O (sending terminate, starting processes, flushing queues). Spawn and
//! despawn deadlines are timer tasks that post back into an event loop, so
//! a timer never touches the pool directly and a stale one is recognized by
//! the lifecycle state it was armed for.

mod balancer;
pub(crate) mod pool;
mod watchdog;

pub use balancer::{Balancer, PoolStats, QueueBalancer, StaticBalancer};
pub use watchdog::Watchdog;

use crate::config::{OverseerConfig, TagPolicy};
use crate::dispatch::{ControlChannel, HandshakeDispatch, StreamingDispatch};
use crate::error::{IsolateError, OverseerError, QueueError, SessionError};
use crate::isolate::{Isolate, ProcessHandle};
use crate::session::{SessionHandle, Upstream};
use futures::future::join_all;
use hive_shared::state_machine::{DroneState, LifecycleEvent, Transition};
use hive_shared::{error_code, Payload, TerminateCode};
use pool::{Binding, DroneEntry, PendingRequest, Pool, RemovedDrone};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Extra time `shutdown` waits beyond the despawn timeout
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Deferred work posted back to the overseer
enum PoolEvent {
    /// The isolation backend finished starting a drone
    Launched {
        id: String,
        result: Result<Box<dyn ProcessHandle>, IsolateError>,
    },
    SpawnTimeout {
        id: String,
        epoch: u64,
    },
    DespawnTimeout {
        id: String,
    },
}

/// An entry taken out of the pool, with whatever has to be failed along
/// with it
struct Removal {
    drone: RemovedDrone,
    reason: &'static str,
    /// Code sent to clients whose requests were still running on the drone
    code: i32,
    /// Pending requests the drone was spawned for
    waiting: Vec<PendingRequest>,
}

pub struct Overseer {
    config: OverseerConfig,
    isolate: Arc<dyn Isolate>,
    balancer: Box<dyn Balancer>,
    pool: Mutex<Pool>,
    next_request: AtomicU64,
    closing: AtomicBool,
    /// Signalled whenever a removal leaves the pool empty
    emptied: Notify,
    events: mpsc::UnboundedSender<PoolEvent>,
    me: Weak<Overseer>,
}

impl Overseer {
    /// Create the overseer and start its event loop. Must be called from
    /// within a tokio runtime.
    pub fn new(
        config: OverseerConfig,
        isolate: Arc<dyn Isolate>,
        balancer: Box<dyn Balancer>,
    ) -> Arc<Self> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let overseer = Arc::new_cyclic(|me| Self {
            config,
            isolate,
            balancer,
            pool: Mutex::new(Pool::default()),
            next_request: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            emptied: Notify::new(),
            events,
            me: me.clone(),
        });
        tokio::spawn(run_events(Arc::downgrade(&overseer), events_rx));
        overseer
    }

    pub fn name(&self) -> &str {
        &self.config.app
    }

    pub fn config(&self) -> &OverseerConfig {
        &self.config
    }

    pub async fn pool_size(&self) -> usize {
        self.pool.lock().await.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.pool.lock().await.pending_len()
    }

    pub async fn stats(&self) -> PoolStats {
        self.pool.lock().await.stats(self.config.tag_policy)
    }

    pub async fn state_of(&self, id: &str) -> Option<DroneState> {
        self.pool.lock().await.get(id).map(DroneEntry::state)
    }

    /// Requests currently bound to drone `id`
    pub async fn load_of(&self, id: &str) -> Option<usize> {
        self.pool.lock().await.get(id).map(DroneEntry::load)
    }

    pub async fn drone_ids(&self) -> Vec<String> {
        self.pool.lock().await.ids()
    }

    // ---- drone lifecycle ----

    /// Ensure at least `count` live entries (bounded by the pool limit);
    /// returns the ids of the entries created
    pub async fn request_spawn(&self, count: usize) -> Vec<String> {
        if self.closing.load(Ordering::SeqCst) {
            return Vec::new();
        }

        let ids = {
            let mut pool = self.pool.lock().await;
            let room = self.config.pool_limit.saturating_sub(pool.len());
            let needed = count.saturating_sub(pool.live()).min(room);
            let mut ids: Vec<String> = (0..needed).map(|_| Uuid::new_v4().to_string()).collect();
            ids.retain(|id| pool.insert(DroneEntry::new(id.clone())));
            pool.assign_awaiting(&ids, self.config.tag_policy);
            ids
        };

        for id in &ids {
            info!("[OVERSEER] spawning drone {}", id);
            self.schedule(
                self.config.spawn_timeout,
                PoolEvent::SpawnTimeout {
                    id: id.clone(),
                    epoch: 0,
                },
            );
            self.launch(id.clone());
        }
        ids
    }

    /// Install the handshake handler on a fresh drone connection
    pub async fn attach(&self, session: &SessionHandle) -> Result<(), SessionError> {
        debug!("[OVERSEER] drone connection from {}", session.peer());
        session
            .inject(Arc::new(HandshakeDispatch::new(&self.config.app, self.me.clone())))
            .await
    }

    /// Accept or reject a drone presenting `peer_id`. On success the
    /// returned control channel takes over the connection.
    pub async fn handshake(&self, peer_id: &str, upstream: Upstream) -> Option<Arc<ControlChannel>> {
        let session = upstream.session().clone();
        let control = {
            let mut pool = self.pool.lock().await;
            let Some(entry) = pool.get_mut(peer_id) else {
                warn!(
                    "[OVERSEER] rejecting drone {} from {}: not spawned by this overseer",
                    peer_id,
                    session.peer()
                );
                return None;
            };
            match entry.process_event(LifecycleEvent::HandshakeAccepted) {
                Transition::Moved(DroneState::Attached) => {
                    let control = Arc::new(ControlChannel::new(
                        &self.config.app,
                        peer_id,
                        upstream,
                        self.me.clone(),
                    ));
                    entry.attach(control.clone(), session);
                    control
                }
                other => {
                    warn!("[OVERSEER] rejecting drone {}: {:?}", peer_id, other);
                    return None;
                }
            }
        };

        info!("[OVERSEER] drone {} attached", peer_id);
        self.rebalance().await;
        Some(control)
    }

    pub async fn heartbeat(&self, id: &str) {
        let mut pool = self.pool.lock().await;
        match pool.get_mut(id) {
            Some(entry) => entry.touch_heartbeat(),
            None => debug!("[OVERSEER] heartbeat from unknown drone {}", id),
        }
    }

    /// The drone sent terminate: an acknowledgement while draining, a
    /// request to be despawned otherwise
    pub async fn terminated(&self, id: &str) {
        if self.state_of(id).await == Some(DroneState::Attached) {
            info!("[OVERSEER] drone {} asked to be despawned", id);
            self.despawn(&[id.to_string()]).await;
            return;
        }
        if let Some(removal) = self.apply(id, LifecycleEvent::TerminateAcked, None).await {
            self.retire(removal, None).await;
        }
    }

    /// The control session of drone `id` ended
    pub async fn session_lost(&self, id: &str, session_id: u64, reason: &str) {
        enum Lost {
            Reattach(u64),
            Removed(Removal),
        }

        let lost = {
            let mut pool = self.pool.lock().await;
            let Some(entry) = pool.get_mut(id) else {
                return;
            };
            if entry.session().map(SessionHandle::id) != Some(session_id) {
                debug!("[OVERSEER] ignoring stale session {} of drone {}", session_id, id);
                return;
            }
            match entry.process_event(LifecycleEvent::SessionLost) {
                Transition::Moved(_) => {
                    entry.detach();
                    Lost::Reattach(entry.epoch())
                }
                Transition::Remove { reason } => match pool.remove(id) {
                    Some(entry) => Lost::Removed(Removal {
                        drone: entry.into_parts(),
                        reason,
                        code: error_code::DRONE_TERMINATED,
                        waiting: Vec::new(),
                    }),
                    None => return,
                },
                Transition::Invalid { .. } => return,
            }
        };

        match lost {
            Lost::Reattach(epoch) => {
                warn!(
                    "[OVERSEER] drone {} lost its session ({}), waiting {:?} for it to reconnect",
                    id, reason, self.config.spawn_timeout
                );
                self.schedule(
                    self.config.spawn_timeout,
                    PoolEvent::SpawnTimeout {
                        id: id.to_string(),
                        epoch,
                    },
                );
            }
            Lost::Removed(removal) => self.retire(removal, None).await,
        }
    }

    /// Start draining the given drones: no new work, terminate sent,
    /// removal on acknowledgement or after the despawn timeout
    pub async fn despawn(&self, ids: &[String]) {
        for id in ids {
            let control = {
                let mut pool = self.pool.lock().await;
                let Some(entry) = pool.get_mut(id) else {
                    continue;
                };
                if entry.state() == DroneState::Draining {
                    continue;
                }
                match entry.process_event(LifecycleEvent::DespawnRequested) {
                    Transition::Moved(_) => entry.control(),
                    _ => continue,
                }
            };

            info!("[OVERSEER] despawning drone {}", id);
            if let Some(control) = control {
                if let Err(e) = control.terminate(TerminateCode::TerminateNormal, "despawn") {
                    debug!("[OVERSEER] could not send terminate to drone {}: {}", id, e);
                }
            }
            self.schedule(
                self.config.despawn_timeout,
                PoolEvent::DespawnTimeout { id: id.clone() },
            );
        }
    }

    /// Grow to `count` live drones, or retire idle drones down to it. The
    /// balancer is told the new size so it does not undo the change.
    pub async fn rebalance_to(&self, count: usize) {
        self.balancer.resize(count);
        let victims = {
            let pool = self.pool.lock().await;
            let live = pool.live();
            (live > count).then(|| pool.idle_victims(live - count))
        };
        match victims {
            Some(ids) => self.despawn(&ids).await,
            None => {
                self.request_spawn(count).await;
            }
        }
    }

    /// Force out drones that stopped heartbeating, expire requests that
    /// waited too long and let the balancer refill the pool
    pub async fn check_deadlines(&self) {
        let now = Instant::now();
        let (dead, expired) = {
            let mut pool = self.pool.lock().await;
            let mut dead = Vec::new();
            for id in pool.silent(now, self.config.heartbeat_timeout) {
                let Some(entry) = pool.get_mut(&id) else {
                    continue;
                };
                if let Transition::Remove { reason } =
                    entry.process_event(LifecycleEvent::HeartbeatTimeout)
                {
                    if let Some(entry) = pool.remove(&id) {
                        dead.push(Removal {
                            drone: entry.into_parts(),
                            reason,
                            code: error_code::DRONE_LOST,
                            waiting: Vec::new(),
                        });
                    }
                }
            }
            (dead, pool.take_expired(now, self.config.pending_timeout))
        };

        for removal in &dead {
            warn!("[OVERSEER] drone {} missed its heartbeat deadline", removal.drone.id);
        }
        join_all(dead.into_iter().map(|r| self.release_drone(r.drone, r.reason, r.code))).await;

        if !expired.is_empty() {
            info!("[OVERSEER] {} pending requests expired", expired.len());
            fail_requests(expired, &OverseerError::RequestTimeout).await;
        }
        self.rebalance().await;
    }

    /// Refuse new work, fail pending requests and despawn every drone.
    /// Returns true if the pool emptied in time.
    pub async fn shutdown(&self) -> bool {
        self.closing.store(true, Ordering::SeqCst);
        let (ids, pending) = {
            let mut pool = self.pool.lock().await;
            (pool.ids(), pool.drain_pending())
        };
        info!(
            "[OVERSEER] shutting down: {} drones, {} pending requests",
            ids.len(),
            pending.len()
        );
        fail_requests(pending, &OverseerError::ShuttingDown).await;
        self.despawn(&ids).await;

        let drained = async {
            loop {
                let emptied = self.emptied.notified();
                tokio::pin!(emptied);
                emptied.as_mut().enable();
                if self.pool.lock().await.is_empty() {
                    break;
                }
                emptied.await;
            }
        };
        tokio::time::timeout(self.config.despawn_timeout + SHUTDOWN_GRACE, drained)
            .await
            .is_ok()
    }

    // ---- request routing ----

    /// Route a client request. Returns the handler for the rest of the
    /// client's request stream; the request is either bound to a drone or
    /// queued until one is available.
    pub async fn enqueue(
        &self,
        client: Upstream,
        event: &str,
        tag: &str,
    ) -> Result<Arc<StreamingDispatch>, OverseerError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(OverseerError::ShuttingDown);
        }

        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let app = &self.config.app;
        let request = Arc::new(StreamingDispatch::request(app, request_id, self.me.clone()));
        let response = Arc::new(StreamingDispatch::response(
            app,
            request_id,
            client,
            self.me.clone(),
        ));
        let pending = PendingRequest::new(request_id, event, tag, request.clone(), response.clone());
        let policy = self.config.tag_policy;

        let binding = {
            let mut pool = self.pool.lock().await;
            if let Some((drone_id, session)) =
                pool.claim(tag, request_id, &response, policy, self.config.drone_concurrency)
            {
                Some(Binding {
                    drone_id,
                    session,
                    request: pending,
                })
            } else if !tag.is_empty()
                && policy == TagPolicy::Strict
                && !pool.serves_tag(tag)
            {
                return Err(OverseerError::NotImplemented {
                    tag: tag.to_string(),
                });
            } else if pool.pending_len() >= self.config.queue_limit {
                return Err(OverseerError::QueueFull {
                    limit: self.config.queue_limit,
                });
            } else {
                pool.push_pending(pending);
                debug!(
                    "[OVERSEER] request {} '{}' queued, {} waiting",
                    request_id,
                    event,
                    pool.pending_len()
                );
                None
            }
        };

        match binding {
            Some(binding) => self.bind(binding).await,
            None => self.rebalance().await,
        }
        Ok(request)
    }

    /// Bind waiting requests to free drones, then let the balancer resize
    /// the pool
    pub async fn rebalance(&self) {
        self.rebalance_with(true).await;
    }

    async fn rebalance_with(&self, grow: bool) {
        let (bindings, stats) = {
            let mut pool = self.pool.lock().await;
            let bindings =
                pool.take_bindable(self.config.tag_policy, self.config.drone_concurrency);
            (bindings, pool.stats(self.config.tag_policy))
        };

        for binding in bindings {
            self.bind(binding).await;
        }

        let target = self.balancer.target(&stats);
        if grow && target > stats.live() {
            debug!("[OVERSEER] growing pool from {} to {}", stats.live(), target);
            self.request_spawn(target).await;
        }
    }

    /// A drone finished request `request_id`
    pub async fn release(&self, drone_id: &str, request_id: u64) {
        if self.unclaim(drone_id, request_id).await {
            debug!("[OVERSEER] drone {} finished request {}", drone_id, request_id);
            self.rebalance().await;
        }
    }

    /// The client of a pending request went away
    pub async fn cancel(&self, request_id: u64) {
        if self.pool.lock().await.take_pending(request_id).is_some() {
            debug!("[OVERSEER] request {} cancelled while pending", request_id);
        }
    }

    /// Wire a matched request to its drone: open a channel, send invoke,
    /// route the drone's replies to the client and flush the buffered body
    async fn bind(&self, binding: Binding) {
        let Binding {
            drone_id,
            session,
            request: pending,
        } = binding;
        let PendingRequest {
            id,
            event,
            request,
            response,
            ..
        } = pending;

        let channel = session.open_channel();
        response.assign(&drone_id);
        if let Err(e) = session.install(channel, response.clone()).await {
            warn!(
                "[OVERSEER] drone {} went away before request {} was bound: {}",
                drone_id, id, e
            );
            self.unclaim(&drone_id, id).await;
            let _ = response
                .error(error_code::DRONE_LOST, "drone went away before the request was bound")
                .await;
            request.cancel().await;
            return;
        }

        let upstream = session.upstream(channel);
        if let Err(e) = upstream.send(Payload::invoke(event.as_str())) {
            // The session is closing; its teardown fails the response side
            debug!("[OVERSEER] could not invoke '{}' on drone {}: {}", event, drone_id, e);
            request.cancel().await;
            return;
        }

        match request.bind(upstream.clone()).await {
            Ok(flushed) => debug!(
                "[OVERSEER] request {} '{}' bound to drone {} on channel {}, {} messages flushed",
                id, event, drone_id, channel, flushed
            ),
            Err(QueueError::Cancelled) => {
                debug!("[OVERSEER] request {} was cancelled before it was bound", id);
                let _ = upstream.send(Payload::error(error_code::CANCELLED, "client disconnected"));
            }
            Err(e) => debug!("[OVERSEER] request {} lost drone {} while binding: {}", id, drone_id, e),
        }
    }

    async fn unclaim(&self, drone_id: &str, request_id: u64) -> bool {
        let mut pool = self.pool.lock().await;
        pool.get_mut(drone_id)
            .map(|entry| entry.release(request_id))
            .unwrap_or(false)
    }

    // ---- deferred work ----

    fn schedule(&self, delay: Duration, event: PoolEvent) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
    }

    fn launch(&self, id: String) {
        let isolate = self.isolate.clone();
        let args = self.config.drone_args(&id);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = isolate.spawn(&id, &args).await;
            let _ = events.send(PoolEvent::Launched { id, result });
        });
    }

    async fn handle_event(&self, event: PoolEvent) {
        match event {
            PoolEvent::Launched { id, result } => self.launched(id, result).await,
            PoolEvent::SpawnTimeout { id, epoch } => {
                if let Some(removal) = self.apply(&id, LifecycleEvent::SpawnTimeout, Some(epoch)).await {
                    warn!("[OVERSEER] drone {} did not hand-shake in time", id);
                    self.retire(removal, Some(OverseerError::SpawnTimeout { id })).await;
                }
            }
            PoolEvent::DespawnTimeout { id } => {
                if let Some(removal) = self.apply(&id, LifecycleEvent::DespawnTimeout, None).await {
                    warn!("[OVERSEER] drone {} did not acknowledge terminate, forcing removal", id);
                    self.retire(removal, None).await;
                }
            }
        }
    }

    async fn launched(&self, id: String, result: Result<Box<dyn ProcessHandle>, IsolateError>) {
        match result {
            Ok(process) => {
                debug!("[OVERSEER] drone {} started, pid={:?}", id, process.pid());
                let orphan = {
                    let mut pool = self.pool.lock().await;
                    match pool.get_mut(&id) {
                        Some(entry) => {
                            entry.set_process(process);
                            None
                        }
                        None => Some(process),
                    }
                };
                if let Some(process) = orphan {
                    debug!("[OVERSEER] drone {} was removed before its process started", id);
                    process.release().await;
                }
            }
            Err(e) => {
                error!("[OVERSEER] failed to start drone {}: {}", id, e);
                if let Some(removal) = self.apply(&id, LifecycleEvent::SpawnFailed, None).await {
                    let failure = OverseerError::SpawnFailed {
                        id,
                        reason: e.to_string(),
                    };
                    self.retire(removal, Some(failure)).await;
                }
            }
        }
    }

    /// Feed a lifecycle event to entry `id`; returns the entry if the event
    /// ends its life. `epoch` guards timers armed for an earlier spawn window.
    async fn apply(&self, id: &str, event: LifecycleEvent, epoch: Option<u64>) -> Option<Removal> {
        let mut pool = self.pool.lock().await;
        let entry = pool.get_mut(id)?;
        if epoch.is_some_and(|epoch| epoch != entry.epoch()) {
            debug!("[OVERSEER] stale {:?} for drone {}", event, id);
            return None;
        }

        match entry.process_event(event) {
            Transition::Remove { reason } => {
                let waiting = match event {
                    LifecycleEvent::SpawnFailed | LifecycleEvent::SpawnTimeout => {
                        pool.take_awaiting(id)
                    }
                    _ => Vec::new(),
                };
                let drone = pool.remove(id)?.into_parts();
                Some(Removal {
                    drone,
                    reason,
                    code: error_code::DRONE_TERMINATED,
                    waiting,
                })
            }
            Transition::Moved(state) => {
                debug!("[OVERSEER] drone {} is now {}", id, state);
                None
            }
            Transition::Invalid { from, event } => {
                debug!("[OVERSEER] ignoring {:?} for drone {} while {}", event, id, from);
                None
            }
        }
    }

    /// Tear down a removed entry, fail the requests it was spawned for and
    /// rebalance
    async fn retire(&self, removal: Removal, failure: Option<OverseerError>) {
        let Removal {
            drone,
            reason,
            code,
            waiting,
        } = removal;
        self.release_drone(drone, reason, code).await;
        // A drone that failed to start is replaced on the next deadline
        // check, not in a tight loop here
        let grow = failure.is_none();
        if let Some(failure) = failure {
            fail_requests(waiting, &failure).await;
        }
        self.rebalance_with(grow).await;
    }

    /// Fail the drone's running requests, close its session and release
    /// its process
    async fn release_drone(&self, drone: RemovedDrone, reason: &str, code: i32) {
        let RemovedDrone {
            id,
            process,
            session,
            inflight,
        } = drone;
        info!("[OVERSEER] removing drone {}: {}", id, reason);

        for response in inflight {
            if !response.is_closed().await {
                let _ = response
                    .error(code, &format!("drone {} removed: {}", id, reason))
                    .await;
            }
        }
        if let Some(session) = session {
            session.close();
        }
        if let Some(process) = process {
            process.release().await;
        }
        if self.pool.lock().await.is_empty() {
            self.emptied.notify_waiters();
        }
    }
}

async fn run_events(overseer: Weak<Overseer>, mut events: mpsc::UnboundedReceiver<PoolEvent>) {
    while let Some(event) = events.recv().await {
        let Some(overseer) = overseer.upgrade() else {
            break;
        };
        overseer.handle_event(event).await;
    }
}

/// Report `failure` to every request's client and drop the request bodies
async fn fail_requests(requests: Vec<PendingRequest>, failure: &OverseerError) {
    for request in requests {
        debug!("[OVERSEER] failing request {}: {}", request.id, failure);
        let _ = request
            .response
            .error(failure.code(), &failure.to_string())
            .await;
        request.request.cancel().await;
    }
}
