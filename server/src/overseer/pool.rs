//! Pool table and pending request set
//!
//! Plain data guarded by the overseer's lock. Nothing here awaits or talks
//! to the network; the overseer applies the side effects after unlocking.

use super::balancer::PoolStats;
use crate::config::TagPolicy;
use crate::dispatch::{ControlChannel, StreamingDispatch};
use crate::isolate::ProcessHandle;
use crate::session::SessionHandle;
use hive_shared::state_machine::{DroneLifecycle, DroneState, LifecycleEvent, Transition};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One drone slot, from spawn request until removal
pub struct DroneEntry {
    id: String,
    lifecycle: DroneLifecycle,
    process: Option<Box<dyn ProcessHandle>>,
    control: Option<Arc<ControlChannel>>,
    session: Option<SessionHandle>,
    /// Response side of every request bound to this drone
    inflight: HashMap<u64, Arc<StreamingDispatch>>,
    last_used: Instant,
    last_heartbeat: Instant,
    tags: HashSet<String>,
}

impl DroneEntry {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            lifecycle: DroneLifecycle::new(),
            process: None,
            control: None,
            session: None,
            inflight: HashMap::new(),
            last_used: now,
            last_heartbeat: now,
            tags: HashSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> DroneState {
        self.lifecycle.state()
    }

    pub fn epoch(&self) -> u64 {
        self.lifecycle.epoch()
    }

    pub fn process_event(&mut self, event: LifecycleEvent) -> Transition {
        self.lifecycle.process_event(event)
    }

    pub fn load(&self) -> usize {
        self.inflight.len()
    }

    pub fn tags(&self) -> &HashSet<String> {
        &self.tags
    }

    pub fn control(&self) -> Option<Arc<ControlChannel>> {
        self.control.clone()
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }

    pub fn set_process(&mut self, process: Box<dyn ProcessHandle>) {
        self.process = Some(process);
    }

    /// Record the control channel and session of an accepted handshake
    pub fn attach(&mut self, control: Arc<ControlChannel>, session: SessionHandle) {
        self.control = Some(control);
        self.session = Some(session);
        self.last_heartbeat = Instant::now();
    }

    /// Forget the lost session; the drone may reconnect
    pub fn detach(&mut self) {
        self.control = None;
        self.session = None;
    }

    pub fn touch_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    fn is_eligible(&self, concurrency: usize) -> bool {
        self.lifecycle.accepts_work() && self.session.is_some() && self.load() < concurrency
    }

    fn is_live(&self) -> bool {
        matches!(self.state(), DroneState::Spawning | DroneState::Attached)
    }

    /// Take one request slot
    fn claim(&mut self, tag: &str, request_id: u64, response: Arc<StreamingDispatch>) {
        self.inflight.insert(request_id, response);
        self.last_used = Instant::now();
        if !tag.is_empty() {
            self.tags.insert(tag.to_string());
        }
    }

    /// Free the slot of `request_id`; false if it was not bound here
    pub fn release(&mut self, request_id: u64) -> bool {
        let released = self.inflight.remove(&request_id).is_some();
        if released {
            self.last_used = Instant::now();
        }
        released
    }

    /// Split the entry into what has to be torn down outside the lock
    pub fn into_parts(self) -> RemovedDrone {
        RemovedDrone {
            id: self.id,
            process: self.process,
            session: self.session,
            inflight: self.inflight.into_values().collect(),
        }
    }
}

/// Resources of an entry taken out of the pool
pub struct RemovedDrone {
    pub id: String,
    pub process: Option<Box<dyn ProcessHandle>>,
    pub session: Option<SessionHandle>,
    pub inflight: Vec<Arc<StreamingDispatch>>,
}

/// A request waiting for a drone
pub struct PendingRequest {
    pub id: u64,
    pub event: String,
    pub tag: String,
    pub queued_at: Instant,
    /// Spawning drone that was started on this request's behalf
    pub awaiting: Option<String>,
    pub request: Arc<StreamingDispatch>,
    pub response: Arc<StreamingDispatch>,
}

impl PendingRequest {
    pub fn new(
        id: u64,
        event: &str,
        tag: &str,
        request: Arc<StreamingDispatch>,
        response: Arc<StreamingDispatch>,
    ) -> Self {
        Self {
            id,
            event: event.to_string(),
            tag: tag.to_string(),
            queued_at: Instant::now(),
            awaiting: None,
            request,
            response,
        }
    }

    /// Whether a freshly spawned drone could take this request
    fn fits_new_drone(&self, policy: TagPolicy) -> bool {
        self.tag.is_empty() || policy == TagPolicy::Advisory
    }
}

/// A request matched to a drone, ready to be wired up
pub struct Binding {
    pub drone_id: String,
    pub session: SessionHandle,
    pub request: PendingRequest,
}

/// Entries plus the pending set, always mutated together
#[derive(Default)]
pub struct Pool {
    entries: HashMap<String, DroneEntry>,
    pending: VecDeque<PendingRequest>,
}

impl Pool {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries that are spawning or attached
    pub fn live(&self) -> usize {
        self.entries.values().filter(|e| e.is_live()).count()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&DroneEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut DroneEntry> {
        self.entries.get_mut(id)
    }

    /// Insert a new entry; false if the id is taken
    pub fn insert(&mut self, entry: DroneEntry) -> bool {
        if self.entries.contains_key(&entry.id) {
            return false;
        }
        self.entries.insert(entry.id.clone(), entry);
        true
    }

    /// Remove an entry; requests that were waiting on it become unassigned
    pub fn remove(&mut self, id: &str) -> Option<DroneEntry> {
        let entry = self.entries.remove(id)?;
        for request in self.pending.iter_mut() {
            if request.awaiting.as_deref() == Some(id) {
                request.awaiting = None;
            }
        }
        Some(entry)
    }

    /// Whether any live entry has served `tag`
    pub fn serves_tag(&self, tag: &str) -> bool {
        self.entries
            .values()
            .any(|e| e.is_live() && e.tags.contains(tag))
    }

    /// Pick the drone for a request: least recently used among eligible
    /// entries, restricted to tagged entries as the policy demands
    pub fn select(&self, tag: &str, policy: TagPolicy, concurrency: usize) -> Option<&str> {
        let eligible = || self.entries.values().filter(|e| e.is_eligible(concurrency));
        if tag.is_empty() {
            return least_recently_used(eligible()).map(DroneEntry::id);
        }

        let tagged = least_recently_used(eligible().filter(|e| e.tags.contains(tag)));
        match (tagged, policy) {
            (Some(entry), _) => Some(entry.id()),
            (None, TagPolicy::Advisory) => least_recently_used(eligible()).map(DroneEntry::id),
            (None, TagPolicy::Strict) => None,
        }
    }

    /// Select a drone and take a slot on it for `response`
    pub fn claim(
        &mut self,
        tag: &str,
        request_id: u64,
        response: &Arc<StreamingDispatch>,
        policy: TagPolicy,
        concurrency: usize,
    ) -> Option<(String, SessionHandle)> {
        let id = self.select(tag, policy, concurrency)?.to_string();
        let entry = self.entries.get_mut(&id)?;
        let session = entry.session.clone()?;
        entry.claim(tag, request_id, response.clone());
        Some((id, session))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn push_pending(&mut self, request: PendingRequest) {
        self.pending.push_back(request);
    }

    /// Remove a pending request by id
    pub fn take_pending(&mut self, request_id: u64) -> Option<PendingRequest> {
        let index = self.pending.iter().position(|r| r.id == request_id)?;
        self.pending.remove(index)
    }

    /// Match pending requests to eligible drones, oldest first
    pub fn take_bindable(&mut self, policy: TagPolicy, concurrency: usize) -> Vec<Binding> {
        let mut bindings = Vec::new();
        let mut index = 0;
        while index < self.pending.len() {
            let (tag, id, response) = {
                let request = &self.pending[index];
                (request.tag.clone(), request.id, request.response.clone())
            };
            match self.claim(&tag, id, &response, policy, concurrency) {
                Some((drone_id, session)) => {
                    if let Some(request) = self.pending.remove(index) {
                        bindings.push(Binding {
                            drone_id,
                            session,
                            request,
                        });
                    }
                }
                None => index += 1,
            }
        }
        bindings
    }

    /// Record that freshly spawned `ids` are meant for the oldest requests
    /// nobody is on the way to serve
    pub fn assign_awaiting(&mut self, ids: &[String], policy: TagPolicy) {
        let mut ids = ids.iter();
        for request in self.pending.iter_mut() {
            if request.awaiting.is_some() || !request.fits_new_drone(policy) {
                continue;
            }
            match ids.next() {
                Some(id) => request.awaiting = Some(id.clone()),
                None => break,
            }
        }
    }

    /// Remove the requests waiting on drone `id`
    pub fn take_awaiting(&mut self, id: &str) -> Vec<PendingRequest> {
        self.take_pending_where(|r| r.awaiting.as_deref() == Some(id))
    }

    /// Remove requests that have waited at least `timeout`
    pub fn take_expired(&mut self, now: Instant, timeout: Duration) -> Vec<PendingRequest> {
        self.take_pending_where(|r| now.saturating_duration_since(r.queued_at) >= timeout)
    }

    /// Remove every pending request
    pub fn drain_pending(&mut self) -> Vec<PendingRequest> {
        self.pending.drain(..).collect()
    }

    fn take_pending_where(&mut self, mut predicate: impl FnMut(&PendingRequest) -> bool) -> Vec<PendingRequest> {
        let (taken, kept): (Vec<_>, Vec<_>) = self.pending.drain(..).partition(|r| predicate(r));
        self.pending = kept.into();
        taken
    }

    /// Attached entries silent for longer than `timeout`
    pub fn silent(&self, now: Instant, timeout: Duration) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.state() == DroneState::Attached)
            .filter(|e| now.saturating_duration_since(e.last_heartbeat) > timeout)
            .map(|e| e.id.clone())
            .collect()
    }

    /// Up to `count` idle live entries to retire: spawning ones first, then
    /// the least recently used attached ones
    pub fn idle_victims(&self, count: usize) -> Vec<String> {
        let mut idle: Vec<&DroneEntry> = self
            .entries
            .values()
            .filter(|e| e.is_live() && e.load() == 0)
            .collect();
        idle.sort_by(|a, b| {
            let rank = |e: &DroneEntry| u8::from(e.state() == DroneState::Attached);
            rank(a)
                .cmp(&rank(b))
                .then_with(|| a.last_used.cmp(&b.last_used))
                .then_with(|| a.id.cmp(&b.id))
        });
        idle.into_iter().take(count).map(|e| e.id.clone()).collect()
    }

    pub fn stats(&self, policy: TagPolicy) -> PoolStats {
        let mut stats = PoolStats {
            pending: self.pending.len(),
            ..Default::default()
        };
        for entry in self.entries.values() {
            match entry.state() {
                DroneState::Spawning => stats.spawning += 1,
                DroneState::Attached => {
                    stats.attached += 1;
                    if entry.load() > 0 {
                        stats.busy += 1;
                    }
                }
                DroneState::Draining => stats.draining += 1,
                DroneState::Closed => {}
            }
        }
        stats.unassigned = self
            .pending
            .iter()
            .filter(|r| r.awaiting.is_none() && r.fits_new_drone(policy))
            .count();
        stats
    }
}

fn least_recently_used<'a>(entries: impl Iterator<Item = &'a DroneEntry>) -> Option<&'a DroneEntry> {
    entries.min_by(|a, b| a.last_used.cmp(&b.last_used).then_with(|| a.id.cmp(&b.id)))
}
