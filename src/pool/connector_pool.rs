//! Per-route pool of idle connector sockets with bounded waiting.
//!
//! # Responsibilities
//! - Keep idle sockets per route
//! - Queue acquisitions when no socket is idle and grant them in arrival order
//! - Fail queued acquisitions after the configured maximum wait
//! - Keep the shared route table in step with registered sockets

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::pool::socket::{PooledSocket, ProtocolVersion, SocketId};
use crate::routing::RouteTable;

/// Why a socket could not be handed out.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AcquireError {
    /// Route is known but no socket became available in time.
    #[error("no connector available for route '{route}' within {} ms", .waited.as_millis())]
    NoCapacity { route: String, waited: Duration },

    /// The pool has been shut down.
    #[error("connector pool is shut down")]
    Closed,
}

struct Waiter<S> {
    id: u64,
    tx: oneshot::Sender<Arc<S>>,
}

struct RouteEntry<S> {
    idle: VecDeque<Arc<S>>,
    waiters: VecDeque<Waiter<S>>,
    /// Every registered socket for the route, idle or borrowed.
    live: HashMap<SocketId, Arc<S>>,
}

impl<S> Default for RouteEntry<S> {
    fn default() -> Self {
        Self {
            idle: VecDeque::new(),
            waiters: VecDeque::new(),
            live: HashMap::new(),
        }
    }
}

impl<S> RouteEntry<S> {
    fn is_empty(&self) -> bool {
        self.idle.is_empty() && self.waiters.is_empty() && self.live.is_empty()
    }
}

struct PoolState<S> {
    entries: HashMap<String, RouteEntry<S>>,
    idle_count: usize,
    next_waiter: u64,
    closed: bool,
}

/// Pool of connector sockets of one protocol version.
pub struct ConnectorPool<S> {
    protocol: ProtocolVersion,
    routes: Arc<RouteTable>,
    max_wait: Duration,
    state: Mutex<PoolState<S>>,
}

impl<S: PooledSocket> ConnectorPool<S> {
    pub fn new(protocol: ProtocolVersion, routes: Arc<RouteTable>, max_wait: Duration) -> Self {
        Self {
            protocol,
            routes,
            max_wait,
            state: Mutex::new(PoolState {
                entries: HashMap::new(),
                idle_count: 0,
                next_waiter: 0,
                closed: false,
            }),
        }
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Add a freshly registered socket.
    ///
    /// The oldest live waiter for the route gets it; otherwise it goes idle.
    pub fn register(&self, socket: Arc<S>) {
        let route = socket.meta().route.clone();
        let socket_id = socket.meta().id;
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let entry = state.entries.entry(route.clone()).or_default();
        if entry.live.insert(socket_id, socket.clone()).is_none() {
            self.routes.add(&route);
        }
        if let Some(socket) = Self::hand_over(entry, socket) {
            entry.idle.push_back(socket);
            state.idle_count += 1;
        }

        tracing::debug!(
            route = %route,
            socket_id = %socket_id,
            protocol = %self.protocol,
            idle = state.idle_count,
            "Connector socket registered"
        );
    }

    /// Return a healthy, reusable socket after use.
    pub fn release(&self, socket: Arc<S>) {
        let meta = socket.meta();
        if meta.is_removed() {
            return;
        }
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let Some(entry) = state.entries.get_mut(&meta.route) else {
            return;
        };
        if !entry.live.contains_key(&meta.id) || entry.idle.iter().any(|s| s.meta().id == meta.id) {
            return;
        }
        if let Some(socket) = Self::hand_over(entry, socket) {
            entry.idle.push_back(socket);
            state.idle_count += 1;
        }
    }

    /// Discard a socket for good.
    ///
    /// Returns true if this call removed it; later calls are no-ops.
    pub fn remove(&self, socket: &Arc<S>) -> bool {
        let meta = socket.meta();
        if !meta.mark_removed() {
            return false;
        }

        let mut state = self.state.lock();
        let mut dropped_idle = 0;
        let mut route_gone = false;
        if let Some(entry) = state.entries.get_mut(&meta.route) {
            if entry.live.remove(&meta.id).is_some() {
                route_gone = self.routes.release(&meta.route);
            }
            let before = entry.idle.len();
            entry.idle.retain(|s| s.meta().id != meta.id);
            dropped_idle = before - entry.idle.len();
            if entry.is_empty() {
                state.entries.remove(&meta.route);
            }
        }
        state.idle_count -= dropped_idle;

        tracing::debug!(
            route = %meta.route,
            socket_id = %meta.id,
            protocol = %self.protocol,
            route_removed = route_gone,
            "Connector socket removed"
        );
        true
    }

    /// Take an idle socket without waiting.
    pub fn try_acquire(&self, route: &str) -> Option<Arc<S>> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        Self::take_idle(&mut state, route)
    }

    /// Take an idle socket, waiting up to the pool's max wait for one.
    pub async fn acquire(&self, route: &str) -> Result<Arc<S>, AcquireError> {
        let started = Instant::now();
        let (waiter_id, rx) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(AcquireError::Closed);
            }
            if let Some(socket) = Self::take_idle(&mut state, route) {
                return Ok(socket);
            }
            let id = state.next_waiter;
            state.next_waiter += 1;
            let (tx, rx) = oneshot::channel();
            state
                .entries
                .entry(route.to_string())
                .or_default()
                .waiters
                .push_back(Waiter { id, tx });
            (id, rx)
        };

        tracing::trace!(route = %route, protocol = %self.protocol, "Waiting for connector socket");

        let mut waiting = Waiting {
            pool: self,
            route,
            id: waiter_id,
            rx,
        };
        match tokio::time::timeout(self.max_wait, &mut waiting.rx).await {
            Ok(Ok(socket)) => Ok(socket),
            Ok(Err(_)) => Err(AcquireError::Closed),
            Err(_) => {
                waiting.withdraw();
                // A socket may have been handed over just before we withdrew.
                match waiting.rx.try_recv() {
                    Ok(socket) => Ok(socket),
                    Err(_) => Err(AcquireError::NoCapacity {
                        route: route.to_string(),
                        waited: started.elapsed(),
                    }),
                }
            }
        }
    }

    /// Drop a queued waiter, pruning the route entry if nothing else is left.
    fn withdraw(&self, route: &str, waiter_id: u64) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(route) {
            entry.waiters.retain(|w| w.id != waiter_id);
            if entry.is_empty() {
                state.entries.remove(route);
            }
        }
    }

    /// Number of idle sockets across all routes.
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle_count
    }

    /// Number of idle sockets for one route.
    pub fn idle_for(&self, route: &str) -> usize {
        self.state
            .lock()
            .entries
            .get(route)
            .map(|e| e.idle.len())
            .unwrap_or(0)
    }

    /// Number of acquisitions currently queued for `route`.
    pub fn waiting_for(&self, route: &str) -> usize {
        self.state
            .lock()
            .entries
            .get(route)
            .map(|e| e.waiters.iter().filter(|w| !w.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Whether any socket (idle or borrowed) is registered for `route`.
    pub fn has_route(&self, route: &str) -> bool {
        self.state
            .lock()
            .entries
            .get(route)
            .map(|e| !e.live.is_empty())
            .unwrap_or(false)
    }

    /// Every registered socket, idle or borrowed.
    pub fn snapshot(&self) -> Vec<Arc<S>> {
        let state = self.state.lock();
        state
            .entries
            .values()
            .flat_map(|e| e.live.values().cloned())
            .collect()
    }

    /// Stop the pool: fail every waiter and hand back all registered sockets.
    pub fn shutdown(&self) -> Vec<Arc<S>> {
        let mut state = self.state.lock();
        state.closed = true;
        state.idle_count = 0;
        let mut sockets = Vec::new();
        for (route, entry) in state.entries.drain() {
            for socket in entry.live.into_values() {
                if socket.meta().mark_removed() {
                    self.routes.release(&route);
                }
                sockets.push(socket);
            }
            // Dropping the waiters' senders fails their acquisitions with `Closed`.
        }
        sockets
    }

    fn take_idle(state: &mut PoolState<S>, route: &str) -> Option<Arc<S>> {
        let entry = state.entries.get_mut(route)?;
        while let Some(socket) = entry.idle.pop_front() {
            state.idle_count -= 1;
            if !socket.meta().is_removed() {
                return Some(socket);
            }
        }
        None
    }

    /// Give `socket` to the oldest waiter still listening, or hand it back.
    fn hand_over(entry: &mut RouteEntry<S>, socket: Arc<S>) -> Option<Arc<S>> {
        let mut socket = socket;
        while let Some(waiter) = entry.waiters.pop_front() {
            match waiter.tx.send(socket) {
                Ok(()) => return None,
                Err(returned) => socket = returned,
            }
        }
        Some(socket)
    }
}

/// A queued acquisition. Dropping it mid-wait withdraws the waiter and
/// returns any socket that was handed over but never received.
struct Waiting<'a, S: PooledSocket> {
    pool: &'a ConnectorPool<S>,
    route: &'a str,
    id: u64,
    rx: oneshot::Receiver<Arc<S>>,
}

impl<S: PooledSocket> Waiting<'_, S> {
    fn withdraw(&self) {
        self.pool.withdraw(self.route, self.id);
    }
}

impl<S: PooledSocket> Drop for Waiting<'_, S> {
    fn drop(&mut self) {
        self.withdraw();
        if let Ok(socket) = self.rx.try_recv() {
            self.pool.release(socket);
        }
    }
}
