//! The single namespace of live tunnels.
//!
//! The registry owns every tunnel by strong reference. Lookups vastly
//! outnumber mutations, so the table sits behind a read-write lock; it is
//! never held across an await or while a tunnel is being closed.
//!
//! A swept session stays retired for a bounded horizon so a create racing
//! the sweep fails; after that the name is forgotten and may be reused.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::TunnelError;
use crate::tunnel::{CloseReason, Tunnel};

#[derive(Debug, Default)]
struct Table {
    tunnels: HashMap<u64, Arc<Tunnel>>,
    /// Sessions swept by `remove_all_for_session` and when; they may not
    /// own new tunnels until the retirement horizon passes.
    retired_sessions: HashMap<String, Instant>,
}

impl Table {
    fn prune_retired(&mut self, horizon: Duration) {
        let now = Instant::now();
        self.retired_sessions
            .retain(|_, at| now.saturating_duration_since(*at) < horizon);
    }

    fn is_retired(&self, peer_session_id: &str, horizon: Duration) -> bool {
        self.retired_sessions
            .get(peer_session_id)
            .is_some_and(|at| at.elapsed() < horizon)
    }
}

/// How long a swept session refuses new tunnels by default.
pub const DEFAULT_SESSION_RETIREMENT: Duration = Duration::from_secs(30);

/// Shared handle to the tunnel table. Clones refer to the same table.
#[derive(Debug, Clone)]
pub struct Registry {
    table: Arc<RwLock<Table>>,
    retirement: Duration,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_retirement(DEFAULT_SESSION_RETIREMENT)
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry whose swept sessions stay retired for `retirement`.
    pub fn with_retirement(retirement: Duration) -> Self {
        Self {
            table: Arc::default(),
            retirement,
        }
    }

    /// Register a tunnel under `id`, building it with `make` only if the id
    /// is free.
    ///
    /// Fails with [`TunnelError::DuplicateId`] while a live tunnel holds the
    /// id (the live tunnel is left untouched), and with
    /// [`TunnelError::SessionClosed`] while the session is retired. A
    /// terminal tunnel that has not been reaped yet is replaced.
    ///
    /// Terminal tunnels are removed automatically.
    pub fn create<F>(
        &self,
        id: u64,
        peer_session_id: &str,
        make: F,
    ) -> Result<Arc<Tunnel>, TunnelError>
    where
        F: FnOnce() -> Arc<Tunnel>,
    {
        let tunnel = {
            let mut table = write(&self.table);
            table.prune_retired(self.retirement);
            if table.is_retired(peer_session_id, self.retirement) {
                return Err(TunnelError::SessionClosed(peer_session_id.to_string()));
            }
            match table.tunnels.entry(id) {
                Entry::Occupied(entry) if !entry.get().is_closed() => {
                    return Err(TunnelError::DuplicateId(id));
                }
                Entry::Occupied(mut entry) => {
                    let tunnel = make();
                    entry.insert(Arc::clone(&tunnel));
                    tunnel
                }
                Entry::Vacant(entry) => Arc::clone(entry.insert(make())),
            }
        };

        self.spawn_reaper(&tunnel);
        Ok(tunnel)
    }

    /// Look a tunnel up. Absence is an ordinary outcome.
    pub fn get(&self, id: u64) -> Option<Arc<Tunnel>> {
        read(&self.table).tunnels.get(&id).cloned()
    }

    /// Remove a tunnel and close it. Safe to call redundantly.
    pub fn remove(&self, id: u64) -> bool {
        let removed = write(&self.table).tunnels.remove(&id);
        match removed {
            Some(tunnel) => {
                tunnel.close(CloseReason::Local);
                true
            }
            None => false,
        }
    }

    /// Close every tunnel of a terminated peer session in one sweep and
    /// retire the session, so a racing create for it fails instead of
    /// leaking a tunnel.
    pub fn remove_all_for_session(&self, peer_session_id: &str) -> usize {
        let swept: Vec<Arc<Tunnel>> = {
            let mut table = write(&self.table);
            table.prune_retired(self.retirement);
            table
                .retired_sessions
                .insert(peer_session_id.to_string(), Instant::now());
            let ids: Vec<u64> = table
                .tunnels
                .iter()
                .filter(|(_, t)| t.peer_session_id() == peer_session_id)
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| table.tunnels.remove(id))
                .collect()
        };

        for tunnel in &swept {
            tunnel.close(CloseReason::SessionEnded);
        }
        debug!(session = peer_session_id, count = swept.len(), "session swept");
        swept.len()
    }

    /// Let a retired session own tunnels again, e.g. after its peer
    /// reconnects. Returns whether the session was retired.
    pub fn release_session(&self, peer_session_id: &str) -> bool {
        let mut table = write(&self.table);
        let retired = table.is_retired(peer_session_id, self.retirement);
        table.retired_sessions.remove(peer_session_id);
        retired
    }

    /// Number of sessions currently refusing new tunnels.
    pub fn retired_sessions(&self) -> usize {
        let table = read(&self.table);
        table
            .retired_sessions
            .values()
            .filter(|at| at.elapsed() < self.retirement)
            .count()
    }

    /// Close every tunnel, e.g. on process shutdown.
    pub fn remove_all(&self) -> usize {
        let swept: Vec<Arc<Tunnel>> = write(&self.table).tunnels.drain().map(|(_, t)| t).collect();
        for tunnel in &swept {
            tunnel.close(CloseReason::Local);
        }
        swept.len()
    }

    pub fn len(&self) -> usize {
        read(&self.table).tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all registered tunnels, in no particular order.
    pub fn ids(&self) -> Vec<u64> {
        read(&self.table).tunnels.keys().copied().collect()
    }

    /// Snapshot of the registered tunnels.
    pub fn tunnels(&self) -> Vec<Arc<Tunnel>> {
        read(&self.table).tunnels.values().cloned().collect()
    }

    /// Drop the entry once the tunnel turns terminal, unless the id has been
    /// taken over by a newer tunnel in the meantime.
    fn spawn_reaper(&self, tunnel: &Arc<Tunnel>) {
        let table: Weak<RwLock<Table>> = Arc::downgrade(&self.table);
        let tunnel = Arc::clone(tunnel);
        tokio::spawn(async move {
            tunnel.terminated().await;
            let Some(table) = table.upgrade() else {
                return;
            };
            let mut table = write(&table);
            let id = tunnel.id();
            if table
                .tunnels
                .get(&id)
                .is_some_and(|live| Arc::ptr_eq(live, &tunnel))
            {
                table.tunnels.remove(&id);
                debug!(tunnel = id, "reaped terminal tunnel");
            }
        });
    }
}

fn read(table: &RwLock<Table>) -> RwLockReadGuard<'_, Table> {
    table.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(table: &RwLock<Table>) -> RwLockWriteGuard<'_, Table> {
    table.write().unwrap_or_else(PoisonError::into_inner)
}
