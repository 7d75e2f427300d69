use crate::{
    config::SessionSettings,
    event_bus::{EventBus, SessionId, Subscription, SubscriptionFilter},
    scheduler::{CancelHandle, run_after},
};
use log::*;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplaySession {
    pub id: SessionId,
    pub fop_name: String,
    pub filter: SubscriptionFilter,
    pub last_seen_at: Instant,
    pub detached: bool,
}

#[derive(Debug)]
struct SessionRecord {
    session: DisplaySession,
    bus: EventBus,
    cleanup: Option<CancelHandle>,
    cleanup_generation: u64,
}

impl SessionRecord {
    fn cancel_cleanup(&mut self) {
        if let Some(handle) = self.cleanup.take() {
            handle.cancel();
        }
    }
}

#[derive(Debug, Default)]
struct ManagerInner {
    next_id: SessionId,
    sessions: BTreeMap<SessionId, SessionRecord>,
}

/// Tracks display sessions for any number of buses. Sessions are registered on
/// attach, unregistered and then cleaned up after a grace window on a soft
/// disconnect, and dropped immediately on a hard detach.
#[derive(Debug, Clone)]
pub struct SessionManager {
    inner: Arc<Mutex<ManagerInner>>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManagerInner {
                next_id: 1,
                sessions: BTreeMap::new(),
            })),
            settings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        lock_inner(&self.inner)
    }

    pub fn settings(&self) -> SessionSettings {
        self.settings
    }

    pub fn attach(&self, bus: &EventBus, filter: SubscriptionFilter) -> Subscription {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let fop_name = bus.name();
        info!("Attaching display session {id} to {fop_name}");
        let subscription = bus.subscribe(id, filter.clone());
        inner.sessions.insert(
            id,
            SessionRecord {
                session: DisplaySession {
                    id,
                    fop_name,
                    filter,
                    last_seen_at: Instant::now(),
                    detached: false,
                },
                bus: bus.clone(),
                cleanup: None,
                cleanup_generation: 0,
            },
        );

        subscription
    }

    /// Brings a soft-detached session back before its cleanup runs
    pub fn reattach(&self, id: SessionId) -> Result<Subscription> {
        let mut inner = self.lock();
        let record = inner
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::UnknownSession(id))?;
        if !record.session.detached {
            return Err(SessionError::AlreadyAttached(id));
        }

        record.cancel_cleanup();
        record.session.detached = false;
        record.session.last_seen_at = Instant::now();
        info!("Reattaching display session {id} to {}", record.session.fop_name);
        Ok(record.bus.subscribe(id, record.session.filter.clone()))
    }

    /// Unregisters the session right away and releases it once the grace window
    /// passes. Calling this again restarts the window.
    pub fn soft_detach(&self, id: SessionId) -> Result<()> {
        let mut inner = self.lock();
        let record = inner
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::UnknownSession(id))?;

        record.bus.unsubscribe(id);
        record.cancel_cleanup();
        record.session.detached = true;
        record.cleanup_generation += 1;

        let generation = record.cleanup_generation;
        let weak: Weak<Mutex<ManagerInner>> = Arc::downgrade(&self.inner);
        debug!(
            "Display session {id} detached, cleaning up in {:?}",
            self.settings.grace()
        );
        record.cleanup = Some(run_after(self.settings.grace(), move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = lock_inner(&inner);
                let expired = inner.sessions.get(&id).is_some_and(|record| {
                    record.session.detached && record.cleanup_generation == generation
                });
                if expired {
                    inner.sessions.remove(&id);
                    info!("Display session {id} cleaned up after grace window");
                }
            }
        }));

        Ok(())
    }

    /// Drops the session immediately. Returns `false` if it was already gone.
    pub fn hard_detach(&self, id: SessionId) -> bool {
        let mut inner = self.lock();
        match inner.sessions.remove(&id) {
            Some(mut record) => {
                record.bus.unsubscribe(id);
                record.cancel_cleanup();
                info!("Display session {id} released");
                true
            }
            None => {
                debug!("Display session {id} was already released");
                false
            }
        }
    }

    pub fn touch(&self, id: SessionId) -> Result<()> {
        let mut inner = self.lock();
        let record = inner
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::UnknownSession(id))?;
        record.session.last_seen_at = Instant::now();
        Ok(())
    }

    /// Hard-detaches every attached session not seen within the idle timeout
    pub fn expire_idle(&self, now: Instant) -> Vec<SessionId> {
        let timeout = self.settings.idle_timeout();
        let expired: Vec<SessionId> = self
            .lock()
            .sessions
            .values()
            .filter(|record| {
                now.checked_duration_since(record.session.last_seen_at)
                    .is_some_and(|idle| idle > timeout)
            })
            .map(|record| record.session.id)
            .collect();

        for id in expired.iter() {
            warn!("Display session {id} timed out");
            self.hard_detach(*id);
        }
        expired
    }

    pub fn get(&self, id: SessionId) -> Option<DisplaySession> {
        self.lock()
            .sessions
            .get(&id)
            .map(|record| record.session.clone())
    }

    pub fn sessions_for(&self, fop_name: &str) -> Vec<SessionId> {
        self.lock()
            .sessions
            .values()
            .filter(|record| record.session.fop_name == fop_name)
            .map(|record| record.session.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_inner(inner: &Mutex<ManagerInner>) -> MutexGuard<'_, ManagerInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("No display session with id {0}")]
    UnknownSession(SessionId),
    #[error("Display session {0} is already attached")]
    AlreadyAttached(SessionId),
}

pub type Result<T> = std::result::Result<T, SessionError>;
