use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::{Session, SessionId};
use crate::error::{Jt808Error, Result};
use crate::protocol::DeviceId;
use crate::transport::TransportHandle;

/// Default idle time before the sweep evicts a session.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Live sessions indexed by session id and by bound device id.
///
/// Reads go straight to the concurrent maps. Anything that touches both
/// maps (`bind`, `evict`) runs under one short lock so a device never maps
/// to an evicted session.
pub struct SessionTable {
    sessions: DashMap<SessionId, Arc<Session>>,
    devices: DashMap<DeviceId, SessionId>,
    bind_lock: Mutex<()>,
    idle_timeout: Duration,
}

impl SessionTable {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            devices: DashMap::new(),
            bind_lock: Mutex::new(()),
            idle_timeout,
        }
    }

    #[inline]
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Allocate and insert a session over `transport`.
    pub fn create(&self, transport: TransportHandle) -> SessionId {
        let session = Arc::new(Session::new(transport));
        let id = session.id();
        tracing::debug!(
            "Session {} created over {} from {}",
            id,
            session.transport().kind(),
            session.transport().peer_addr()
        );
        self.sessions.insert(id, session);
        id
    }

    /// Bind `device_id` to session `id`.
    ///
    /// Drops the session's previous identity mapping, and takes the device
    /// away from any other session holding it. That other session stays
    /// open and reachable by id, with its device id cleared.
    pub fn bind(&self, id: SessionId, device_id: DeviceId) -> Result<()> {
        let _guard = self.bind_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let session = self
            .lookup_by_session(id)
            .ok_or(Jt808Error::SessionNotFound(id))?;

        if let Some(old) = session.device_id() {
            if old == device_id {
                return Ok(());
            }
            self.devices.remove_if(&old, |_, owner| *owner == id);
        }

        if let Some(previous) = self.devices.insert(device_id.clone(), id) {
            if previous != id {
                if let Some(superseded) = self.lookup_by_session(previous) {
                    superseded.set_device_id(None);
                }
                tracing::info!(
                    "Device {} moved from session {} to {}",
                    device_id,
                    previous,
                    id
                );
            }
        } else {
            tracing::info!("Device {} bound to session {}", device_id, id);
        }
        session.set_device_id(Some(device_id));
        Ok(())
    }

    pub fn lookup_by_session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn lookup_by_device(&self, device_id: &DeviceId) -> Option<Arc<Session>> {
        let id = *self.devices.get(device_id)?;
        self.lookup_by_session(id)
    }

    /// Next outbound serial for session `id`.
    pub fn next_serial(&self, id: SessionId) -> Result<u16> {
        self.lookup_by_session(id)
            .map(|session| session.next_serial())
            .ok_or(Jt808Error::SessionNotFound(id))
    }

    pub fn set_authenticated(&self, id: SessionId, authenticated: bool) -> Result<()> {
        let session = self
            .lookup_by_session(id)
            .ok_or(Jt808Error::SessionNotFound(id))?;
        session.set_authenticated(authenticated);
        Ok(())
    }

    pub fn set_protocol_version(&self, id: SessionId, version: Option<u8>) -> Result<()> {
        let session = self
            .lookup_by_session(id)
            .ok_or(Jt808Error::SessionNotFound(id))?;
        session.set_protocol_version(version);
        Ok(())
    }

    /// Remove session `id` and its identity mapping, closing its transport.
    ///
    /// Returns the removed session, or `None` if it was already gone.
    pub fn evict(&self, id: SessionId) -> Option<Arc<Session>> {
        let session = {
            let _guard = self.bind_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let (_, session) = self.sessions.remove(&id)?;
            if let Some(device_id) = session.device_id() {
                self.devices.remove_if(&device_id, |_, owner| *owner == id);
            }
            session
        };

        session.close();
        tracing::info!(
            "Session {} evicted (device {:?}, {} received, {} sent)",
            id,
            session.device_id().map(|d| d.to_string()),
            session.received_count(),
            session.sent_count()
        );
        Some(session)
    }

    /// Evict sessions idle past the timeout.
    pub fn sweep_idle(&self) -> Vec<SessionId> {
        self.sweep_idle_at(Instant::now())
    }

    /// [`sweep_idle`](Self::sweep_idle) with an explicit clock.
    pub fn sweep_idle_at(&self, now: Instant) -> Vec<SessionId> {
        let idle: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_idle_at(now, self.idle_timeout))
            .map(|entry| *entry.key())
            .collect();

        idle.into_iter()
            .filter(|&id| {
                tracing::debug!("Session {} idle for more than {:?}", id, self.idle_timeout);
                self.evict(id).is_some()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of live sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}
