use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;
use tracing::{debug, warn};

use super::types::{HandleEntry, HandleId, RegistrationId, RegistryError};
use crate::llm::engine::RawHandle;
use crate::llm::session::CallbackRegistration;

// Created on first use (the first session) and lives for the process. Entries
// are removed on dispose and at the end of every generation.
static GLOBAL_REGISTRY: Lazy<HandleRegistry> = Lazy::new(HandleRegistry::new);

#[derive(Default)]
struct Tables {
    handles: HashMap<HandleId, HandleEntry>,
    registrations: HashMap<RegistrationId, Arc<CallbackRegistration>>,
}

/// Table mapping plain integer ids to live native handles and callback registrations.
///
/// Threads that run native calls receive only a [`HandleId`] or [`RegistrationId`]
/// and re-attach to the handle here, so raw addresses never travel between
/// execution contexts.
pub struct HandleRegistry {
    tables: Mutex<Tables>,
    next_handle: AtomicU64,
    next_registration: AtomicU64,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            next_handle: AtomicU64::new(1),
            next_registration: AtomicU64::new(1),
        }
    }

    /// The process-wide registry used by sessions and the callback bridge.
    pub fn global() -> &'static HandleRegistry {
        &GLOBAL_REGISTRY
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        // Entries stay consistent across a panic in another holder, so keep going
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a live handle and returns its id.
    pub fn register(&self, handle: RawHandle) -> HandleId {
        let id = HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.tables().handles.insert(id, HandleEntry { handle, active: None });
        debug!(handle_id = %id, handle = ?handle, "Registered native handle");
        id
    }

    pub fn lookup(&self, id: HandleId) -> Result<RawHandle, RegistryError> {
        self.tables()
            .handles
            .get(&id)
            .map(|entry| entry.handle)
            .ok_or(RegistryError::NotFound(id))
    }

    /// Removes a handle entry, returning the handle so the caller can destroy it.
    ///
    /// A second call for the same id is a programming error: it is logged and
    /// returns `None`, so the handle can never be destroyed twice.
    pub fn unregister(&self, id: HandleId) -> Option<RawHandle> {
        let mut tables = self.tables();
        match tables.handles.remove(&id) {
            Some(entry) => {
                if let Some(active) = entry.active {
                    tables.registrations.remove(&active);
                    warn!(handle_id = %id, registration_id = %active, "Unregistered handle with an active callback registration");
                }
                debug!(handle_id = %id, "Unregistered native handle");
                Some(entry.handle)
            }
            None => {
                warn!(handle_id = %id, "Ignoring unregister of unknown native handle (double free?)");
                None
            }
        }
    }

    /// Allocates the id for a new callback registration.
    pub fn next_registration_id(&self) -> RegistrationId {
        RegistrationId(self.next_registration.fetch_add(1, Ordering::Relaxed))
    }

    /// Makes a registration reachable from the native callback and marks its
    /// handle as in use.
    pub fn attach(&self, registration: Arc<CallbackRegistration>) -> Result<RegistrationId, RegistryError> {
        let id = registration.id();
        let handle_id = registration.handle_id();
        let mut tables = self.tables();

        let entry = tables.handles.get_mut(&handle_id).ok_or(RegistryError::NotFound(handle_id))?;
        if entry.active.is_some() {
            return Err(RegistryError::AlreadyActive(handle_id));
        }
        entry.active = Some(id);
        tables.registrations.insert(id, registration);
        debug!(handle_id = %handle_id, registration_id = %id, "Attached callback registration");
        Ok(id)
    }

    pub fn registration(&self, id: RegistrationId) -> Option<Arc<CallbackRegistration>> {
        self.tables().registrations.get(&id).cloned()
    }

    /// Removes a registration and frees its handle for the next generation.
    pub fn detach(&self, id: RegistrationId) {
        let mut tables = self.tables();
        let Some(registration) = tables.registrations.remove(&id) else {
            warn!(registration_id = %id, "Ignoring detach of unknown callback registration");
            return;
        };
        if let Some(entry) = tables.handles.get_mut(&registration.handle_id()) {
            if entry.active == Some(id) {
                entry.active = None;
            }
        }
        debug!(registration_id = %id, "Detached callback registration");
    }

    /// Number of registered handles.
    pub fn len(&self) -> usize {
        self.tables().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live callback registrations.
    pub fn active_registrations(&self) -> usize {
        self.tables().registrations.len()
    }
}
