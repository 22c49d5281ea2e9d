//! Thread-per-connection dispatch.
//!
//! Each connection is moved into the closure of a freshly spawned thread; the
//! join handle is dropped immediately, so the worker is detached and the
//! accept loop keeps no reference to it.

use super::{Connection, SessionContext, WorkerHandle};
use crate::error::{self, ServerError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use tracing::debug;

/// Spawns one detached thread per connection.
pub struct ThreadDispatcher {
    context: SessionContext,
    /// Admission limit; `None` means unbounded.
    slots: Option<Arc<WorkerSlots>>,
}

impl ThreadDispatcher {
    /// `max_workers == 0` admits an unbounded number of threads.
    pub fn new(context: SessionContext, max_workers: usize) -> Self {
        Self {
            context,
            slots: (max_workers > 0).then(|| WorkerSlots::new(max_workers)),
        }
    }

    /// Hand `conn` to a new worker thread.
    ///
    /// With a worker limit this blocks the caller until a slot frees up.
    pub fn dispatch(&self, conn: Connection) -> Result<WorkerHandle, ServerError> {
        let permit = self.slots.as_ref().map(WorkerSlots::acquire);
        let name = format!("echo-{}", conn.peer());
        let context = self.context;

        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _permit = permit;
                let peer = conn.peer();
                if let Err(e) = context.finish(peer, conn.serve(context.mirror)) {
                    error::die(&e);
                }
            })
            .map_err(|e| ServerError::Spawn("thread worker", e))?;

        if let Some(slots) = &self.slots {
            debug!(worker = %name, active = slots.active(), "Spawned worker");
        }
        Ok(WorkerHandle::Thread { name })
    }
}

/// Counting gate bounding the number of live thread workers.
#[derive(Debug)]
pub struct WorkerSlots {
    limit: usize,
    active: Mutex<usize>,
    freed: Condvar,
}

impl WorkerSlots {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            active: Mutex::new(0),
            freed: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a slot is free and take it.
    pub fn acquire(self: &Arc<Self>) -> SlotPermit {
        let mut active = self.lock();
        while *active >= self.limit {
            active = self
                .freed
                .wait(active)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *active += 1;
        SlotPermit {
            slots: Arc::clone(self),
        }
    }

    pub fn active(&self) -> usize {
        *self.lock()
    }
}

/// A taken worker slot, released on drop.
#[derive(Debug)]
pub struct SlotPermit {
    slots: Arc<WorkerSlots>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        let mut active = self.slots.lock();
        *active -= 1;
        self.slots.freed.notify_one();
    }
}
