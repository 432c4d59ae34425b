use super::key::BucketKey;
use super::manager::{Eviction, Shared};
use super::transport::Transport;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// A connection checked out of the pool for one request.
///
/// Ending the lease is how a request reports what happened to its connection:
///
/// * [`release`](Lease::release), or simply dropping the lease, means the
///   request is done. The pool passes the connection to the next queued
///   request, parks it as idle, or closes it.
/// * [`close`](Lease::close) closes the connection and frees its slot.
/// * [`detach`](Lease::detach) takes the connection out of the pool without
///   closing it, for protocol upgrades that make it unusable for pooling.
pub struct Lease<T: Transport> {
    shared: Arc<Shared<T>>,
    key: BucketKey,
    id: u64,
    generation: u64,
    conn: Arc<T::Connection>,
    reusable: bool,
    armed: bool,
}

impl<T: Transport> Lease<T> {
    pub(crate) fn new(
        shared: Arc<Shared<T>>,
        key: BucketKey,
        id: u64,
        generation: u64,
        conn: Arc<T::Connection>,
        reusable: bool,
    ) -> Self {
        Self {
            shared,
            key,
            id,
            generation,
            conn,
            reusable,
            armed: true,
        }
    }

    /// Bucket this connection belongs to.
    pub fn key(&self) -> &BucketKey {
        &self.key
    }

    /// Pool-assigned connection id, stable across reuse.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connection(&self) -> &Arc<T::Connection> {
        &self.conn
    }

    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    /// Mark whether the connection may serve another request after this one,
    /// e.g. false after a response without keep-alive.
    pub fn set_reusable(&mut self, reusable: bool) {
        self.reusable = reusable;
    }

    pub fn release(self) {
        drop(self);
    }

    pub fn close(mut self) {
        self.armed = false;
        self.shared
            .evict(&self.key, self.generation, Eviction::Closed);
    }

    pub fn detach(mut self) -> Arc<T::Connection> {
        self.armed = false;
        self.shared
            .evict(&self.key, self.generation, Eviction::Detached);
        Arc::clone(&self.conn)
    }

    /// Drop without notifying the pool. Only valid while the pool lock is held
    /// and the matching active entry is being removed by the caller.
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T: Transport> Deref for Lease<T> {
    type Target = T::Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<T: Transport> Drop for Lease<T> {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            self.shared
                .release(&self.key, self.generation, self.reusable);
        }
    }
}

impl<T: Transport> fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("reusable", &self.reusable)
            .finish()
    }
}
