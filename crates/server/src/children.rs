//! Supervision of tasks spawned by stream handlers.
//!
//! A handler may hand the connection a task to watch over; the connection
//! maps the task back to its stream when it exits and applies the child's
//! shutdown policy when the stream terminates.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::trace;

use drover_codec::stream::StreamId;

/// Identifier the connection assigns to a supervised child.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ChildId(u64);

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "child {}", self.0)
    }
}

/// How a child is stopped when its stream terminates.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Shutdown {
    /// Abort immediately.
    BrutalKill,
    /// Give the child this long to finish, then abort it.
    Timeout(Duration),
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::Timeout(Duration::from_secs(5))
    }
}

/// Why a supervised child exited.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChildExit {
    /// The task ran to completion.
    Normal,
    /// The task panicked.
    Panic,
    /// The task was aborted.
    Killed,
}

#[derive(Debug)]
struct Child {
    /// The owning stream, or `None` once that stream has terminated and
    /// the child is only awaited for its exit notification.
    owner: Option<StreamId>,
    abort: AbortHandle,
    shutdown: Shutdown,
}

/// What an exit notification maps to.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Down {
    /// A supervised child; `None` if its stream already ended.
    Known(Option<StreamId>),
    Unknown,
}

#[derive(Debug, Default)]
pub(crate) struct Children {
    children: HashMap<ChildId, Child>,
    next_id: u64,
}

impl Children {
    pub(crate) fn register(&mut self, owner: StreamId, abort: AbortHandle, shutdown: Shutdown) -> ChildId {
        let id = ChildId(self.next_id);
        self.next_id += 1;
        self.children.insert(
            id,
            Child {
                owner: Some(owner),
                abort,
                shutdown,
            },
        );
        id
    }

    /// Resolve an exit notification, dropping the entry.
    pub(crate) fn down(&mut self, id: ChildId) -> Down {
        match self.children.remove(&id) {
            Some(child) => Down::Known(child.owner),
            None => Down::Unknown,
        }
    }

    /// Stop all children of a terminating stream according to their
    /// policies. The entries stay registered (without an owner) until
    /// their exit notifications arrive.
    pub(crate) fn shutdown(&mut self, owner: StreamId) {
        for child in self.children.values_mut().filter(|c| c.owner == Some(owner)) {
            child.owner = None;
            stop(child.abort.clone(), child.shutdown);
        }
    }

    /// Stop everything; the connection is going away.
    pub(crate) fn terminate_all(&mut self) {
        for (id, child) in self.children.drain() {
            trace!("stopping {id} at connection teardown");
            stop(child.abort, child.shutdown);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.children.len()
    }
}

fn stop(abort: AbortHandle, shutdown: Shutdown) {
    match shutdown {
        Shutdown::BrutalKill => abort.abort(),
        Shutdown::Timeout(grace) => {
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                abort.abort();
            });
        }
    }
}
