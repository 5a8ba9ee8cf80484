//! Lifecycle callback buckets.

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::{BackendError, Result};

/// A lifecycle callback. Called once per transition.
pub type CallbackFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Connection transition a callback is attached to.
///
/// `*Ordered` buckets run first, one callback at a time in registration
/// order; a failing callback registered with `reraise` stops the sequence
/// and fails the transition. The plain buckets run concurrently and are
/// awaited as a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    OnOpenOrdered,
    OnOpen,
    OnLostOrdered,
    OnLost,
    OnCloseOrdered,
    OnClose,
}

impl CallbackKind {
    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            CallbackKind::OnOpenOrdered | CallbackKind::OnLostOrdered | CallbackKind::OnCloseOrdered
        )
    }

    pub fn as_str(&self) -> &'static str {
        // ---
        match self {
            CallbackKind::OnOpenOrdered => "on_open_ordered",
            CallbackKind::OnOpen => "on_open",
            CallbackKind::OnLostOrdered => "on_lost_ordered",
            CallbackKind::OnLost => "on_lost",
            CallbackKind::OnCloseOrdered => "on_close_ordered",
            CallbackKind::OnClose => "on_close",
        }
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallbackKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        let kind = match s {
            "on_open_ordered" => CallbackKind::OnOpenOrdered,
            "on_open" => CallbackKind::OnOpen,
            "on_lost_ordered" => CallbackKind::OnLostOrdered,
            "on_lost" => CallbackKind::OnLost,
            "on_close_ordered" => CallbackKind::OnCloseOrdered,
            "on_close" => CallbackKind::OnClose,
            other => {
                return Err(BackendError::InvalidCallback(format!(
                    "unknown callback bucket '{other}'"
                )))
            }
        };
        Ok(kind)
    }
}

#[derive(Clone)]
pub(crate) struct Registered {
    pub(crate) name: String,
    pub(crate) func: CallbackFn,
    pub(crate) reraise: bool,
}

/// One owner's callbacks, bucket by bucket.
#[derive(Default)]
pub(crate) struct CallbackSet {
    buckets: HashMap<CallbackKind, Vec<Registered>>,
}

impl CallbackSet {
    /// Register `name`; a second registration under the same name replaces
    /// the first and keeps its position.
    pub(crate) fn add(&mut self, kind: CallbackKind, name: String, func: CallbackFn, reraise: bool) {
        // ---
        let bucket = self.buckets.entry(kind).or_default();
        let entry = Registered {
            name,
            func,
            reraise,
        };
        match bucket.iter_mut().find(|r| r.name == entry.name) {
            Some(slot) => *slot = entry,
            None => bucket.push(entry),
        }
    }

    pub(crate) fn remove(&mut self, kind: CallbackKind, name: &str) -> bool {
        // ---
        let Some(bucket) = self.buckets.get_mut(&kind) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|r| r.name != name);
        before != bucket.len()
    }

    pub(crate) fn snapshot(&self, kind: CallbackKind) -> Vec<Registered> {
        self.buckets.get(&kind).cloned().unwrap_or_default()
    }

    pub(crate) fn contains(&self, kind: CallbackKind, name: &str) -> bool {
        self.buckets
            .get(&kind)
            .is_some_and(|b| b.iter().any(|r| r.name == name))
    }

    pub(crate) fn clear(&mut self) {
        self.buckets.clear();
    }
}
