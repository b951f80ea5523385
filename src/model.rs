//! Core data model.
//!
//! A task record is a unit of work. Its serialized form is the key every
//! backend stores; the queue status says which bucket that key sits in.

pub mod task;

pub use task::{TaskId, TaskRecord};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Queue status of a task. Every stored key is in exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Enqueued, eligible for claim.
    Todo,
    /// Claimed by a worker, lease active.
    Doing,
    /// Handler succeeded.
    Done,
    /// Handler (or its result callback) failed.
    Error,
    /// No handler registered for the task's type.
    Null,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Todo,
        Status::Doing,
        Status::Done,
        Status::Error,
        Status::Null,
    ];

    /// Can a key move from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Todo, Doing)
                | (Doing, Done)
                | (Doing, Error)
                | (Doing, Null)
                | (Doing, Todo) // lease timeout or shutdown requeue
        )
    }

    /// Is this a terminal state (absent external cleanup)?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Error | Status::Null)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Todo => "todo",
            Status::Doing => "doing",
            Status::Done => "done",
            Status::Error => "error",
            Status::Null => "null",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "todo" => Ok(Status::Todo),
            "doing" => Ok(Status::Doing),
            "done" => Ok(Status::Done),
            "error" => Ok(Status::Error),
            "null" => Ok(Status::Null),
            other => Err(Error::Other(format!("unknown queue status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Counts
// ---------------------------------------------------------------------------

/// Number of keys per status for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub todo: u64,
    pub doing: u64,
    pub done: u64,
    pub error: u64,
    pub null: u64,
}

impl StatusCounts {
    pub fn get(&self, status: Status) -> u64 {
        match status {
            Status::Todo => self.todo,
            Status::Doing => self.doing,
            Status::Done => self.done,
            Status::Error => self.error,
            Status::Null => self.null,
        }
    }

    pub fn set(&mut self, status: Status, count: u64) {
        match status {
            Status::Todo => self.todo = count,
            Status::Doing => self.doing = count,
            Status::Done => self.done = count,
            Status::Error => self.error = count,
            Status::Null => self.null = count,
        }
    }

    pub fn total(&self) -> u64 {
        self.todo + self.doing + self.done + self.error + self.null
    }
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

/// Per-status retention. A status without an entry is never swept.
///
/// Age is measured from enqueue time for `todo`, `done`, `error` and `null`,
/// and from lease start for `doing`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TtlPolicy {
    ttls: BTreeMap<Status, Duration>,
}

impl TtlPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the time-to-live for one status (builder style).
    pub fn with(mut self, status: Status, ttl: Duration) -> Self {
        self.ttls.insert(status, ttl);
        self
    }

    pub fn get(&self, status: Status) -> Option<Duration> {
        self.ttls.get(&status).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.ttls.is_empty()
    }

    /// Configured (status, ttl) pairs in status order.
    pub fn iter(&self) -> impl Iterator<Item = (Status, Duration)> + '_ {
        self.ttls.iter().map(|(s, d)| (*s, *d))
    }

    /// Parse `todo=3600,done=86400` (seconds). Blank input is an empty policy.
    pub fn parse(entries: &str) -> Result<Self> {
        let mut policy = Self::new();
        for part in entries.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (status, secs) = part
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("bad ttl entry '{part}', expected status=seconds")))?;
            let status: Status = status
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("bad ttl status '{}'", status.trim())))?;
            let secs: u64 = secs
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("bad ttl seconds '{}'", secs.trim())))?;
            policy = policy.with(status, Duration::from_secs(secs));
        }
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lifecycle_edges_are_allowed() {
        assert!(Status::Todo.can_transition_to(Status::Doing));
        assert!(Status::Doing.can_transition_to(Status::Todo));
        assert!(Status::Doing.can_transition_to(Status::Null));
        assert!(!Status::Todo.can_transition_to(Status::Done));
        assert!(!Status::Done.can_transition_to(Status::Todo));
        assert!(!Status::Doing.can_transition_to(Status::Doing));
    }

    #[test]
    fn status_parses_its_display_form() {
        for status in Status::ALL {
            assert_eq!(status.to_string().parse::<Status>().unwrap(), status);
        }
        assert!("running".parse::<Status>().is_err());
    }

    #[test]
    fn ttl_policy_parses_entries() {
        let policy = TtlPolicy::parse("todo=3, done = 86400").unwrap();
        assert_eq!(policy.get(Status::Todo), Some(Duration::from_secs(3)));
        assert_eq!(policy.get(Status::Done), Some(Duration::from_secs(86400)));
        assert_eq!(policy.get(Status::Doing), None);
        assert!(TtlPolicy::parse("").unwrap().is_empty());
        assert!(TtlPolicy::parse("todo").is_err());
        assert!(TtlPolicy::parse("later=5").is_err());
        assert!(TtlPolicy::parse("todo=soon").is_err());
    }
}
