//! The send log: every outgoing message stays queued until it has been
//! posted to `dropbox_send_redundancy` distinct dropboxes, and is only
//! forgotten once the recipient's polling cycle can be assumed to have
//! picked it up.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use prism_types::cleartext::ClearText;
use prism_types::server_db::ServerDb;

use crate::routing::MessageRoute;

/// One backlog entry: the message plus the routes already used.
#[derive(Debug, Clone)]
pub struct SendLogEntry {
    /// The message awaiting delivery.
    pub message: ClearText,
    /// Routes successfully posted so far.
    pub routes_sent: Vec<MessageRoute>,
}

impl SendLogEntry {
    /// Pseudonyms of dropboxes already used.
    pub fn dropboxes_sent(&self) -> Vec<&[u8]> {
        self.routes_sent
            .iter()
            .map(|route| route.target.pseudonym.as_slice())
            .collect()
    }

    /// How many more distinct dropboxes this entry must reach.
    pub fn sends_remaining(&self, redundancy: usize) -> usize {
        redundancy.saturating_sub(self.routes_sent.len())
    }

    /// Record a successful post.
    pub fn sent(&mut self, route: MessageRoute) {
        self.routes_sent.push(route);
    }

    /// Drop routes that have since been NARKed so they are retried
    /// elsewhere.
    pub fn invalidate_routes(&mut self, db: &ServerDb) {
        self.routes_sent.retain(|route| !route.is_dead(db));
    }

    /// Whether the entry may be forgotten: fully sent, and at least two
    /// poll periods have passed since the last send so receipt through the
    /// polling cycle can be assumed.
    pub fn safe(&self, redundancy: usize, poll_timing: Duration) -> bool {
        if self.sends_remaining(redundancy) > 0 {
            return false;
        }
        let Some(last) = self.routes_sent.iter().map(|r| r.timestamp).max() else {
            return false;
        };
        SystemTime::now()
            .duration_since(last)
            .map(|elapsed| elapsed > poll_timing * 2)
            .unwrap_or(false)
    }
}

/// The backlog of outgoing messages plus the finished-but-not-yet-safe
/// tail.
pub struct SendLog {
    redundancy: usize,
    poll_timing: Duration,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    backlog: VecDeque<SendLogEntry>,
    complete: Vec<SendLogEntry>,
}

impl SendLog {
    /// A log targeting `redundancy` sends per message.
    pub fn new(redundancy: usize, poll_timing: Duration) -> Self {
        Self {
            redundancy,
            poll_timing,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Queue a message for delivery.
    pub fn add(&self, message: ClearText) {
        self.inner.lock().backlog.push_back(SendLogEntry {
            message,
            routes_sent: Vec::new(),
        });
    }

    /// Pop the next entry to attempt, after re-validating finished entries
    /// against the server DB (a NARKed route sends its entry back into the
    /// backlog).
    pub fn take(&self, db: &ServerDb) -> Option<SendLogEntry> {
        let mut inner = self.inner.lock();

        let mut still_complete = Vec::new();
        for mut entry in std::mem::take(&mut inner.complete) {
            entry.invalidate_routes(db);
            if entry.sends_remaining(self.redundancy) > 0 {
                inner.backlog.push_back(entry);
            } else if !entry.safe(self.redundancy, self.poll_timing) {
                still_complete.push(entry);
            }
        }
        inner.complete = still_complete;

        let mut entry = inner.backlog.pop_front()?;
        entry.invalidate_routes(db);
        Some(entry)
    }

    /// Return an attempted entry: finished entries park until safe, the
    /// rest re-queue.
    pub fn put_back(&self, entry: SendLogEntry) {
        let mut inner = self.inner.lock();
        if entry.sends_remaining(self.redundancy) == 0 {
            inner.complete.push(entry);
        } else {
            inner.backlog.push_back(entry);
        }
    }

    /// Pending entry count.
    pub fn len(&self) -> usize {
        self.inner.lock().backlog.len()
    }

    /// Whether the backlog is drained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_types::state::StateStore;

    fn db() -> ServerDb {
        ServerDb::new(StateStore::ephemeral(), "genesis")
    }

    #[test]
    fn entries_cycle_until_redundancy_met() {
        let log = SendLog::new(2, Duration::from_millis(100));
        log.add(ClearText::new("alice", "bob", "hi"));

        let entry = log.take(&db()).unwrap();
        assert_eq!(entry.sends_remaining(2), 2);
        log.put_back(entry);
        // Unfinished entries come back around.
        assert!(log.take(&db()).is_some());
    }

    #[test]
    fn finished_entries_leave_the_backlog() {
        let log = SendLog::new(0, Duration::from_millis(0));
        log.add(ClearText::new("alice", "bob", "hi"));
        let entry = log.take(&db()).unwrap();
        log.put_back(entry);
        assert!(log.is_empty());
    }
}
