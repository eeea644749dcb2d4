//! Rate-limited FIFO queues pacing LSP floods and acknowledgements so a
//! routing change never turns into an LSP storm.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Which queue an item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QKind {
    /// Flood the originator's LSP to the neighbor.
    Send,
    /// Acknowledge the originator's LSP to the neighbor.
    Ack,
}

/// A `(neighbor, originator)` work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QItem {
    /// The neighbor to contact.
    pub neighbor: Vec<u8>,
    /// Whose LSP the contact is about.
    pub originator: Vec<u8>,
}

/// A FIFO drained at a fixed rate. Inserting an item already queued is a
/// no-op, so floods collapse naturally under load.
pub struct LsQueue {
    kind: QKind,
    items: Mutex<VecDeque<QItem>>,
}

impl LsQueue {
    /// An empty queue of the given kind.
    pub fn new(kind: QKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            items: Mutex::new(VecDeque::new()),
        })
    }

    /// Queue an item unless it is already pending.
    pub fn insert(&self, item: QItem) {
        let mut items = self.items.lock();
        if !items.contains(&item) {
            items.push_back(item);
        }
    }

    /// Drop all pending items for a (dead) neighbor.
    pub fn remove_neighbor(&self, neighbor: &[u8]) {
        self.items.lock().retain(|item| item.neighbor != neighbor);
    }

    /// Pop one item per `rate` tick into `out` until cancelled.
    pub async fn rate_limited_drain(
        self: Arc<Self>,
        out: mpsc::Sender<(QKind, QItem)>,
        rate: Duration,
        cancel: CancellationToken,
    ) {
        let mut tick = tokio::time::interval(rate.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let head = self.items.lock().pop_front();
                    if let Some(item) = head
                        && out.send((self.kind, item)).await.is_err()
                    {
                        return;
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_items_collapse() {
        let q = LsQueue::new(QKind::Send);
        let item = QItem {
            neighbor: vec![1],
            originator: vec![2],
        };
        q.insert(item.clone());
        q.insert(item.clone());
        assert_eq!(q.items.lock().len(), 1);
        q.remove_neighbor(&[1]);
        assert!(q.items.lock().is_empty());
    }

    #[tokio::test]
    async fn drains_in_fifo_order() {
        let q = LsQueue::new(QKind::Ack);
        for i in 0..3u8 {
            q.insert(QItem {
                neighbor: vec![i],
                originator: vec![9],
            });
        }
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(q.clone().rate_limited_drain(
            tx,
            Duration::from_millis(1),
            cancel.clone(),
        ));
        for i in 0..3u8 {
            let (kind, item) = rx.recv().await.unwrap();
            assert_eq!(kind, QKind::Ack);
            assert_eq!(item.neighbor, vec![i]);
        }
        cancel.cancel();
        let _ = task.await;
    }
}
