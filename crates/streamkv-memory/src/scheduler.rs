use parking_lot::Mutex;
use tokio::sync::Notify;

struct Entry {
    id: u64,
    database: String,
    /// `None` claims the whole database (upgrades and deletes).
    scope: Option<Vec<String>>,
    writable: bool,
}

impl Entry {
    fn conflicts_with(&self, other: &Entry) -> bool {
        if self.database != other.database || !(self.writable || other.writable) {
            return false;
        }
        match (&self.scope, &other.scope) {
            (Some(ours), Some(theirs)) => ours.iter().any(|store| theirs.contains(store)),
            _ => true,
        }
    }
}

/// Start order for transactions: one may run only when no earlier unfinished
/// entry overlaps its scope with either side writing.
#[derive(Default)]
pub(crate) struct Scheduler {
    entries: Mutex<Vec<Entry>>,
    changed: Notify,
}

impl Scheduler {
    pub fn register(&self, id: u64, database: &str, scope: Option<Vec<String>>, writable: bool) {
        self.entries.lock().push(Entry {
            id,
            database: database.to_string(),
            scope,
            writable,
        });
    }

    fn can_start(&self, id: u64) -> bool {
        let entries = self.entries.lock();
        let Some(position) = entries.iter().position(|entry| entry.id == id) else {
            return true;
        };
        let candidate = &entries[position];
        !entries[..position].iter().any(|earlier| earlier.conflicts_with(candidate))
    }

    pub async fn wait_turn(&self, id: u64) {
        loop {
            let mut notified = std::pin::pin!(self.changed.notified());
            notified.as_mut().enable();
            if self.can_start(id) {
                return;
            }
            notified.await;
        }
    }

    /// Idempotent; removing an unknown id is a no-op.
    pub fn finish(&self, id: u64) {
        let removed = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|entry| entry.id != id);
            before != entries.len()
        };
        if removed {
            self.changed.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn scope(stores: &[&str]) -> Option<Vec<String>> {
        Some(stores.iter().map(|store| store.to_string()).collect())
    }

    #[test]
    fn readers_share_but_writers_wait_for_overlapping_scope() {
        let scheduler = Scheduler::default();
        scheduler.register(1, "db", scope(&["a"]), true);
        scheduler.register(2, "db", scope(&["a", "b"]), false);
        scheduler.register(3, "db", scope(&["b"]), false);
        scheduler.register(4, "other", scope(&["a"]), true);

        assert!(scheduler.wait_turn(1).now_or_never().is_some());
        assert!(scheduler.wait_turn(2).now_or_never().is_none());
        assert!(scheduler.wait_turn(3).now_or_never().is_some());
        assert!(scheduler.wait_turn(4).now_or_never().is_some());

        scheduler.finish(1);
        assert!(scheduler.wait_turn(2).now_or_never().is_some());
    }

    #[test]
    fn whole_database_claim_blocks_later_transactions() {
        let scheduler = Scheduler::default();
        scheduler.register(1, "db", None, true);
        scheduler.register(2, "db", scope(&["a"]), false);

        assert!(scheduler.wait_turn(2).now_or_never().is_none());
        scheduler.finish(1);
        scheduler.finish(1);
        assert!(scheduler.wait_turn(2).now_or_never().is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn finishing_wakes_a_waiting_transaction() {
        let scheduler = std::sync::Arc::new(Scheduler::default());
        scheduler.register(1, "db", scope(&["a"]), true);
        scheduler.register(2, "db", scope(&["a"]), true);

        let waiter = {
            let scheduler = std::sync::Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.wait_turn(2).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        scheduler.finish(1);
        waiter.await.expect("waiter should finish");
    }
}
