use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crossbeam_channel::bounded;

/// Per-sweep cap on corrective actions, shared by one phase's row workers.
#[derive(Debug)]
pub(crate) struct NudgeBudget {
    limit: usize,
    used: AtomicUsize,
}

impl NudgeBudget {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    /// Takes one slot, or returns false once the limit is reached.
    pub(crate) fn try_reserve(&self) -> bool {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.limit).then_some(used + 1)
            })
            .is_ok()
    }

    /// Gives back a slot whose action did not happen.
    pub(crate) fn release(&self) {
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| used.checked_sub(1));
    }

    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }
}

/// Runs `work` over `rows` on at most `concurrency` scoped threads and
/// returns once every row has been handled.
pub(crate) fn for_each_row<T, F>(rows: Vec<T>, concurrency: usize, work: F)
where
    T: Send,
    F: Fn(T) + Sync,
{
    if rows.is_empty() {
        return;
    }
    let workers = concurrency.max(1).min(rows.len());
    if workers == 1 {
        rows.into_iter().for_each(work);
        return;
    }

    let (sender, receiver) = bounded::<T>(workers);
    let work = &work;
    thread::scope(|scope| {
        for _ in 0..workers {
            let receiver = receiver.clone();
            scope.spawn(move || {
                for row in receiver {
                    work(row);
                }
            });
        }
        drop(receiver);
        for row in rows {
            if sender.send(row).is_err() {
                break;
            }
        }
        drop(sender);
    });
}
