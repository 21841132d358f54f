//! Notification Scheduler
//!
//! Signals never call their listeners directly from `set`. They schedule a
//! notification job here, and the scheduler runs queued jobs once the
//! current synchronous unit of work is over.
//!
//! # Units of work
//!
//! - A call made outside any batch is its own unit: its jobs run before the
//!   call returns.
//! - [`batch`] opens an explicit unit. Batches nest; only the outermost one
//!   flushes when it completes.
//! - [`defer`] queues a job without starting a flush. It runs with the next
//!   flush, whichever unit of work triggers it, or on an explicit [`flush`].
//!   Computed signals use this to coalesce bursts of `refresh()` calls.
//!
//! Jobs run in FIFO order. Jobs scheduled while a flush is running are
//! picked up by the same flush. Identical jobs are not de-duplicated;
//! callers check for redundant emission before scheduling.
//!
//! # Threading
//!
//! The queue lives in thread-local storage, like the context stack of most
//! fine-grained reactive runtimes. Each thread has its own flush window.

use std::cell::RefCell;
use std::collections::VecDeque;

type Job = Box<dyn FnOnce()>;

#[derive(Default)]
struct Scheduler {
    depth: usize,
    flushing: bool,
    queue: VecDeque<Job>,
}

thread_local! {
    static SCHEDULER: RefCell<Scheduler> = RefCell::new(Scheduler::default());
}

/// Restores the batch depth even if the batched closure panics.
struct BatchGuard;

impl Drop for BatchGuard {
    fn drop(&mut self) {
        SCHEDULER.with(|s| {
            let mut s = s.borrow_mut();
            s.depth = s.depth.saturating_sub(1);
        });
    }
}

/// Clears the flushing flag even if a job panics.
struct FlushGuard;

impl Drop for FlushGuard {
    fn drop(&mut self) {
        SCHEDULER.with(|s| s.borrow_mut().flushing = false);
    }
}

/// Run `f` as one unit of work. Notifications scheduled inside run after
/// the outermost batch completes.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    SCHEDULER.with(|s| s.borrow_mut().depth += 1);
    let guard = BatchGuard;
    let output = f();
    drop(guard);

    if !is_batching() {
        flush();
    }
    output
}

/// Queue a notification job. Outside a batch it runs immediately.
pub fn schedule_notification(job: impl FnOnce() + 'static) {
    SCHEDULER.with(|s| s.borrow_mut().queue.push_back(Box::new(job)));
    if !is_batching() {
        flush();
    }
}

/// Queue a job for the next flush without starting one.
pub fn defer(job: impl FnOnce() + 'static) {
    SCHEDULER.with(|s| s.borrow_mut().queue.push_back(Box::new(job)));
}

/// Run every queued job, including jobs queued by the jobs themselves.
///
/// A nested call while a flush is running returns at once; the running
/// flush drains the queue.
pub fn flush() {
    let already_flushing = SCHEDULER.with(|s| {
        let mut s = s.borrow_mut();
        std::mem::replace(&mut s.flushing, true)
    });
    if already_flushing {
        return;
    }
    let _guard = FlushGuard;

    let mut ran = 0usize;
    loop {
        let job = SCHEDULER.with(|s| s.borrow_mut().queue.pop_front());
        match job {
            Some(job) => {
                job();
                ran += 1;
            }
            None => break,
        }
    }

    if ran > 0 {
        tracing::trace!(jobs = ran, "flushed notifications");
    }
}

/// Whether a batch is open on this thread.
pub fn is_batching() -> bool {
    SCHEDULER.with(|s| s.borrow().depth > 0)
}

/// Number of jobs waiting for the next flush on this thread.
pub fn pending() -> usize {
    SCHEDULER.with(|s| s.borrow().queue.len())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn jobs_outside_batch_run_immediately() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_clone = log.clone();

        schedule_notification(move || log_clone.borrow_mut().push(1));
        assert_eq!(*log.borrow(), vec![1]);
    }

    #[test]
    fn nested_batches_flush_once_at_the_outermost() {
        let log = Rc::new(RefCell::new(Vec::new()));

        batch(|| {
            let a = log.clone();
            schedule_notification(move || a.borrow_mut().push("a"));

            batch(|| {
                let b = log.clone();
                schedule_notification(move || b.borrow_mut().push("b"));
            });

            // Inner batch completed, nothing flushed yet.
            assert!(log.borrow().is_empty());
            assert!(is_batching());
        });

        assert_eq!(*log.borrow(), vec!["a", "b"]);
        assert!(!is_batching());
    }

    #[test]
    fn deferred_jobs_wait_for_a_flush() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_clone = log.clone();

        defer(move || log_clone.borrow_mut().push("deferred"));
        assert!(log.borrow().is_empty());
        assert_eq!(pending(), 1);

        flush();
        assert_eq!(*log.borrow(), vec!["deferred"]);
        assert_eq!(pending(), 0);
    }

    #[test]
    fn jobs_scheduled_during_flush_run_in_same_flush() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let outer = log.clone();

        batch(|| {
            schedule_notification(move || {
                outer.borrow_mut().push("first");
                let inner = outer.clone();
                schedule_notification(move || inner.borrow_mut().push("second"));
            });
        });

        assert_eq!(*log.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn distinct_jobs_are_not_deduplicated() {
        let count = Rc::new(RefCell::new(0));

        batch(|| {
            for _ in 0..3 {
                let count = count.clone();
                schedule_notification(move || *count.borrow_mut() += 1);
            }
        });

        assert_eq!(*count.borrow(), 3);
    }

    #[test]
    fn batch_depth_recovers_after_panic() {
        let result = std::panic::catch_unwind(|| batch(|| panic!("boom")));
        assert!(result.is_err());
        assert!(!is_batching());
    }
}
