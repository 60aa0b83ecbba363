use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use once_cell::sync::Lazy;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, error};

// -----------------------------------------------------------------------------
// ----- Global Singleton ------------------------------------------------------

static GLOBAL_TRACKER: Lazy<TaskTracker> = Lazy::new(TaskTracker::new);

static PANIC_HOOK: Once = Once::new();

thread_local! {
    // Stack of the last panic on this thread, captured at the panic site.
    static PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

// -----------------------------------------------------------------------------
// ----- TaskTracker -----------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TaskTracker {
    pending: Arc<AtomicUsize>,
}

// -----------------------------------------------------------------------------
// ----- TaskTracker: Static ---------------------------------------------------

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static TaskTracker {
        &GLOBAL_TRACKER
    }
}

// -----------------------------------------------------------------------------
// ----- TaskTracker: Public ---------------------------------------------------

impl TaskTracker {
    /// Spawn `fut` behind a panic boundary. The pending count is bumped before
    /// the spawn and released when the task finishes, faults or is dropped.
    pub fn launch<F>(&self, name: impl Into<String>, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        install_panic_hook();

        let name = name.into();
        let guard = PendingGuard::enter(self.pending.clone());

        tokio::spawn(async move {
            let _guard = guard;

            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                let fault = FaultReport::from_panic(&panic);
                error!(
                    "task '{name}' faulted: {}\n ----Stack----\n{}",
                    fault.reason, fault.stack
                );
            }
        })
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn idle(&self) -> bool {
        self.pending() == 0
    }

    /// Poll `idle()` every `poll` until it holds or `deadline` elapses.
    /// Returns whether quiescence was reached.
    pub async fn wait_idle(&self, poll: Duration, deadline: Duration) -> bool {
        let until = Instant::now() + deadline;

        loop {
            if self.idle() {
                return true;
            }

            if Instant::now() >= until {
                debug!("still {} tasks in flight at deadline", self.pending());
                return false;
            }

            sleep(poll).await;
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: PendingGuard ------------------------------------------------

struct PendingGuard {
    pending: Arc<AtomicUsize>,
}

impl PendingGuard {
    fn enter(pending: Arc<AtomicUsize>) -> Self {
        pending.fetch_add(1, Ordering::AcqRel);
        Self { pending }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: FaultReport -------------------------------------------------

struct FaultReport {
    reason: String,
    stack: String,
}

impl FaultReport {
    /// Must run on the thread that caught the panic, before it panics again.
    fn from_panic(panic: &Box<dyn Any + Send>) -> Self {
        let stack = PANIC_STACK
            .with(|slot| slot.borrow_mut().take())
            .unwrap_or_else(|| Backtrace::force_capture().to_string());

        Self {
            reason: panic_message(panic),
            stack,
        }
    }
}

/// Chain a hook that records the panicking frames regardless of
/// `RUST_BACKTRACE`. The previous hook still runs.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();

        panic::set_hook(Box::new(move |info| {
            let stack = Backtrace::force_capture().to_string();
            PANIC_STACK.with(|slot| *slot.borrow_mut() = Some(stack));
            previous(info);
        }));
    });
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn counts_in_flight_tasks() {
        let tracker = TaskTracker::new();
        let (tx, rx) = oneshot::channel::<()>();

        let handle = tracker.launch("held", async move {
            let _ = rx.await;
        });

        assert_eq!(tracker.pending(), 1);
        assert!(!tracker.idle());

        tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(tracker.idle());
    }

    #[tokio::test]
    async fn panic_is_contained_and_released() {
        let tracker = TaskTracker::new();

        let handle = tracker.launch("boom", async {
            panic!("decode exploded");
        });

        // The join handle resolves normally; the fault never reaches us.
        handle.await.unwrap();
        assert!(tracker.idle());
    }

    #[tokio::test]
    async fn clones_share_the_counter() {
        let tracker = TaskTracker::new();
        let clone = tracker.clone();
        let (tx, rx) = oneshot::channel::<()>();

        let handle = clone.launch("held", async move {
            let _ = rx.await;
        });
        assert_eq!(tracker.pending(), 1);

        tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn wait_idle_reports_deadline_miss() {
        let tracker = TaskTracker::new();
        let (tx, rx) = oneshot::channel::<()>();

        let handle = tracker.launch("held", async move {
            let _ = rx.await;
        });

        let reached = tracker
            .wait_idle(Duration::from_millis(5), Duration::from_millis(30))
            .await;
        assert!(!reached);

        tx.send(()).unwrap();
        handle.await.unwrap();

        let reached = tracker
            .wait_idle(Duration::from_millis(5), Duration::from_millis(30))
            .await;
        assert!(reached);
    }

    #[test]
    fn fault_report_carries_the_panic_site_stack() {
        install_panic_hook();

        let panic = panic::catch_unwind(|| panic!("decode exploded")).unwrap_err();
        let fault = FaultReport::from_panic(&panic);

        assert_eq!(fault.reason, "decode exploded");
        assert!(!fault.stack.is_empty());
        assert_ne!(fault.stack, "disabled backtrace");

        // Consumed by the report; nothing left over for the next fault.
        assert!(PANIC_STACK.with(|slot| slot.borrow().is_none()));
    }

    #[test]
    fn panic_message_reads_both_payload_kinds() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        let other: Box<dyn Any + Send> = Box::new(7_u8);

        assert_eq!(panic_message(&owned), "owned");
        assert_eq!(panic_message(&borrowed), "borrowed");
        assert_eq!(panic_message(&other), "unknown panic");
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
