//! Fault-isolated task launching.
//!
//! Every per-delivery and per-connection callback runs through a
//! [`TaskTracker`]. A panic inside a launched task is caught, logged and turned
//! into a normal task completion. The tracker counts in-flight tasks so that
//! shutdown can wait for quiescence before tearing things down.

pub mod tracker;

pub use tracker::TaskTracker;

use std::future::Future;

use tokio::task::JoinHandle;

/// Launch on the process-wide tracker.
pub fn launch<F>(name: impl Into<String>, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    TaskTracker::global().launch(name, fut)
}

/// True when no task launched on the process-wide tracker is in flight.
pub fn idle() -> bool {
    TaskTracker::global().idle()
}
