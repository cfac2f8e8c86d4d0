//! Per-operation fault boundary.
//!
//! A forwarding operation is made of several independently scheduled tasks
//! (connection driver, body pumps, close watchers). Each one is spawned
//! through a [`FaultScope`] and reports into a single channel owned by the
//! operation's [`FaultBoundary`]. The first report wins; settling the
//! boundary detaches it, aborting every task still registered and refusing
//! later reports.
//!
//! ```text
//!   scope.spawn(exchange) ──┐
//!   scope.watch(driver) ────┼──▶ channel ──▶ boundary.settle() ──▶ one outcome
//!   scope.watch(closed) ────┘                    │
//!                                                └──▶ abort all registered tasks
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::proxy::ForwardError;

enum Signal {
    Complete,
    Fail(ForwardError),
}

struct Shared {
    label: &'static str,
    detached: AtomicBool,
    reported: AtomicBool,
    sources: Mutex<Vec<AbortHandle>>,
}

impl Shared {
    fn detach(&self) -> bool {
        let sources = {
            let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
            if self.detached.swap(true, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut *sources)
        };
        for source in &sources {
            source.abort();
        }
        tracing::trace!(scope = self.label, sources = sources.len(), "Fault scope detached");
        true
    }
}

/// Owner side of a fault boundary; yields the operation's single outcome.
pub struct FaultBoundary {
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<Signal>,
}

/// Reporting side of a fault boundary. Cheap to clone; hand one to every
/// task belonging to the operation.
#[derive(Clone)]
pub struct FaultScope {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Signal>,
}

impl FaultBoundary {
    /// Open a boundary. The returned scope is the only way to report into it;
    /// once every scope clone is gone without a report the outcome is
    /// [`ForwardError::Abandoned`].
    pub fn new(label: &'static str) -> (FaultBoundary, FaultScope) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            label,
            detached: AtomicBool::new(false),
            reported: AtomicBool::new(false),
            sources: Mutex::new(Vec::new()),
        });
        let boundary = FaultBoundary {
            shared: Arc::clone(&shared),
            rx,
        };
        (boundary, FaultScope { shared, tx })
    }

    /// Wait for the first report, then detach the scope from all its sources.
    pub async fn settle(mut self) -> Result<(), ForwardError> {
        let signal = self.rx.recv().await;
        self.shared.detach();
        self.rx.close();

        match signal {
            Some(Signal::Complete) => Ok(()),
            Some(Signal::Fail(err)) => Err(err),
            None => Err(ForwardError::Abandoned),
        }
    }
}

impl Drop for FaultBoundary {
    fn drop(&mut self) {
        self.shared.detach();
    }
}

impl FaultScope {
    /// Report successful completion. Returns whether this is the report the
    /// boundary settles on; only the first one is accepted.
    pub fn complete(&self) -> bool {
        self.report(Signal::Complete)
    }

    /// Report a failure. Returns whether this is the report the boundary
    /// settles on; only the first one is accepted.
    pub fn fail(&self, err: ForwardError) -> bool {
        self.report(Signal::Fail(err))
    }

    pub fn is_detached(&self) -> bool {
        self.shared.detached.load(Ordering::Acquire)
    }

    /// Run an outcome-bearing step: `Ok` completes the operation, `Err` fails it.
    pub fn spawn<F>(&self, step: F)
    where
        F: Future<Output = Result<(), ForwardError>> + Send + 'static,
    {
        let scope = self.clone();
        self.register(async move {
            match step.await {
                Ok(()) => scope.complete(),
                Err(err) => scope.fail(err),
            };
        });
    }

    /// Run a side step whose `Ok` means nothing; only its `Err` is reported.
    ///
    /// A watcher does not keep the boundary open: once every outcome-bearing
    /// holder is gone the operation is abandoned even if watchers still run.
    pub fn watch<F>(&self, step: F)
    where
        F: Future<Output = Result<(), ForwardError>> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let tx = self.tx.downgrade();
        self.register(async move {
            if let Err(err) = step.await {
                if let Some(tx) = tx.upgrade() {
                    FaultScope { shared, tx }.fail(err);
                }
            }
        });
    }

    fn register<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_detached() {
            return;
        }
        let handle = tokio::spawn(task).abort_handle();

        let mut sources = self.shared.sources.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shared.detached.load(Ordering::Acquire) {
            handle.abort();
        } else {
            sources.push(handle);
        }
    }

    fn report(&self, signal: Signal) -> bool {
        if self.is_detached() || self.shared.reported.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.tx.send(signal).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn first_failure_wins() {
        let (boundary, scope) = FaultBoundary::new("test");
        assert!(scope.fail(ForwardError::InboundAbort));
        assert!(!scope.fail(ForwardError::WriteFailure));
        assert!(!scope.complete());

        let outcome = boundary.settle().await;
        assert!(matches!(outcome, Err(ForwardError::InboundAbort)));
    }

    #[tokio::test]
    async fn reports_after_settle_are_refused() {
        let (boundary, scope) = FaultBoundary::new("test");
        scope.complete();
        assert!(boundary.settle().await.is_ok());

        assert!(scope.is_detached());
        assert!(!scope.fail(ForwardError::WriteFailure));
        assert!(!scope.complete());
    }

    #[tokio::test]
    async fn settling_aborts_registered_tasks() {
        struct DropFlag(oneshot::Sender<()>);

        let (boundary, scope) = FaultBoundary::new("test");
        let (dropped_tx, dropped_rx) = oneshot::channel();

        scope.watch(async move {
            let _flag = DropFlag(dropped_tx);
            std::future::pending::<()>().await;
            Ok(())
        });
        scope.spawn(async { Err(ForwardError::InboundAbort) });
        drop(scope);

        assert!(matches!(boundary.settle().await, Err(ForwardError::InboundAbort)));
        // The pending watcher was aborted, dropping its sender.
        let aborted = tokio::time::timeout(Duration::from_secs(1), dropped_rx).await;
        assert!(matches!(aborted, Ok(Err(_))));
    }

    #[tokio::test]
    async fn watch_ignores_success() {
        let (boundary, scope) = FaultBoundary::new("test");
        let (go_tx, go_rx) = oneshot::channel::<()>();

        scope.watch(async { Ok(()) });
        scope.spawn(async move {
            let _ = go_rx.await;
            Ok(())
        });
        drop(scope);

        tokio::task::yield_now().await;
        let _ = go_tx.send(());
        assert!(boundary.settle().await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_failures_deliver_once() {
        let (boundary, scope) = FaultBoundary::new("test");
        let delivered = Arc::new(AtomicUsize::new(0));

        let reporters: Vec<_> = (0..8)
            .map(|_| {
                let delivered = Arc::clone(&delivered);
                let scope = scope.clone();
                tokio::spawn(async move {
                    if scope.fail(ForwardError::WriteFailure) {
                        delivered.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        drop(scope);

        assert!(boundary.settle().await.is_err());
        for reporter in reporters {
            reporter.await.unwrap();
        }
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spawn_after_detach_never_runs() {
        let (boundary, scope) = FaultBoundary::new("test");
        scope.complete();
        boundary.settle().await.unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        scope.spawn(async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn pending_watcher_does_not_hold_the_boundary_open() {
        let (boundary, scope) = FaultBoundary::new("test");
        scope.watch(std::future::pending());
        scope.spawn(async {
            if true {
                panic!("step blew up");
            }
            Ok(())
        });
        drop(scope);

        let outcome = tokio::time::timeout(Duration::from_secs(1), boundary.settle()).await;
        assert!(matches!(outcome, Ok(Err(ForwardError::Abandoned))));
    }

    #[tokio::test]
    async fn vanished_scope_is_abandoned() {
        let (boundary, scope) = FaultBoundary::new("test");
        scope.spawn(async {
            if true {
                panic!("step blew up");
            }
            Ok(())
        });
        drop(scope);

        assert!(matches!(boundary.settle().await, Err(ForwardError::Abandoned)));
    }
}
