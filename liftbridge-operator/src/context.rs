use std::sync::{Arc, OnceLock};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelCause {
    /// A termination signal was received.
    Shutdown,
    /// The lease could not be renewed before the renew deadline.
    LeadershipLost,
    /// The term ended because the guarded workload returned.
    Released,
}

impl CancelCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelCause::Shutdown => "shutdown",
            CancelCause::LeadershipLost => "leadership-lost",
            CancelCause::Released => "released",
        }
    }
}

impl std::fmt::Display for CancelCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cancellable lifecycle context.
///
/// Clones share state. The first call to [`Context::cancel`] wins: it records
/// the cause and fires the token, later calls are no-ops.
#[derive(Clone, Debug, Default)]
pub struct Context {
    token: CancellationToken,
    cause: Arc<OnceLock<CancelCause>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the context. Returns `true` only for the call that actually
    /// cancelled it.
    pub fn cancel(&self, cause: CancelCause) -> bool {
        if self.cause.set(cause).is_err() {
            return false;
        }
        // The cause is published before the token fires so every observer
        // woken by `cancelled()` can read it.
        self.token.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cause(&self) -> Option<CancelCause> {
        self.cause.get().copied()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Detaches the monitor task of a merged context.
///
/// Dropping the guard has the same effect as [`MergeGuard::release`], so a
/// guard held on the stack is released on early return and on unwind.
#[derive(Debug)]
#[must_use = "dropping the guard immediately detaches the merged context"]
pub struct MergeGuard {
    detach: CancellationToken,
    monitor: Option<JoinHandle<()>>,
}

impl MergeGuard {
    fn detached() -> Self {
        Self {
            detach: CancellationToken::new(),
            monitor: None,
        }
    }

    pub fn release(self) {}

    pub fn is_attached(&self) -> bool {
        self.monitor.as_ref().is_some_and(|m| !m.is_finished())
    }
}

impl Drop for MergeGuard {
    fn drop(&mut self) {
        self.detach.cancel();
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

/// Combines two contexts into one that is cancelled as soon as either parent
/// is, carrying the cause of the parent that fired first.
///
/// Releasing the returned guard never cancels `a` or `b`. Must be called from
/// within a tokio runtime.
pub fn merge(a: &Context, b: &Context) -> (Context, MergeGuard) {
    let merged = Context::new();

    for parent in [a, b] {
        if let Some(cause) = parent.cause() {
            merged.cancel(cause);
            return (merged, MergeGuard::detached());
        }
    }

    let detach = CancellationToken::new();
    let monitor = {
        let a = a.clone();
        let b = b.clone();
        let merged = merged.clone();
        let detach = detach.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = detach.cancelled() => {}
                _ = a.cancelled() => {
                    merged.cancel(a.cause().unwrap_or(CancelCause::Shutdown));
                }
                _ = b.cancelled() => {
                    merged.cancel(b.cause().unwrap_or(CancelCause::Shutdown));
                }
            }
        })
    };

    (
        merged,
        MergeGuard {
            detach,
            monitor: Some(monitor),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn observe(ctx: &Context) -> bool {
        tokio::time::timeout(Duration::from_secs(1), ctx.cancelled())
            .await
            .is_ok()
    }

    #[test]
    fn test_context_starts_live() {
        let ctx = Context::new();
        assert!(!ctx.is_cancelled());
        assert_eq!(ctx.cause(), None);
    }

    #[test]
    fn test_cancel_is_first_wins() {
        let ctx = Context::new();
        assert!(ctx.cancel(CancelCause::Shutdown));
        assert!(!ctx.cancel(CancelCause::LeadershipLost));
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.cause(), Some(CancelCause::Shutdown));
    }

    #[test]
    fn test_clones_share_cancellation() {
        let ctx = Context::new();
        let clone = ctx.clone();
        clone.cancel(CancelCause::Released);
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.cause(), Some(CancelCause::Released));
    }

    #[tokio::test]
    async fn test_merge_cancelled_by_first_parent() {
        let root = Context::new();
        let term = Context::new();
        let (merged, guard) = merge(&root, &term);

        root.cancel(CancelCause::Shutdown);

        assert!(observe(&merged).await);
        assert_eq!(merged.cause(), Some(CancelCause::Shutdown));
        assert!(!term.is_cancelled());
        guard.release();
    }

    #[tokio::test]
    async fn test_merge_cancelled_by_second_parent() {
        let root = Context::new();
        let term = Context::new();
        let (merged, _guard) = merge(&root, &term);

        term.cancel(CancelCause::LeadershipLost);

        assert!(observe(&merged).await);
        assert_eq!(merged.cause(), Some(CancelCause::LeadershipLost));
        assert!(!root.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_merge_both_parents_concurrently() {
        for _ in 0..100 {
            let root = Context::new();
            let term = Context::new();
            let (merged, guard) = merge(&root, &term);

            let r = root.clone();
            let t = term.clone();
            let h1 = tokio::spawn(async move { r.cancel(CancelCause::Shutdown) });
            let h2 = tokio::spawn(async move { t.cancel(CancelCause::LeadershipLost) });
            assert!(h1.await.unwrap());
            assert!(h2.await.unwrap());

            assert!(observe(&merged).await);
            let cause = merged.cause().unwrap();
            assert!(cause == CancelCause::Shutdown || cause == CancelCause::LeadershipLost);
            assert!(!merged.cancel(CancelCause::Released));
            guard.release();
        }
    }

    #[tokio::test]
    async fn test_merge_with_already_cancelled_parent() {
        let root = Context::new();
        root.cancel(CancelCause::Shutdown);
        let term = Context::new();

        let (merged, guard) = merge(&root, &term);

        assert!(merged.is_cancelled());
        assert_eq!(merged.cause(), Some(CancelCause::Shutdown));
        assert!(!guard.is_attached());
    }

    #[tokio::test]
    async fn test_release_after_cancel_is_harmless() {
        let root = Context::new();
        let term = Context::new();
        let (merged, guard) = merge(&root, &term);

        term.cancel(CancelCause::LeadershipLost);
        assert!(observe(&merged).await);

        guard.release();
        assert_eq!(merged.cause(), Some(CancelCause::LeadershipLost));
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn test_release_does_not_cancel_parents() {
        let root = Context::new();
        let term = Context::new();
        let (merged, guard) = merge(&root, &term);

        guard.release();
        tokio::task::yield_now().await;

        assert!(!root.is_cancelled());
        assert!(!term.is_cancelled());
        assert!(!merged.is_cancelled());

        // Detached: later parent cancellation no longer reaches the merge.
        root.cancel(CancelCause::Shutdown);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!merged.is_cancelled());
    }

    #[tokio::test]
    async fn test_guard_released_on_early_return() {
        fn scoped(root: &Context, term: &Context) -> Context {
            let (merged, _guard) = merge(root, term);
            merged
        }

        let root = Context::new();
        let term = Context::new();
        let merged = scoped(&root, &term);
        tokio::task::yield_now().await;

        term.cancel(CancelCause::LeadershipLost);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!merged.is_cancelled());
    }

    #[tokio::test]
    async fn test_many_listeners_observe_merge() {
        let root = Context::new();
        let term = Context::new();
        let (merged, _guard) = merge(&root, &term);

        let listeners: Vec<_> = (0..8)
            .map(|_| {
                let merged = merged.clone();
                tokio::spawn(async move {
                    merged.cancelled().await;
                    merged.cause()
                })
            })
            .collect();

        root.cancel(CancelCause::Shutdown);

        for listener in listeners {
            assert_eq!(listener.await.unwrap(), Some(CancelCause::Shutdown));
        }
    }

    #[test]
    fn test_cause_display() {
        assert_eq!(CancelCause::Shutdown.to_string(), "shutdown");
        assert_eq!(CancelCause::LeadershipLost.to_string(), "leadership-lost");
        assert_eq!(CancelCause::Released.to_string(), "released");
    }
}
