//! The guarded section that only runs while this process leads.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::context::{merge, CancelCause, Context};
use crate::crd::LiftbridgeCluster;
use crate::leader::LeaderCallbacks;

/// The reconciliation entry point. Invoked once per leadership term and
/// expected to run until `ctx` is cancelled.
#[async_trait]
pub trait Workload: Send + Sync + 'static {
    async fn run(&self, ctx: Context) -> anyhow::Result<()>;
}

#[derive(Debug)]
pub enum RunOutcome {
    Cancelled(CancelCause),
    /// The workload returned on its own while the context was still live.
    Exited(anyhow::Result<()>),
}

impl RunOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunOutcome::Cancelled(_))
    }
}

/// Runs `workload` until it returns or `ctx` is cancelled.
///
/// On cancellation the workload future is dropped before this returns, so no
/// workload code runs after the context fires.
pub async fn run_guarded<W>(ctx: &Context, workload: &W) -> RunOutcome
where
    W: Workload + ?Sized,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => {}
        result = workload.run(ctx.clone()) => {
            if !ctx.is_cancelled() {
                match &result {
                    Ok(()) => error!("Workload returned before it was cancelled"),
                    Err(e) => error!(error = %e, "Workload failed"),
                }
                return RunOutcome::Exited(result);
            }
        }
    }

    let cause = ctx.cause().unwrap_or(CancelCause::Shutdown);
    info!(cause = %cause, "Liftbridge Operator has stopped");
    RunOutcome::Cancelled(cause)
}

/// Adapts a [`Workload`] into leader callbacks: each term runs the workload
/// under the merge of the root and term contexts.
pub struct GuardedWorkload<W: Workload> {
    root: Context,
    workload: Arc<W>,
}

impl<W: Workload> GuardedWorkload<W> {
    pub fn new(root: Context, workload: W) -> Self {
        Self {
            root,
            workload: Arc::new(workload),
        }
    }
}

#[async_trait]
impl<W: Workload> LeaderCallbacks for GuardedWorkload<W> {
    async fn on_started_leading(&self, term: Context) {
        debug!("Started leading");
        let (ctx, guard) = merge(&self.root, &term);
        let outcome = run_guarded(&ctx, self.workload.as_ref()).await;
        guard.release();
        debug!(outcome = ?outcome, "Leader workload finished");
    }

    async fn on_stopped_leading(&self) {
        error!("Leader election lost");
    }

    async fn on_new_leader(&self, identity: &str) {
        debug!(leader = %identity, "Current leader");
    }
}

/// Waits for cancellation without doing anything.
#[derive(Clone, Debug, Default)]
pub struct IdleWorkload;

#[async_trait]
impl Workload for IdleWorkload {
    async fn run(&self, ctx: Context) -> anyhow::Result<()> {
        ctx.cancelled().await;
        Ok(())
    }
}

/// Watches `LiftbridgeCluster` resources and reports their desired state.
///
/// Building the StatefulSets and Services for a cluster is left to the
/// reconciler; this keeps the watch open for the whole term and rejects
/// specs that fail validation.
pub struct ClusterWatchWorkload {
    client: Client,
}

impl ClusterWatchWorkload {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn observe(cluster: &LiftbridgeCluster) {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let name = cluster.name_any();

        if let Err(e) = cluster.spec.validate() {
            warn!(namespace = %namespace, name = %name, error = %e, "Ignoring invalid LiftbridgeCluster");
            return;
        }
        if cluster.spec.is_paused() {
            debug!(namespace = %namespace, name = %name, "LiftbridgeCluster is paused");
            return;
        }
        info!(
            namespace = %namespace,
            name = %name,
            replicas = cluster.spec.replicas,
            version = %cluster.spec.version,
            "Observed LiftbridgeCluster"
        );
    }
}

#[async_trait]
impl Workload for ClusterWatchWorkload {
    async fn run(&self, ctx: Context) -> anyhow::Result<()> {
        let clusters: Api<LiftbridgeCluster> = Api::all(self.client.clone());
        let stream = watcher(clusters, watcher::Config::default()).applied_objects();
        tokio::pin!(stream);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                item = stream.next() => match item {
                    Some(Ok(cluster)) => Self::observe(&cluster),
                    Some(Err(e)) => warn!(error = %e, "LiftbridgeCluster watch error"),
                    None => anyhow::bail!("LiftbridgeCluster watch ended"),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingWorkload {
        started: AtomicUsize,
        finished: AtomicBool,
    }

    #[async_trait]
    impl Workload for CountingWorkload {
        async fn run(&self, _ctx: Context) -> anyhow::Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            // Ignores the context on purpose: the runner must drop it.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingWorkload;

    #[async_trait]
    impl Workload for FailingWorkload {
        async fn run(&self, _ctx: Context) -> anyhow::Result<()> {
            anyhow::bail!("reconciler crashed")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_guarded_returns_on_cancel() {
        let ctx = Context::new();
        let workload = CountingWorkload::default();

        let canceller = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                ctx.cancel(CancelCause::Shutdown);
            })
        };

        let outcome = run_guarded(&ctx, &workload).await;
        canceller.await.unwrap();

        assert!(matches!(outcome, RunOutcome::Cancelled(CancelCause::Shutdown)));
        assert_eq!(workload.started.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert!(!workload.finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_guarded_already_cancelled() {
        let ctx = Context::new();
        ctx.cancel(CancelCause::LeadershipLost);
        let workload = CountingWorkload::default();

        let outcome = run_guarded(&ctx, &workload).await;

        assert!(matches!(
            outcome,
            RunOutcome::Cancelled(CancelCause::LeadershipLost)
        ));
        assert_eq!(workload.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_guarded_reports_unexpected_exit() {
        let ctx = Context::new();
        let outcome = run_guarded(&ctx, &FailingWorkload).await;

        match outcome {
            RunOutcome::Exited(Err(e)) => assert_eq!(e.to_string(), "reconciler crashed"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idle_workload_waits_for_cancel() {
        let ctx = Context::new();
        let handle = {
            let ctx = ctx.clone();
            tokio::spawn(async move { run_guarded(&ctx, &IdleWorkload).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        ctx.cancel(CancelCause::Shutdown);
        assert!(handle.await.unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn test_guarded_workload_stops_on_term_cancel() {
        let root = Context::new();
        let term = Context::new();
        let guarded = Arc::new(GuardedWorkload::new(root.clone(), IdleWorkload));

        let handle = {
            let guarded = Arc::clone(&guarded);
            let term = term.clone();
            tokio::spawn(async move { guarded.on_started_leading(term).await })
        };

        term.cancel(CancelCause::LeadershipLost);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn test_guarded_workload_stops_on_root_cancel() {
        let root = Context::new();
        let term = Context::new();
        let guarded = GuardedWorkload::new(root.clone(), IdleWorkload);

        root.cancel(CancelCause::Shutdown);
        tokio::time::timeout(Duration::from_secs(1), guarded.on_started_leading(term.clone()))
            .await
            .unwrap();
        assert!(!term.is_cancelled());
    }
}
