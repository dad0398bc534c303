use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::context::{CancelCause, Context};
use crate::error::{OperatorError, Result};
use crate::exit::ExitCode;
use crate::lock::{LeaseLock, LeaseRecord, LockKey, DEFAULT_LOCK_NAME, DEFAULT_LOCK_NAMESPACE};

pub const DEFAULT_LEASE_DURATION_SECONDS: i32 = 15;
pub const DEFAULT_RENEW_DEADLINE_SECONDS: u64 = 10;
pub const DEFAULT_RETRY_PERIOD_SECONDS: u64 = 2;
const RELEASED_LEASE_DURATION_SECONDS: i32 = 1;

#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    pub lease_name: String,
    pub namespace: String,
    pub identity: String,
    pub lease_duration_seconds: i32,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
    pub release_on_cancel: bool,
}

impl LeaderElectionConfig {
    pub fn new(
        lease_name: impl Into<String>,
        namespace: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            lease_name: lease_name.into(),
            namespace: namespace.into(),
            identity: identity.into(),
            lease_duration_seconds: DEFAULT_LEASE_DURATION_SECONDS,
            renew_deadline: Duration::from_secs(DEFAULT_RENEW_DEADLINE_SECONDS),
            retry_period: Duration::from_secs(DEFAULT_RETRY_PERIOD_SECONDS),
            release_on_cancel: true,
        }
    }

    /// Config for the operator's well-known lease.
    pub fn for_identity(identity: impl Into<String>) -> Self {
        Self::new(DEFAULT_LOCK_NAME, DEFAULT_LOCK_NAMESPACE, identity)
    }

    pub fn with_lease_duration(mut self, seconds: i32) -> Self {
        self.lease_duration_seconds = seconds;
        self
    }

    pub fn with_renew_deadline(mut self, duration: Duration) -> Self {
        self.renew_deadline = duration;
        self
    }

    pub fn with_retry_period(mut self, duration: Duration) -> Self {
        self.retry_period = duration;
        self
    }

    pub fn with_release_on_cancel(mut self, release: bool) -> Self {
        self.release_on_cancel = release;
        self
    }

    pub fn key(&self) -> LockKey {
        LockKey::new(&self.namespace, &self.lease_name)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.lease_duration_seconds).unwrap_or(0))
    }

    /// Checks `0 < retry_period < renew_deadline < lease_duration`; without
    /// it a leader cannot renew before its lease expires.
    pub fn validate(&self) -> Result<()> {
        if self.identity.trim().is_empty() {
            return Err(OperatorError::invalid_config("identity must not be empty"));
        }
        self.key().validate()?;
        if self.lease_duration_seconds <= 0 {
            return Err(OperatorError::invalid_config(format!(
                "lease duration must be positive, got {}s",
                self.lease_duration_seconds
            )));
        }
        if self.retry_period.is_zero() {
            return Err(OperatorError::invalid_config("retry period must be positive"));
        }
        if self.retry_period >= self.renew_deadline {
            return Err(OperatorError::invalid_config(format!(
                "retry period ({:?}) must be less than renew deadline ({:?})",
                self.retry_period, self.renew_deadline
            )));
        }
        if self.renew_deadline >= self.lease_duration() {
            return Err(OperatorError::invalid_config(format!(
                "renew deadline ({:?}) must be less than lease duration ({:?})",
                self.renew_deadline,
                self.lease_duration()
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeadershipState {
    Idle,
    Acquiring,
    Leading,
    Renewing,
    Lost,
}

impl LeadershipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadershipState::Idle => "Idle",
            LeadershipState::Acquiring => "Acquiring",
            LeadershipState::Leading => "Leading",
            LeadershipState::Renewing => "Renewing",
            LeadershipState::Lost => "Lost",
        }
    }

    /// Leading or in the middle of a renewal attempt.
    pub fn holds_lease(&self) -> bool {
        matches!(self, LeadershipState::Leading | LeadershipState::Renewing)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeadershipOutcome {
    /// The root context was cancelled; the term, if any, ended cleanly.
    Shutdown,
    /// The lease could not be renewed in time.
    LeadershipLost,
    /// The guarded workload returned while the root context was live.
    WorkloadExited,
}

impl LeadershipOutcome {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            LeadershipOutcome::Shutdown => ExitCode::Graceful,
            LeadershipOutcome::LeadershipLost => ExitCode::LeadershipLost,
            LeadershipOutcome::WorkloadExited => ExitCode::WorkloadExited,
        }
    }
}

/// Hooks invoked by [`LeaderElector::run`].
#[async_trait]
pub trait LeaderCallbacks: Send + Sync + 'static {
    /// Runs the guarded workload for one term. It should return promptly once
    /// `term` is cancelled.
    async fn on_started_leading(&self, term: Context);

    /// Called once after the term context has been cancelled because the
    /// lease was lost.
    async fn on_stopped_leading(&self) {}

    /// Called whenever the observed holder changes, including to ourselves.
    async fn on_new_leader(&self, _identity: &str) {}
}

#[derive(Default)]
struct ObservedLease {
    record: Option<LeaseRecord>,
    observed_at: Option<Instant>,
}

enum RenewalExit {
    Stopped,
    Lost,
}

struct ElectorCore {
    config: LeaderElectionConfig,
    lock: Arc<dyn LeaseLock>,
    callbacks: Arc<dyn LeaderCallbacks>,
    observed: Mutex<ObservedLease>,
    reported_leader: Mutex<Option<String>>,
    is_leader: Arc<AtomicBool>,
    state: watch::Sender<LeadershipState>,
}

impl ElectorCore {
    fn identity(&self) -> &str {
        self.lock.identity()
    }

    fn set_state(&self, state: LeadershipState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = previous.as_str(), to = state.as_str(), "Leadership state changed");
        }
    }

    fn observe(&self, record: LeaseRecord, at: Instant) {
        let mut observed = self.observed.lock();
        observed.record = Some(record);
        observed.observed_at = Some(at);
    }

    /// Notifies `on_new_leader` on its own task so a slow callback cannot
    /// hold up acquisition or renewal.
    fn report_leader(&self, holder: &str) {
        {
            let mut reported = self.reported_leader.lock();
            if reported.as_deref() == Some(holder) {
                return;
            }
            *reported = Some(holder.to_string());
        }
        let callbacks = Arc::clone(&self.callbacks);
        let holder = holder.to_string();
        tokio::spawn(async move { callbacks.on_new_leader(&holder).await });
    }

    /// Emits a leader election event, giving up after `limit`.
    async fn record_event_within(&self, message: &str, limit: Duration) {
        if tokio::time::timeout(limit, self.lock.record_event(message))
            .await
            .is_err()
        {
            warn!(event = message, limit = ?limit, "Timed out recording leader election event");
        }
    }

    /// One acquire-or-renew round against the store. Store errors count as
    /// a failed round; the caller decides when failures become fatal.
    ///
    /// On success returns the instant the round started. Other candidates
    /// measure expiry from no earlier than that point.
    async fn try_acquire_or_renew(&self) -> Option<Instant> {
        let now = chrono::Utc::now();
        let instant = Instant::now();
        let identity = self.identity().to_string();
        let mut desired =
            LeaseRecord::held_by(identity.as_str(), self.config.lease_duration_seconds, now);

        let current = match self.lock.get().await {
            Ok(Some(current)) => current,
            Ok(None) => {
                return match self.lock.create(&desired).await {
                    Ok(()) => {
                        self.observe(desired, instant);
                        self.report_leader(&identity);
                        info!(identity = %identity, lock = %self.lock.describe(), "Created and acquired leader lease");
                        Some(instant)
                    }
                    Err(e) => {
                        debug!(identity = %identity, error = %e, "Failed to create leader lease");
                        None
                    }
                };
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "Failed to read leader lease");
                return None;
            }
        };

        let observed_at = {
            let mut observed = self.observed.lock();
            if observed.record.as_ref() != Some(&current) {
                observed.record = Some(current.clone());
                observed.observed_at = Some(instant);
            }
            observed.observed_at.unwrap_or(instant)
        };

        if let Some(holder) = current.holder() {
            self.report_leader(holder);

            // Expiry is judged from when we saw the record change, on the
            // local monotonic clock, so clock skew between nodes does not
            // matter.
            let lease_seconds = if current.lease_duration_seconds > 0 {
                current.lease_duration_seconds
            } else {
                self.config.lease_duration_seconds
            };
            let lease_duration =
                Duration::from_secs(u64::try_from(lease_seconds).unwrap_or_default());
            if holder != identity && observed_at + lease_duration > instant {
                debug!(
                    identity = %identity,
                    holder = %holder,
                    expires_at = ?current.expires_at(),
                    "Lease is held by another candidate"
                );
                return None;
            }
            if holder != identity && current.is_valid_at(now) {
                warn!(
                    identity = %identity,
                    holder = %holder,
                    "Taking over a lease whose renew time is still recent, clocks may be skewed"
                );
            }
        }

        if current.is_held_by(&identity) {
            desired.acquire_time = current.acquire_time;
            desired.lease_transitions = current.lease_transitions;
        } else {
            desired.lease_transitions = current.lease_transitions + 1;
        }

        match self.lock.update(&desired).await {
            Ok(()) => {
                let acquired = !current.is_held_by(&identity);
                self.observe(desired, instant);
                self.report_leader(&identity);
                if acquired {
                    info!(identity = %identity, lock = %self.lock.describe(), "Acquired leader lease");
                } else {
                    debug!(identity = %identity, "Renewed leader lease");
                }
                Some(instant)
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "Failed to update leader lease");
                None
            }
        }
    }

    /// Returns the instant the winning round started, or `None` when `root`
    /// was cancelled first.
    async fn acquire(&self, root: &Context) -> Option<Instant> {
        self.set_state(LeadershipState::Acquiring);
        info!(identity = %self.identity(), lock = %self.lock.describe(), "Attempting to acquire leader lease");

        loop {
            if root.is_cancelled() {
                break;
            }
            if let Some(acquired_at) = self.try_acquire_or_renew().await {
                self.is_leader.store(true, Ordering::SeqCst);
                self.set_state(LeadershipState::Leading);
                return Some(acquired_at);
            }
            tokio::select! {
                _ = root.cancelled() => break,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }

        self.set_state(LeadershipState::Idle);
        None
    }

    /// Renews every retry period until the term ends or no renewal succeeds
    /// within `renew_deadline` of the last successful one. The first
    /// deadline counts from `acquired_at`.
    async fn renew(&self, term: &Context, acquired_at: Instant) -> RenewalExit {
        let mut last_renewal = acquired_at;

        loop {
            tokio::select! {
                _ = term.cancelled() => return RenewalExit::Stopped,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
            if term.is_cancelled() {
                return RenewalExit::Stopped;
            }

            let deadline = last_renewal + self.config.renew_deadline;
            self.set_state(LeadershipState::Renewing);
            let renewed = tokio::select! {
                biased;
                _ = term.cancelled() => return RenewalExit::Stopped,
                result = tokio::time::timeout_at(deadline, self.try_acquire_or_renew()) => {
                    result.ok().flatten()
                }
            };

            if let Some(renewed_at) = renewed {
                last_renewal = renewed_at;
                self.set_state(LeadershipState::Leading);
            } else if Instant::now() >= deadline {
                warn!(
                    identity = %self.identity(),
                    renew_deadline = ?self.config.renew_deadline,
                    "Failed to renew leader lease before the renew deadline"
                );
                return RenewalExit::Lost;
            }
        }
    }

    async fn release(&self) -> Result<bool> {
        let identity = self.identity().to_string();
        let Some(current) = self.lock.get().await? else {
            debug!("Lease not found, nothing to release");
            return Ok(false);
        };
        if !current.is_held_by(&identity) {
            return Ok(false);
        }

        let now = chrono::Utc::now();
        let released = LeaseRecord {
            holder_identity: None,
            lease_duration_seconds: RELEASED_LEASE_DURATION_SECONDS,
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: current.lease_transitions,
        };
        self.lock.update(&released).await?;
        self.observe(released, Instant::now());
        self.is_leader.store(false, Ordering::SeqCst);
        info!(identity = %identity, "Released leader lease");
        Ok(true)
    }
}

/// Runs the guarded workload while holding the operator's lease.
///
/// A single call to [`LeaderElector::run`] covers one leadership term: it
/// waits to acquire the lease, starts the workload, keeps renewing, and
/// returns once both the renewal loop and the workload have stopped.
pub struct LeaderElector {
    core: Arc<ElectorCore>,
}

impl LeaderElector {
    pub fn new(
        lock: Arc<dyn LeaseLock>,
        config: LeaderElectionConfig,
        callbacks: Arc<dyn LeaderCallbacks>,
    ) -> Result<Self> {
        config.validate()?;
        if lock.identity() != config.identity {
            return Err(OperatorError::invalid_config(format!(
                "lock identity {:?} does not match configured identity {:?}",
                lock.identity(),
                config.identity
            )));
        }
        if *lock.key() != config.key() {
            return Err(OperatorError::invalid_config(format!(
                "lock {} does not match configured lease {}",
                lock.key(),
                config.key()
            )));
        }

        let (state, _) = watch::channel(LeadershipState::Idle);
        Ok(Self {
            core: Arc::new(ElectorCore {
                config,
                lock,
                callbacks,
                observed: Mutex::new(ObservedLease::default()),
                reported_leader: Mutex::new(None),
                is_leader: Arc::new(AtomicBool::new(false)),
                state,
            }),
        })
    }

    pub fn config(&self) -> &LeaderElectionConfig {
        &self.core.config
    }

    pub fn is_leader(&self) -> bool {
        self.core.is_leader.load(Ordering::SeqCst)
    }


    pub fn state(&self) -> LeadershipState {
        *self.core.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.core.state.subscribe()
    }

    /// The holder identity most recently observed in the store.
    pub fn observed_leader(&self) -> Option<String> {
        self.core.reported_leader.lock().clone()
    }

    pub async fn try_acquire_or_renew(&self) -> bool {
        self.core.try_acquire_or_renew().await.is_some()
    }

    /// Gives the lease up if we still hold it so a standby can take over
    /// without waiting for expiry.
    pub async fn release(&self) -> Result<bool> {
        self.core.release().await
    }

    pub async fn run(&self, root: &Context) -> LeadershipOutcome {
        let Some(acquired_at) = self.core.acquire(root).await else {
            info!("Shutdown requested before leadership was acquired");
            return LeadershipOutcome::Shutdown;
        };

        let term = Context::new();
        {
            let core = Arc::clone(&self.core);
            let limit = self.core.config.renew_deadline;
            tokio::spawn(async move { core.record_event_within("became leader", limit).await });
        }

        let mut workload: JoinHandle<()> = {
            let callbacks = Arc::clone(&self.core.callbacks);
            let term = term.clone();
            tokio::spawn(async move { callbacks.on_started_leading(term).await })
        };
        let mut renewal: JoinHandle<RenewalExit> = {
            let core = Arc::clone(&self.core);
            let term = term.clone();
            tokio::spawn(async move { core.renew(&term, acquired_at).await })
        };

        tokio::select! {
            exit = &mut renewal => {
                if let Err(e) = &exit {
                    error!(error = %e, "Lease renewal task failed");
                }
                if let Ok(RenewalExit::Stopped) = exit {
                    // Only the term owner cancels the term, so renewal cannot
                    // stop on its own while the workload is still running.
                    warn!("Lease renewal stopped unexpectedly");
                }
                self.lose_leadership(&term, workload).await;
                LeadershipOutcome::LeadershipLost
            }
            result = &mut workload => {
                if let Err(e) = result {
                    error!(error = %e, "Leader workload task failed");
                }
                self.end_term(root, &term, renewal).await
            }
        }
    }

    async fn lose_leadership(&self, term: &Context, mut workload: JoinHandle<()>) {
        self.core.is_leader.store(false, Ordering::SeqCst);
        self.core.set_state(LeadershipState::Lost);
        term.cancel(CancelCause::LeadershipLost);

        let grace = self.core.config.retry_period;
        if tokio::time::timeout(grace, &mut workload).await.is_err() {
            warn!(grace = ?grace, "Leader workload ignored cancellation, aborting it");
            workload.abort();
            let _ = workload.await;
        }

        self.core.record_event_within("stopped leading", grace).await;
        self.core.callbacks.on_stopped_leading().await;
    }

    async fn end_term(
        &self,
        root: &Context,
        term: &Context,
        renewal: JoinHandle<RenewalExit>,
    ) -> LeadershipOutcome {
        let outcome = if root.is_cancelled() {
            LeadershipOutcome::Shutdown
        } else {
            LeadershipOutcome::WorkloadExited
        };

        term.cancel(CancelCause::Released);
        if let Err(e) = renewal.await {
            error!(error = %e, "Lease renewal task failed");
        }

        if self.core.config.release_on_cancel {
            let limit = self.core.config.renew_deadline;
            match tokio::time::timeout(limit, self.core.release()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "Failed to release leader lease"),
                Err(_) => warn!(limit = ?limit, "Timed out releasing leader lease"),
            }
        }
        self.core.is_leader.store(false, Ordering::SeqCst);
        self.core.set_state(LeadershipState::Idle);
        self.core
            .record_event_within("stopped leading", self.core.config.retry_period)
            .await;
        outcome
    }
}
