#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod context;
pub mod crd;
pub mod error;
pub mod events;
pub mod exit;
pub mod leader;
pub mod lock;
pub mod runner;
pub mod signals;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use context::{merge, CancelCause, Context, MergeGuard};
pub use crd::{
    LiftbridgeCluster, LiftbridgeClusterNatsSpec, LiftbridgeClusterSpec, LiftbridgeClusterStatus,
    LiftbridgeClusterStorageSpec, LiftbridgeClusterTlsSpec,
};
pub use error::{OperatorError, Result};
pub use events::{EventSink, EventType, KubeEventSink, NoopEventSink};
pub use exit::ExitCode;
pub use leader::{
    LeaderCallbacks, LeaderElectionConfig, LeaderElector, LeadershipOutcome, LeadershipState,
    DEFAULT_LEASE_DURATION_SECONDS, DEFAULT_RENEW_DEADLINE_SECONDS, DEFAULT_RETRY_PERIOD_SECONDS,
};
pub use lock::{
    validate_lock, KubeLeaseLock, LeaseLock, LeaseRecord, LockKey, DEFAULT_LOCK_NAME,
    DEFAULT_LOCK_NAMESPACE,
};
pub use runner::{
    run_guarded, ClusterWatchWorkload, GuardedWorkload, IdleWorkload, RunOutcome, Workload,
};
pub use signals::TerminationSignal;
