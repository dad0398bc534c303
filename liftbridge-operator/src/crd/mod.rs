pub mod cluster;

pub use cluster::{
    LiftbridgeCluster, LiftbridgeClusterNatsSpec, LiftbridgeClusterSpec, LiftbridgeClusterStatus,
    LiftbridgeClusterStorageSpec, LiftbridgeClusterTlsSpec,
};
