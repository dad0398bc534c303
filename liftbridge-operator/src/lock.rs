use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::{
    api::{Api, PostParams},
    Client,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{OperatorError, Result};
use crate::events::{EventSink, EventType};

pub const DEFAULT_LOCK_NAMESPACE: &str = "liftbridge-operator";
pub const DEFAULT_LOCK_NAME: &str = "liftbridge-operator";

const EVENT_REASON: &str = "LeaderElection";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub namespace: String,
    pub name: String,
}

impl LockKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_dns_label("lock namespace", &self.namespace)?;
        validate_dns_subdomain("lock name", &self.name)
    }
}

impl Default for LockKey {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_NAMESPACE, DEFAULT_LOCK_NAME)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

fn validate_dns_label(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.len() > 63 {
        return Err(OperatorError::lock(format!(
            "{} must be 1-63 characters, got {:?}",
            what, value
        )));
    }
    validate_dns_chars(what, value, false)
}

fn validate_dns_subdomain(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.len() > 253 {
        return Err(OperatorError::lock(format!(
            "{} must be 1-253 characters, got {:?}",
            what, value
        )));
    }
    validate_dns_chars(what, value, true)
}

fn validate_dns_chars(what: &str, value: &str, allow_dots: bool) -> Result<()> {
    let valid_char = |c: char| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || (allow_dots && c == '.')
    };
    let alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());

    if !value.chars().all(valid_char) || !alnum(value.chars().next()) || !alnum(value.chars().last())
    {
        return Err(OperatorError::lock(format!(
            "{} {:?} is not a valid DNS name",
            what, value
        )));
    }
    Ok(())
}

/// The leader election fields of a `Lease`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder_identity: Option<String>,
    pub lease_duration_seconds: i32,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub lease_transitions: i32,
}

impl LeaseRecord {
    pub fn held_by(
        identity: impl Into<String>,
        lease_duration_seconds: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            holder_identity: Some(identity.into()),
            lease_duration_seconds,
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: 0,
        }
    }

    /// The current holder. An empty identity counts as released.
    pub fn holder(&self) -> Option<&str> {
        self.holder_identity.as_deref().filter(|h| !h.is_empty())
    }

    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder() == Some(identity)
    }

    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(self.lease_duration_seconds))
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.renew_time.map(|rt| rt + self.lease_duration())
    }

    /// A lease is valid while it has a holder and `now - renew_time` is
    /// strictly less than the lease duration.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match (self.holder(), self.renew_time) {
            (Some(_), Some(renew_time)) => {
                now.signed_duration_since(renew_time) < self.lease_duration()
            }
            _ => false,
        }
    }

    pub fn from_spec(spec: &LeaseSpec) -> Self {
        Self {
            holder_identity: spec.holder_identity.clone(),
            lease_duration_seconds: spec.lease_duration_seconds.unwrap_or_default(),
            acquire_time: spec.acquire_time.as_ref().map(|t| t.0),
            renew_time: spec.renew_time.as_ref().map(|t| t.0),
            lease_transitions: spec.lease_transitions.unwrap_or_default(),
        }
    }

    pub fn to_spec(&self) -> LeaseSpec {
        LeaseSpec {
            holder_identity: self.holder_identity.clone(),
            lease_duration_seconds: Some(self.lease_duration_seconds),
            acquire_time: self.acquire_time.map(MicroTime),
            renew_time: self.renew_time.map(MicroTime),
            lease_transitions: Some(self.lease_transitions),
            ..Default::default()
        }
    }
}

/// Storage operations behind leader election.
///
/// `update` must fail with [`OperatorError::Conflict`] when the record was
/// changed by someone else since this handle's last successful `get`,
/// `create` or `update`.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    async fn get(&self) -> Result<Option<LeaseRecord>>;

    async fn create(&self, record: &LeaseRecord) -> Result<()>;

    async fn update(&self, record: &LeaseRecord) -> Result<()>;

    /// Best-effort audit event; never fails.
    async fn record_event(&self, message: &str);

    fn identity(&self) -> &str;

    fn key(&self) -> &LockKey;

    fn describe(&self) -> String {
        self.key().to_string()
    }
}

/// Validates everything a lock handle needs before it touches the store.
pub fn validate_lock(key: &LockKey, identity: &str) -> Result<()> {
    key.validate()?;
    if identity.trim().is_empty() {
        return Err(OperatorError::lock("lock identity must not be empty"));
    }
    Ok(())
}

pub struct KubeLeaseLock {
    leases: Api<Lease>,
    key: LockKey,
    identity: String,
    events: Arc<dyn EventSink>,
    observed: Mutex<Option<Lease>>,
}

impl KubeLeaseLock {
    pub fn new(
        client: Client,
        key: LockKey,
        identity: impl Into<String>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let identity = identity.into();
        validate_lock(&key, &identity)?;

        Ok(Self {
            leases: Api::namespaced(client, &key.namespace),
            key,
            identity,
            events,
            observed: Mutex::new(None),
        })
    }

    fn map_write_error(&self, err: kube::Error) -> OperatorError {
        match err {
            kube::Error::Api(e) if e.code == 409 && e.reason == "AlreadyExists" => {
                OperatorError::AlreadyExists(self.key.to_string())
            }
            kube::Error::Api(e) if e.code == 409 => OperatorError::Conflict(self.key.to_string()),
            e => OperatorError::KubeApi(e),
        }
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn get(&self) -> Result<Option<LeaseRecord>> {
        match self.leases.get(&self.key.name).await {
            Ok(lease) => {
                let record = lease
                    .spec
                    .as_ref()
                    .map(LeaseRecord::from_spec)
                    .unwrap_or_default();
                *self.observed.lock() = Some(lease);
                Ok(Some(record))
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                *self.observed.lock() = None;
                Ok(None)
            }
            Err(e) => Err(OperatorError::KubeApi(e)),
        }
    }

    async fn create(&self, record: &LeaseRecord) -> Result<()> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.key.name.clone()),
                namespace: Some(self.key.namespace.clone()),
                ..Default::default()
            },
            spec: Some(record.to_spec()),
        };

        let created = self
            .leases
            .create(&PostParams::default(), &lease)
            .await
            .map_err(|e| self.map_write_error(e))?;
        *self.observed.lock() = Some(created);
        Ok(())
    }

    async fn update(&self, record: &LeaseRecord) -> Result<()> {
        let mut lease = self
            .observed
            .lock()
            .clone()
            .ok_or_else(|| OperatorError::lock("lease must be read before it is updated"))?;
        lease.spec = Some(record.to_spec());

        // `replace` sends the observed resourceVersion, which the API server
        // compares before writing.
        let updated = self
            .leases
            .replace(&self.key.name, &PostParams::default(), &lease)
            .await
            .map_err(|e| self.map_write_error(e))?;
        *self.observed.lock() = Some(updated);
        Ok(())
    }

    async fn record_event(&self, message: &str) {
        let message = format!("{} {}", self.identity, message);
        if let Err(e) = self.events.emit(EventType::Normal, EVENT_REASON, &message).await {
            debug!(
                error = %e,
                lock = %self.key,
                component = %self.events.component(),
                "Failed to record leader election event"
            );
        }
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn key(&self) -> &LockKey {
        &self.key
    }
}
