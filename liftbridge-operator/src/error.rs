use thiserror::Error;

pub type Result<T> = std::result::Result<T, OperatorError>;

#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("Kubernetes API error: {0}")]
    KubeApi(#[from] kube::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("lease {0} was modified concurrently")]
    Conflict(String),

    #[error("lease {0} already exists")]
    AlreadyExists(String),

    #[error("coordination store unavailable: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("signal handler error: {0}")]
    Signal(#[from] std::io::Error),
}

impl OperatorError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        Self::InvalidSpec(msg.into())
    }

    pub fn lock(msg: impl Into<String>) -> Self {
        Self::Lock(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::AlreadyExists(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_constructors() {
        assert!(matches!(
            OperatorError::invalid_config("bad"),
            OperatorError::InvalidConfig(m) if m == "bad"
        ));
        assert!(matches!(
            OperatorError::invalid_spec("bad"),
            OperatorError::InvalidSpec(m) if m == "bad"
        ));
        assert!(matches!(OperatorError::lock("x"), OperatorError::Lock(_)));
        assert!(matches!(OperatorError::store("x"), OperatorError::Store(_)));
    }

    #[test]
    fn test_conflict_classification() {
        assert!(OperatorError::Conflict("ns/lease".into()).is_conflict());
        assert!(OperatorError::AlreadyExists("ns/lease".into()).is_conflict());
        assert!(!OperatorError::store("down").is_conflict());
    }

    #[test]
    fn test_display() {
        let err = OperatorError::Conflict("liftbridge-operator/liftbridge-operator".into());
        assert_eq!(
            err.to_string(),
            "lease liftbridge-operator/liftbridge-operator was modified concurrently"
        );
    }
}
