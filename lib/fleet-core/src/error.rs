use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },

    #[error("Conflict writing {kind} {key}: {message}")]
    Conflict {
        kind: String,
        key: String,
        message: String,
    },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: String },

    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Cluster offline: {0}")]
    ClusterOffline(String),

    #[error("Invalid desired state: {0}")]
    InvalidDesiredState(String),

    #[error("Render error: {0}")]
    RenderError(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Kubernetes error: {0}")]
    KubernetesError(#[from] kube::error::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Permanent errors need a change to the desired state before a retry
    /// can succeed; the work queue drops them instead of backing off.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidDesiredState(_)
                | CoreError::RenderError(_)
                | CoreError::SerializationError(_)
                | CoreError::YamlError(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, CoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound { .. })
    }

    /// Unknown or offline clusters are skipped by multi-cluster passes
    pub fn is_cluster_unavailable(&self) -> bool {
        matches!(
            self,
            CoreError::ClusterNotFound(_) | CoreError::ClusterOffline(_)
        )
    }

    /// Map an API error for `kind` `key` onto the error taxonomy
    pub fn from_kube(err: kube::error::Error, kind: &str, key: &str) -> Self {
        match err {
            kube::error::Error::Api(resp) => match resp.code {
                404 => CoreError::NotFound {
                    kind: kind.to_string(),
                    key: key.to_string(),
                },
                409 if resp.reason == "AlreadyExists" => CoreError::AlreadyExists {
                    kind: kind.to_string(),
                    key: key.to_string(),
                },
                409 => CoreError::Conflict {
                    kind: kind.to_string(),
                    key: key.to_string(),
                    message: resp.message,
                },
                400 | 422 => CoreError::InvalidDesiredState(format!(
                    "{} {}: {}",
                    kind, key, resp.message
                )),
                _ => CoreError::KubernetesError(kube::error::Error::Api(resp)),
            },
            other => CoreError::KubernetesError(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::error::Error {
        kube::error::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_from_kube_classification() {
        assert!(CoreError::from_kube(api_error(404, "NotFound"), "Deployment", "ns/a").is_not_found());
        assert!(CoreError::from_kube(api_error(409, "Conflict"), "Deployment", "ns/a").is_conflict());
        assert!(matches!(
            CoreError::from_kube(api_error(409, "AlreadyExists"), "Deployment", "ns/a"),
            CoreError::AlreadyExists { .. }
        ));
        assert!(CoreError::from_kube(api_error(422, "Invalid"), "Deployment", "ns/a").is_permanent());

        let server = CoreError::from_kube(api_error(503, "ServiceUnavailable"), "Deployment", "ns/a");
        assert!(!server.is_permanent());
        assert!(!server.is_conflict());
    }

    #[test]
    fn test_cluster_unavailable() {
        assert!(CoreError::ClusterOffline("east".into()).is_cluster_unavailable());
        assert!(CoreError::ClusterNotFound("east".into()).is_cluster_unavailable());
        assert!(!CoreError::Transient("x".into()).is_cluster_unavailable());
    }
}
