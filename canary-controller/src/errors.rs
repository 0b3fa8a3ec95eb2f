/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// The resource cache did not complete its initial listing before
    /// shutdown was requested. Fatal during startup.
    #[error("failed to wait for {0} cache to sync")]
    CacheSync(String),
    /// The `Canary` CustomResourceDefinition is not installed or not readable.
    #[error("Canary CRD is not registered: {0}")]
    CrdNotRegistered(kube::Error),
    /// The API server reports a version outside the supported range.
    #[error("unsupported version of kubernetes detected, expected {expected}, got {actual}")]
    UnsupportedKubernetesVersion { expected: String, actual: String },
    /// The API server version cannot be parsed as a semantic version.
    #[error("error parsing kubernetes version {0} as a semantic version: {1}")]
    InvalidKubernetesVersion(String, semver::Error),
    /// Invalid command line or environment configuration.
    #[error("{0}")]
    Configuration(String),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Kubeconfig loading errors
    #[error("{0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),
    /// Metrics pipeline setup errors
    #[error("failed to set up metrics: {0}")]
    Metrics(String),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "".to_string(),
            code,
        })
    }

    #[test]
    fn classifies_api_errors() {
        assert!(api_error(404).is_not_found());
        assert!(api_error(410).is_not_found());
        assert!(!api_error(409).is_not_found());
        assert!(!api_error(500).is_not_found());
    }
}
