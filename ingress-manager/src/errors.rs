use ingress_manager_apis::{ConstructionError, KeyError};

/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// A queue key which is not of the form `namespace/name`. Such keys are
    /// produced by broken event handlers and never become valid.
    #[error("{0}")]
    MalformedKey(#[from] KeyError),
    /// The Ingress could not be built from the Service.
    #[error("failed to construct ingress: {0}")]
    Construction(#[from] ConstructionError),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// The sync future panicked.
    #[error("sync panicked: {0}")]
    Panicked(String),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ControllerError {
    pub(crate) fn is_temporary(&self) -> bool {
        match self {
            ControllerError::MalformedKey(_) => false,
            _ => true,
        }
    }
}
