use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("image template {0} not found")]
    ImageNotFound(PathBuf),

    #[error("image template {0} is not a regular file")]
    ImageNotRegularFile(PathBuf),

    #[error("failed to copy image template {path}: {source}")]
    ImageCopy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("network setup of {device} failed at step '{step}': {source}")]
    Network {
        device: String,
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn hypervisor: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("control socket {0} did not become ready in time")]
    SocketTimeout(PathBuf),

    #[error("hypervisor exited during startup")]
    ExitedDuringStartup,

    #[error("hypervisor rejected {resource}: {source}")]
    Configure {
        resource: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to stop hypervisor: {0}")]
    Stop(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
#[error("metadata push to {socket} failed: {source}")]
pub struct MetadataError {
    pub socket: PathBuf,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("no free guest addresses left in the pool")]
    ResourceExhausted,

    #[error(transparent)]
    Provisioning(#[from] ProvisionError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("vm {0} not found")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VmError {
    pub fn kind(&self) -> &'static str {
        match self {
            VmError::Validation(_) => "validation_error",
            VmError::ResourceExhausted => "resource_exhausted",
            VmError::Provisioning(_) => "provisioning_error",
            VmError::Supervisor(_) => "supervisor_error",
            VmError::Metadata(_) => "metadata_error",
            VmError::NotFound(_) => "not_found",
            VmError::Internal(_) => "internal_error",
        }
    }
}

pub type VmResult<T> = Result<T, VmError>;
