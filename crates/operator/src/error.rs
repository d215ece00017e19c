use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Compile(#[from] rules::CompileError),
    #[error(transparent)]
    Git(#[from] git::GitError),
    #[error(transparent)]
    Worker(#[from] services::services::worker_manager::WorkerError),
    #[error(transparent)]
    Secret(#[from] crate::secrets::SecretError),
    #[error("object has no {0}")]
    MissingObjectKey(&'static str),
    #[error("{0}")]
    Finalizer(String),
}
