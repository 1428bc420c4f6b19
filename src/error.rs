//! Error types for the admission core.

/// Result type alias for admission-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the admission core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// NUMA node id outside the supported range
    #[error("NUMA node {0} is out of range")]
    InvalidNode(usize),

    /// Resource request that does not convert to a whole number of bytes
    #[error("invalid quantity {0:?}: not a whole number of bytes")]
    InvalidQuantity(String),

    /// No NUMA node set has enough memory for the request
    #[error("no NUMA nodes with enough memory to satisfy the request")]
    NoFeasibleHint,

    /// The merged affinity was preferred but only non-preferred hints remain
    #[error("failed to find a preferred hint for a preferred affinity")]
    PreferredLost,

    /// Persisted state is internally inconsistent and cannot be trusted
    #[error("corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    /// Persisted machine state disagrees with its own assignments
    #[error("machine state drift: {0}; drain the node and remove the policy state file")]
    TopologyDrift(String),

    /// Checkpoint could not be written or parsed
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// The container runtime rejected a resource update
    #[error("runtime error: {0}")]
    Runtime(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Create a corrupt-checkpoint error
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        Error::CorruptCheckpoint(msg.into())
    }

    /// Create a drift error
    pub fn drift<S: Into<String>>(msg: S) -> Self {
        Error::TopologyDrift(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint<S: Into<String>>(msg: S) -> Self {
        Error::Checkpoint(msg.into())
    }

    /// Create a runtime-adapter error
    pub fn runtime<S: Into<String>>(msg: S) -> Self {
        Error::Runtime(msg.into())
    }
}
