use thiserror::Error;

/// Every semantic error kind the engine can raise, from graph construction
/// through execution, partitioning and serialisation.
#[derive(Error, Debug)]
pub enum HarmonicsError {
    #[error("duplicate node name: {0}")]
    DuplicateName(String),
    #[error("unknown node reference: {0}")]
    UnknownNode(String),
    #[error("malformed graph declaration: {0}")]
    MalformedAst(String),

    #[error("producer {0} is not bound to a source")]
    ProducerNotBound(usize),
    #[error("producer {name} sample width {actual} disagrees with declared width {declared}")]
    ProducerShapeMismatch { name: String, declared: usize, actual: usize },

    #[error("unknown activation: {0}")]
    UnknownActivation(String),
    #[error("unknown loss: {0}")]
    UnknownLoss(String),
    #[error("function id already registered: {0}")]
    DuplicateFunction(String),
    #[error("size mismatch inside kernel {kernel}: expected {expected}, found {found}")]
    KernelSizeMismatch { kernel: String, expected: usize, found: usize },
    #[error("unsupported dtype {dtype:?} for kernel {kernel}")]
    UnsupportedDType { kernel: String, dtype: crate::tensor::DType },
    #[error("shader compile failed for {shader_key}: {reason}")]
    CompileFailed { shader_key: String, reason: String },
    #[error("requested backend unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("flow line schedules two arrows writing the same slot: {0:?}")]
    AliasingWrite(crate::graph::NodeId),

    #[error("bad magic bytes: expected {expected}, found {found:?}")]
    BadMagic { expected: &'static str, found: [u8; 4] },
    #[error("truncated stream while reading {0}")]
    TruncatedStream(&'static str),
    #[error("unsupported file version: {0}")]
    UnsupportedVersion(u32),
    #[error("tensor size inconsistency: declared {declared} bytes, found {found}")]
    TensorSizeInconsistency { declared: usize, found: usize },

    #[error("partition split {split} out of range for {len} layers")]
    SplitOutOfRange { split: usize, len: usize },

    #[error("device allocation failed: {0}")]
    AllocationFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type HarmonicsResult<T> = Result<T, HarmonicsError>;
