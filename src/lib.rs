pub mod backend;
pub mod deploy;
pub mod device;
pub mod error;
pub mod graph;
pub mod kernel_cache;
pub mod precision;
pub mod proof;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod slab;
pub mod telemetry;
pub mod tensor;
pub mod training;
pub mod weights;

pub use deploy::Deployment;
pub use error::{HarmonicsError, HarmonicsResult};
pub use graph::{Graph, NodeId, NodeKind};
pub use registry::FunctionRegistry;
pub use runtime::CycleRuntime;
pub use scheduler::DistributedScheduler;
pub use tensor::Tensor;
