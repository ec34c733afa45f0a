pub mod error;
pub mod real;
pub mod tensor;
pub mod model;
pub mod parallel;
pub mod dispatch;
pub mod kernels;
pub mod forward;
pub mod backward;
pub mod dma;
pub mod tiled;
pub mod gradient;

pub use backward::backward;
pub use error::{MhsaError, Result};
pub use forward::forward;
pub use kernels::Executor;
pub use model::{Activations, ExecConfig, MhsaConfig, MhsaParams, ScaleMode};
pub use real::Real;
pub use tensor::{Scratch, Tensor};
pub use tiled::{forward_double_buffered, TilingConfig};
