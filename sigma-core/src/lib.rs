pub mod config;
pub mod device;
pub mod encode;
pub mod error;
pub mod loader;
pub mod normalize;
pub mod output;
pub mod request;
pub mod service;

mod pixart;

pub use device::*;
pub use encode::*;
pub use error::*;
pub use loader::*;
pub use normalize::*;
pub use output::*;
pub use pixart::{PixArtLoader, PixArtPipeline};
pub use request::*;
pub use service::*;

/// An inference pipeline turning resolved parameters into images.
///
/// `run` is blocking and is called from the blocking thread pool. The output
/// shape is deliberately loose, see [`extract_images`].
pub trait Pipeline: Send + Sync {
    fn run(&self, params: &GenerationParams) -> Result<PipelineOutput, PipelineError>;
}
