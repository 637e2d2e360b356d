use thiserror::Error;

/// Failure reported by a [`crate::Pipeline`] run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("out of memory: run needs ~{required} bytes, budget is {budget} bytes")]
    OutOfMemory { required: u64, budget: u64 },
    /// The allocator or device ran out of memory mid-run.
    #[error("out of memory: {0:#}")]
    DeviceOutOfMemory(anyhow::Error),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl PipelineError {
    /// Classifies a runtime error, recognising allocator and device OOM reports.
    pub fn from_runtime(err: impl Into<anyhow::Error>) -> Self {
        let err = err.into();
        let message = format!("{err:#}").to_lowercase();
        if message.contains("out of memory") || message.contains("out_of_memory") {
            Self::DeviceOutOfMemory(err)
        } else {
            Self::Failed(err)
        }
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. } | Self::DeviceOutOfMemory(_))
    }
}

impl From<candle_core::Error> for PipelineError {
    fn from(err: candle_core::Error) -> Self {
        Self::from_runtime(err)
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("pipeline unavailable: {0}")]
    PipelineUnavailable(String),
    #[error("out of memory even with reduced parameters: {0}")]
    OutOfMemory(String),
    #[error("no images found in pipeline output")]
    NoImages,
    #[error("failed to encode all {0} generated images")]
    EncodingFailed(usize),
    #[error("generation failed: {0}")]
    PipelineFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_oom_is_classified() {
        let err = PipelineError::from_runtime(anyhow::anyhow!("CUDA_ERROR_OUT_OF_MEMORY"));
        assert!(matches!(err, PipelineError::DeviceOutOfMemory(_)));
        assert!(err.is_out_of_memory());
        assert_eq!(err.to_string(), "out of memory: CUDA_ERROR_OUT_OF_MEMORY");

        let err = PipelineError::from_runtime(anyhow::anyhow!("DriverError: out of memory"));
        assert!(err.is_out_of_memory());
        assert!(!err.to_string().contains("0 bytes"));
    }

    #[test]
    fn test_budget_oom_reports_sizes() {
        let err = PipelineError::OutOfMemory {
            required: 2048,
            budget: 1024,
        };
        assert!(err.is_out_of_memory());
        assert!(err.to_string().contains("2048"));
        assert!(err.to_string().contains("1024"));
    }

    #[test]
    fn test_other_runtime_errors_stay_failures() {
        let err = PipelineError::from(candle_core::Error::Msg("shape mismatch".to_string()));
        assert!(matches!(err, PipelineError::Failed(_)));
        assert!(!err.is_out_of_memory());
        assert!(err.to_string().contains("shape mismatch"));
    }
}
