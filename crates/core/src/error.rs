use thiserror::Error;

pub type Result<T> = std::result::Result<T, Waifu2xError>;

/// Failure of one `run` call, named by the phase that failed.
///
/// Every variant is terminal for the call that produced it. Nothing in the
/// core retries; callers decide whether to re-decode, reload or abort.
#[derive(Error, Debug)]
pub enum Waifu2xError {
    #[error("failed to decode image: {0}")]
    DecodeFailed(String),

    #[error("failed to encode image: {0}")]
    EncodeFailed(String),

    #[error("unsupported {0} bits alpha channel")]
    UnsupportedAlphaBits(u8),

    #[error("failed to expand image: {0}")]
    ExpandFailed(String),

    #[error("failed to rescale alpha channel: {0}")]
    AlphaRescaleFailed(String),

    #[error("inference failed: {0}")]
    InferenceError(String),

    #[error("failed to reassemble output: {0}")]
    ReassemblyFailed(String),

    #[error("blocking run failed: {0}")]
    BlockingRunFailed(String),

    #[error("invalid model descriptor: {0}")]
    InvalidModel(String),

    #[error("failed to load model: {0}")]
    LoadModelFailed(String),
}

pub fn inference_error(msg: impl ToString) -> Waifu2xError {
    Waifu2xError::InferenceError(msg.to_string())
}

pub fn reassembly_failed(msg: impl ToString) -> Waifu2xError {
    Waifu2xError::ReassemblyFailed(msg.to_string())
}
