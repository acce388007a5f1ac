//! Block-based waifu2x super-resolution on top of ONNX Runtime.

pub mod alpha;
pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod expand;
pub mod logging;
pub mod merger;
pub mod model;
pub mod pipeline;
pub mod runtime;
pub mod session;
pub mod tiling;
pub mod types;
pub mod waifu2x;

pub use error::{Result, Waifu2xError};
pub use waifu2x::{Waifu2x, DEFAULT_BATCH_SIZE};
