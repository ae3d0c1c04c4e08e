//! Runtime error types.

use crate::config::ConfigError;
use rpcq_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
}
