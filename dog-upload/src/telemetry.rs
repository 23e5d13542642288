//! Optional subscriber setup for binaries and tests embedding the pipeline.

use tracing_subscriber::EnvFilter;

use crate::{UploadError, UploadResult};

const DEFAULT_DIRECTIVE: &str = "dog_upload=info";

/// Install a formatting subscriber filtered by `RUST_LOG`, falling back to
/// `dog_upload=info`. Fails if a global subscriber is already set.
pub fn init_tracing() -> UploadResult<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| UploadError::config(format!("tracing already initialized: {e}")))
}
