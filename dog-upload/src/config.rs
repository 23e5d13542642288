use crate::{ErrorPolicy, UploadError, UploadResult};

/// Configuration for the upload pipeline
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Upper bound on block transfers in flight for one draft
    pub max_concurrent_blocks: usize,

    /// If set and a revision has more pending blocks than this, blocks are
    /// uploaded in sequential pages of this size
    pub page_size: Option<usize>,

    /// How the aggregated progress is split between stages
    pub progress_weights: ProgressWeights,

    /// Capacity of the broadcast channel carrying [`UploadEvent`](crate::UploadEvent)s
    pub event_capacity: usize,

    /// Remote error code classification
    pub error_policy: ErrorPolicy,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_blocks: 5,
            page_size: None,
            progress_weights: ProgressWeights::default(),
            event_capacity: 1000,
            error_policy: ErrorPolicy::default(),
        }
    }
}

/// Relative share of each stage in the aggregated progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressWeights {
    pub allocation: u64,
    pub transfer: u64,
    pub sealing: u64,
}

impl Default for ProgressWeights {
    fn default() -> Self {
        Self {
            allocation: 5,
            transfer: 90,
            sealing: 5,
        }
    }
}

impl ProgressWeights {
    pub fn total(&self) -> u64 {
        self.allocation + self.transfer + self.sealing
    }
}

impl UploadConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the block fan-out limit
    pub fn with_max_concurrent_blocks(mut self, max: usize) -> Self {
        self.max_concurrent_blocks = max;
        self
    }

    /// Upload blocks in pages of `size` once a revision exceeds it
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn with_progress_weights(mut self, weights: ProgressWeights) -> Self {
        self.progress_weights = weights;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Layer environment overrides on top of the defaults.
    ///
    /// Recognized keys, after `prefix`: `MAX_CONCURRENT_BLOCKS`, `PAGE_SIZE`,
    /// `EVENT_CAPACITY`, and the comma separated code lists `QUOTA_CODES`,
    /// `ALREADY_COMMITTED_CODES` and `INVALID_REVISION_CODES`.
    /// `DOG_UPLOAD__PAGE_SIZE=64` with prefix `DOG_UPLOAD__` enables paging.
    pub fn from_env(prefix: &str) -> UploadResult<Self> {
        Self::from_vars(prefix, std::env::vars())
    }

    /// Same as [`from_env`](Self::from_env) over an explicit variable list
    pub fn from_vars<I>(prefix: &str, vars: I) -> UploadResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let Some(stripped) = key.strip_prefix(prefix) else {
                continue;
            };
            match stripped.to_lowercase().as_str() {
                "max_concurrent_blocks" => {
                    config.max_concurrent_blocks = parse_positive(&key, &value)?;
                }
                "page_size" => config.page_size = Some(parse_positive(&key, &value)?),
                "event_capacity" => config.event_capacity = parse_positive(&key, &value)?,
                "quota_codes" => {
                    config.error_policy.quota_exceeded_codes = parse_codes(&key, &value)?;
                }
                "already_committed_codes" => {
                    config.error_policy.already_committed_codes = parse_codes(&key, &value)?;
                }
                "invalid_revision_codes" => {
                    config.error_policy.invalid_revision_codes = parse_codes(&key, &value)?;
                }
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> UploadResult<()> {
        if self.max_concurrent_blocks == 0 {
            return Err(UploadError::config("max_concurrent_blocks must be at least 1"));
        }
        if self.page_size == Some(0) {
            return Err(UploadError::config("page_size must be at least 1"));
        }
        if self.event_capacity == 0 {
            return Err(UploadError::config("event_capacity must be at least 1"));
        }
        if self.progress_weights.total() == 0 {
            return Err(UploadError::config("progress weights must not all be zero"));
        }
        Ok(())
    }
}

fn parse_positive(key: &str, value: &str) -> UploadResult<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(UploadError::config(format!(
            "{key}: expected a positive integer, got {value:?}"
        ))),
    }
}

fn parse_codes(key: &str, value: &str) -> UploadResult<Vec<i64>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|code| {
            code.parse::<i64>()
                .map_err(|_| UploadError::config(format!("{key}: invalid error code {code:?}")))
        })
        .collect()
}
