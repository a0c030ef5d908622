use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KestrelConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl Default for KestrelConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionConfig::default(),
        }
    }
}

/// Query execution tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Default degree of parallelism for per-range fan-out when the
    /// query does not specify one. Negative = unbounded, 0 = sequential,
    /// n > 0 = at most n in-flight fetches.
    #[serde(default = "default_max_degree_of_parallelism")]
    pub max_degree_of_parallelism: i32,

    /// Page size used when the caller passes `max_item_count <= 0`
    /// ("use default" sentinel). Also the page-size hint forwarded to
    /// the per-range fetch primitive.
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,

    /// End-to-end deadline for producing one page, in milliseconds,
    /// including all concurrent sub-fetches. 0 = no deadline.
    #[serde(default)]
    pub page_timeout_ms: u64,

    /// Safety valve: maximum consecutive empty backend pages accepted
    /// from a single range before the engine reports the collaborator
    /// as broken. Guards against a backend that returns empty pages
    /// with a live continuation forever.
    #[serde(default = "default_max_empty_fetches")]
    pub max_empty_fetches_per_range: u32,
}

fn default_max_degree_of_parallelism() -> i32 {
    -1
}

fn default_page_size() -> usize {
    100
}

fn default_max_empty_fetches() -> u32 {
    1000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_degree_of_parallelism: default_max_degree_of_parallelism(),
            default_page_size: default_page_size(),
            page_timeout_ms: 0,
            max_empty_fetches_per_range: default_max_empty_fetches(),
        }
    }
}

impl ExecutionConfig {
    /// Validate configuration invariants. Called once at engine startup.
    pub fn validate(&self) -> Result<(), String> {
        if self.default_page_size == 0 {
            return Err("execution.default_page_size must be > 0".into());
        }
        if self.max_empty_fetches_per_range == 0 {
            return Err("execution.max_empty_fetches_per_range must be > 0".into());
        }
        Ok(())
    }
}
