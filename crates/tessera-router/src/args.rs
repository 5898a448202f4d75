use clap::Parser;

use tessera_common::{BalancerConfig, HealthThresholds, InstanceInfo};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    #[arg(long, env = "TESSERA_ROUTER_ADDR", default_value = "0.0.0.0:18081")]
    pub listen_addr: String,

    /// Host the per-accelerator inference servers listen on.
    #[arg(long, env = "TESSERA_BACKEND_HOST", default_value = "127.0.0.1")]
    pub backend_host: String,

    /// Port of the server on accelerator 0; accelerator N listens on base + N.
    #[arg(long, env = "TESSERA_BACKEND_BASE_PORT", default_value_t = 11434)]
    pub backend_base_port: u16,

    /// Accelerator indices to balance over, e.g. "0,1,2,3".
    #[arg(long, env = "TESSERA_GPUS", value_delimiter = ',', default_value = "0")]
    pub gpus: Vec<u32>,

    #[arg(long, env = "TESSERA_ROUTING_STRATEGY", default_value = "health_weighted")]
    pub routing_strategy: String,

    #[arg(long, env = "TESSERA_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    #[arg(long, env = "TESSERA_ATTEMPT_TIMEOUT_MS", default_value_t = 120_000)]
    pub attempt_timeout_ms: u64,

    #[arg(long, env = "TESSERA_REQUEST_TIMEOUT_MS", default_value_t = 300_000)]
    pub request_timeout_ms: u64,

    #[arg(long, env = "TESSERA_BACKOFF_BASE_MS", default_value_t = 250)]
    pub backoff_base_ms: u64,

    #[arg(long, env = "TESSERA_BACKOFF_MAX_MS", default_value_t = 5_000)]
    pub backoff_max_ms: u64,

    #[arg(long, env = "TESSERA_BACKOFF_JITTER_MS", default_value_t = 100)]
    pub backoff_jitter_ms: u64,

    #[arg(long, env = "TESSERA_PULL_TIMEOUT_MS", default_value_t = 3_600_000)]
    pub pull_timeout_ms: u64,

    #[arg(long, env = "TESSERA_MEMORY_MARGIN_MB", default_value_t = 512)]
    pub memory_margin_mb: u64,

    #[arg(long, env = "TESSERA_LATENCY_BUCKET_MS", default_value_t = 100)]
    pub latency_bucket_ms: u64,

    /// Route to the least-bad instance when every eligible one is Unhealthy.
    #[arg(long, env = "TESSERA_ALLOW_DEGRADED_FALLBACK")]
    pub allow_degraded_fallback: bool,

    #[arg(long, env = "TESSERA_UNHEALTHY_BELOW", default_value_t = 0.3)]
    pub unhealthy_below: f64,

    #[arg(long, env = "TESSERA_DEGRADED_BELOW", default_value_t = 0.7)]
    pub degraded_below: f64,

    #[arg(long, env = "TESSERA_MAX_CONSECUTIVE_FAILURES", default_value_t = 3)]
    pub max_consecutive_failures: u32,

    /// Seconds between health probes; 0 disables probing.
    #[arg(long, env = "TESSERA_PROBE_INTERVAL_SECS", default_value_t = 15)]
    pub probe_interval_secs: u64,

    #[arg(long, env = "TESSERA_CONNECT_TIMEOUT_MS", default_value_t = 3_000)]
    pub connect_timeout_ms: u64,

    #[arg(long, env = "TESSERA_MAX_REQUEST_BODY_BYTES", default_value_t = 4 * 1024 * 1024)]
    pub max_request_body_bytes: usize,

    #[arg(long, env = "TESSERA_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// OTLP endpoint for exporting traces.
    #[arg(long, env = "TESSERA_OTLP_URL")]
    pub otlp_url: Option<String>,

    /// Bearer token for the OTLP collector.
    #[arg(long, env = "TESSERA_OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}

impl Args {
    pub fn instances(&self) -> Vec<InstanceInfo> {
        let mut gpus = self.gpus.clone();
        gpus.sort_unstable();
        gpus.dedup();
        gpus.into_iter()
            .map(|gpu| InstanceInfo::for_gpu(gpu, &self.backend_host, self.backend_base_port))
            .collect()
    }

    pub fn balancer_config(&self) -> BalancerConfig {
        BalancerConfig {
            max_attempts: self.max_attempts,
            attempt_timeout_ms: self.attempt_timeout_ms,
            request_timeout_ms: self.request_timeout_ms,
            backoff_base_ms: self.backoff_base_ms,
            backoff_max_ms: self.backoff_max_ms,
            backoff_jitter_ms: self.backoff_jitter_ms,
            pull_timeout_ms: self.pull_timeout_ms,
            memory_safety_margin_mb: self.memory_margin_mb,
            allow_degraded_fallback: self.allow_degraded_fallback,
            latency_bucket_ms: self.latency_bucket_ms,
            health: HealthThresholds {
                unhealthy_below: self.unhealthy_below,
                degraded_below: self.degraded_below,
                max_consecutive_failures: self.max_consecutive_failures,
                ..HealthThresholds::default()
            },
        }
    }
}
