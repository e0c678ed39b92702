use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct DatabaseArgs {
    /// Storage backend: "postgres" or "memory"
    #[arg(long, env = "ARGUS_DB", default_value = "postgres")]
    pub db: String,

    #[clap(flatten)]
    pub postgres: PostgresArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct PostgresArgs {
    #[arg(long, env = "POSTGRES_HOST", default_value = "localhost")]
    pub postgres_host: String,

    #[arg(long, env = "POSTGRES_PORT", default_value_t = 5432)]
    pub postgres_port: u16,

    #[arg(long, env = "POSTGRES_DATABASE", default_value = "argus")]
    pub postgres_database: String,

    #[arg(long, env = "POSTGRES_USERNAME", default_value = "postgres")]
    pub postgres_username: String,

    #[arg(long, env = "POSTGRES_PASSWORD")]
    pub postgres_password: Option<String>,

    /// Extra CA bundle (PEM contents) for TLS connections to Postgres
    #[arg(long, env = "POSTGRES_CA_CERT")]
    pub postgres_ca_cert: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct RateLimiterArgs {
    /// Sustained request rate per client IP (requests per second)
    #[arg(long, env = "RATE_LIMIT_PER_SEC", default_value_t = 10.0)]
    pub rate_per_sec: f64,

    /// Burst capacity per client IP
    #[arg(long, env = "RATE_LIMIT_BURST", default_value_t = 30)]
    pub burst: u32,

    /// Sustained rate for authentication endpoints (requests per second)
    #[arg(long, env = "RATE_LIMIT_AUTH_PER_SEC", default_value_t = 1.0)]
    pub auth_rate_per_sec: f64,

    /// Burst capacity for authentication endpoints
    #[arg(long, env = "RATE_LIMIT_AUTH_BURST", default_value_t = 5)]
    pub auth_burst: u32,

    /// Evict buckets idle for longer than this many seconds
    #[arg(long, env = "RATE_LIMIT_IDLE_EVICT_SECS", default_value_t = 300)]
    pub idle_evict_secs: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct AuthArgs {
    /// HMAC secret used to sign bearer tokens
    #[arg(
        long,
        env = "AUTH_SIGNING_SECRET",
        required = true,
        hide_env_values = true
    )]
    pub signing_secret: String,

    /// Access token lifetime in seconds
    #[arg(long, env = "AUTH_ACCESS_TTL_SECS", default_value_t = 900)]
    pub access_ttl_secs: u64,

    /// Refresh token lifetime in seconds
    #[arg(long, env = "AUTH_REFRESH_TTL_SECS", default_value_t = 604_800)]
    pub refresh_ttl_secs: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct SealArgs {
    /// Base64-encoded 32-byte key for sealing cluster credentials at rest
    #[arg(
        long,
        env = "CREDENTIAL_SEAL_KEY",
        required = true,
        hide_env_values = true
    )]
    pub credential_seal_key: String,
}

#[derive(Parser, Debug, Clone)]
pub struct GatewayArgs {
    /// Port for the agent tunnel gRPC service
    #[arg(long, env = "GATEWAY_PORT", default_value_t = 9443)]
    pub gateway_port: u16,

    /// Path to the gateway TLS certificate (PEM); plaintext is refused when set
    #[arg(long, env = "GATEWAY_TLS_CERT")]
    pub tls_cert: Option<String>,

    /// Path to the gateway TLS private key (PEM)
    #[arg(long, env = "GATEWAY_TLS_KEY")]
    pub tls_key: Option<String>,

    /// Interval between pings sent to connected agents, in seconds
    #[arg(long, env = "AGENT_PING_INTERVAL_SECS", default_value_t = 15)]
    pub ping_interval_secs: u64,

    /// Declare an agent session unhealthy after this many seconds without a pong
    #[arg(long, env = "AGENT_LIVENESS_WINDOW_SECS", default_value_t = 45)]
    pub liveness_window_secs: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct HubArgs {
    /// Bounded queue size per watch subscriber; overflow evicts the subscriber
    #[arg(long, env = "HUB_SUBSCRIBER_QUEUE", default_value_t = 256)]
    pub subscriber_queue: usize,

    /// Keep an upstream watch open this many milliseconds after its last subscriber leaves
    #[arg(long, env = "HUB_LINGER_MS", default_value_t = 2000)]
    pub linger_ms: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct BrokerArgs {
    /// Pending tool-call confirmations expire after this many seconds
    #[arg(long, env = "CONFIRMATION_TTL_SECS", default_value_t = 60)]
    pub confirmation_ttl_secs: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct ModelArgs {
    /// Messages endpoint of the model API
    #[arg(
        long,
        env = "MODEL_API_URL",
        default_value = "https://api.anthropic.com/v1/messages"
    )]
    pub model_api_url: String,

    /// API key for the model endpoint
    #[arg(long, env = "MODEL_API_KEY", hide_env_values = true)]
    pub model_api_key: Option<String>,

    /// Model identifier
    #[arg(long, env = "MODEL_NAME", default_value = "claude-sonnet-4-5")]
    pub model_name: String,

    /// Maximum tokens per model response
    #[arg(long, env = "MODEL_MAX_TOKENS", default_value_t = 4096)]
    pub model_max_tokens: u32,

    /// Hard cap on tool-call iterations within one user turn
    #[arg(long, env = "MAX_TOOL_ITERATIONS", default_value_t = 8)]
    pub max_tool_iterations: u32,
}
