use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "argus-agent")]
#[command(about = "In-cluster agent terminating the Argus reverse tunnel")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register (when needed) and run the tunnel
    Run(RunArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Control plane gateway endpoint, e.g. https://argus.example.com:9443
    #[arg(long, env = "ARGUS_SERVER_URL", required = true)]
    pub server_url: String,

    /// One-time registration secret; required until an agent token exists
    #[arg(long, env = "ARGUS_REGISTRATION_SECRET", hide_env_values = true)]
    pub registration_secret: Option<String>,

    /// Long-lived agent token; normally read from --token-file
    #[arg(long, env = "ARGUS_AGENT_TOKEN", hide_env_values = true)]
    pub agent_token: Option<String>,

    /// Where the minted agent token is persisted after registration
    #[arg(long, env = "ARGUS_TOKEN_FILE", default_value = "/var/lib/argus/agent-token")]
    pub token_file: String,

    /// Extra CA bundle (PEM file) for the gateway TLS endpoint
    #[arg(long, env = "ARGUS_CA_CERT")]
    pub ca_cert: Option<String>,

    /// Preferred cluster name sent during registration
    #[arg(long, env = "ARGUS_CLUSTER_NAME", default_value = "")]
    pub cluster_name: String,
}
