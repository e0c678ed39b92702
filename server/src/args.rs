use clap::{Parser, Subcommand};

use argus_common::args::{
    AuthArgs, BrokerArgs, DatabaseArgs, GatewayArgs, HubArgs, ModelArgs, RateLimiterArgs, SealArgs,
};

#[derive(Parser, Debug)]
#[command(name = "argus-server")]
#[command(about = "Multi-cluster Kubernetes control plane")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control plane server
    Server(ServerArgs),

    /// Generate a fresh base64 credential seal key
    GenSealKey,
}

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    /// Port for the client HTTP/WebSocket API
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    #[clap(flatten)]
    pub database: DatabaseArgs,

    #[clap(flatten)]
    pub rate: RateLimiterArgs,

    #[clap(flatten)]
    pub auth: AuthArgs,

    #[clap(flatten)]
    pub seal: SealArgs,

    #[clap(flatten)]
    pub gateway: GatewayArgs,

    #[clap(flatten)]
    pub hub: HubArgs,

    #[clap(flatten)]
    pub broker: BrokerArgs,

    #[clap(flatten)]
    pub model: ModelArgs,
}
