use anyhow::Result;
use clap::Parser;

mod args;
mod kube_exec;
mod tunnel;
mod watch;

pub mod proto {
    pub mod tunnel {
        tonic::include_proto!("tunnel");
    }
}

use args::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    argus_common::init();

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => tunnel::run(args).await,
    }
}
