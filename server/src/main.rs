use anyhow::Result;
use base64::Engine;
use clap::Parser;

use argus_server::args::{Cli, Commands};
use argus_server::server::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    argus_common::init();

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::GenSealKey => {
            let mut key = [0u8; 32];
            rand::RngCore::fill_bytes(&mut rand::rng(), &mut key);
            println!(
                "{}",
                base64::engine::general_purpose::STANDARD.encode(key)
            );
            Ok(())
        }
    }
}
