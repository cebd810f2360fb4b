mod api;
mod chat;
mod config;
mod image_gen;
mod session;

use anyhow::Result;
use std::io;
use std::process::exit;
use tracing_subscriber::EnvFilter;

use api::ApiClient;
use config::Config;
use session::Session;

#[tokio::main]
async fn main() {
    // stdout belongs to the conversation, so diagnostics go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    if let Err(e) = run().await {
        eprintln!("ERROR: {:#}", e);
        exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::from_cli()?;
    let client = ApiClient::new(&config)?;
    let mut session = Session::new(&client, &config)?;

    let stdin = io::stdin();
    session.run(stdin.lock(), &mut io::stdout()).await
}
