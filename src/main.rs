use anyhow::Result;
use clap::Parser;
use std::{process::ExitCode, sync::Arc};
use tcp_forward::{Args, bind, load_config, serve};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let error = format!("{e:#}");
            error!(%error, "Fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(args)?;
    info!(
        listen = %config.listen,
        forward = %config.forward,
        protocol = %config.protocol,
        "Configuration loaded"
    );

    let listener = bind(&config.listen, config.protocol).await?;
    info!(listen_addr = %listener.local_addr()?, "Listening");

    serve(listener, Arc::from(config.forward)).await;
    Ok(())
}
