use clap::Parser;
use game_relay::{config::Args, remote::TcpBringup, Lifecycle, Relay};
use tokio::select;

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let config = Args::parse().resolve().await?;
    tracing::info!("Relaying to {}", config.remote_address);

    let relay = Relay::new(config);
    let lifecycle = Lifecycle::new(relay.clone(), TcpBringup);

    select! {
        result = lifecycle.run() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Shutting down");
            relay.state().begin_shutdown();
            relay.state().reset().await;
        }
    }

    Ok(())
}
