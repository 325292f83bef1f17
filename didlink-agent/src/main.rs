// didlink agent daemon: opens the relay sessions and logs inbound events until shutdown.

use anyhow::Context;
use didlink_agent::{config, Agent, AgentError};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("didlink-agent {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("didlink=info")),
        )
        .init();

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let mut agent = Agent::from_config(&cfg)?;
    agent
        .open()
        .await
        .with_context(|| format!("opening agent at {}", cfg.server_address))?;
    let paired = agent
        .wallet()?
        .list_pairwise()
        .await
        .context("listing pairwise relationships")?;
    tracing::info!(pairwise = paired.len(), "wallet ready");
    for endpoint in agent.endpoints() {
        tracing::info!(
            address = %endpoint.address,
            routing_keys = ?endpoint.routing_keys,
            is_default = endpoint.is_default,
            "endpoint"
        );
    }
    tracing::info!(balancing_group = ?agent.balancing_group(), "listening for events");

    let listener = agent.subscribe()?;
    let io_timeout = cfg.session_options().io_timeout;
    let pump = async {
        loop {
            match listener.get(io_timeout).await {
                Ok(event) => tracing::info!(
                    kind = event.message.kind(),
                    thid = ?event.message.thread_id(),
                    sender = ?event.sender_verkey,
                    their_did = ?event.pairwise.as_ref().map(|p| &p.their.did),
                    "event"
                ),
                Err(AgentError::Timeout) => continue,
                Err(AgentError::ConnectionClosed) => {
                    tracing::warn!("relay closed the events session");
                    return;
                }
                Err(e) => tracing::warn!(error = %e, "bad event"),
            }
        }
    };

    tokio::select! {
        _ = pump => {}
        signal = shutdown_signal() => signal?,
    }
    agent.close();
    tracing::info!("agent closed");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
