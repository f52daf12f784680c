//! Drive the relay from the command line: stream a live invocation, or replay
//! a captured upstream body offline.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use relay_core::runtime::HttpAgentTransport;
use relay_core::{AgentClient, AgentTransport, RelayConfig, ReplayTransport};

#[derive(Debug, Parser)]
#[command(name = "relay-examples", about = "Relay agent runtime streams as SSE")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Invoke the configured agent runtime and print the relayed SSE frames.
    Stream {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long, default_value = "default")]
        actor_id: String,
    },
    /// Replay a captured response body through the relay.
    Replay {
        #[arg(long)]
        file: PathBuf,
        /// Feed the body in chunks of this many bytes. Omit to read it whole.
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long, default_value = "replay-session")]
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    relay_core::config::load_dotenv();
    relay_core::observability::init_observability();
    let relay_config = RelayConfig::from_env()?;

    match Cli::parse().command {
        Command::Stream {
            prompt,
            session_id,
            actor_id,
        } => {
            let transport = HttpAgentTransport::from_env()?;
            let session_id =
                session_id.unwrap_or_else(|| format!("session-{}", uuid::Uuid::new_v4()));
            print_relay(Arc::new(transport), relay_config, &prompt, &session_id, &actor_id).await?;
        }
        Command::Replay {
            file,
            chunk_size,
            session_id,
        } => {
            let body = std::fs::read(&file)?;
            let transport = match chunk_size {
                Some(size) => ReplayTransport::chunked(body, size),
                None => ReplayTransport::whole(body),
            };
            print_relay(Arc::new(transport), relay_config, "replay", &session_id, "default").await?;
        }
    }
    Ok(())
}

async fn print_relay(
    transport: Arc<dyn AgentTransport>,
    relay_config: RelayConfig,
    prompt: &str,
    session_id: &str,
    actor_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = AgentClient::new(transport, relay_config);
    let mut stream = client.invoke_stream(prompt, session_id, actor_id)?;
    while let Some(event) = stream.next_event().await {
        print!("{}", event.to_sse());
    }
    let exit = stream.close().await;
    eprintln!("producer exit: {exit:?}");
    Ok(())
}
