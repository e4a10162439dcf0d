use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use raft_shim::{
    cli::{Cli, Command},
    client::{PendingCommand, RaftClient},
    runtime::Node,
    server::RaftServer,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let server = RaftServer::new(args.cluster);
            let node = Node::register(&args.name, args.dispatcher, server).await?;
            info!(name = %args.name, "server node entering event loop");
            node.run().await
        }
        Command::Client(args) => {
            let commands = args
                .commands
                .iter()
                .map(|raw| {
                    serde_json::from_str::<PendingCommand>(raw)
                        .with_context(|| format!("invalid command JSON: {raw}"))
                })
                .collect::<Result<Vec<_>>>()?;
            let client = RaftClient::new(args.cluster, commands);
            let node = Node::register(&args.name, args.dispatcher, client).await?;
            info!(name = %args.name, "client node entering event loop");
            node.run().await
        }
    }
}
