use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a Raft server node driven by the dispatcher.
    Server(ServerArgs),
    /// Run a Raft client node that submits configured commands.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Node name registered with the dispatcher; unique per run.
    #[arg(long)]
    pub name: String,

    /// Address of the dispatcher to register with.
    #[arg(long, default_value = "127.0.0.1:4343")]
    pub dispatcher: SocketAddr,

    /// Initial cluster membership, e.g. S1,S2,S3,S4.
    #[arg(long, value_delimiter = ',')]
    pub cluster: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Node name registered with the dispatcher; unique per run.
    #[arg(long)]
    pub name: String,

    /// Address of the dispatcher to register with.
    #[arg(long, default_value = "127.0.0.1:4343")]
    pub dispatcher: SocketAddr,

    /// Cluster members to submit commands to, e.g. S1,S2,S3,S4.
    #[arg(long, value_delimiter = ',')]
    pub cluster: Vec<String>,

    /// A command to submit, as JSON: {"type":"AddNode","body":{"node":"S5"}}.
    /// Repeat the flag to queue several; they run one at a time, in order.
    #[arg(long = "command")]
    pub commands: Vec<String>,
}
