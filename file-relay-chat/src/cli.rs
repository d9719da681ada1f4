use std::{net::IpAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::relay::DEFAULT_MAX_UPLOAD_BYTES;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting paired text and file connections.
    Server(ServerArgs),
    /// Connect to a relay server and participate in the chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address both listeners bind to.
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: IpAddr,

    /// Port for the line-oriented chat channel. Use 0 for an ephemeral port.
    #[arg(long)]
    pub text_port: u16,

    /// Port for the binary file channel. Use 0 for an ephemeral port.
    #[arg(long)]
    pub file_port: u16,

    /// Largest upload the server accepts, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Host running the relay server.
    #[arg(long)]
    pub host: String,

    #[arg(long)]
    pub text_port: u16,

    #[arg(long)]
    pub file_port: u16,

    /// Display name shown to other participants. Not required to be unique.
    #[arg(long)]
    pub name: String,

    /// Directory received files are written into.
    #[arg(long, default_value = ".")]
    pub download_dir: PathBuf,
}
