//! Runtime settings for both sides of the relay.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use crate::{
    cli::{ClientArgs, ServerArgs},
    relay::DEFAULT_MAX_UPLOAD_BYTES,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: IpAddr,
    /// Port `0` picks an ephemeral port.
    pub text_port: u16,
    pub file_port: u16,
    /// Uploads declaring more bytes are drained and dropped.
    pub max_upload_bytes: u64,
}

impl ServerConfig {
    /// Both channels on ephemeral loopback ports.
    pub fn ephemeral() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            text_port: 0,
            file_port: 0,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn text_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.text_port)
    }

    pub fn file_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.file_port)
    }
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        Self {
            bind: args.bind,
            text_port: args.text_port,
            file_port: args.file_port,
            max_upload_bytes: args.max_upload_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub text_port: u16,
    pub file_port: u16,
    pub name: String,
    /// Received files are written here, replacing same-named files.
    pub download_dir: PathBuf,
}

impl From<ClientArgs> for ClientConfig {
    fn from(args: ClientArgs) -> Self {
        Self {
            host: args.host,
            text_port: args.text_port,
            file_port: args.file_port,
            name: args.name,
            download_dir: args.download_dir,
        }
    }
}
