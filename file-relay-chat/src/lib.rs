//! Multi-client chat relay with inline file broadcasting.
//!
//! Every client holds two TCP connections to the server: a text channel for
//! newline-terminated chat lines and a file channel for length-prefixed file
//! frames. Chat lines are relayed to everyone else as `<name>: <text>`; an
//! uploaded file is announced on each other client's text channel and then
//! streamed on its file channel.
//!
//! - [`cli`] parses the command line for server and client modes, and
//!   [`config`] turns it into runtime settings.
//! - [`frame`] reads and writes lines and file frames on any async stream.
//! - [`relay`] builds the chat/announce/upload protocol on top of the frames.
//! - [`session`] owns one client's connections and runs its receive loop.
//! - [`registry`] tracks live sessions and fans messages and files out.
//! - [`server`] accepts paired connections and starts sessions.
//! - [`client`] connects to a server, multiplexing stdin with relayed lines
//!   and files for a terminal user.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
