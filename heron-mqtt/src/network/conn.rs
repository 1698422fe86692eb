pub(crate) use client::ClientConnection;
use tokio::{io, time};

use super::packet;

mod client;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("First packet not connect")]
    FirstPacketNotConnect,
    #[error("Packet error: {0}")]
    Packet(#[from] packet::Error),
    #[error("I/O: {0}")]
    IO(#[from] io::Error),
    #[error("Keep alive timeout")]
    KeepAlive(#[from] time::error::Elapsed),
    #[error("Connection closed by peer")]
    ConnectionAborted,
}
