//! Client-initiated TCP forwarding (`direct-tcpip` channels).

use crate::helpers;
use russh::server::Msg;
use russh::Channel;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

/// Dial the forwarding target with a timeout.
pub async fn dial(host: &str, port: u32, timeout: Duration) -> io::Result<TcpStream> {
    let address = format!("{host}:{port}");
    match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("dialing {address} timed out"),
        )),
    }
}

/// Pump bytes between the accepted channel and the dialed connection. Each
/// direction closes the opposite write side when its source reaches EOF.
pub fn serve(channel: Channel<Msg>, stream: TcpStream) {
    let (tcp_read, tcp_write) = stream.into_split();
    let (channel_read, channel_write) = tokio::io::split(channel.into_stream());

    tokio::spawn(helpers::copy_and_close(tcp_read, channel_write));
    tokio::spawn(helpers::copy_and_close(channel_read, tcp_write));
}
