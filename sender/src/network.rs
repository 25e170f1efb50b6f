//! UDP network transmission.
//!
//! Bridges the synchronous pipeline to an async UDP socket: the pipeline
//! side is a wait-free `PacketWriter` pushing into a channel, and a spawned
//! task composes and transmits packets. Network errors are logged but do
//! not stop the stream.

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use rtp_pcm_common::rtp::compose;
use rtp_pcm_common::{Packet, PacketWriter};

/// Pipeline-side handle: a wait-free packet writer feeding the transmit
/// task.
#[derive(Clone)]
pub struct UdpLink {
    tx: mpsc::UnboundedSender<Packet>,
}

impl PacketWriter for UdpLink {
    fn write(&mut self, packet: Packet) {
        // ---
        if self.tx.send(packet).is_err() {
            warn!("udp sender: transmit task is gone, dropping packet");
        }
    }
}

/// UDP transmitter for one remote endpoint.
pub struct UdpSender;

impl UdpSender {
    // ---
    /// Binds a socket and spawns the transmit task for `remote_addr`.
    ///
    /// Returns the pipeline-side link and the task handle.
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn spawn(remote_addr: impl Into<String>) -> Result<(UdpLink, JoinHandle<()>)> {
        // ---
        let remote_addr = remote_addr.into();

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed to bind UDP socket")?;

        debug!("udp sender: socket bound to {}", socket.local_addr()?);

        let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();

        let handle = tokio::spawn(async move {
            // ---
            let mut packets_sent: u64 = 0;
            let mut bytes_sent: u64 = 0;

            while let Some(mut packet) = rx.recv().await {
                if !compose(&mut packet) {
                    warn!("udp sender: dropping uncomposable packet");
                    continue;
                }

                match socket.send_to(packet.data(), &remote_addr).await {
                    Ok(bytes) => {
                        packets_sent += 1;
                        bytes_sent += bytes as u64;

                        if packets_sent % 100 == 0 {
                            debug!(
                                "udp sender: sent {} packets ({} bytes)",
                                packets_sent, bytes_sent
                            );
                        }
                    }
                    Err(e) => {
                        // Don't stop; UDP transmit errors are transient
                        error!("udp sender: failed to send packet: {}", e);
                    }
                }
            }
        });

        Ok((UdpLink { tx }, handle))
    }
}
