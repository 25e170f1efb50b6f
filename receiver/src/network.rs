//! UDP network reception.
//!
//! Binds a socket and feeds raw datagrams into the receiver's pending
//! queue. Parsing happens later on the processing thread, under the
//! receiver's port admission; this task only stamps transport addresses.

use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use rtp_pcm_common::{Context, Packet, UdpAttrs};

use crate::Receiver;

/// UDP ingest task for one bound address.
pub struct UdpReceiver;

impl UdpReceiver {
    // ---
    /// Binds `bind_addr` and spawns the ingest task feeding `receiver`.
    ///
    /// Returns the actually bound port (useful with port 0) and the task
    /// handle.
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn spawn(
        bind_addr: impl Into<String>,
        context: Context,
        receiver: Arc<Receiver>,
    ) -> Result<(u16, JoinHandle<()>)> {
        // ---
        let bind_addr = bind_addr.into();

        let socket = UdpSocket::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind UDP socket to {}", bind_addr))?;

        let local_addr = socket.local_addr()?;
        info!("udp receiver: socket bound to {}", local_addr);

        let handle = tokio::spawn(async move {
            // ---
            let mut scratch = vec![0u8; 2048];
            let mut dropped: u64 = 0;

            loop {
                let (len, src_addr) = match socket.recv_from(&mut scratch).await {
                    Ok(received) => received,
                    Err(e) => {
                        error!("udp receiver: recv failed: {}", e);
                        continue;
                    }
                };

                let mut data = match context.byte_pool().allocate() {
                    Some(data) => data,
                    None => {
                        dropped += 1;
                        if dropped % 100 == 1 {
                            error!("udp receiver: pool exhausted, dropped {} packets", dropped);
                        }
                        continue;
                    }
                };

                if data.len() < len {
                    debug!("udp receiver: datagram too large: len={}", len);
                    continue;
                }
                data.truncate(len);
                data.copy_from_slice(&scratch[..len]);

                let mut packet = Packet::new(data);
                packet.udp = Some(UdpAttrs {
                    src_addr,
                    dst_addr: local_addr,
                });

                receiver.write(packet);
            }
        });

        Ok((local_addr.port(), handle))
    }
}
