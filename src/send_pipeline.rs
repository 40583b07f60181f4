use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// Abstraction for writing a datagram on a UDP socket, introduced to facilitate
///  mocking the I/O part away for testing (including loss injection).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending {} bytes to {:?}", packet_buf.len(), to);

        // Write errors are swallowed: for reliable modes retransmission is the
        //  recovery path, for unreliable modes loss is part of the contract.
        if let Err(e) = self.send_to(packet_buf, to).await {
            debug!("error sending UDP packet to {:?}: {}", to, e);
        }
    }
}

/// Shared send side of the endpoint's single UDP socket. The endpoint owns the
///  socket; connections hold this as a non-owning handle.
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>) -> SendPipeline {
        SendPipeline { socket }
    }

    pub async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        self.socket.do_send_packet(to, packet_buf).await;
    }
}
