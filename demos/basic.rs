//! Echo demo: a server and a client in one process.

use async_trait::async_trait;
use rudp::{Client, ClientHandler, Connection, DeliveryMode, Packet, RudpConfig, Server, ServerHandler};
use std::sync::Arc;
use std::time::Duration;

struct EchoServer;

#[async_trait]
impl ServerHandler for EchoServer {
    async fn on_connect(&self, connection: Arc<Connection>) {
        println!("client connected: {:?}", connection.remote_addr().await);
    }

    async fn on_message(&self, connection: Arc<Connection>, packet: Packet) {
        let text = String::from_utf8_lossy(&packet.payload);
        println!("server received: {}", text);

        let reply = format!("Echo: {}", text);
        if let Err(e) = connection.send(reply.as_bytes(), DeliveryMode::Reliable).await {
            eprintln!("echo failed: {}", e);
        }
    }

    async fn on_disconnect(&self, connection: Arc<Connection>) {
        println!("client disconnected: {:?}", connection.remote_addr().await);
    }
}

struct PrintingClient;

#[async_trait]
impl ClientHandler for PrintingClient {
    async fn on_message(&self, packet: Packet) {
        println!("client received: {}", String::from_utf8_lossy(&packet.payload));
    }

    async fn on_disconnect(&self) {
        println!("client disconnected");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let server = Server::new(RudpConfig::default(), Arc::new(EchoServer))?;
    server.listen("127.0.0.1:8080").await?;
    println!("server listening on 127.0.0.1:8080");

    let client = Client::new(RudpConfig::default())?;
    client.connect("127.0.0.1:8080", Arc::new(PrintingClient)).await?;
    println!("client connected with id {:08x}", client.client_id());

    for message in ["Hello", "World", "Reliable UDP"] {
        client.send(message.as_bytes(), DeliveryMode::Reliable).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    tokio::time::sleep(Duration::from_secs(2)).await;

    client.close().await;
    server.close().await;
    println!("demo complete");
    Ok(())
}
