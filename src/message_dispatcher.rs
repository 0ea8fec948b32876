use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;


/// The upper layer's sink for reassembled payloads. Invocations for one connection happen in
///  strict sequence order, starting right after the peer's initial sequence number.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, sender_addr: SocketAddr, payload: Vec<u8>);
}
