use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, error, info, trace};
use crate::config::ProtocolConfig;
use crate::connection::{ConnState, Connection};
use crate::message_dispatcher::MessageDispatcher;
use crate::send_pipeline::SendPipeline;

/// the largest UDP payload we are willing to pick up off the socket
const RECEIVE_BUFFER_LEN: usize = 65535;

/// EndPoint is the place where all other parts of the protocol come together: It listens on
///  a UdpSocket, routing inbound segments to their per-peer connections, and has an API for
///  application code to open connections.
pub struct EndPoint {
    receive_socket: Arc<UdpSocket>,
    send_pipeline: Arc<SendPipeline>,
    connections: RwLock<FxHashMap<SocketAddr, Connection>>,
    dispatcher: Arc<dyn MessageDispatcher>,
    config: Arc<ProtocolConfig>,
}

impl EndPoint {
    pub async fn new(
        config: Arc<ProtocolConfig>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let receive_socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        info!("bound receive socket to {:?}", receive_socket.local_addr()?);

        let send_pipeline = Arc::new(SendPipeline::new(Arc::new(receive_socket.clone())));

        Ok(EndPoint {
            receive_socket,
            send_pipeline,
            connections: RwLock::new(FxHashMap::default()),
            dispatcher,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.receive_socket.local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }

    /// active open: create a connection and send the opening SYN
    pub async fn connect(&self, peer_addr: SocketAddr) -> Connection {
        let connection = Connection::new(
            self.config.syn_params(),
            peer_addr,
            self.send_pipeline.clone(),
            self.dispatcher.clone(),
        );
        connection.start_active_open().await;

        self.connections.write().await
            .insert(peer_addr, connection.clone());
        connection
    }

    pub async fn recv_loop(&self) {
        info!("starting receive loop");

        let mut buf = vec![0u8; RECEIVE_BUFFER_LEN];
        loop {
            let (num_read, from) = match self.receive_socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            trace!("received datagram from {:?}: {:?}", from, &buf[..num_read]);

            let connection = match self.get_connection(from).await {
                Some(connection) => connection,
                None => {
                    debug!("datagram from unknown peer {:?} - dropping", from);
                    continue;
                }
            };

            connection.on_datagram(&buf[..num_read]).await;
        }
    }

    async fn get_connection(&self, peer_addr: SocketAddr) -> Option<Connection> {
        if let Some(connection) = self.connections.read().await.get(&peer_addr) {
            if connection.state().await != ConnState::Closed {
                return Some(connection.clone());
            }
            debug!("replacing the closed connection for {:?}", peer_addr);
        }

        if !self.config.accept_incoming {
            return None;
        }

        debug!("initializing passive connection for {:?}", peer_addr);
        let connection = Connection::new(
            self.config.syn_params(),
            peer_addr,
            self.send_pipeline.clone(),
            self.dispatcher.clone(),
        );
        connection.start_passive_open().await;

        self.connections.write().await
            .insert(peer_addr, connection.clone());
        Some(connection)
    }
}
