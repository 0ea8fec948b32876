use anyhow::bail;
use bytes::BytesMut;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};
use crate::buffers::{RxBuffer, TxBuffer, TxEntry};
use crate::config::ConnectionConfig;
use crate::message_dispatcher::MessageDispatcher;
use crate::segment::Segment;
use crate::send_pipeline::SendPipeline;
use crate::seq_number::SeqNumber;
use crate::validator::SegmentAction;
use crate::var_header::{SynParams, VarHeader};

/// Connection states
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Open,
    CloseWait,
}

pub(crate) struct ConnectionInner {
    pub(crate) state: ConnState,
    /// negotiated at handshake completion, None before that
    pub(crate) config: Option<ConnectionConfig>,
    local_params: SynParams,

    /// next sequence number to assign to an outbound data segment
    pub(crate) tx_next_seq: SeqNumber,
    /// the highest cumulatively acknowledged sequence number - advances monotonically under
    ///  the modular order, never backwards
    pub(crate) tx_oldest_unacked: SeqNumber,
    pub(crate) tx_buffer: TxBuffer,

    /// the highest sequence number delivered in order to the upper layer; every buffered
    ///  out-of-order segment lies modularly beyond it
    pub(crate) rx_last_in_seq: SeqNumber,
    pub(crate) rx_buffer: RxBuffer,

    /// data segments received since the last outgoing cumulative ack
    unacked_rx_count: u8,
    /// whether any segment went out since the last keepalive tick
    sent_since_nul_tick: bool,

    peer_addr: SocketAddr,
    send_pipeline: Arc<SendPipeline>,
    dispatcher: Arc<dyn MessageDispatcher>,

    retransmission_timer: Option<JoinHandle<()>>,
    cumulative_ack_timer: Option<JoinHandle<()>>,
    nul_timer: Option<JoinHandle<()>>,
    close_wait_timer: Option<JoinHandle<()>>,
}

impl ConnectionInner {
    fn config_or_teardown(&mut self) -> Option<ConnectionConfig> {
        if let Some(config) = &self.config {
            return Some(config.clone());
        }
        // a connection past the handshake without a negotiated config is broken beyond repair
        warn!("no negotiated config for {:?} in state {:?} - tearing the connection down", self.peer_addr, self.state);
        None
    }

    async fn send_segment(&mut self, segment: &Segment) {
        trace!("sending segment to {:?}: {:?}", self.peer_addr, segment);

        let mut buf = BytesMut::with_capacity(segment.serialized_len());
        segment.ser(&mut buf);
        self.send_pipeline.send_segment_bytes(self.peer_addr, &buf).await;

        self.sent_since_nul_tick = true;
    }

    /// An empty cumulative ack, with the out-of-order sequence numbers attached when there
    ///  are any so the peer can retransmit selectively
    async fn send_ack(&mut self) {
        let mut eak_numbers = self.rx_buffer.seq_numbers();
        eak_numbers.truncate(Segment::MAX_EAK_NUMBERS);

        let segment = Segment {
            ack: true,
            eak: !eak_numbers.is_empty(),
            seq_number: self.tx_next_seq,
            ack_number: self.rx_last_in_seq,
            var_header: if eak_numbers.is_empty() { VarHeader::None } else { VarHeader::Eak(eak_numbers) },
            ..Default::default()
        };
        self.send_segment(&segment).await;
        self.note_cumulative_ack_sent();
    }

    async fn send_rst(&mut self) {
        let segment = Segment {
            rst: true,
            seq_number: self.tx_next_seq,
            ack_number: self.rx_last_in_seq,
            ..Default::default()
        };
        self.send_segment(&segment).await;
    }

    async fn send_syn_ack(&mut self) {
        let segment = Segment {
            syn: true,
            ack: true,
            seq_number: self.tx_next_seq.prev(),
            ack_number: self.rx_last_in_seq,
            var_header: VarHeader::Syn(self.local_params.clone()),
            ..Default::default()
        };
        self.send_segment(&segment).await;
    }

    async fn send_data_segment(&mut self, seq_number: SeqNumber, payload: Vec<u8>) {
        let segment = Segment {
            ack: true,
            seq_number,
            ack_number: self.rx_last_in_seq,
            data: payload,
            ..Default::default()
        };
        self.send_segment(&segment).await;
        self.note_cumulative_ack_sent();
    }

    /// any segment carrying the ACK flag resets the deferred-ack bookkeeping
    fn note_cumulative_ack_sent(&mut self) {
        self.unacked_rx_count = 0;
        if let Some(handle) = self.cumulative_ack_timer.take() {
            handle.abort();
        }
    }

    pub(crate) async fn process_segment(&mut self, self_arc: &Arc<RwLock<ConnectionInner>>, segment: Segment) {
        match self.state {
            ConnState::Listen => self.process_in_listen(segment).await,
            ConnState::SynSent => self.process_in_syn_sent(self_arc, segment).await,
            ConnState::SynReceived => self.process_in_syn_received(self_arc, segment).await,
            ConnState::Open => self.process_in_open(self_arc, segment).await,
            ConnState::CloseWait => {
                if segment.rst {
                    debug!("peer {:?} confirmed the teardown", self.peer_addr);
                    self.enter_closed();
                }
            }
            ConnState::Closed => {}
        }
    }

    async fn process_in_listen(&mut self, segment: Segment) {
        let VarHeader::Syn(peer_params) = &segment.var_header else {
            self.send_rst().await;
            self.enter_closed();
            return;
        };

        self.config = Some(ConnectionConfig::negotiated(&self.local_params, peer_params));
        self.rx_last_in_seq = segment.seq_number;

        debug!("accepting handshake from {:?}", self.peer_addr);
        self.send_syn_ack().await;
        self.state = ConnState::SynReceived;
    }

    async fn process_in_syn_sent(&mut self, self_arc: &Arc<RwLock<ConnectionInner>>, segment: Segment) {
        if segment.rst {
            debug!("peer {:?} refused the connection", self.peer_addr);
            self.enter_closed();
            return;
        }

        let VarHeader::Syn(peer_params) = &segment.var_header else {
            self.send_rst().await;
            self.enter_closed();
            return;
        };

        self.config = Some(ConnectionConfig::negotiated(&self.local_params, peer_params));
        self.rx_last_in_seq = segment.seq_number;

        if segment.ack {
            self.tx_oldest_unacked = segment.ack_number;
            self.send_ack().await;
            self.enter_open(self_arc);
        }
        else {
            // both sides opened at the same time
            self.send_syn_ack().await;
            self.state = ConnState::SynReceived;
        }
    }

    async fn process_in_syn_received(&mut self, self_arc: &Arc<RwLock<ConnectionInner>>, segment: Segment) {
        if segment.rst {
            debug!("peer {:?} aborted the handshake", self.peer_addr);
            self.enter_closed();
            return;
        }

        // the ack completing the handshake was validated against our initial sequence number
        self.tx_oldest_unacked = segment.ack_number;
        self.enter_open(self_arc);

        // anything piggybacked on the completing ack is regular traffic
        self.process_in_open(self_arc, segment).await;
    }

    async fn process_in_open(&mut self, self_arc: &Arc<RwLock<ConnectionInner>>, segment: Segment) {
        if segment.rst {
            debug!("peer {:?} reset the connection", self.peer_addr);
            self.enter_close_wait(self_arc);
            return;
        }

        let Some(config) = self.config_or_teardown() else {
            self.send_rst().await;
            self.enter_closed();
            return;
        };

        if segment.nul {
            trace!("keepalive probe from {:?}", self.peer_addr);
            self.send_ack().await;
            return;
        }

        if segment.ack {
            self.apply_cumulative_ack(segment.ack_number);
        }

        if let VarHeader::Eak(eak_numbers) = &segment.var_header {
            for &eak in eak_numbers {
                trace!("peer {:?} received #{} out of order", self.peer_addr, eak);
                self.tx_buffer.remove_seq(eak);
            }
        }

        if self.tx_buffer.is_empty() {
            if let Some(handle) = self.retransmission_timer.take() {
                handle.abort();
            }
        }

        if !segment.data.is_empty() {
            self.apply_data(self_arc, &config, segment.seq_number, segment.data).await;
        }
    }

    fn apply_cumulative_ack(&mut self, ack_number: SeqNumber) {
        if self.tx_oldest_unacked.lt(ack_number) {
            self.tx_oldest_unacked = ack_number;
            self.tx_buffer.remove_up_to(ack_number);
        }
    }

    async fn apply_data(
        &mut self,
        self_arc: &Arc<RwLock<ConnectionInner>>,
        config: &ConnectionConfig,
        seq_number: SeqNumber,
        data: Vec<u8>,
    ) {
        if seq_number == self.rx_last_in_seq.next() {
            self.rx_last_in_seq = seq_number;
            self.dispatcher.on_message(self.peer_addr, data).await;

            for entry in self.rx_buffer.drain_in_order(self.rx_last_in_seq) {
                self.rx_last_in_seq = entry.seq_number;
                self.dispatcher.on_message(self.peer_addr, entry.payload).await;
            }
        }
        else if self.rx_buffer.len() >= config.max_out_of_seq as usize {
            debug!("out-of-order buffer for {:?} is full - dropping segment #{}", self.peer_addr, seq_number);
        }
        else {
            trace!("buffering out-of-order segment #{} from {:?}", seq_number, self.peer_addr);
            self.rx_buffer.insert_or_drop(seq_number, data);
        }

        self.unacked_rx_count = self.unacked_rx_count.saturating_add(1);
        if self.unacked_rx_count >= config.max_cumulative_ack {
            self.send_ack().await;
        }
        else if self.cumulative_ack_timer.is_none() {
            self.arm_cumulative_ack_timer(self_arc, config.cumulative_ack_timeout);
        }
    }

    fn enter_open(&mut self, self_arc: &Arc<RwLock<ConnectionInner>>) {
        debug!("connection to {:?} established", self.peer_addr);
        self.state = ConnState::Open;
        self.sent_since_nul_tick = false;

        if let Some(config) = &self.config {
            self.arm_nul_timer(self_arc, config.nul_timeout);
        }
    }

    fn enter_close_wait(&mut self, self_arc: &Arc<RwLock<ConnectionInner>>) {
        self.state = ConnState::CloseWait;

        for handle in [
            self.retransmission_timer.take(),
            self.cumulative_ack_timer.take(),
            self.nul_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }

        match &self.config {
            Some(config) => {
                // linger long enough for segments still on the wire to arrive and be ignored
                self.arm_close_wait_timer(self_arc, 2 * config.retransmission_timeout);
            }
            None => self.enter_closed(),
        }
    }

    fn enter_closed(&mut self) {
        debug!("connection to {:?} closed", self.peer_addr);
        self.state = ConnState::Closed;

        for handle in [
            self.retransmission_timer.take(),
            self.cumulative_ack_timer.take(),
            self.nul_timer.take(),
            self.close_wait_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }

        self.tx_buffer.clear();
        self.rx_buffer.clear();
        self.unacked_rx_count = 0;
    }

    fn arm_retransmission_timer(&mut self, self_arc: &Arc<RwLock<ConnectionInner>>, delay: Duration) {
        if let Some(handle) = self.retransmission_timer.take() {
            handle.abort();
        }

        let arc = self_arc.clone();
        self.retransmission_timer = Some(tokio::spawn(async move {
            time::sleep(delay).await;

            let mut inner = arc.write().await;
            inner.retransmission_timer = None;
            inner.on_retransmission_timeout(&arc).await;
        }));
    }

    async fn on_retransmission_timeout(&mut self, self_arc: &Arc<RwLock<ConnectionInner>>) {
        if self.state != ConnState::Open {
            return;
        }
        let Some(config) = self.config_or_teardown() else {
            self.send_rst().await;
            self.enter_closed();
            return;
        };

        let Some(front) = self.tx_buffer.front_mut() else {
            // everything was acknowledged while the timer was pending
            return;
        };

        if front.retransmit_count >= config.max_retransmissions {
            warn!("segment #{} to {:?} exhausted its {} retransmissions - giving up on the connection",
                front.seq_number, self.peer_addr, config.max_retransmissions);
            self.send_rst().await;
            self.enter_close_wait(self_arc);
            return;
        }

        front.retransmit_count += 1;
        let seq_number = front.seq_number;
        let payload = front.payload.clone();
        let attempt = front.retransmit_count;

        debug!("retransmitting segment #{} to {:?} (attempt {})", seq_number, self.peer_addr, attempt);
        self.send_data_segment(seq_number, payload).await;
        self.arm_retransmission_timer(self_arc, config.retransmission_timeout);
    }

    fn arm_cumulative_ack_timer(&mut self, self_arc: &Arc<RwLock<ConnectionInner>>, delay: Duration) {
        if let Some(handle) = self.cumulative_ack_timer.take() {
            handle.abort();
        }

        let arc = self_arc.clone();
        self.cumulative_ack_timer = Some(tokio::spawn(async move {
            time::sleep(delay).await;

            let mut inner = arc.write().await;
            inner.cumulative_ack_timer = None;
            if inner.state == ConnState::Open && inner.unacked_rx_count > 0 {
                inner.send_ack().await;
            }
        }));
    }

    fn arm_nul_timer(&mut self, self_arc: &Arc<RwLock<ConnectionInner>>, delay: Duration) {
        if let Some(handle) = self.nul_timer.take() {
            handle.abort();
        }

        let arc = self_arc.clone();
        self.nul_timer = Some(tokio::spawn(async move {
            time::sleep(delay).await;

            let mut inner = arc.write().await;
            inner.nul_timer = None;
            inner.on_nul_timeout(&arc).await;
        }));
    }

    async fn on_nul_timeout(&mut self, self_arc: &Arc<RwLock<ConnectionInner>>) {
        if self.state != ConnState::Open {
            return;
        }
        let Some(config) = self.config_or_teardown() else {
            self.send_rst().await;
            self.enter_closed();
            return;
        };

        if !self.sent_since_nul_tick {
            trace!("idle for a keepalive interval - probing {:?}", self.peer_addr);
            let segment = Segment {
                nul: true,
                // a keepalive probe consumes no sequence space
                seq_number: self.tx_next_seq,
                ack_number: self.rx_last_in_seq,
                ..Default::default()
            };
            self.send_segment(&segment).await;
        }

        self.sent_since_nul_tick = false;
        self.arm_nul_timer(self_arc, config.nul_timeout);
    }

    fn arm_close_wait_timer(&mut self, self_arc: &Arc<RwLock<ConnectionInner>>, delay: Duration) {
        if let Some(handle) = self.close_wait_timer.take() {
            handle.abort();
        }

        let arc = self_arc.clone();
        self.close_wait_timer = Some(tokio::spawn(async move {
            time::sleep(delay).await;

            let mut inner = arc.write().await;
            inner.close_wait_timer = None;
            if inner.state == ConnState::CloseWait {
                inner.enter_closed();
            }
        }));
    }
}

/// One reliable connection to one peer. All validation, processing, timer callbacks and
///  send calls serialize through the inner lock, which is what keeps the queue invariants
///  without further synchronization.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<RwLock<ConnectionInner>>,
}

impl Connection {
    pub(crate) fn new(
        local_params: SynParams,
        peer_addr: SocketAddr,
        send_pipeline: Arc<SendPipeline>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> Connection {
        let initial_seq_number = SeqNumber::from_raw(rand::thread_rng().gen());

        let inner = ConnectionInner {
            state: ConnState::Closed,
            config: None,
            local_params,
            tx_next_seq: initial_seq_number.next(),
            tx_oldest_unacked: initial_seq_number,
            tx_buffer: TxBuffer::new(),
            rx_last_in_seq: SeqNumber::from_raw(0),
            rx_buffer: RxBuffer::new(),
            unacked_rx_count: 0,
            sent_since_nul_tick: false,
            peer_addr,
            send_pipeline,
            dispatcher,
            retransmission_timer: None,
            cumulative_ack_timer: None,
            nul_timer: None,
            close_wait_timer: None,
        };

        Connection {
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    /// active open: emit the opening SYN
    pub(crate) async fn start_active_open(&self) {
        let mut inner = self.inner.write().await;
        debug!("opening connection to {:?}", inner.peer_addr);

        let segment = Segment {
            syn: true,
            seq_number: inner.tx_next_seq.prev(),
            var_header: VarHeader::Syn(inner.local_params.clone()),
            ..Default::default()
        };
        inner.send_segment(&segment).await;
        inner.state = ConnState::SynSent;
    }

    /// passive open: wait for the peer's SYN
    pub(crate) async fn start_passive_open(&self) {
        self.inner.write().await.state = ConnState::Listen;
    }

    /// Inbound datagram bytes from the peer: decode, validate, process. Malformed input is
    ///  logged and dropped without touching connection state.
    pub async fn on_datagram(&self, mut datagram_buf: &[u8]) {
        let segment = match Segment::deser(&mut datagram_buf) {
            Ok(segment) => segment,
            Err(e) => {
                debug!("undecodable segment: {} - dropping", e);
                return;
            }
        };

        self.on_segment(segment).await;
    }

    pub(crate) async fn on_segment(&self, segment: Segment) {
        let mut inner = self.inner.write().await;
        trace!("segment from {:?} in state {:?}: {:?}", inner.peer_addr, inner.state, segment);

        let (action, reason) = inner.validate_segment(&segment);
        match action {
            SegmentAction::Process => inner.process_segment(&self.inner, segment).await,
            SegmentAction::Discard => {
                debug!("discarding segment from {:?}: {}", inner.peer_addr, reason.unwrap_or("no reason"));
            }
            SegmentAction::Reset => {
                debug!("resetting connection to {:?}: {}", inner.peer_addr, reason.unwrap_or("no reason"));
                inner.send_rst().await;
                inner.enter_closed();
            }
            SegmentAction::Ack => {
                debug!("answering unexpected segment from {:?} with an ack: {}", inner.peer_addr, reason.unwrap_or("no reason"));
                inner.send_ack().await;
            }
        }
    }

    /// Enqueue bytes for reliable, in-order transmission. The payload is fragmented across
    ///  segments honoring the negotiated max segment size.
    ///
    /// Fails when the connection is not open, and when the peer's declared limit of
    ///  outstanding segments leaves no room - backpressure is the caller's concern.
    pub async fn send_message(&self, message: &[u8]) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;

        if inner.state != ConnState::Open {
            bail!("connection to {:?} is not open", inner.peer_addr);
        }
        let Some(config) = inner.config.clone() else {
            bail!("connection to {:?} has no negotiated config", inner.peer_addr);
        };
        if message.is_empty() {
            bail!("empty message");
        }

        let num_segments = message.len().div_ceil(config.max_segment_size as usize);
        if inner.tx_buffer.len() + num_segments > config.max_outstanding_peer as usize {
            bail!("send window to {:?} is exhausted ({} segments pending)", inner.peer_addr, inner.tx_buffer.len());
        }

        debug!("sending message of length {} to {:?} in {} segments", message.len(), inner.peer_addr, num_segments);

        for chunk in message.chunks(config.max_segment_size as usize) {
            let seq_number = inner.tx_next_seq;
            inner.tx_next_seq = seq_number.next();

            inner.tx_buffer.push(TxEntry {
                seq_number,
                retransmit_count: 0,
                payload: chunk.to_vec(),
            });
            inner.send_data_segment(seq_number, chunk.to_vec()).await;
        }

        if inner.retransmission_timer.is_none() {
            inner.arm_retransmission_timer(&self.inner, config.retransmission_timeout);
        }

        Ok(())
    }

    /// Initiate teardown: emit RST and linger until segments still on the wire have drained
    pub async fn close(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            ConnState::Closed => {}
            ConnState::Listen => inner.enter_closed(),
            _ => {
                debug!("closing connection to {:?}", inner.peer_addr);
                inner.send_rst().await;
                inner.enter_close_wait(&self.inner);
            }
        }
    }

    pub async fn state(&self) -> ConnState {
        self.inner.read().await.state
    }

    pub async fn peer_addr(&self) -> SocketAddr {
        self.inner.read().await.peer_addr
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::message_dispatcher::MockMessageDispatcher;
    use crate::send_pipeline::MockSendSocket;

    pub(crate) fn test_peer_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9))
    }

    pub(crate) fn test_params() -> SynParams {
        SynParams {
            version: SynParams::PROTOCOL_VERSION_1,
            max_segment_size: 128,
            max_outstanding_segments: 10,
            retransmission_timeout_millis: 100,
            cumulative_ack_timeout_millis: 40,
            nul_timeout_millis: 400,
            max_retransmissions: 3,
            max_cumulative_ack: 10,
            max_out_of_seq: 16,
            max_auto_reset: 4,
        }
    }

    pub(crate) fn test_config() -> ConnectionConfig {
        ConnectionConfig::negotiated(&test_params(), &test_params())
    }

    pub(crate) fn connection_with_state(
        state: ConnState,
        config: Option<ConnectionConfig>,
        tx_next_seq: u16,
        tx_oldest_unacked: u16,
        rx_last_in_seq: u16,
        socket: MockSendSocket,
        dispatcher: MockMessageDispatcher,
    ) -> Connection {
        let connection = Connection::new(
            test_params(),
            test_peer_addr(),
            Arc::new(SendPipeline::new(Arc::new(socket))),
            Arc::new(dispatcher),
        );

        {
            let mut inner = connection.inner.try_write().unwrap();
            inner.state = state;
            inner.config = config;
            inner.tx_next_seq = SeqNumber::from_raw(tx_next_seq);
            inner.tx_oldest_unacked = SeqNumber::from_raw(tx_oldest_unacked);
            inner.rx_last_in_seq = SeqNumber::from_raw(rx_last_in_seq);
        }

        connection
    }

    pub(crate) fn enqueue_tx_segments(connection: &Connection, count: usize) {
        let mut inner = connection.inner.try_write().unwrap();
        for _ in 0..count {
            let seq_number = inner.tx_next_seq;
            inner.tx_next_seq = seq_number.next();
            inner.tx_buffer.push(TxEntry {
                seq_number,
                retransmit_count: 0,
                payload: vec![seq_number.to_raw() as u8],
            });
        }
    }

    /// decodes the sent buffer so expectations can match on segment structure instead of
    ///  brittle raw bytes
    pub(crate) fn sent_segment(buf: &[u8]) -> Option<Segment> {
        let mut b = buf;
        Segment::deser(&mut b).ok()
    }
}
