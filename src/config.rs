use std::cmp::min;
use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use crate::safe_converter::PrecheckedCast;
use crate::var_header::SynParams;

/// Local protocol preferences: where to bind, whether to accept inbound handshakes, and the
///  parameter block proposed to peers during the handshake.
///
/// These are *proposals* - the values a connection actually runs with are negotiated against
///  the peer's proposals at handshake completion, see [ConnectionConfig].
pub struct ProtocolConfig {
    pub self_addr: SocketAddr,

    /// Whether segments from unknown peers create a passively opened connection. Without
    ///  this, only connections opened locally are served.
    pub accept_incoming: bool,

    /// The largest payload placed into a single data segment. Outbound messages above this
    ///  size are fragmented across several segments.
    ///
    /// The segment must fit the underlying datagram unfragmented. With full Ethernet frames
    ///  and no optional IP headers that leaves `1500 - 20 - 8 = 1472` bytes of UDP payload
    ///  for IPV4, minus this protocol's 8 byte fixed header. Surprising network hardware on
    ///  some routes may support less; this crate does not attempt to discover path limits.
    pub max_segment_size: u16,

    /// The number of unacknowledged segments the peer may keep in flight towards us. Twice
    ///  this value is the width of the local acceptance window.
    pub max_outstanding_segments: u16,

    pub retransmission_timeout: Duration,
    pub cumulative_ack_timeout: Duration,
    pub nul_timeout: Duration,

    /// How often one segment is retransmitted before the connection is torn down
    pub max_retransmissions: u8,

    /// The number of received data segments for which a cumulative ack may be deferred
    pub max_cumulative_ack: u8,

    /// Upper bound for the out-of-order reception queue
    pub max_out_of_seq: u8,

    pub max_auto_reset: u8,
}

impl ProtocolConfig {
    pub fn default_ipv4(self_addr: SocketAddr) -> ProtocolConfig {
        ProtocolConfig {
            self_addr,
            accept_incoming: true,
            max_segment_size: 1464,
            max_outstanding_segments: 16,
            retransmission_timeout: Duration::from_millis(600),
            cumulative_ack_timeout: Duration::from_millis(200),
            nul_timeout: Duration::from_millis(3000),
            max_retransmissions: 4,
            max_cumulative_ack: 3,
            max_out_of_seq: 16,
            max_auto_reset: 4,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_segment_size < 16 {
            bail!("max segment size is too small");
        }
        if self.max_outstanding_segments == 0 {
            bail!("max outstanding segments must be positive");
        }
        if self.max_outstanding_segments >= 0x4000 {
            bail!("max outstanding segments must leave the acceptance window below half of the sequence space");
        }
        if self.max_retransmissions == 0 {
            bail!("max retransmissions must be positive");
        }
        if self.retransmission_timeout.as_millis() > u16::MAX as u128
            || self.cumulative_ack_timeout.as_millis() > u16::MAX as u128
            || self.nul_timeout.as_millis() > u16::MAX as u128
        {
            bail!("timeouts must fit the wire format's 16-bit millisecond fields");
        }
        if self.cumulative_ack_timeout >= self.retransmission_timeout {
            bail!("the cumulative ack timeout must stay below the retransmission timeout to keep acks ahead of retransmits");
        }

        Ok(())
    }

    /// the parameter block sent in SYN segments
    pub fn syn_params(&self) -> SynParams {
        SynParams {
            version: SynParams::PROTOCOL_VERSION_1,
            max_segment_size: self.max_segment_size,
            max_outstanding_segments: self.max_outstanding_segments,
            retransmission_timeout_millis: self.retransmission_timeout.as_millis().prechecked_cast(),
            cumulative_ack_timeout_millis: self.cumulative_ack_timeout.as_millis().prechecked_cast(),
            nul_timeout_millis: self.nul_timeout.as_millis().prechecked_cast(),
            max_retransmissions: self.max_retransmissions,
            max_cumulative_ack: self.max_cumulative_ack,
            max_out_of_seq: self.max_out_of_seq,
            max_auto_reset: self.max_auto_reset,
        }
    }
}

/// The parameter set a connection runs with, fixed at handshake completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub max_segment_size: u16,
    /// our advertisement: bounds the peer's in-flight segments and sizes the local
    ///  acceptance window
    pub max_outstanding_self: u16,
    /// the peer's advertisement: bounds our in-flight segments
    pub max_outstanding_peer: u16,
    pub retransmission_timeout: Duration,
    pub cumulative_ack_timeout: Duration,
    pub nul_timeout: Duration,
    pub max_retransmissions: u8,
    pub max_cumulative_ack: u8,
    pub max_out_of_seq: u8,
}

impl ConnectionConfig {
    /// Maxima settle on the smaller of the two proposals, timeouts as well - the more
    ///  impatient side wins. The outstanding-segment limit is directional and not negotiated:
    ///  each side's advertisement bounds the other side's in-flight segments.
    pub fn negotiated(local: &SynParams, peer: &SynParams) -> ConnectionConfig {
        ConnectionConfig {
            max_segment_size: min(local.max_segment_size, peer.max_segment_size),
            max_outstanding_self: local.max_outstanding_segments,
            max_outstanding_peer: peer.max_outstanding_segments,
            retransmission_timeout: Duration::from_millis(
                min(local.retransmission_timeout_millis, peer.retransmission_timeout_millis) as u64),
            cumulative_ack_timeout: Duration::from_millis(
                min(local.cumulative_ack_timeout_millis, peer.cumulative_ack_timeout_millis) as u64),
            nul_timeout: Duration::from_millis(
                min(local.nul_timeout_millis, peer.nul_timeout_millis) as u64),
            max_retransmissions: min(local.max_retransmissions, peer.max_retransmissions),
            max_cumulative_ack: min(local.max_cumulative_ack, peer.max_cumulative_ack),
            max_out_of_seq: min(local.max_out_of_seq, peer.max_out_of_seq),
        }
    }
}
