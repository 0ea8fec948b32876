//! A reliable, connection-oriented message transport over unreliable datagrams, in the
//!  spirit of RDP (RFC 908 / RFC 1151): ordered, retransmitted, selectively acknowledged
//!  segments with an explicit three-way handshake and a small per-connection state machine.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data as
//!   opposed to a byte stream); messages above the negotiated segment size are fragmented
//!   across segments and delivered segment-wise in order
//! * Delivery to the upper layer is in strict sequence order: out-of-order segments are
//!   buffered at the receiver until the gap before them is filled
//! * Positive cumulative acknowledgement, deferrable up to a negotiated count or timeout,
//!   plus *extended acknowledgement* (EAK) of individual out-of-order segments so a sender
//!   can retransmit selectively
//! * Lost segments are retransmitted from a per-connection queue with a bounded number of
//!   attempts; exhausting them tears the connection down
//! * Idle connections are probed with NUL keepalive segments that consume no sequence space
//! * Sequence numbers live in a 16-bit wrapping space; all comparisons are windowed and
//!   wrap-safe
//! * One UDP socket serves all connections of an endpoint; connections are keyed by the
//!   peer's socket address
//! * Explicitly *not* goals: congestion control, path-MTU discovery, multiplexing several
//!   streams over one connection, cryptographic authentication
//!
//! ## Segment format
//!
//! All numbers in network byte order (BE):
//! ```ascii
//! 0: flags (8 bits):
//!    * bit 7: SYN - handshake, carries the parameter block
//!    * bit 6: ACK - the acknowledgement number is valid
//!    * bit 5: EAK - carries a list of out-of-order sequence numbers
//!    * bit 4: RST - teardown
//!    * bit 3: NUL - keepalive probe
//!    * bits 2-0: reserved, must be zero
//! 1: header length in 16-bit words, including the variable header (u8)
//! 2: sequence number (u16)
//! 4: acknowledgement number (u16)
//! 6: data length in octets (u16)
//! 8: variable header: SYN parameter block (16 bytes) for SYN segments, a list of
//!     sequence numbers (2 bytes each) for EAK segments, empty otherwise
//! *: data
//! ```
//!
//! The SYN parameter block is documented in [var_header::SynParams].
//!
//! ## Connection lifecycle
//!
//! ```ascii
//! Closed      --passive open-->  Listen
//! Closed      --active open-->   SynSent       (SYN sent)
//! Listen      --SYN-->           SynReceived   (SYN+ACK sent)
//! SynSent     --SYN+ACK-->       Open          (ACK sent)
//! SynSent     --SYN-->           SynReceived   (SYN+ACK sent, simultaneous open)
//! SynSent     --RST-->           Closed
//! SynReceived --ACK of ISS-->    Open
//! SynReceived --RST-->           Closed
//! Open        --RST-->           CloseWait
//! Open        --retransmissions exhausted--> CloseWait (RST sent)
//! CloseWait   --linger timer-->  Closed
//! ```
//!
//! Per connection everything is serialized through one lock: segment processing, timer
//!  callbacks and send calls never run concurrently, which is what keeps the transmit and
//!  receive queue invariants without further synchronization.

pub mod buffers;
pub mod config;
pub mod connection;
pub mod end_point;
pub mod message_dispatcher;
pub mod safe_converter;
pub mod segment;
pub mod send_pipeline;
pub mod seq_number;
pub mod validator;
pub mod var_header;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
