use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use crate::seq_number::SeqNumber;

/// The variable header section of a segment. Which variant is present is determined by the
///  segment's flag bits: SYN segments carry the handshake parameter block, EAK segments an
///  out-of-order sequence number list, everything else has no variable header.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum VarHeader {
    #[default]
    None,
    Syn(SynParams),
    Eak(Vec<SeqNumber>),
}

impl VarHeader {
    pub fn serialized_len(&self) -> usize {
        match self {
            VarHeader::None => 0,
            VarHeader::Syn(_) => SynParams::SERIALIZED_LEN,
            VarHeader::Eak(eak_numbers) => 2 * eak_numbers.len(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            VarHeader::None => {}
            VarHeader::Syn(params) => params.ser(buf),
            VarHeader::Eak(eak_numbers) => {
                for eak in eak_numbers {
                    buf.put_u16(eak.to_raw());
                }
            }
        }
    }
}

/// The parameter block carried by SYN segments during the handshake. Each side proposes its
///  values; the negotiated connection config is derived from both proposals.
///
/// Wire layout (16 bytes, all multi-byte fields big-endian):
/// ```ascii
///  0: protocol version (u8), currently 1
///  1: spare (u8), zero
///  2: maximum segment size in octets (u16)
///  4: maximum number of outstanding segments (u16)
///  6: retransmission timeout in millis (u16)
///  8: cumulative ack timeout in millis (u16)
/// 10: nul segment timeout in millis (u16)
/// 12: maximum retransmissions of one segment (u8)
/// 13: maximum cumulative acks deferrable (u8)
/// 14: maximum out-of-sequence segments buffered (u8)
/// 15: maximum automatic reset attempts (u8)
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SynParams {
    pub version: u8,
    pub max_segment_size: u16,
    pub max_outstanding_segments: u16,
    pub retransmission_timeout_millis: u16,
    pub cumulative_ack_timeout_millis: u16,
    pub nul_timeout_millis: u16,
    pub max_retransmissions: u8,
    pub max_cumulative_ack: u8,
    pub max_out_of_seq: u8,
    pub max_auto_reset: u8,
}

impl SynParams {
    pub const SERIALIZED_LEN: usize = 16;

    pub const PROTOCOL_VERSION_1: u8 = 1;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(0);
        buf.put_u16(self.max_segment_size);
        buf.put_u16(self.max_outstanding_segments);
        buf.put_u16(self.retransmission_timeout_millis);
        buf.put_u16(self.cumulative_ack_timeout_millis);
        buf.put_u16(self.nul_timeout_millis);
        buf.put_u8(self.max_retransmissions);
        buf.put_u8(self.max_cumulative_ack);
        buf.put_u8(self.max_out_of_seq);
        buf.put_u8(self.max_auto_reset);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SynParams> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("SYN parameter block is truncated");
        }

        let version = buf.get_u8();
        if version != Self::PROTOCOL_VERSION_1 {
            bail!("unsupported protocol version {}", version);
        }
        let _spare = buf.get_u8();

        Ok(SynParams {
            version,
            max_segment_size: buf.get_u16(),
            max_outstanding_segments: buf.get_u16(),
            retransmission_timeout_millis: buf.get_u16(),
            cumulative_ack_timeout_millis: buf.get_u16(),
            nul_timeout_millis: buf.get_u16(),
            max_retransmissions: buf.get_u8(),
            max_cumulative_ack: buf.get_u8(),
            max_out_of_seq: buf.get_u8(),
            max_auto_reset: buf.get_u8(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn params() -> SynParams {
        SynParams {
            version: SynParams::PROTOCOL_VERSION_1,
            max_segment_size: 16384,
            max_outstanding_segments: 16,
            retransmission_timeout_millis: 4096,
            cumulative_ack_timeout_millis: 2048,
            nul_timeout_millis: 16384,
            max_retransmissions: 4,
            max_cumulative_ack: 16,
            max_out_of_seq: 16,
            max_auto_reset: 4,
        }
    }

    #[test]
    fn test_syn_params_ser() {
        let mut buf = BytesMut::new();
        params().ser(&mut buf);

        assert_eq!(buf.as_ref(), &[
            0x01, 0x00,
            0x40, 0x00,
            0x00, 0x10,
            0x10, 0x00,
            0x08, 0x00,
            0x40, 0x00,
            0x04, 0x10,
            0x10, 0x04,
        ]);
    }

    #[test]
    fn test_syn_params_round_trip() {
        let original = params();

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        let mut b: &[u8] = &buf;
        let deser = SynParams::deser(&mut b).unwrap();

        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[rstest]
    #[case::version_zero(0)]
    #[case::future_version(2)]
    fn test_syn_params_rejects_version(#[case] version: u8) {
        let mut buf = BytesMut::new();
        SynParams { version, ..params() }.ser(&mut buf);

        let mut b: &[u8] = &buf;
        assert!(SynParams::deser(&mut b).is_err());
    }

    #[test]
    fn test_syn_params_rejects_truncated() {
        let mut buf = BytesMut::new();
        params().ser(&mut buf);

        let mut b: &[u8] = &buf[..SynParams::SERIALIZED_LEN - 1];
        assert!(SynParams::deser(&mut b).is_err());
    }

    #[rstest]
    #[case::none(VarHeader::None, 0)]
    #[case::syn(VarHeader::Syn(params()), 16)]
    #[case::eak(VarHeader::Eak(vec![SeqNumber::from_raw(1), SeqNumber::from_raw(2)]), 4)]
    fn test_serialized_len(#[case] var_header: VarHeader, #[case] expected: usize) {
        assert_eq!(var_header.serialized_len(), expected);

        let mut buf = BytesMut::new();
        var_header.ser(&mut buf);
        assert_eq!(buf.len(), expected);
    }
}
