use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use crate::safe_converter::PrecheckedCast;
use crate::seq_number::SeqNumber;
use crate::var_header::{SynParams, VarHeader};

/// One protocol data unit: five flags, sequence and acknowledgement numbers, an optional
///  variable header selected by the flags, and an optional payload.
///
/// See the crate documentation for the wire layout.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Segment {
    pub syn: bool,
    pub ack: bool,
    pub eak: bool,
    pub rst: bool,
    pub nul: bool,
    pub seq_number: SeqNumber,
    pub ack_number: SeqNumber,
    pub var_header: VarHeader,
    pub data: Vec<u8>,
}

impl Segment {
    pub const FIXED_HEADER_LEN: usize = 8;

    const FLAG_SYN: u8 = 1 << 7;
    const FLAG_ACK: u8 = 1 << 6;
    const FLAG_EAK: u8 = 1 << 5;
    const FLAG_RST: u8 = 1 << 4;
    const FLAG_NUL: u8 = 1 << 3;
    const RESERVED_MASK: u8 = 0b0000_0111;

    /// The longest EAK list that still fits the one-byte header length field
    pub const MAX_EAK_NUMBERS: usize = (u8::MAX as usize * 2 - Self::FIXED_HEADER_LEN) / 2;

    pub fn serialized_len(&self) -> usize {
        Self::FIXED_HEADER_LEN + self.var_header.serialized_len() + self.data.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let header_len = Self::FIXED_HEADER_LEN + self.var_header.serialized_len();

        buf.put_u8(self.encode_flags());
        buf.put_u8((header_len >> 1).prechecked_cast());
        buf.put_u16(self.seq_number.to_raw());
        buf.put_u16(self.ack_number.to_raw());
        buf.put_u16(self.data.len().prechecked_cast());
        self.var_header.ser(buf);
        buf.put_slice(&self.data);
    }

    fn encode_flags(&self) -> u8 {
        let mut flags = 0;

        if self.syn {
            flags |= Self::FLAG_SYN;
        }
        if self.ack {
            flags |= Self::FLAG_ACK;
        }
        if self.eak {
            flags |= Self::FLAG_EAK;
        }
        if self.rst {
            flags |= Self::FLAG_RST;
        }
        if self.nul {
            flags |= Self::FLAG_NUL;
        }

        flags
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Segment> {
        if buf.remaining() < Self::FIXED_HEADER_LEN {
            bail!("segment is shorter than the fixed header");
        }

        let flags = buf.get_u8();
        if flags & Self::RESERVED_MASK != 0 {
            bail!("reserved flag bits are set");
        }
        let syn = flags & Self::FLAG_SYN != 0;
        let eak = flags & Self::FLAG_EAK != 0;

        let header_len = (buf.get_u8() as usize) * 2;
        let Some(var_header_len) = header_len.checked_sub(Self::FIXED_HEADER_LEN) else {
            bail!("declared header length {} is shorter than the fixed header", header_len);
        };

        let seq_number = SeqNumber::from_raw(buf.get_u16());
        let ack_number = SeqNumber::from_raw(buf.get_u16());
        let data_len = buf.get_u16() as usize;

        if buf.remaining() < var_header_len + data_len {
            bail!("segment declares {} variable header and {} payload bytes but only {} are present",
                var_header_len, data_len, buf.remaining());
        }

        let var_header = if syn {
            if var_header_len != SynParams::SERIALIZED_LEN {
                bail!("SYN segment with a malformed parameter block of {} bytes", var_header_len);
            }
            VarHeader::Syn(SynParams::deser(buf)?)
        }
        else if eak {
            if var_header_len == 0 {
                bail!("EAK segment without a sequence number list");
            }
            let mut eak_numbers = Vec::with_capacity(var_header_len / 2);
            for _ in 0..var_header_len / 2 {
                eak_numbers.push(SeqNumber::from_raw(buf.get_u16()));
            }
            VarHeader::Eak(eak_numbers)
        }
        else {
            if var_header_len != 0 {
                bail!("variable header on a segment with neither SYN nor EAK set");
            }
            VarHeader::None
        };

        let mut data = vec![0; data_len];
        buf.copy_to_slice(&mut data);

        Ok(Segment {
            syn,
            ack: flags & Self::FLAG_ACK != 0,
            eak,
            rst: flags & Self::FLAG_RST != 0,
            nul: flags & Self::FLAG_NUL != 0,
            seq_number,
            ack_number,
            var_header,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn syn_params() -> SynParams {
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

    #[rstest]
    #[case::base(
        Segment {
            syn: true,
            ack: true,
            seq_number: SeqNumber::from_raw(0x1234),
            ack_number: SeqNumber::from_raw(0x5678),
            var_header: VarHeader::Syn(syn_params()),
            ..Default::default()
        },
        vec![
            0xc0, 0x0c,
            0x12, 0x34,
            0x56, 0x78,
            0x00, 0x00,
            0x01, 0x00,
            0x40, 0x00,
            0x00, 0x10,
            0x10, 0x00,
            0x08, 0x00,
            0x40, 0x00,
            0x04, 0x10,
            0x10, 0x04,
        ],
    )]
    #[case::data(
        Segment {
            ack: true,
            seq_number: SeqNumber::from_raw(0x1234),
            ack_number: SeqNumber::from_raw(0x5678),
            data: vec![0xba, 0xad, 0xbe, 0xef, 0x15, 0xba, 0xad],
            ..Default::default()
        },
        vec![
            0x40, 0x04,
            0x12, 0x34,
            0x56, 0x78,
            0x00, 0x07,
            0xba, 0xad,
            0xbe, 0xef,
            0x15, 0xba,
            0xad,
        ],
    )]
    #[case::syn(
        Segment {
            syn: true,
            seq_number: SeqNumber::from_raw(0x1234),
            ack_number: SeqNumber::from_raw(0x5678),
            var_header: VarHeader::Syn(syn_params()),
            ..Default::default()
        },
        vec![
            0x80, 0x0c,
            0x12, 0x34,
            0x56, 0x78,
            0x00, 0x00,
            0x01, 0x00,
            0x40, 0x00,
            0x00, 0x10,
            0x10, 0x00,
            0x08, 0x00,
            0x40, 0x00,
            0x04, 0x10,
            0x10, 0x04,
        ],
    )]
    #[case::eak(
        Segment {
            ack: true,
            eak: true,
            seq_number: SeqNumber::from_raw(0x1234),
            ack_number: SeqNumber::from_raw(0x5678),
            var_header: VarHeader::Eak(vec![
                SeqNumber::from_raw(0x123a),
                SeqNumber::from_raw(0x123b),
                SeqNumber::from_raw(0x123c),
            ]),
            ..Default::default()
        },
        vec![
            0x60, 0x07,
            0x12, 0x34,
            0x56, 0x78,
            0x00, 0x00,
            0x12, 0x3a,
            0x12, 0x3b,
            0x12, 0x3c,
        ],
    )]
    #[case::rst(
        Segment {
            rst: true,
            seq_number: SeqNumber::from_raw(0x0001),
            ack_number: SeqNumber::from_raw(0x0002),
            ..Default::default()
        },
        vec![
            0x10, 0x04,
            0x00, 0x01,
            0x00, 0x02,
            0x00, 0x00,
        ],
    )]
    #[case::nul(
        Segment {
            nul: true,
            seq_number: SeqNumber::from_raw(0xffff),
            ack_number: SeqNumber::from_raw(0x0000),
            ..Default::default()
        },
        vec![
            0x08, 0x04,
            0xff, 0xff,
            0x00, 0x00,
            0x00, 0x00,
        ],
    )]
    fn test_ser(#[case] segment: Segment, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        segment.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut b: &[u8] = &buf;
        let deser = Segment::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, segment);
    }

    #[test]
    fn test_ser_base_bytes() {
        let segment = Segment {
            syn: true,
            ack: true,
            seq_number: SeqNumber::from_raw(0x1234),
            ack_number: SeqNumber::from_raw(0x5678),
            ..Default::default()
        };

        let mut buf = BytesMut::new();
        segment.ser(&mut buf);
        assert_eq!(buf.as_ref(), &[0xc0, 0x04, 0x12, 0x34, 0x56, 0x78, 0x00, 0x00]);
    }

    #[test]
    fn test_ser_large_data() {
        let segment = Segment {
            ack: true,
            seq_number: SeqNumber::from_raw(0x1234),
            ack_number: SeqNumber::from_raw(0x5678),
            data: vec![0; 40000],
            ..Default::default()
        };

        let mut buf = BytesMut::new();
        segment.ser(&mut buf);

        assert_eq!(buf.len(), 40008);
        assert_eq!(&buf.as_ref()[..8], &[0x40, 0x04, 0x12, 0x34, 0x56, 0x78, 0x9c, 0x40]);
    }

    #[rstest]
    #[case::truncated_fixed_header(vec![0x40, 0x04, 0x12, 0x34, 0x56])]
    #[case::reserved_bits(vec![0x41, 0x04, 0x12, 0x34, 0x56, 0x78, 0x00, 0x00])]
    #[case::header_too_short(vec![0x40, 0x03, 0x12, 0x34, 0x56, 0x78, 0x00, 0x00])]
    #[case::data_truncated(vec![0x40, 0x04, 0x12, 0x34, 0x56, 0x78, 0x00, 0x02, 0xba])]
    #[case::var_header_without_flags(vec![0x40, 0x05, 0x12, 0x34, 0x56, 0x78, 0x00, 0x00, 0x12, 0x3a])]
    #[case::syn_header_wrong_len(vec![0x80, 0x06, 0x12, 0x34, 0x56, 0x78, 0x00, 0x00, 0x01, 0x00, 0x40, 0x00])]
    #[case::syn_header_missing(vec![0x80, 0x04, 0x12, 0x34, 0x56, 0x78, 0x00, 0x00])]
    #[case::syn_bad_version(vec![
        0x80, 0x0c, 0x12, 0x34, 0x56, 0x78, 0x00, 0x00,
        0x02, 0x00, 0x40, 0x00, 0x00, 0x10, 0x10, 0x00, 0x08, 0x00, 0x40, 0x00, 0x04, 0x10, 0x10, 0x04,
    ])]
    #[case::eak_header_missing(vec![0x60, 0x04, 0x12, 0x34, 0x56, 0x78, 0x00, 0x00])]
    #[case::eak_header_truncated(vec![0x60, 0x07, 0x12, 0x34, 0x56, 0x78, 0x00, 0x00, 0x12, 0x3a])]
    fn test_deser_rejects(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        assert!(Segment::deser(&mut b).is_err());
    }

    #[test]
    fn test_deser_ignores_trailing_bytes() {
        let raw: Vec<u8> = vec![0x40, 0x04, 0x12, 0x34, 0x56, 0x78, 0x00, 0x01, 0xba, 0xfe, 0xfe];

        let mut b: &[u8] = &raw;
        let segment = Segment::deser(&mut b).unwrap();

        assert_eq!(segment.data, vec![0xba]);
        assert_eq!(b.len(), 2);
    }
}
