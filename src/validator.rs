use crate::connection::{ConnState, ConnectionInner};
use crate::segment::Segment;
use crate::seq_number::SeqNumber;
use crate::var_header::VarHeader;

/// What to do with an inbound segment, decided against connection state before any state is
///  touched.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SegmentAction {
    /// apply the segment to the connection
    Process,
    /// drop silently
    Discard,
    /// emit RST and tear the connection down
    Reset,
    /// answer with an empty cumulative ack and drop the segment
    Ack,
}

type Verdict = (SegmentAction, Option<&'static str>);

const PROCESS: Verdict = (SegmentAction::Process, None);

impl ConnectionInner {
    /// Per-state acceptance rules. This only inspects state, it never changes it - the
    ///  caller performs the returned action.
    pub(crate) fn validate_segment(&self, segment: &Segment) -> Verdict {
        match self.state {
            ConnState::Closed => (SegmentAction::Discard, Some("segment for a closed connection")),
            ConnState::Listen => self.validate_in_listen(segment),
            ConnState::SynSent => self.validate_in_syn_sent(segment),
            ConnState::SynReceived => self.validate_in_syn_received(segment),
            ConnState::Open => self.validate_in_open(segment),
            ConnState::CloseWait => {
                if segment.rst {
                    PROCESS
                }
                else {
                    (SegmentAction::Discard, Some("only RST is processed while closing"))
                }
            }
        }
    }

    fn validate_in_listen(&self, segment: &Segment) -> Verdict {
        if !segment.syn || segment.ack || segment.eak || segment.rst || segment.nul {
            return (SegmentAction::Discard, Some("a listening connection processes only bare SYN segments"));
        }
        if !matches!(segment.var_header, VarHeader::Syn(_)) {
            return (SegmentAction::Reset, Some("SYN segment without a parameter block"));
        }

        PROCESS
    }

    fn validate_in_syn_sent(&self, segment: &Segment) -> Verdict {
        if segment.rst {
            return PROCESS;
        }

        if !segment.syn || segment.eak || segment.nul {
            return (SegmentAction::Discard, Some("expecting the peer's SYN"));
        }
        if !matches!(segment.var_header, VarHeader::Syn(_)) {
            return (SegmentAction::Reset, Some("SYN segment without a parameter block"));
        }
        if segment.ack && segment.ack_number != self.tx_next_seq.prev() {
            return (SegmentAction::Reset, Some("handshake ack does not match the initial sequence number"));
        }

        PROCESS
    }

    fn validate_in_syn_received(&self, segment: &Segment) -> Verdict {
        if segment.rst {
            return PROCESS;
        }

        // check the sequence number before anything else so that late and duplicate
        //  segments get an ack instead of escalating
        if let Some(verdict) = self.check_receive_window(segment.seq_number) {
            return verdict;
        }

        if segment.syn || segment.eak {
            return (SegmentAction::Reset, Some("unexpected handshake flags on an accepted connection"));
        }
        if !segment.ack {
            return (SegmentAction::Discard, Some("the initial SYN must be acknowledged first"));
        }
        if segment.ack_number != self.tx_next_seq.prev() {
            return (SegmentAction::Reset, Some("handshake ack does not match the initial sequence number"));
        }
        if segment.nul && !segment.data.is_empty() {
            return (SegmentAction::Discard, Some("NUL segment carrying data"));
        }

        PROCESS
    }

    fn validate_in_open(&self, segment: &Segment) -> Verdict {
        if segment.rst {
            return PROCESS;
        }

        if let Some(verdict) = self.check_receive_window(segment.seq_number) {
            return verdict;
        }

        if segment.syn {
            return (SegmentAction::Reset, Some("SYN on an open connection"));
        }
        if segment.nul && !segment.data.is_empty() {
            return (SegmentAction::Discard, Some("NUL segment carrying data"));
        }
        if segment.ack && self.tx_next_seq.leq(segment.ack_number) {
            return (SegmentAction::Discard, Some("ack for a sequence number that was never sent"));
        }

        if segment.eak {
            if !segment.ack {
                return (SegmentAction::Reset, Some("EAK without a cumulative ack"));
            }
            let eak_numbers = match &segment.var_header {
                VarHeader::Eak(eak_numbers) if !eak_numbers.is_empty() => eak_numbers,
                _ => return (SegmentAction::Reset, Some("EAK segment without a sequence number list")),
            };
            for &eak in eak_numbers {
                if eak.leq(segment.ack_number) {
                    return (SegmentAction::Discard, Some("EAK at or below the cumulative ack"));
                }
                if self.tx_next_seq.leq(eak) {
                    return (SegmentAction::Discard, Some("EAK for a sequence number that was never sent"));
                }
            }
        }

        PROCESS
    }

    /// A segment is acceptable iff its sequence number lies modularly above the delivery
    ///  point and within twice the advertised outstanding-segment limit.
    fn check_receive_window(&self, seq_number: SeqNumber) -> Option<Verdict> {
        let Some(config) = &self.config else {
            return Some((SegmentAction::Reset, Some("no negotiated config on an accepted connection")));
        };

        let upper_bound = self.rx_last_in_seq + 2 * config.max_outstanding_self;
        if self.rx_last_in_seq.lt(seq_number) && seq_number.leq(upper_bound) {
            None
        }
        else {
            Some((SegmentAction::Ack, Some("sequence number outside the receive window")))
        }
    }
}
