//! Half-stream assembler
//!
//! Reassembles one direction of a flow into a growing byte buffer plus block
//! metadata. Segments arriving ahead of the expected sequence number wait in
//! a bounded out-of-order buffer; old data is recognized with RFC 1323
//! wraparound arithmetic and flagged as retransmission on the blocks it
//! originally filled.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

/// Metadata of one contiguous block within the reassembled buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMeta {
    /// Byte offset of the block within the buffer
    pub start: usize,
    /// Capture time of the first packet of the block
    pub timestamp: DateTime<Utc>,
    /// Whether a retransmitted segment contributed bytes to the block
    pub loss: bool,
}

#[derive(Debug)]
struct PendingSegment {
    seq: u32,
    payload: Vec<u8>,
    timestamp: DateTime<Utc>,
    fin: bool,
}

/// One direction of a flow under reassembly
#[derive(Debug)]
pub struct HalfStream {
    buffer: Vec<u8>,
    blocks: Vec<BlockMeta>,
    /// Expected sequence number of the next segment
    next_seq: Option<u32>,
    /// Sequence number of `buffer[0]`
    initial_seq: Option<u32>,
    /// Future segments waiting for the gap to fill
    ooo: VecDeque<PendingSegment>,
    ooo_capacity: usize,
    /// Capture time of the last payload-bearing packet
    last_payload_at: Option<DateTime<Utc>>,
    fin_seen: bool,
}

impl HalfStream {
    pub fn new(ooo_capacity: usize) -> Self {
        Self {
            buffer: Vec::new(),
            blocks: Vec::new(),
            next_seq: None,
            initial_seq: None,
            ooo: VecDeque::new(),
            ooo_capacity,
            last_payload_at: None,
            fin_seen: false,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn fin_seen(&self) -> bool {
        self.fin_seen
    }

    pub fn blocks(&self) -> &[BlockMeta] {
        &self.blocks
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Record the SYN of this direction; it consumes one sequence number.
    pub fn on_syn(&mut self, seq: u32) {
        self.next_seq = Some(seq.wrapping_add(1));
    }

    /// Feed one segment of this direction.
    pub fn on_segment(
        &mut self,
        seq: u32,
        payload: &[u8],
        fin: bool,
        timestamp: DateTime<Utc>,
        block_gap: Duration,
    ) {
        // Flows captured mid-conversation have no SYN to anchor on
        let next = match self.next_seq {
            Some(next) => next,
            None => {
                self.next_seq = Some(seq);
                seq
            }
        };

        if seq == next {
            self.accept(seq, payload, fin, timestamp, false, block_gap);
            self.flush_ooo(block_gap);
        } else if wrapping_lt(next, seq) {
            self.buffer_ooo(seq, payload, fin, timestamp);
        } else {
            let end_seq = seq.wrapping_add(payload.len() as u32);
            if wrapping_lt(next, end_seq) {
                // Starts before the expected sequence but carries new bytes
                let overlap = next.wrapping_sub(seq) as usize;
                self.accept(next, &payload[overlap..], fin, timestamp, true, block_gap);
                self.flush_ooo(block_gap);
            } else {
                // Pure retransmission: bytes were already delivered once
                self.mark_retransmitted(seq, payload.len());
                if fin {
                    self.fin_seen = true;
                }
            }
        }
    }

    /// Append accepted bytes and advance the expected sequence number.
    fn accept(
        &mut self,
        seq: u32,
        payload: &[u8],
        fin: bool,
        timestamp: DateTime<Utc>,
        retransmitted: bool,
        block_gap: Duration,
    ) {
        if !payload.is_empty() {
            if self.initial_seq.is_none() {
                self.initial_seq = Some(seq);
            }

            let new_block = match (self.blocks.last(), self.last_payload_at) {
                (None, _) => true,
                (Some(_), Some(last)) => timestamp - last > block_gap,
                (Some(_), None) => true,
            };

            if new_block {
                self.blocks.push(BlockMeta {
                    start: self.buffer.len(),
                    timestamp,
                    loss: retransmitted,
                });
            } else if let Some(block) = self.blocks.last_mut() {
                block.loss |= retransmitted;
            }

            self.buffer.extend_from_slice(payload);
            self.last_payload_at = Some(timestamp);
        }

        let mut expected = seq.wrapping_add(payload.len() as u32);
        if fin {
            self.fin_seen = true;
            expected = expected.wrapping_add(1);
        }
        self.next_seq = Some(expected);
    }

    fn buffer_ooo(&mut self, seq: u32, payload: &[u8], fin: bool, timestamp: DateTime<Utc>) {
        if self.ooo.len() >= self.ooo_capacity {
            tracing::warn!(seq, "out-of-order buffer full, dropping segment");
            return;
        }
        self.ooo.push_back(PendingSegment {
            seq,
            payload: payload.to_vec(),
            timestamp,
            fin,
        });
    }

    /// Drain out-of-order segments that the expected sequence number has
    /// caught up with; keep future ones, drop stale ones.
    fn flush_ooo(&mut self, block_gap: Duration) {
        let mut progressed = true;
        while progressed {
            progressed = false;
            let next = match self.next_seq {
                Some(next) => next,
                None => return,
            };

            let mut index = 0;
            while index < self.ooo.len() {
                let seq = self.ooo[index].seq;
                let len = self.ooo[index].payload.len() as u32;

                if seq == next {
                    let segment = self.ooo.remove(index).unwrap();
                    self.accept(
                        segment.seq,
                        &segment.payload,
                        segment.fin,
                        segment.timestamp,
                        false,
                        block_gap,
                    );
                    progressed = true;
                    break;
                } else if wrapping_lt(next, seq) {
                    index += 1;
                } else if wrapping_lt(next, seq.wrapping_add(len)) {
                    let segment = self.ooo.remove(index).unwrap();
                    let overlap = next.wrapping_sub(segment.seq) as usize;
                    self.accept(
                        next,
                        &segment.payload[overlap..],
                        segment.fin,
                        segment.timestamp,
                        true,
                        block_gap,
                    );
                    progressed = true;
                    break;
                } else {
                    // stale: already fully delivered
                    let segment = self.ooo.remove(index).unwrap();
                    self.mark_retransmitted(segment.seq, segment.payload.len());
                }
            }
        }
    }

    /// Flag every block overlapping the re-delivered sequence range.
    fn mark_retransmitted(&mut self, seq: u32, len: usize) {
        let Some(initial) = self.initial_seq else {
            return;
        };
        if len == 0 || self.buffer.is_empty() {
            return;
        }

        let start = seq.wrapping_sub(initial) as usize;
        if start >= self.buffer.len() {
            return;
        }
        let end = (start + len).min(self.buffer.len());

        // Each block runs to the next block's start, or to the buffer end.
        let starts: Vec<usize> = self.blocks.iter().map(|b| b.start).collect();
        let buffer_len = self.buffer.len();
        for (i, block) in self.blocks.iter_mut().enumerate() {
            let block_end = starts.get(i + 1).copied().unwrap_or(buffer_len);
            if block.start < end && start < block_end {
                block.loss = true;
            }
        }
    }

    /// Consume the assembler, yielding the reassembled bytes and block
    /// metadata.
    pub fn into_parts(self) -> (Vec<u8>, Vec<BlockMeta>) {
        (self.buffer, self.blocks)
    }
}

/// RFC 1323 wraparound comparison: is `lhs` earlier than `rhs`?
pub fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    lhs.wrapping_sub(rhs) > (1 << 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn gap() -> Duration {
        Duration::milliseconds(100)
    }

    #[test]
    fn test_in_order_reassembly() {
        let mut stream = HalfStream::new(64);
        stream.on_syn(99);
        stream.on_segment(100, b"hello ", false, ts(0), gap());
        stream.on_segment(106, b"world", false, ts(10), gap());

        assert_eq!(stream.buffer(), b"hello world");
        assert_eq!(stream.blocks().len(), 1);
        assert!(!stream.blocks()[0].loss);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut stream = HalfStream::new(64);
        stream.on_syn(0);
        stream.on_segment(7, b"world", false, ts(10), gap());
        assert!(stream.is_empty());

        stream.on_segment(1, b"hello ", false, ts(0), gap());
        assert_eq!(stream.buffer(), b"hello world");
    }

    #[test]
    fn test_block_gap_starts_new_block() {
        let mut stream = HalfStream::new(64);
        stream.on_syn(0);
        stream.on_segment(1, b"first", false, ts(0), gap());
        stream.on_segment(6, b"second", false, ts(500), gap());

        assert_eq!(stream.blocks().len(), 2);
        assert_eq!(stream.blocks()[0].start, 0);
        assert_eq!(stream.blocks()[1].start, 5);
        assert_eq!(stream.blocks()[1].timestamp, ts(500));
    }

    #[test]
    fn test_pure_retransmission_flags_block_without_duplicating() {
        let mut stream = HalfStream::new(64);
        stream.on_syn(0);
        stream.on_segment(1, b"payload", false, ts(0), gap());
        // identical bytes, same sequence number
        stream.on_segment(1, b"payload", false, ts(50), gap());

        assert_eq!(stream.buffer(), b"payload");
        assert_eq!(stream.blocks().len(), 1);
        assert!(stream.blocks()[0].loss);
    }

    #[test]
    fn test_partial_overlap_keeps_new_tail() {
        let mut stream = HalfStream::new(64);
        stream.on_syn(0);
        stream.on_segment(1, b"abcdef", false, ts(0), gap());
        // re-delivers "def" and adds "ghi"
        stream.on_segment(4, b"defghi", false, ts(10), gap());

        assert_eq!(stream.buffer(), b"abcdefghi");
        // the tail bytes came from a partially retransmitted segment
        assert!(stream.blocks().iter().any(|b| b.loss));
    }

    #[test]
    fn test_fin_consumes_sequence_number() {
        let mut stream = HalfStream::new(64);
        stream.on_syn(0);
        stream.on_segment(1, b"bye", true, ts(0), gap());
        assert!(stream.fin_seen());

        // a segment after the FIN's phantom byte still lines up
        let mut other = HalfStream::new(64);
        other.on_syn(0);
        other.on_segment(1, b"", true, ts(0), gap());
        other.on_segment(2, b"late", false, ts(5), gap());
        assert_eq!(other.buffer(), b"late");
    }

    #[test]
    fn test_mid_capture_flow_without_syn() {
        let mut stream = HalfStream::new(64);
        stream.on_segment(5000, b"no syn seen", false, ts(0), gap());
        assert_eq!(stream.buffer(), b"no syn seen");
    }

    #[test]
    fn test_ooo_capacity_bound() {
        let mut stream = HalfStream::new(2);
        stream.on_syn(0);
        // all future segments; only two fit
        stream.on_segment(100, b"a", false, ts(0), gap());
        stream.on_segment(200, b"b", false, ts(1), gap());
        stream.on_segment(300, b"c", false, ts(2), gap());
        assert_eq!(stream.ooo.len(), 2);
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut stream = HalfStream::new(64);
        stream.on_syn(u32::MAX - 2);
        stream.on_segment(u32::MAX - 1, b"ab", false, ts(0), gap());
        // wraps past zero
        stream.on_segment(1, b"cd", false, ts(1), gap());
        assert_eq!(stream.buffer(), b"abcd");
    }

    #[test]
    fn test_wrapping_lt() {
        assert!(wrapping_lt(1, 2));
        assert!(!wrapping_lt(2, 1));
        assert!(wrapping_lt(u32::MAX, 1));
        assert!(!wrapping_lt(1, u32::MAX));
    }
}
