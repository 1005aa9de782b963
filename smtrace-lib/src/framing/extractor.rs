use super::{Frame, END, END_LEN, ESCAPE, MAX_PADDING, START};
use tracing::{trace, warn};

/// Bytes of already consumed history kept in front of the unconsumed data so the
/// "not preceded by an escape" rules see the same bytes regardless of how the stream
/// was chunked.
const LOOKBEHIND: usize = ESCAPE.len();

/// Result of a single [FrameExtractor::feed].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Extraction {
    /// Complete frames in stream order.
    pub frames: Vec<Frame>,
    /// Number of buffered bytes released by this call.
    pub consumed: usize,
}

/// Turns an arbitrarily fragmented byte stream into complete SML [Frame]s.
///
/// Bytes are appended to an internal buffer and the whole unconsumed buffer is
/// scanned on every [feed](Self::feed). Everything up to the end of the last frame
/// found is released, the rest waits for more data.
///
/// # Example
/// ```
/// use smtrace::framing::{Frame, FrameExtractor};
///
/// let frame = Frame::encode(&[0x76, 0x01, 0x02]);
/// let (head, tail) = frame.as_bytes().split_at(5);
///
/// let mut extractor = FrameExtractor::new();
/// assert!(extractor.feed(head).frames.is_empty());
/// assert_eq!(extractor.feed(tail).frames, vec![frame]);
/// assert!(extractor.pending().is_empty());
/// ```
#[derive(Debug)]
pub struct FrameExtractor {
    buf: Vec<u8>,
    // Index of the first unconsumed byte, bytes before are look-behind context only
    start: usize,
    limit: usize,
}

impl Default for FrameExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameExtractor {
    /// Default upper bound for unconsumed bytes.
    pub const DEFAULT_LIMIT: usize = 64 * 1024;

    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity_limit(Self::DEFAULT_LIMIT)
    }

    /// Create an extractor that holds at most `limit` unconsumed bytes. Once exceeded
    /// without a complete frame in sight, older bytes are dropped.
    #[must_use]
    pub fn with_capacity_limit(limit: usize) -> Self {
        FrameExtractor {
            buf: Vec::new(),
            start: 0,
            limit: limit.max(Frame::MIN_LEN),
        }
    }

    /// Append `data` and return all complete frames now available.
    pub fn feed(&mut self, data: &[u8]) -> Extraction {
        self.buf.extend_from_slice(data);

        let mut frames = Vec::default();
        let mut pos = self.start;
        while let Some((begin, end)) = find_frame(&self.buf, pos) {
            trace!(offset = begin, len = end - begin, "frame");
            frames.push(Frame::new(self.buf[begin..end].to_vec()));
            pos = end;
        }

        let mut consumed = pos - self.start;
        self.release(pos);

        let pending = self.buf.len() - self.start;
        if pending > self.limit {
            // keep only what could still be the beginning of a start marker
            let keep = START.len() - 1;
            let dropped = pending - keep;
            warn!(dropped, limit = self.limit, "no frame found; discarding buffered bytes");
            self.release(self.buf.len() - keep);
            consumed += dropped;
        }

        Extraction { frames, consumed }
    }

    /// Bytes received but not yet part of a complete frame.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    /// Drop all buffered data.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.start = 0;
    }

    fn release(&mut self, upto: usize) {
        let keep_from = upto.saturating_sub(LOOKBEHIND);
        self.buf.drain(..keep_from);
        self.start = upto - keep_from;
    }
}

fn position(buf: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|idx| idx + from)
}

fn preceded_by_escape(buf: &[u8], idx: usize) -> bool {
    idx >= ESCAPE.len() && buf[idx - ESCAPE.len()..idx] == ESCAPE
}

/// Locate the first frame starting at or after `from`, returning its byte range.
fn find_frame(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut cursor = from;
    while let Some(begin) = position(buf, &START, cursor) {
        if preceded_by_escape(buf, begin) {
            cursor = begin + 1;
            continue;
        }
        // Any later start would only see a subset of the end markers available to this
        // one, so there is no point in looking further if this one has no end.
        return find_end(buf, begin + START.len()).map(|end| (begin, end));
    }
    None
}

/// Locate the first valid end marker at or after `from`, returning the offset just past
/// the frame checksum.
fn find_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut cursor = from;
    while let Some(idx) = position(buf, &END, cursor) {
        if idx + END_LEN > buf.len() {
            return None;
        }
        if !preceded_by_escape(buf, idx) && buf[idx + END.len()] <= MAX_PADDING {
            return Some(idx + END_LEN);
        }
        cursor = idx + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn telegram(fill: u8, len: usize) -> Frame {
        Frame::encode(&vec![fill; len])
    }

    fn extract_all(chunks: &[&[u8]]) -> (Vec<Frame>, Vec<u8>) {
        let mut extractor = FrameExtractor::new();
        let mut frames = Vec::new();
        for chunk in chunks {
            frames.extend(extractor.feed(chunk).frames);
        }
        (frames, extractor.pending().to_vec())
    }

    #[test]
    fn single_frame_in_one_feed() {
        let frame = telegram(0x42, 12);
        let (frames, rest) = extract_all(&[frame.as_bytes()]);
        assert_eq!(frames, vec![frame]);
        assert!(rest.is_empty());
    }

    #[test]
    fn back_to_back_frames_leave_only_trailing_bytes() {
        let first = telegram(0x11, 8);
        let second = telegram(0x22, 9);
        let mut stream = first.as_bytes().to_vec();
        stream.extend_from_slice(second.as_bytes());
        stream.extend_from_slice(&[0x1b, 0x1b, 0x1b]);

        let mut extractor = FrameExtractor::new();
        let extracted = extractor.feed(&stream);

        assert_eq!(extracted.frames, vec![first.clone(), second.clone()]);
        assert_eq!(extracted.consumed, first.len() + second.len());
        assert_eq!(extractor.pending(), &[0x1b, 0x1b, 0x1b]);
    }

    #[test]
    fn garbage_before_start_is_skipped() {
        let frame = telegram(0x33, 4);
        let mut stream = vec![0x00, 0xff, 0x1b, 0x1b, 0x01];
        stream.extend_from_slice(frame.as_bytes());
        let (frames, rest) = extract_all(&[&stream]);
        assert_eq!(frames, vec![frame]);
        assert!(rest.is_empty());
    }

    #[test]
    fn start_marker_split_across_reads() {
        let frame = telegram(0x44, 16);
        let bytes = frame.as_bytes();
        let (frames, _) = extract_all(&[&bytes[..3], &bytes[3..6], &bytes[6..]]);
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn incomplete_frame_is_retained() {
        let frame = telegram(0x55, 8);
        let bytes = frame.as_bytes();
        let mut extractor = FrameExtractor::new();

        let extracted = extractor.feed(&bytes[..bytes.len() - 1]);
        assert!(extracted.frames.is_empty());
        assert_eq!(extracted.consumed, 0);
        assert_eq!(extractor.pending().len(), bytes.len() - 1);

        let extracted = extractor.feed(&bytes[bytes.len() - 1..]);
        assert_eq!(extracted.frames, vec![frame]);
    }

    #[test]
    fn escaped_start_marker_is_not_a_boundary() {
        // An escape sequence directly followed by a start marker
        let mut stream = ESCAPE.to_vec();
        stream.extend_from_slice(&START);
        stream.extend_from_slice(&[0x01, 0x02, 0x03, 0x00]);
        stream.extend_from_slice(&END);
        stream.extend_from_slice(&[0x00, 0xaa, 0xbb]);

        let (frames, _) = extract_all(&[&stream]);
        assert!(frames.is_empty());
    }

    #[test]
    fn escaped_end_marker_is_not_a_boundary() {
        let mut stream = START.to_vec();
        stream.extend_from_slice(&[0x01, 0x02, 0x03, 0x04]);
        // escaped escape followed by what would be an end marker
        stream.extend_from_slice(&ESCAPE);
        stream.extend_from_slice(&END);
        stream.extend_from_slice(&[0x00, 0x01, 0x02]);
        // the real end
        stream.extend_from_slice(&[0x05, 0x06, 0x07, 0x08]);
        stream.extend_from_slice(&END);
        stream.extend_from_slice(&[0x00, 0xcc, 0xdd]);

        let (frames, rest) = extract_all(&[&stream]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_bytes(), &stream[..]);
        assert!(rest.is_empty());
    }

    #[test]
    fn end_marker_with_invalid_padding_is_skipped() {
        let mut stream = START.to_vec();
        stream.extend_from_slice(&[0x01, 0x02, 0x03, 0x04]);
        stream.extend_from_slice(&END);
        stream.extend_from_slice(&[0x07, 0x00, 0x00]);
        stream.extend_from_slice(&END);
        stream.extend_from_slice(&[0x00, 0x10, 0x20]);

        let (frames, _) = extract_all(&[&stream]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), stream.len());
        assert_eq!(frames[0].checksum(), 0x2010);
    }

    #[test]
    fn shortest_match_does_not_swallow_next_frame() {
        let first = telegram(0x01, 4);
        let second = telegram(0x02, 4);
        let mut stream = first.as_bytes().to_vec();
        stream.extend_from_slice(second.as_bytes());

        let (frames, _) = extract_all(&[&stream]);
        assert_eq!(frames, vec![first, second]);
    }

    #[test]
    fn chunked_feeds_match_single_feed() {
        let mut stream = vec![0x00, 0x1b, 0x1b];
        for i in 0..20u8 {
            stream.extend_from_slice(telegram(i, usize::from(i) * 3 + 1).as_bytes());
            // never 4 escapes in a row, that would escape the next start marker
            stream.push(0x00);
            stream.extend_from_slice(&vec![0x1b; usize::from(i % 4)]);
        }
        let (expected, expected_rest) = extract_all(&[&stream]);
        assert_eq!(expected.len(), 20);

        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let mut chunks: Vec<&[u8]> = Vec::new();
            let mut rest = &stream[..];
            while !rest.is_empty() {
                let n = rng.gen_range(1..=rest.len().min(40));
                let (head, tail) = rest.split_at(n);
                chunks.push(head);
                rest = tail;
            }
            let (frames, pending) = extract_all(&chunks);
            assert_eq!(frames, expected);
            assert_eq!(pending, expected_rest);
        }
    }

    #[test]
    fn byte_at_a_time() {
        let frame = telegram(0x1b, 13);
        let chunks: Vec<&[u8]> = frame.as_bytes().chunks(1).collect();
        let (frames, rest) = extract_all(&chunks);
        assert_eq!(frames, vec![frame]);
        assert!(rest.is_empty());
    }

    #[test]
    fn limit_discards_unframed_bytes() {
        let mut extractor = FrameExtractor::with_capacity_limit(64);
        let extracted = extractor.feed(&[0xab; 100]);
        assert!(extracted.frames.is_empty());
        assert_eq!(extracted.consumed, 100 - (START.len() - 1));
        assert_eq!(extractor.pending().len(), START.len() - 1);

        let frame = telegram(0x10, 8);
        assert_eq!(extractor.feed(frame.as_bytes()).frames, vec![frame]);
    }
}
