//! Splits a concatenated MJPEG byte stream (ffmpeg `-f mjpeg`) into frames.

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

#[derive(Debug, Default)]
pub(crate) struct MjpegSplitter {
    buf: Vec<u8>,
}

impl MjpegSplitter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every frame completed by it, oldest first.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            let Some(start) = find(&self.buf, &SOI, 0) else {
                // Keep a trailing 0xFF in case it begins the next marker.
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                self.buf.drain(..self.buf.len() - keep);
                break;
            };
            let Some(end) = find(&self.buf, &EOI, start + SOI.len()) else {
                self.buf.drain(..start);
                break;
            };
            let stop = end + EOI.len();
            frames.push(self.buf[start..stop].to_vec());
            self.buf.drain(..stop);
        }
        frames
    }
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == needle)
        .map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut f = SOI.to_vec();
        f.extend_from_slice(body);
        f.extend_from_slice(&EOI);
        f
    }

    #[test]
    fn splits_back_to_back_frames() {
        let mut s = MjpegSplitter::new();
        let mut stream = frame(&[1, 2, 3]);
        stream.extend(frame(&[4, 5]));
        let frames = s.push(&stream);
        assert_eq!(frames, vec![frame(&[1, 2, 3]), frame(&[4, 5])]);
    }

    #[test]
    fn reassembles_frames_across_chunks() {
        let mut s = MjpegSplitter::new();
        let f = frame(&[9, 9, 9, 9]);
        assert!(s.push(&f[..1]).is_empty());
        assert!(s.push(&f[1..5]).is_empty());
        assert_eq!(s.push(&f[5..]), vec![f.clone()]);
    }

    #[test]
    fn discards_garbage_between_frames() {
        let mut s = MjpegSplitter::new();
        let mut stream = vec![0, 1, 2];
        stream.extend(frame(&[7]));
        stream.extend([3, 3]);
        let frames = s.push(&stream);
        assert_eq!(frames, vec![frame(&[7])]);
        assert!(s.buf.is_empty());
    }
}
