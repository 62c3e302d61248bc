//! Frame encoding/decoding for the tunnel wire format
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+--------+--------+
//! |   Length (2B)   |           Stream ID (4B)          |
//! +--------+--------+--------+--------+--------+--------+
//! |                 Payload (Length bytes)              |
//! +--------+--------+--------+--------+--------+--------+
//! ```
//!
//! Both integers are big-endian. An empty payload closes the stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 6;

/// Largest payload the length field can describe
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    stream_id: u32,
    payload: Bytes,
}

impl Frame {
    /// Cuts `data` into data frames of at most [`MAX_PAYLOAD_SIZE`] bytes.
    /// Empty `data` yields no frame.
    pub fn split(stream_id: u32, data: &[u8]) -> impl Iterator<Item = Frame> + '_ {
        data.chunks(MAX_PAYLOAD_SIZE).map(move |chunk| Frame {
            stream_id,
            payload: Bytes::copy_from_slice(chunk),
        })
    }

    /// The empty frame that tells the other side to close `stream_id`.
    pub fn close(stream_id: u32) -> Self {
        Frame {
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_close(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.put(&mut buf);
        buf.freeze()
    }

    /// Appends the encoded frame to `buf`.
    pub fn put(&self, buf: &mut BytesMut) {
        debug_assert!(self.payload.len() <= MAX_PAYLOAD_SIZE);
        buf.reserve(self.encoded_len());
        buf.put_u16(self.payload.len() as u16);
        buf.put_u32(self.stream_id);
        buf.put_slice(&self.payload);
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns the frame and the number of bytes it occupied, or `None` if
    /// `buf` does not yet hold a complete frame. Nothing is consumed then.
    pub fn decode(buf: &[u8]) -> Option<(Frame, usize)> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }

        let mut header = &buf[..FRAME_HEADER_SIZE];
        let length = header.get_u16() as usize;
        let stream_id = header.get_u32();

        let total = FRAME_HEADER_SIZE + length;
        if buf.len() < total {
            return None;
        }

        let payload = Bytes::copy_from_slice(&buf[FRAME_HEADER_SIZE..total]);
        Some((Frame { stream_id, payload }, total))
    }
}

#[cfg(test)]
impl Frame {
    /// A single data frame.
    pub(crate) fn data(stream_id: u32, payload: &[u8]) -> Self {
        assert!(payload.len() <= MAX_PAYLOAD_SIZE);
        Frame {
            stream_id,
            payload: Bytes::copy_from_slice(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(mut buf: &[u8]) -> (Vec<Frame>, usize) {
        let mut frames = Vec::new();
        while let Some((frame, used)) = Frame::decode(buf) {
            frames.push(frame);
            buf = &buf[used..];
        }
        (frames, buf.len())
    }

    #[test]
    fn wire_layout() {
        let frame = Frame::data(0x0102_0304, b"hi");
        assert_eq!(&frame.encode()[..], [0x00, 0x02, 0x01, 0x02, 0x03, 0x04, b'h', b'i']);
        assert_eq!(&Frame::close(7).encode()[..], [0, 0, 0, 0, 0, 7]);
    }

    #[test]
    fn extreme_ids_and_sizes_survive_decoding() {
        for (stream_id, len) in [(0, 0), (u32::MAX, MAX_PAYLOAD_SIZE), (42, 1)] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let frame = Frame::data(stream_id, &payload);
            let encoded = frame.encode();

            let (decoded, used) = Frame::decode(&encoded).unwrap();
            assert_eq!(decoded, frame);
            assert_eq!(used, encoded.len());
        }
    }

    #[test]
    fn split_respects_the_length_field() {
        let data: Vec<u8> = (0..2 * MAX_PAYLOAD_SIZE + 10).map(|i| i as u8).collect();
        let frames: Vec<Frame> = Frame::split(3, &data).collect();

        let sizes: Vec<usize> = frames.iter().map(|frame| frame.payload().len()).collect();
        assert_eq!(sizes, vec![MAX_PAYLOAD_SIZE, MAX_PAYLOAD_SIZE, 10]);
        assert!(frames.iter().all(|frame| frame.stream_id() == 3));
        let joined: Vec<u8> = frames.iter().flat_map(|frame| frame.payload().to_vec()).collect();
        assert_eq!(joined, data);

        assert_eq!(Frame::split(3, &[]).count(), 0);
    }

    #[test]
    fn split_at_any_boundary() {
        let frame = Frame::data(9, b"partial frames");
        let encoded = frame.encode();

        for split in 0..encoded.len() {
            assert_eq!(Frame::decode(&encoded[..split]), None, "split {split}");

            let mut buffered = BytesMut::from(&encoded[..split]);
            buffered.extend_from_slice(&encoded[split..]);
            let (decoded, used) = Frame::decode(&buffered).unwrap();
            assert_eq!(decoded, frame);
            assert_eq!(used, encoded.len());
        }
    }

    #[test]
    fn batched_frames_decode_in_order() {
        let mut buf = BytesMut::new();
        Frame::data(1, b"a").put(&mut buf);
        Frame::data(2, b"b").put(&mut buf);
        Frame::close(1).put(&mut buf);
        buf.extend_from_slice(&[0x00, 0x05, 0x00]);

        let (frames, left) = decode_all(&buf);
        assert_eq!(
            frames,
            vec![
                Frame::data(1, b"a"),
                Frame::data(2, b"b"),
                Frame::close(1),
            ]
        );
        assert!(frames[2].is_close());
        assert_eq!(left, 3);
    }
}
