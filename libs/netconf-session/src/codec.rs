//! NETCONF 1.0 end-of-message framing
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::TransportError;

/// delimiter appended to every base:1.0 message
pub const EOM: &[u8] = b"]]>]]>";

/// largest frame accepted before the peer is considered broken
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Splits a byte stream on the `]]>]]>` delimiter. Frames are yielded as trimmed UTF-8
/// strings, the delimiter itself is never part of a frame.
#[derive(Debug, Clone)]
pub struct EomCodec {
    // bytes already scanned without finding a delimiter
    scanned: usize,
    max_frame_len: usize,
}

impl Default for EomCodec {
    fn default() -> Self {
        Self {
            scanned: 0,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

impl EomCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject frames longer than `max` bytes
    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    fn oversized(&mut self) -> TransportError {
        self.scanned = 0;
        TransportError::Malformed(format!(
            "frame exceeds {} bytes without a delimiter",
            self.max_frame_len
        ))
    }
}

impl Decoder for EomCodec {
    type Item = String;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, TransportError> {
        // the delimiter may straddle the previous read boundary
        let start = self.scanned.saturating_sub(EOM.len() - 1);
        let found = src
            .get(start..)
            .and_then(|rest| rest.windows(EOM.len()).position(|w| w == EOM));

        match found {
            Some(pos) if start + pos > self.max_frame_len => Err(self.oversized()),
            Some(pos) => {
                let frame = src.split_to(start + pos);
                src.advance(EOM.len());
                self.scanned = 0;
                let text = String::from_utf8(frame.to_vec())
                    .map_err(|err| TransportError::Malformed(err.to_string()))?;
                Ok(Some(text.trim().to_owned()))
            }
            // the delimiter could still be in the tail we keep
            None if src.len() > self.max_frame_len + EOM.len() - 1 => Err(self.oversized()),
            None => {
                self.scanned = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, TransportError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.iter().all(u8::is_ascii_whitespace) => {
                buf.clear();
                Ok(None)
            }
            // peer hung up halfway through a message
            None => Err(TransportError::RemoteClosed),
        }
    }
}

impl<T: AsRef<str>> Encoder<T> for EomCodec {
    type Error = TransportError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), TransportError> {
        let item = item.as_ref();
        dst.reserve(item.len() + EOM.len());
        dst.put_slice(item.as_bytes());
        dst.put_slice(EOM);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    use super::{EOM, EomCodec};
    use crate::errors::TransportError;

    #[test]
    fn splits_on_delimiter() {
        let mut codec = EomCodec::new();
        let mut buf = BytesMut::from(&b"<hello/>]]>]]>\n<rpc-reply/>]]>]]>"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("<hello/>"));
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("<rpc-reply/>")
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn delimiter_across_reads() {
        let mut codec = EomCodec::new();
        let mut buf = BytesMut::from(&b"<ok/>]]>"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"]]>");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("<ok/>"));
        assert!(buf.is_empty());
    }

    #[test]
    fn truncated_frame_at_eof_is_remote_closed() {
        let mut codec = EomCodec::new();
        let mut buf = BytesMut::from(&b"<rpc-reply><da"[..]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(err.is_remote_closed());

        let mut buf = BytesMut::from(&b"\n  "[..]);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_malformed() {
        let mut codec = EomCodec::new().with_max_frame_len(8);
        let mut buf = BytesMut::from(&b"<rpc-reply>"[..]);
        buf.extend_from_slice(&[b'x'; 4]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)), "{err}");

        // a complete frame over the cap is refused as well
        let mut codec = EomCodec::new().with_max_frame_len(8);
        let mut buf = BytesMut::from(&b"<rpc-reply/>]]>]]>"[..]);
        assert!(matches!(
            codec.decode(&mut buf).unwrap_err(),
            TransportError::Malformed(_)
        ));

        // up to the cap is fine, even while the delimiter is still incomplete
        let mut codec = EomCodec::new().with_max_frame_len(8);
        let mut buf = BytesMut::from(&b"<ok/>"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"]]>]]");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b">");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("<ok/>"));
    }

    #[test]
    fn encode_appends_delimiter() {
        let mut codec = EomCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("<get/>", &mut buf).unwrap();
        assert!(buf.ends_with(EOM));
        assert!(buf.starts_with(b"<get/>"));
    }
}
