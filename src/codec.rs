use bytes::{Buf, BytesMut};
use std::io;
use tokio_util::codec::Decoder;

/// Frames a byte stream in some legacy charset into UTF-8 chunks.
pub struct Utf8Transcoder {
    decoder: encoding_rs::Decoder,
}

impl Utf8Transcoder {
    pub fn new(encoding: &'static encoding_rs::Encoding) -> Self {
        Self {
            decoder: encoding.new_decoder_without_bom_handling(),
        }
    }

    fn transcode(&mut self, src: &mut BytesMut, last: bool) -> Option<BytesMut> {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(src.len())
            .unwrap_or_else(|| src.len() * 3);
        let mut out = vec![0; capacity];
        let (_result, read, written, _replaced) = self.decoder.decode_to_utf8(src, &mut out, last);
        src.advance(read);
        (written > 0).then(|| BytesMut::from(&out[..written]))
    }
}

impl Decoder for Utf8Transcoder {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        // A partial multi-byte sequence is held inside the decoder, so
        // consuming input without output is fine here.
        Ok(self.transcode(src, false))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let out = self.transcode(buf, true);
        buf.clear();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcodes_latin1_to_utf8() {
        let mut t = Utf8Transcoder::new(encoding_rs::WINDOWS_1252);
        let mut src = BytesMut::from(&b"Z\xfcrich,12.50\n"[..]);
        let out = t.decode(&mut src).expect("decode").expect("some output");
        assert_eq!(std::str::from_utf8(&out).expect("utf8"), "Zürich,12.50\n");
        assert!(src.is_empty());
        assert!(t.decode_eof(&mut src).expect("eof").is_none());
    }

    #[test]
    fn split_multibyte_sequence_is_completed_on_next_chunk() {
        let mut t = Utf8Transcoder::new(encoding_rs::SHIFT_JIS);
        // "日" in Shift_JIS is 0x93 0xFA.
        let mut first = BytesMut::from(&b"\x93"[..]);
        assert!(t.decode(&mut first).expect("decode").is_none());
        let mut second = BytesMut::from(&b"\xfa"[..]);
        let out = t.decode(&mut second).expect("decode").expect("output");
        assert_eq!(std::str::from_utf8(&out).expect("utf8"), "日");
    }
}
