use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use tokio::io::{AsyncRead, BufReader};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use crate::codec::Utf8Transcoder;
use crate::manifest::Manifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

/// How a report blob is encoded on the wire.
#[derive(Debug, Clone)]
pub struct ReportEncoding {
    pub compression: Compression,
    /// Character encoding of the CSV text (defaults to UTF-8)
    pub charset: &'static encoding_rs::Encoding,
}

impl Default for ReportEncoding {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            charset: encoding_rs::UTF_8,
        }
    }
}

impl ReportEncoding {
    /// Resolve the encoding of one report key. Decompression is chosen from
    /// the manifest's compression field, then its content type, then the
    /// key's extension.
    pub fn for_report(manifest: &Manifest, key: &str) -> Self {
        let compression =
            compression_from_names(&manifest.compression, &manifest.content_type, key);
        let charset = encoding_rs::Encoding::for_label(manifest.charset.trim().as_bytes())
            .unwrap_or(encoding_rs::UTF_8);
        Self {
            compression,
            charset,
        }
    }
}

fn compression_from_names(compression: &str, content_type: &str, key: &str) -> Compression {
    let ce = compression.to_ascii_lowercase();
    let ct = content_type.to_ascii_lowercase();

    let is_gzip = ce.split(',').any(|s| s.trim() == "gzip")
        || matches!(ct.as_str(), "application/gzip" | "application/x-gzip")
        || key.ends_with(".gz");
    let is_zstd = ce.split(',').any(|s| s.trim() == "zstd")
        || ct == "application/zstd"
        || key.ends_with(".zst");

    if is_gzip {
        Compression::Gzip
    } else if is_zstd {
        Compression::Zstd
    } else {
        Compression::None
    }
}

/// Wrap a raw report stream with decompression and UTF-8 transcoding.
/// The result is ready to hand to `csv_async`.
pub fn build_report_reader<R>(
    raw: R,
    encoding: &ReportEncoding,
) -> Box<dyn AsyncRead + Unpin + Send>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buf = BufReader::with_capacity(1 << 20, raw);
    let decompressed: Box<dyn AsyncRead + Unpin + Send> = match encoding.compression {
        Compression::Gzip => Box::new(GzipDecoder::new(buf)),
        Compression::Zstd => Box::new(ZstdDecoder::new(buf)),
        Compression::None => Box::new(buf),
    };

    if encoding.charset == encoding_rs::UTF_8 {
        decompressed
    } else {
        let framed = FramedRead::new(decompressed, Utf8Transcoder::new(encoding.charset));
        Box::new(StreamReader::new(framed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_prefers_manifest_field() {
        assert_eq!(compression_from_names("GZIP", "", "a.csv"), Compression::Gzip);
        assert_eq!(compression_from_names("", "application/zstd", "a.csv"), Compression::Zstd);
        assert_eq!(compression_from_names("", "text/csv", "a.csv.gz"), Compression::Gzip);
        assert_eq!(compression_from_names("", "text/csv", "a.csv"), Compression::None);
    }

    #[tokio::test]
    async fn plain_utf8_passes_through() -> anyhow::Result<()> {
        use tokio::io::AsyncReadExt;

        let raw = std::io::Cursor::new(b"a,b\n1,2\n".to_vec());
        let mut reader = build_report_reader(raw, &ReportEncoding::default());
        let mut out = String::new();
        reader.read_to_string(&mut out).await?;
        assert_eq!(out, "a,b\n1,2\n");
        Ok(())
    }
}
