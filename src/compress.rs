//! Compression adapter for the nested package payloads.

use std::fmt;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use xz2::read::XzDecoder;
use xz2::stream::{Check, Filters, LzmaOptions, MtStreamBuilder};
use xz2::write::XzEncoder;

use crate::error::{Error, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const XZ_MAGIC: [u8; 6] = [0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];

const XZ_PRESET: u32 = 6;
const XZ_DICT_SIZE: u32 = 16 << 20;
const XZ_BLOCK_SIZE: u64 = 25_165_824;

/// Payload compression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    #[default]
    Xz,
}

impl Compression {
    /// Sniffs the compression from leading bytes. Anything unrecognised is
    /// treated as an uncompressed tar.
    pub fn from_magic(bytes: &[u8]) -> Self {
        if bytes.starts_with(&GZIP_MAGIC) {
            Compression::Gzip
        } else if bytes.starts_with(&XZ_MAGIC) {
            Compression::Xz
        } else {
            Compression::None
        }
    }

    /// Infers the compression from an `ar` member name such as `data.tar.xz`.
    pub fn from_member_name(name: &str) -> Option<Self> {
        if name.ends_with(".tar.xz") {
            Some(Compression::Xz)
        } else if name.ends_with(".tar.gz") {
            Some(Compression::Gzip)
        } else if name.ends_with(".tar") {
            Some(Compression::None)
        } else {
            None
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Xz => ".xz",
        }
    }

    /// `control` becomes `control.tar.xz` and so on.
    pub fn member_name(self, stem: &str) -> String {
        format!("{}.tar{}", stem, self.extension())
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Xz => "xz",
        })
    }
}

/// Decompresses `data`, sniffing its format.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let compression = Compression::from_magic(data);
    tracing::debug!("Decompressing {} byte(s) of {} payload", data.len(), compression);
    let mut out = Vec::new();
    match compression {
        Compression::None => out.extend_from_slice(data),
        Compression::Gzip => {
            GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(Error::Compression)?;
        }
        Compression::Xz => {
            XzDecoder::new_multi_decoder(data)
                .read_to_end(&mut out)
                .map_err(Error::Compression)?;
        }
    }
    Ok(out)
}

/// Compresses `data` with `compression`.
pub fn compress(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    let out = match compression {
        Compression::None => data.to_vec(),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).map_err(Error::Compression)?;
            encoder.finish().map_err(Error::Compression)?
        }
        Compression::Xz => {
            let mut encoder = XzEncoder::new_stream(Vec::new(), xz_stream()?);
            encoder.write_all(data).map_err(Error::Compression)?;
            encoder.finish().map_err(Error::Compression)?
        }
    };
    tracing::debug!(
        "Compressed {} byte(s) to {} byte(s) ({})",
        data.len(),
        out.len(),
        compression
    );
    Ok(out)
}

/// LZMA2 with a 16 MiB dictionary, 24 MiB blocks and a CRC64 check.
fn xz_stream() -> Result<xz2::stream::Stream> {
    let to_io = |e: xz2::stream::Error| Error::Compression(e.into());
    let mut options = LzmaOptions::new_preset(XZ_PRESET).map_err(to_io)?;
    options.dict_size(XZ_DICT_SIZE);
    let mut filters = Filters::new();
    filters.lzma2(&options);
    MtStreamBuilder::new()
        .threads(1)
        .block_size(XZ_BLOCK_SIZE)
        .filters(filters)
        .check(Check::Crc64)
        .encoder()
        .map_err(to_io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_magic() {
        assert_eq!(Compression::from_magic(&[0x1f, 0x8b, 8, 0]), Compression::Gzip);
        assert_eq!(Compression::from_magic(&XZ_MAGIC), Compression::Xz);
        assert_eq!(Compression::from_magic(b"./\0\0"), Compression::None);
        assert_eq!(Compression::from_magic(&[]), Compression::None);
    }

    #[test]
    fn test_member_names() {
        assert_eq!(Compression::from_member_name("data.tar.xz"), Some(Compression::Xz));
        assert_eq!(Compression::from_member_name("control.tar.gz"), Some(Compression::Gzip));
        assert_eq!(Compression::from_member_name("data.tar"), Some(Compression::None));
        assert_eq!(Compression::from_member_name("data.tar.zst"), None);
        assert_eq!(Compression::Xz.member_name("control"), "control.tar.xz");
        assert_eq!(Compression::None.member_name("data"), "data.tar");
    }

    #[test]
    fn test_xz_output_is_sniffable_and_decodes() {
        let data = b"usr/sbin/frida-server\n".repeat(64);
        let packed = compress(&data, Compression::Xz).unwrap();
        assert_eq!(Compression::from_magic(&packed), Compression::Xz);
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn test_gzip_output_decodes() {
        let data = b"Package: re.frida.server\n".to_vec();
        let packed = compress(&data, Compression::Gzip).unwrap();
        assert_eq!(Compression::from_magic(&packed), Compression::Gzip);
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn test_corrupt_xz_is_a_compression_error() {
        let mut bad = XZ_MAGIC.to_vec();
        bad.extend_from_slice(&[0xff; 32]);
        assert!(matches!(decompress(&bad), Err(Error::Compression(_))));
    }
}
