use std::io::{self, Read, Write};
use std::str::FromStr;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// Compression applied to objects before they are written to storage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Codec {
    #[default]
    None,
    Gzip,
    Zstd,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseCodecError(pub String);

impl FromStr for Codec {
    type Err = ParseCodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "none" | "uncompressed" => Ok(Codec::None),
            "gzip" => Ok(Codec::Gzip),
            "zstd" => Ok(Codec::Zstd),
            invalid => Err(ParseCodecError(invalid.to_owned())),
        }
    }
}

impl Codec {
    pub fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Codec::None => Ok(data.to_vec()),
            Codec::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
            Codec::Zstd => zstd::encode_all(data, 0),
        }
    }

    pub fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Codec::None => Ok(data.to_vec()),
            Codec::Gzip => {
                let mut decoded = Vec::new();
                GzDecoder::new(data).read_to_end(&mut decoded)?;
                Ok(decoded)
            }
            Codec::Zstd => zstd::decode_all(data),
        }
    }

    /// Suffix appended to object keys written with this codec.
    pub fn extension(&self) -> &'static str {
        match self {
            Codec::None => "",
            Codec::Gzip => ".gz",
            Codec::Zstd => ".zst",
        }
    }

    /// Value for the Content-Encoding metadata of stored objects.
    pub fn content_encoding(&self) -> Option<&'static str> {
        match self {
            Codec::None => None,
            Codec::Gzip => Some("gzip"),
            Codec::Zstd => Some("zstd"),
        }
    }
}
