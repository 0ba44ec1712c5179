//! Payload codecs
//!
//! Dispatches on [`Compression`]; the tag persisted next to each blob decides
//! how it is decoded, so blobs written with different codecs coexist.

use blobnode_common::{Compression, Error, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};

/// Zstandard level used for tag 2 (0 selects the library default)
const ZSTD_LEVEL: i32 = 0;

/// Encode `data` with `codec`
pub fn compress(codec: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Compression::None => Ok(data.to_vec()),
        Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        Compression::Zstd => zstd::encode_all(data, ZSTD_LEVEL).map_err(Error::from),
        Compression::Zlib(level) => {
            let level = flate2::Compression::new(u32::from(level.clamp(1, 9)));
            let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), level);
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
    }
}

/// Decode bytes produced by [`compress`] with the same codec
pub fn decompress(codec: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Compression::None => Ok(data.to_vec()),
        Compression::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| Error::corruption(format!("lz4 payload: {e}"))),
        Compression::Zstd => zstd::decode_all(data)
            .map_err(|e| Error::corruption(format!("zstd payload: {e}"))),
        Compression::Zlib(_) => {
            let mut out = Vec::with_capacity(data.len() * 2);
            ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| Error::corruption(format!("zlib payload: {e}")))?;
            Ok(out)
        }
    }
}

/// Resolve a caller or persisted tag, rejecting unknown values
pub fn codec_for_tag(tag: i32) -> Result<Compression> {
    Compression::from_tag(tag)
        .ok_or_else(|| Error::invalid_parameters(format!("unknown compression tag {tag}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn all_codecs() -> Vec<Compression> {
        (0..=11).map(|tag| Compression::from_tag(tag).unwrap()).collect()
    }

    #[test]
    fn test_round_trip_all_tags() {
        let mut rng = StdRng::seed_from_u64(7);
        let random: Vec<u8> = (0..4096).map(|_| rng.r#gen()).collect();
        let text = b"the quick brown fox jumps over the lazy dog ".repeat(200);
        for codec in all_codecs() {
            for input in [&[][..], b"x", random.as_slice(), text.as_slice()] {
                let encoded = compress(codec, input).unwrap();
                assert_eq!(decompress(codec, &encoded).unwrap(), input, "{codec:?}");
            }
        }
    }

    #[test]
    fn test_round_trip_large_payload() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut large = vec![0u8; 3 * 1024 * 1024 + 17];
        // half random, half repetitive
        rng.fill(&mut large[..1024 * 1024]);
        for codec in all_codecs() {
            let encoded = compress(codec, &large).unwrap();
            assert_eq!(decompress(codec, &encoded).unwrap(), large, "{codec:?}");
        }
    }

    #[test]
    fn test_compressible_input_shrinks() {
        let text = vec![b'a'; 64 * 1024];
        for codec in [Compression::Lz4, Compression::Zstd, Compression::Zlib(6)] {
            assert!(compress(codec, &text).unwrap().len() < text.len() / 10);
        }
    }

    #[test]
    fn test_garbage_is_corruption() {
        let err = decompress(Compression::Zstd, b"definitely not zstd").unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
        assert!(decompress(Compression::Lz4, &[0xff, 0xff, 0xff, 0x7f, 1]).is_err());
    }

    #[test]
    fn test_unknown_tag() {
        assert!(codec_for_tag(12).is_err());
        assert_eq!(codec_for_tag(2).unwrap(), Compression::Zstd);
    }
}
