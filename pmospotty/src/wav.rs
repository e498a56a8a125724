//! Synthèse de l'en-tête WAV.
//!
//! Le décodeur produit du PCM brut (44100 Hz, stéréo, 16 bits little-endian).
//! Pour que le lecteur puisse faire des requêtes Range, la taille totale du
//! fichier doit être connue avant tout décodage : elle est déduite de la
//! durée annoncée par l'appelant.

use bytes::{BufMut, Bytes, BytesMut};

pub const SAMPLE_RATE: u32 = 44_100;
pub const CHANNELS: u16 = 2;
pub const BITS_PER_SAMPLE: u16 = 16;
pub const BLOCK_ALIGN: u16 = CHANNELS * BITS_PER_SAMPLE / 8;

/// Octets de PCM par seconde d'audio
pub const BYTES_PER_SECOND: u64 = SAMPLE_RATE as u64 * BLOCK_ALIGN as u64;

/// Taille de l'en-tête RIFF/WAVE canonique
pub const WAV_HEADER_LEN: usize = 44;

const MAX_DATA_LEN: u64 = u32::MAX as u64 - 36;

/// Taille du PCM pour une durée donnée : `round(duration × 176400)`.
///
/// Les durées nulles, négatives ou non finies donnent 0.
pub fn pcm_len_for_duration(duration: f64) -> u64 {
    if !duration.is_finite() || duration <= 0.0 {
        return 0;
    }
    let len = (duration * BYTES_PER_SECOND as f64).round();
    if len >= MAX_DATA_LEN as f64 {
        MAX_DATA_LEN
    } else {
        len as u64
    }
}

/// En-tête WAV immuable pour une durée donnée
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavHeader {
    bytes: Bytes,
    data_len: u64,
}

impl WavHeader {
    pub fn for_duration(duration: f64) -> Self {
        Self::for_data_len(pcm_len_for_duration(duration))
    }

    pub fn for_data_len(data_len: u64) -> Self {
        let data_len = data_len.min(MAX_DATA_LEN);
        let mut buf = BytesMut::with_capacity(WAV_HEADER_LEN);

        buf.put_slice(b"RIFF");
        buf.put_u32_le((36 + data_len) as u32);
        buf.put_slice(b"WAVE");

        buf.put_slice(b"fmt ");
        buf.put_u32_le(16);
        buf.put_u16_le(1); // PCM
        buf.put_u16_le(CHANNELS);
        buf.put_u32_le(SAMPLE_RATE);
        buf.put_u32_le(BYTES_PER_SECOND as u32);
        buf.put_u16_le(BLOCK_ALIGN);
        buf.put_u16_le(BITS_PER_SAMPLE);

        buf.put_slice(b"data");
        buf.put_u32_le(data_len as u32);

        debug_assert_eq!(buf.len(), WAV_HEADER_LEN);

        Self {
            bytes: buf.freeze(),
            data_len,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    /// Taille totale du fichier servi (en-tête + PCM)
    pub fn total_len(&self) -> u64 {
        WAV_HEADER_LEN as u64 + self.data_len
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_at(b: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
    }

    fn u16_at(b: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([b[at], b[at + 1]])
    }

    #[test]
    fn test_header_layout() {
        let header = WavHeader::for_duration(178.795);
        let b = header.as_bytes();

        assert_eq!(header.len(), 44);
        assert_eq!(&b[0..4], b"RIFF");
        assert_eq!(&b[8..12], b"WAVE");
        assert_eq!(&b[12..16], b"fmt ");
        assert_eq!(u32_at(b, 16), 16);
        assert_eq!(u16_at(b, 20), 1);
        assert_eq!(u16_at(b, 22), 2);
        assert_eq!(u32_at(b, 24), 44_100);
        assert_eq!(u32_at(b, 28), 176_400);
        assert_eq!(u16_at(b, 32), 4);
        assert_eq!(u16_at(b, 34), 16);
        assert_eq!(&b[36..40], b"data");

        assert_eq!(u32_at(b, 40) as u64, header.data_len());
        assert_eq!(u32_at(b, 4) as u64, 36 + header.data_len());
    }

    #[test]
    fn test_total_len_matches_duration() {
        let header = WavHeader::for_duration(178.795);
        // 178.795 × 176400 = 31539438
        assert_eq!(header.data_len(), 31_539_438);
        assert_eq!(header.total_len(), 44 + 31_539_438);
    }

    #[test]
    fn test_degenerate_durations() {
        assert_eq!(pcm_len_for_duration(0.0), 0);
        assert_eq!(pcm_len_for_duration(-3.0), 0);
        assert_eq!(pcm_len_for_duration(f64::NAN), 0);
        assert_eq!(WavHeader::for_duration(f64::INFINITY).total_len(), 44);
        assert_eq!(pcm_len_for_duration(1e12), u32::MAX as u64 - 36);
    }
}
