//! Block codec registry.
//!
//! Maps a FEC scheme to encoder/decoder factories. The pipeline only sees
//! the `BlockEncoder`/`BlockDecoder` traits; the Reed-Solomon scheme is
//! backed by `reed-solomon-erasure`. LDPC-Staircase is declared on the wire
//! but has no in-tree codec, so its factories report the scheme as
//! unavailable and construction fails upstream.

use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::{debug, error};

use crate::packet::FecScheme;

/// Computes repair payloads over a block of source payloads.
pub trait BlockEncoder: Send {
    /// Encodes one block. All source payloads must have equal length;
    /// returns one repair payload of the same length per repair slot, or
    /// `None` if the block cannot be encoded.
    fn encode(&mut self, source: &[&[u8]]) -> Option<Vec<Vec<u8>>>;
}

/// Reconstructs missing source payloads of a block.
pub trait BlockDecoder: Send {
    /// Attempts reconstruction in place. `shards` holds source payloads
    /// first, then repair payloads, with `None` marking missing ones.
    /// Returns whether the missing source shards were filled in.
    fn decode(&mut self, shards: &mut [Option<Vec<u8>>]) -> bool;
}

struct Rs8mEncoder {
    codec: ReedSolomon,
    n_repair: usize,
}

impl BlockEncoder for Rs8mEncoder {
    fn encode(&mut self, source: &[&[u8]]) -> Option<Vec<Vec<u8>>> {
        // ---
        let payload_size = match source.first() {
            Some(first) => first.len(),
            None => return None,
        };

        let mut shards: Vec<Vec<u8>> = source.iter().map(|s| s.to_vec()).collect();
        shards.extend(std::iter::repeat_with(|| vec![0u8; payload_size]).take(self.n_repair));

        if let Err(err) = self.codec.encode(&mut shards) {
            error!("fec codec: encoding failed: {}", err);
            return None;
        }

        Some(shards.split_off(source.len()))
    }
}

struct Rs8mDecoder {
    codec: ReedSolomon,
}

impl BlockDecoder for Rs8mDecoder {
    fn decode(&mut self, shards: &mut [Option<Vec<u8>>]) -> bool {
        // ---
        match self.codec.reconstruct(shards) {
            Ok(()) => true,
            Err(err) => {
                debug!("fec codec: reconstruction failed: {}", err);
                false
            }
        }
    }
}

fn new_rs8m(n_source: usize, n_repair: usize) -> Option<ReedSolomon> {
    // ---
    match ReedSolomon::new(n_source, n_repair) {
        Ok(codec) => Some(codec),
        Err(err) => {
            error!(
                "fec codec: invalid block layout: n_source={} n_repair={}: {}",
                n_source, n_repair, err
            );
            None
        }
    }
}

/// Creates an encoder for the scheme, or `None` if the scheme has no codec
/// or the block layout is invalid.
pub fn new_encoder(
    scheme: FecScheme,
    n_source: usize,
    n_repair: usize,
) -> Option<Box<dyn BlockEncoder>> {
    // ---
    match scheme {
        FecScheme::ReedSolomonM8 => Some(Box::new(Rs8mEncoder {
            codec: new_rs8m(n_source, n_repair)?,
            n_repair,
        })),
        FecScheme::LdpcStaircase => {
            error!("fec codec: no codec built in for ldpc-staircase");
            None
        }
        FecScheme::Disable => None,
    }
}

/// Creates a decoder for the scheme, or `None` if the scheme has no codec
/// or the block layout is invalid.
pub fn new_decoder(
    scheme: FecScheme,
    n_source: usize,
    n_repair: usize,
) -> Option<Box<dyn BlockDecoder>> {
    // ---
    match scheme {
        FecScheme::ReedSolomonM8 => Some(Box::new(Rs8mDecoder {
            codec: new_rs8m(n_source, n_repair)?,
        })),
        FecScheme::LdpcStaircase => {
            error!("fec codec: no codec built in for ldpc-staircase");
            None
        }
        FecScheme::Disable => None,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_recovers_up_to_m_losses() {
        // ---
        let mut encoder = new_encoder(FecScheme::ReedSolomonM8, 4, 2).unwrap();
        let mut decoder = new_decoder(FecScheme::ReedSolomonM8, 4, 2).unwrap();

        let source: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 8]).collect();
        let refs: Vec<&[u8]> = source.iter().map(|s| s.as_slice()).collect();
        let repair = encoder.encode(&refs).expect("encoding failed");
        assert_eq!(repair.len(), 2);
        assert_eq!(repair[0].len(), 8);

        // Lose two source shards
        let mut shards: Vec<Option<Vec<u8>>> = source.iter().cloned().map(Some).collect();
        shards.extend(repair.into_iter().map(Some));
        shards[1] = None;
        shards[3] = None;

        assert!(decoder.decode(&mut shards));
        assert_eq!(shards[1].as_ref().unwrap(), &vec![1u8; 8]);
        assert_eq!(shards[3].as_ref().unwrap(), &vec![3u8; 8]);
    }

    #[test]
    fn test_too_many_losses() {
        // ---
        let mut encoder = new_encoder(FecScheme::ReedSolomonM8, 4, 2).unwrap();
        let mut decoder = new_decoder(FecScheme::ReedSolomonM8, 4, 2).unwrap();

        let source: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 8]).collect();
        let refs: Vec<&[u8]> = source.iter().map(|s| s.as_slice()).collect();
        let repair = encoder.encode(&refs).unwrap();

        let mut shards: Vec<Option<Vec<u8>>> = source.iter().cloned().map(Some).collect();
        shards.extend(repair.into_iter().map(Some));
        shards[0] = None;
        shards[1] = None;
        shards[2] = None;

        assert!(!decoder.decode(&mut shards));
    }

    #[test]
    fn test_ldpc_has_no_codec() {
        // ---
        assert!(new_encoder(FecScheme::LdpcStaircase, 4, 2).is_none());
        assert!(new_decoder(FecScheme::LdpcStaircase, 4, 2).is_none());
    }
}
