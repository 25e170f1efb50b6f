//! Forward error correction.
//!
//! The writer interleaves repair packets into the outgoing stream; the
//! reader reassembles blocks on the receiving side and reconstructs lost
//! source packets. The protected unit is a source packet's full wire image
//! (RTP header plus payload), so a reconstructed packet parses like a
//! received one.

mod codec;
mod reader;
mod writer;

pub use codec::{new_decoder, new_encoder, BlockDecoder, BlockEncoder};
pub use reader::{FecReader, ReaderConfig};
pub use writer::{FecWriter, WriterConfig};
