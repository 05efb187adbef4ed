//! Pack file encoder/decoder following the
//! [pack-format spec](https://git-scm.com/docs/pack-format).
//!
//! Layout: `PACK`, a 4-byte version (2 or 3), a 4-byte object count, the entries, and a trailing
//! checksum of everything before it in the repository's hash format. Each entry is a
//! variable-length type/size header followed by a zlib stream; delta entries carry either a
//! negative offset to their base (`ofs-delta`) or the base's id (`ref-delta`) between the two.

pub mod decode;
pub mod delta;
pub mod encode;
pub mod index;
pub mod stream;

pub const PACK_SIGNATURE: &[u8; 4] = b"PACK";
pub const PACK_VERSION: u32 = 2;
pub const PACK_HEADER_LEN: usize = 12;

pub const OFS_DELTA: u8 = 6;
pub const REF_DELTA: u8 = 7;

/// Deflate never expands data by more than about this factor.
pub const MAX_INFLATE_RATIO: usize = 1032;

/// Sizes read from pack and delta headers are untrusted: buffers start at most this large
/// and grow with the data actually produced.
pub(crate) const MAX_PREALLOC: usize = 1 << 20;
