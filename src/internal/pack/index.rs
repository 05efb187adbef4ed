//! Read-only `.idx` version 2 lookup.
//!
//! Layout: magic `\377tOc`, version 2, a 256-entry cumulative fan-out table keyed by the first id
//! byte, sorted ids, CRC32 per entry, 31-bit offsets (msb set means "index into the 64-bit
//! table"), the 64-bit offsets, then the pack and index checksums.

use crate::{
    errors::GitError,
    hash::{HashKind, ObjectId},
};

const IDX_MAGIC: [u8; 4] = [0xff, 0x74, 0x4f, 0x63];
const FANOUT_LEN: usize = 256 * 4;

pub struct PackIndex {
    hash: HashKind,
    count: usize,
    fanout: Vec<u32>,
    names: Vec<u8>,
    offsets: Vec<u32>,
    large_offsets: Vec<u64>,
}

fn be32(data: &[u8], pos: usize) -> Result<u32, GitError> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| GitError::InvalidIdxFile("truncated index".to_string()))
}

impl PackIndex {
    pub fn parse(hash: HashKind, data: &[u8]) -> Result<PackIndex, GitError> {
        if data.len() < 8 + FANOUT_LEN || data[..4] != IDX_MAGIC {
            return Err(GitError::InvalidIdxFile("missing idx v2 header".to_string()));
        }
        let version = be32(data, 4)?;
        if version != 2 {
            return Err(GitError::InvalidIdxFile(format!(
                "unsupported idx version {version}"
            )));
        }

        let mut fanout = Vec::with_capacity(256);
        for i in 0..256 {
            fanout.push(be32(data, 8 + i * 4)?);
        }
        let count = fanout[255] as usize;

        let names_start = 8 + FANOUT_LEN;
        let names_end = names_start + count * hash.size();
        let crc_end = names_end + count * 4;
        let offsets_end = crc_end + count * 4;
        let names = data
            .get(names_start..names_end)
            .ok_or_else(|| GitError::InvalidIdxFile("truncated name table".to_string()))?
            .to_vec();

        let mut offsets = Vec::with_capacity(count);
        let mut large_count = 0;
        for i in 0..count {
            let offset = be32(data, crc_end + i * 4)?;
            if offset & 0x8000_0000 != 0 {
                large_count += 1;
            }
            offsets.push(offset);
        }

        let mut large_offsets = Vec::with_capacity(large_count);
        for i in 0..large_count {
            let pos = offsets_end + i * 8;
            let hi = be32(data, pos)? as u64;
            let lo = be32(data, pos + 4)? as u64;
            large_offsets.push((hi << 32) | lo);
        }

        Ok(PackIndex {
            hash,
            count,
            fanout,
            names,
            offsets,
            large_offsets,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn name(&self, i: usize) -> &[u8] {
        let size = self.hash.size();
        &self.names[i * size..(i + 1) * size]
    }

    /// Pack offset of `id`, if this index lists it.
    pub fn find(&self, id: &ObjectId) -> Option<u64> {
        let key = id.as_ref();
        if key.len() != self.hash.size() {
            return None;
        }
        let first = key[0] as usize;
        let mut lo = if first == 0 {
            0
        } else {
            self.fanout[first - 1] as usize
        };
        let mut hi = self.fanout[first] as usize;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.name(mid).cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return self.offset(mid),
            }
        }
        None
    }

    fn offset(&self, i: usize) -> Option<u64> {
        let raw = self.offsets[i];
        if raw & 0x8000_0000 == 0 {
            Some(raw as u64)
        } else {
            self.large_offsets
                .get((raw & 0x7fff_ffff) as usize)
                .copied()
        }
    }

    /// Every id in the index, in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        (0..self.count).filter_map(|i| ObjectId::from_bytes(self.hash, self.name(i)).ok())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::PackIndex;
    use crate::hash::{HashKind, ObjectId};

    /// Build a v2 index for `(id, offset)` pairs. Checksums are zero-filled.
    pub(crate) fn build_idx(hash: HashKind, entries: &[(ObjectId, u64)]) -> Vec<u8> {
        let mut entries = entries.to_vec();
        entries.sort();
        let mut out = vec![0xff, 0x74, 0x4f, 0x63, 0, 0, 0, 2];
        let mut fanout = [0u32; 256];
        for (id, _) in &entries {
            fanout[id.as_ref()[0] as usize] += 1;
        }
        for i in 1..256 {
            fanout[i] += fanout[i - 1];
        }
        for count in fanout {
            out.extend(count.to_be_bytes());
        }
        for (id, _) in &entries {
            out.extend(id.to_data());
        }
        for _ in &entries {
            out.extend(0u32.to_be_bytes());
        }
        let mut large = Vec::new();
        for (_, offset) in &entries {
            if *offset >= 0x8000_0000 {
                out.extend((0x8000_0000u32 | large.len() as u32).to_be_bytes());
                large.push(*offset);
            } else {
                out.extend((*offset as u32).to_be_bytes());
            }
        }
        for offset in large {
            out.extend(offset.to_be_bytes());
        }
        out.extend(vec![0u8; hash.size() * 2]);
        out
    }

    #[test]
    fn finds_small_and_large_offsets() {
        let a = HashKind::Sha1.digest(b"a");
        let b = HashKind::Sha1.digest(b"b");
        let c = HashKind::Sha1.digest(b"c");
        let idx = build_idx(HashKind::Sha1, &[(a, 12), (b, 0x1_0000_0000), (c, 99)]);
        let index = PackIndex::parse(HashKind::Sha1, &idx).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.find(&a), Some(12));
        assert_eq!(index.find(&b), Some(0x1_0000_0000));
        assert_eq!(index.find(&c), Some(99));
        assert_eq!(index.find(&HashKind::Sha1.digest(b"d")), None);
        assert_eq!(index.ids().count(), 3);
    }

    #[test]
    fn rejects_other_versions() {
        let mut idx = build_idx(HashKind::Sha1, &[]);
        idx[7] = 3;
        assert!(PackIndex::parse(HashKind::Sha1, &idx).is_err());
    }
}
