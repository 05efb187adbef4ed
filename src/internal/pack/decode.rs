//! Pack reader.
//!
//! [`PackDecoder::decode`] parses an in-memory pack, verifies the trailer and resolves every
//! delta whose base is inside the pack. Ref-deltas against objects the pack does not carry
//! (thin packs) stay pending until [`DecodedPack::resolve_external`] is fed those bases from the
//! repository. The entry-level helpers are also used by the filesystem store for random access
//! into on-disk packs.

use std::collections::{HashMap, VecDeque};
use std::io::Read;

use flate2::bufread::ZlibDecoder;

use super::{
    MAX_INFLATE_RATIO, MAX_PREALLOC, OFS_DELTA, PACK_HEADER_LEN, PACK_SIGNATURE, REF_DELTA,
    delta::{apply_delta, result_size},
};
use crate::{
    errors::GitError,
    hash::{HashKind, Hasher, ObjectId},
    internal::object::{ObjectKind, RawObject},
};

/// How an entry's payload is to be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Base(ObjectKind),
    /// Base lives at this absolute offset in the same pack.
    OfsDelta(usize),
    RefDelta(ObjectId),
}

/// Entry header plus the offset at which its zlib stream begins.
#[derive(Debug, Clone)]
pub struct EntryHeader {
    pub kind: EntryKind,
    pub size: usize,
    pub data_offset: usize,
}

fn byte_at(data: &[u8], pos: usize) -> Result<u8, GitError> {
    data.get(pos)
        .copied()
        .ok_or_else(|| GitError::InvalidPackFile("truncated entry header".to_string()))
}

/// Parse the entry header at `offset`.
pub fn read_entry_header(
    hash: HashKind,
    data: &[u8],
    offset: usize,
) -> Result<EntryHeader, GitError> {
    let mut pos = offset;
    let mut byte = byte_at(data, pos)?;
    pos += 1;
    let type_id = (byte >> 4) & 0x07;
    let mut size = (byte & 0x0f) as usize;
    let mut shift = 4;
    while byte & 0x80 != 0 {
        byte = byte_at(data, pos)?;
        pos += 1;
        if shift > usize::BITS - 7 {
            return Err(GitError::InvalidPackFile("entry size overflow".to_string()));
        }
        size |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
    }

    let kind = match type_id {
        OFS_DELTA => {
            byte = byte_at(data, pos)?;
            pos += 1;
            let mut distance = (byte & 0x7f) as usize;
            while byte & 0x80 != 0 {
                byte = byte_at(data, pos)?;
                pos += 1;
                distance = distance
                    .checked_add(1)
                    .and_then(|d| d.checked_mul(128))
                    .ok_or_else(|| GitError::InvalidPackFile("ofs-delta overflow".to_string()))?
                    | (byte & 0x7f) as usize;
            }
            let base = offset.checked_sub(distance).filter(|_| distance > 0).ok_or_else(|| {
                GitError::InvalidPackFile(format!("ofs-delta at {offset} points before pack"))
            })?;
            EntryKind::OfsDelta(base)
        }
        REF_DELTA => {
            let end = pos + hash.size();
            let raw = data
                .get(pos..end)
                .ok_or_else(|| GitError::InvalidPackFile("truncated ref-delta base".to_string()))?;
            pos = end;
            EntryKind::RefDelta(ObjectId::from_bytes(hash, raw).map_err(GitError::InvalidPackFile)?)
        }
        other => EntryKind::Base(ObjectKind::from_pack_type_u8(other)?),
    };

    Ok(EntryHeader {
        kind,
        size,
        data_offset: pos,
    })
}

/// Inflate one zlib stream starting at `offset`, returning the payload and compressed length.
pub fn inflate_at(data: &[u8], offset: usize, size: usize) -> Result<(Vec<u8>, usize), GitError> {
    let input = data
        .get(offset..)
        .ok_or_else(|| GitError::InvalidPackFile("entry data past end of pack".to_string()))?;
    if size > input.len().saturating_mul(MAX_INFLATE_RATIO) {
        return Err(GitError::InvalidPackFile(format!(
            "entry at {offset} declares {size} bytes, more than its data can inflate to"
        )));
    }
    let mut decoder = ZlibDecoder::new(input);
    let mut out = Vec::with_capacity(size.min(MAX_PREALLOC));
    (&mut decoder)
        .take((size as u64).saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| GitError::InvalidPackFile(format!("corrupt zlib stream: {e}")))?;
    if out.len() != size {
        return Err(GitError::InvalidPackFile(format!(
            "entry inflated to {} bytes, header says {}",
            out.len(),
            size
        )));
    }
    Ok((out, decoder.total_in() as usize))
}

/// Check `PACK`, version and trailer. Returns the declared object count.
pub fn verify_pack(hash: HashKind, data: &[u8]) -> Result<u32, GitError> {
    if data.len() < PACK_HEADER_LEN + hash.size() {
        return Err(GitError::InvalidPackHeader(format!(
            "pack of {} bytes is too short",
            data.len()
        )));
    }
    if &data[..4] != PACK_SIGNATURE {
        return Err(GitError::InvalidPackHeader("missing PACK signature".to_string()));
    }
    let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if version != 2 && version != 3 {
        return Err(GitError::InvalidPackHeader(format!(
            "unsupported pack version {version}"
        )));
    }
    let count = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

    let body_end = data.len() - hash.size();
    let mut hasher = Hasher::new(hash);
    hasher.update(&data[..body_end]);
    if hasher.finalize().as_ref() != &data[body_end..] {
        return Err(GitError::InvalidPackFile("pack checksum mismatch".to_string()));
    }
    Ok(count)
}

struct Parsed {
    offset: usize,
    kind: EntryKind,
    data: Vec<u8>,
}

/// Result of decoding a pack, possibly with deltas waiting for external bases.
pub struct DecodedPack {
    hash: HashKind,
    max_object_size: usize,
    objects: Vec<RawObject>,
    /// Deltas by the id of their base, and deltas by base offset, both still unresolved.
    waiting_by_id: HashMap<ObjectId, Vec<Parsed>>,
    waiting_by_offset: HashMap<usize, Vec<Parsed>>,
}

impl DecodedPack {
    /// Bases referenced by ref-deltas but not present in the pack.
    pub fn missing_bases(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.waiting_by_id.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Supply a base object from the repository and resolve whatever depends on it.
    /// The base itself is not added to the decoded objects.
    pub fn resolve_external(&mut self, base: &RawObject) -> Result<(), GitError> {
        let Some(children) = self.waiting_by_id.remove(&base.id) else {
            return Ok(());
        };
        let mut queue = VecDeque::new();
        for child in children {
            queue.push_back((child, base.kind, base.data.clone()));
        }
        self.drain(queue)
    }

    /// Objects decoded so far; errors if any delta is still missing its base.
    pub fn finish(self) -> Result<Vec<RawObject>, GitError> {
        if let Some(id) = self.waiting_by_id.keys().next() {
            return Err(GitError::InvalidPackFile(format!(
                "delta base {id} is not available"
            )));
        }
        if !self.waiting_by_offset.is_empty() {
            return Err(GitError::InvalidPackFile(
                "ofs-delta chain with unresolved base".to_string(),
            ));
        }
        Ok(self.objects)
    }

    fn drain(
        &mut self,
        mut queue: VecDeque<(Parsed, ObjectKind, Vec<u8>)>,
    ) -> Result<(), GitError> {
        while let Some((entry, kind, base)) = queue.pop_front() {
            let size = result_size(&entry.data)?;
            if size > self.max_object_size {
                return Err(GitError::InvalidPackFile(format!(
                    "delta at {} builds a {size}-byte object, over the {}-byte limit",
                    entry.offset, self.max_object_size
                )));
            }
            let data = apply_delta(&base, &entry.data)?;
            self.accept(entry.offset, kind, data, &mut queue);
        }
        Ok(())
    }

    /// Record a resolved object and enqueue every delta built on top of it.
    fn accept(
        &mut self,
        offset: usize,
        kind: ObjectKind,
        data: Vec<u8>,
        queue: &mut VecDeque<(Parsed, ObjectKind, Vec<u8>)>,
    ) {
        let object = RawObject::new(self.hash, kind, data);
        let dependents = self
            .waiting_by_offset
            .remove(&offset)
            .into_iter()
            .flatten()
            .chain(self.waiting_by_id.remove(&object.id).into_iter().flatten());
        for child in dependents {
            queue.push_back((child, kind, object.data.clone()));
        }
        self.objects.push(object);
    }
}

pub struct PackDecoder {
    hash: HashKind,
    max_object_size: usize,
}

impl PackDecoder {
    pub fn new(hash: HashKind) -> Self {
        Self {
            hash,
            max_object_size: usize::MAX,
        }
    }

    /// Reject entries and delta results larger than `limit` bytes.
    pub fn with_max_object_size(mut self, limit: usize) -> Self {
        self.max_object_size = limit;
        self
    }

    pub fn decode(&self, data: &[u8]) -> Result<DecodedPack, GitError> {
        let count = verify_pack(self.hash, data)?;
        let body_end = data.len() - self.hash.size();

        let mut entries = Vec::new();
        let mut offset = PACK_HEADER_LEN;
        for _ in 0..count {
            if offset >= body_end {
                return Err(GitError::InvalidPackFile(format!(
                    "pack declares {count} objects but ends early"
                )));
            }
            let header = read_entry_header(self.hash, data, offset)?;
            if header.size > self.max_object_size {
                return Err(GitError::InvalidPackFile(format!(
                    "entry at {offset} declares {} bytes, over the {}-byte limit",
                    header.size, self.max_object_size
                )));
            }
            let (payload, consumed) = inflate_at(&data[..body_end], header.data_offset, header.size)?;
            entries.push(Parsed {
                offset,
                kind: header.kind,
                data: payload,
            });
            offset = header.data_offset + consumed;
        }
        if offset != body_end {
            return Err(GitError::InvalidPackFile(format!(
                "{} trailing bytes after last entry",
                body_end - offset
            )));
        }

        let mut pack = DecodedPack {
            hash: self.hash,
            max_object_size: self.max_object_size,
            objects: Vec::with_capacity(entries.len()),
            waiting_by_id: HashMap::new(),
            waiting_by_offset: HashMap::new(),
        };
        let mut bases = Vec::new();
        for entry in entries {
            match entry.kind.clone() {
                EntryKind::Base(kind) => bases.push((entry.offset, kind, entry.data)),
                EntryKind::OfsDelta(base) => {
                    pack.waiting_by_offset.entry(base).or_default().push(entry)
                }
                EntryKind::RefDelta(id) => pack.waiting_by_id.entry(id).or_default().push(entry),
            }
        }

        let mut queue = VecDeque::new();
        for (offset, kind, data) in bases {
            pack.accept(offset, kind, data, &mut queue);
        }
        pack.drain(queue)?;
        tracing::debug!(
            objects = pack.objects.len(),
            missing = pack.waiting_by_id.len(),
            "decoded pack"
        );
        Ok(pack)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::{Compression, write::ZlibEncoder};

    use super::{EntryKind, PackDecoder, read_entry_header};
    use crate::{
        errors::GitError,
        hash::{HashKind, Hasher},
        internal::{
            object::{ObjectKind, RawObject},
            pack::{
                delta::tests::sample_delta,
                encode::{encode_entry_header, encode_pack},
            },
        },
    };

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn seal(hash: HashKind, mut body: Vec<u8>) -> Vec<u8> {
        let mut hasher = Hasher::new(hash);
        hasher.update(&body);
        body.extend(hasher.finalize().to_data());
        body
    }

    #[test]
    fn decodes_whole_objects() {
        let objects = vec![
            RawObject::new(HashKind::Sha1, ObjectKind::Blob, b"hello".to_vec()),
            RawObject::new(HashKind::Sha1, ObjectKind::Blob, vec![7u8; 5000]),
        ];
        let pack = encode_pack(HashKind::Sha1, &objects).unwrap();
        let decoded = PackDecoder::new(HashKind::Sha1)
            .decode(&pack)
            .unwrap()
            .finish()
            .unwrap();
        assert_eq!(decoded, objects);
    }

    #[test]
    fn resolves_ofs_and_ref_deltas() {
        let base = RawObject::new(HashKind::Sha1, ObjectKind::Blob, b"hello world".to_vec());
        let mut body = b"PACK\0\0\0\x02\0\0\0\x03".to_vec();

        let base_offset = body.len();
        body.extend(encode_entry_header(3, base.data.len()));
        body.extend(zlib(&base.data));

        let ofs_offset = body.len();
        let delta = sample_delta();
        body.extend(encode_entry_header(6, delta.len()));
        let distance = ofs_offset - base_offset;
        assert!(distance < 128);
        body.push(distance as u8);
        body.extend(zlib(&delta));

        body.extend(encode_entry_header(7, delta.len()));
        body.extend(base.id.to_data());
        body.extend(zlib(&delta));

        let pack = seal(HashKind::Sha1, body);
        assert_eq!(
            read_entry_header(HashKind::Sha1, &pack, ofs_offset).unwrap().kind,
            EntryKind::OfsDelta(base_offset)
        );
        let objects = PackDecoder::new(HashKind::Sha1)
            .decode(&pack)
            .unwrap()
            .finish()
            .unwrap();
        assert_eq!(objects.len(), 3);
        assert!(
            objects
                .iter()
                .filter(|o| o.data == b"hello rust")
                .all(|o| o.kind == ObjectKind::Blob)
        );
    }

    #[test]
    fn thin_pack_waits_for_external_base() {
        let base = RawObject::new(HashKind::Sha1, ObjectKind::Blob, b"hello world".to_vec());
        let delta = sample_delta();
        let mut body = b"PACK\0\0\0\x02\0\0\0\x01".to_vec();
        body.extend(encode_entry_header(7, delta.len()));
        body.extend(base.id.to_data());
        body.extend(zlib(&delta));
        let pack = seal(HashKind::Sha1, body);

        let mut decoded = PackDecoder::new(HashKind::Sha1).decode(&pack).unwrap();
        assert_eq!(decoded.missing_bases(), vec![base.id]);
        decoded.resolve_external(&base).unwrap();
        let objects = decoded.finish().unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].data, b"hello rust");
    }

    #[test]
    fn oversized_entry_headers_are_rejected() {
        let mut body = b"PACK\0\0\0\x02\0\0\0\x01".to_vec();
        body.extend(encode_entry_header(3, 1 << 55));
        body.extend(zlib(b"tiny"));
        let pack = seal(HashKind::Sha1, body);
        assert!(matches!(
            PackDecoder::new(HashKind::Sha1).decode(&pack),
            Err(GitError::InvalidPackFile(_))
        ));

        let objects = vec![RawObject::new(HashKind::Sha1, ObjectKind::Blob, vec![1u8; 4096])];
        let pack = encode_pack(HashKind::Sha1, &objects).unwrap();
        assert!(matches!(
            PackDecoder::new(HashKind::Sha1)
                .with_max_object_size(1024)
                .decode(&pack),
            Err(GitError::InvalidPackFile(_))
        ));
    }

    #[test]
    fn corrupt_trailer_is_rejected() {
        let mut pack = encode_pack(HashKind::Sha1, &[]).unwrap();
        let last = pack.len() - 1;
        pack[last] ^= 0xff;
        assert!(PackDecoder::new(HashKind::Sha1).decode(&pack).is_err());
    }
}
