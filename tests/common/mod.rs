#![allow(dead_code)]

use std::path::Path;

use bytes::{BufMut, BytesMut};
use git_gateway::{
    hash::{HashKind, ObjectId},
    internal::{
        object::{
            ObjectKind, RawObject,
            tree::{TreeEntry, encode_entries},
        },
        pack::decode::PackDecoder,
    },
    protocol::pktline::{FLUSH_PKT, PktLine, add_pkt_line_string, decode_frame},
};

/// Blob, tree and commit for a one-file snapshot. The commit is the last object.
pub fn commit_objects(
    hash: HashKind,
    content: &str,
    parents: &[ObjectId],
    time: u64,
) -> (ObjectId, Vec<RawObject>) {
    let blob = RawObject::new(hash, ObjectKind::Blob, content.as_bytes().to_vec());
    let tree = RawObject::new(
        hash,
        ObjectKind::Tree,
        encode_entries(&[TreeEntry {
            mode: b"100644".to_vec(),
            name: b"README".to_vec(),
            id: blob.id,
        }]),
    );
    let mut body = format!("tree {}\n", tree.id);
    for parent in parents {
        body.push_str(&format!("parent {parent}\n"));
    }
    body.push_str(&format!(
        "author Dev <dev@example.com> {time} +0000\ncommitter Dev <dev@example.com> {time} +0000\n\n{content}\n"
    ));
    let commit = RawObject::new(hash, ObjectKind::Commit, body.into_bytes());
    (commit.id, vec![blob, tree, commit])
}

/// pkt-line request body: each line framed, `None` marks a flush.
pub fn request(lines: &[Option<&str>]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for line in lines {
        match line {
            Some(text) => add_pkt_line_string(&mut buf, text).unwrap(),
            None => buf.put(&FLUSH_PKT[..]),
        }
    }
    buf.to_vec()
}

/// Pop one frame off the front of `data`.
pub fn next_frame<'a>(data: &mut &'a [u8]) -> PktLine {
    let rest: &'a [u8] = *data;
    let (pkt, used) = decode_frame(rest).unwrap().expect("complete frame");
    *data = &rest[used..];
    pkt
}

/// Frames up to and including the next flush.
pub fn until_flush(data: &mut &[u8]) -> Vec<PktLine> {
    let mut out = Vec::new();
    loop {
        let pkt = next_frame(data);
        let flush = pkt == PktLine::Flush;
        out.push(pkt);
        if flush {
            return out;
        }
    }
}

pub fn text(pkt: &PktLine) -> String {
    String::from_utf8_lossy(pkt.as_text().expect("data frame")).into_owned()
}

/// Side-band frames up to the closing flush, split into (channel 1 bytes, channel 2 text).
pub fn demux(data: &mut &[u8]) -> (Vec<u8>, String) {
    let mut primary = Vec::new();
    let mut progress = String::new();
    for pkt in until_flush(data) {
        let PktLine::Data(payload) = pkt else {
            continue;
        };
        match payload[0] {
            1 => primary.extend_from_slice(&payload[1..]),
            2 => progress.push_str(&String::from_utf8_lossy(&payload[1..])),
            band => panic!("unexpected side-band channel {band}"),
        }
    }
    (primary, progress)
}

pub fn unpack_ids(hash: HashKind, pack: &[u8]) -> Vec<ObjectId> {
    let objects = PackDecoder::new(hash)
        .decode(pack)
        .unwrap()
        .finish()
        .unwrap();
    objects.into_iter().map(|o| o.id).collect()
}

/// Minimal bare repository layout, `HEAD` on `refs/heads/main`.
pub fn init_bare(dir: &Path) {
    std::fs::create_dir_all(dir.join("objects/pack")).unwrap();
    std::fs::create_dir_all(dir.join("refs/heads")).unwrap();
    std::fs::create_dir_all(dir.join("refs/tags")).unwrap();
    std::fs::write(dir.join("HEAD"), "ref: refs/heads/main\n").unwrap();
    std::fs::write(
        dir.join("config"),
        "[core]\n\trepositoryformatversion = 0\n\tbare = true\n",
    )
    .unwrap();
}
