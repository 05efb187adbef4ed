//! upload-pack: the fetch side of the protocol.
//!
//! Protocol v0 without `multi_ack`. The client sends its wants (capabilities on the first one)
//! plus any `shallow`/`deepen` lines, then a flush. If it asked for a depth the server answers
//! with the shallow boundary and a flush. The client then sends `have` lines in rounds closed
//! by a flush, and finally `done`. Unless [`UploadPolicy::ack_common`] is set, every round and
//! the `done` are answered with `NAK`. With it, the first `have` the server knows is
//! acknowledged with `ACK <id>`; a round that ends without any common object gets `NAK`, as
//! does `done` when nothing was ever common. Stateless transports (HTTP) end the response after a flush round
//! and the client reconnects with the next request.

use std::collections::HashSet;

use tokio::io::{AsyncRead, AsyncWrite};

use super::{
    advertise::Advertisement,
    pktline::{PktLine, PktLineReader, PktLineWriter},
    sideband::{SideBandMode, SideBandWriter},
    types::{Capability, CapabilitySet, ProtocolError},
};
use crate::{
    hash::{HashKind, ObjectId},
    internal::pack::encode::PackEncoder,
    store::{
        RepositoryStore,
        walk::{ShallowUpdate, WalkRequest, collect_objects, shallow_boundary},
    },
};

/// Pack bytes are batched to roughly this size before they are framed.
const PACK_CHUNK: usize = 64 * 1024;

/// How the have rounds are answered.
///
/// With `ack_common` off every round and the final `done` get a plain `NAK`, as a server
/// that never acknowledges does; the pack is still cut at the common commits. With it on, the
/// first common `have` is answered with `ACK <id>` the way git's own upload-pack does without
/// `multi_ack`, which lets the client stop sending history early.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadPolicy {
    pub ack_common: bool,
}

/// Decoded first section of an upload-pack request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadRequest {
    pub wants: Vec<ObjectId>,
    /// Capabilities listed on the first want line, as sent.
    pub capabilities: CapabilitySet,
    pub client_shallow: Vec<ObjectId>,
    pub depth: Option<u32>,
}

pub(crate) fn line_text(line: &[u8]) -> Result<&str, ProtocolError> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    std::str::from_utf8(line).map_err(|_| ProtocolError::invalid_request("line is not UTF-8"))
}

pub(crate) fn parse_id(hash: HashKind, hex: &str) -> Result<ObjectId, ProtocolError> {
    ObjectId::from_hex(hash, hex)
        .map_err(|e| ProtocolError::InvalidRequest(format!("bad object id `{hex}`: {e}")))
}

impl UploadRequest {
    /// Read the want section. `Ok(None)` when the client hangs up or sends a bare flush,
    /// which is how `ls-remote` ends a session after the advertisement.
    pub async fn read<R: AsyncRead + Unpin>(
        reader: &mut PktLineReader<R>,
        hash: HashKind,
    ) -> Result<Option<Self>, ProtocolError> {
        let mut request = UploadRequest::default();
        let mut saw_line = false;
        loop {
            let line = match reader.read_pkt().await? {
                None if !saw_line => return Ok(None),
                None => return Err(ProtocolError::invalid_request("request truncated")),
                Some(PktLine::Flush) if !saw_line => return Ok(None),
                Some(PktLine::Flush) => break,
                Some(PktLine::Data(data)) => data,
                Some(other) => {
                    return Err(ProtocolError::InvalidRequest(format!(
                        "unexpected {other:?} in want section"
                    )));
                }
            };
            saw_line = true;
            let text = line_text(&line)?;
            tracing::debug!(line = text, "upload-pack request");

            if let Some(rest) = text.strip_prefix("want ") {
                let (hex, caps) = rest.split_once(' ').unwrap_or((rest, ""));
                if request.wants.is_empty() {
                    request.capabilities = CapabilitySet::parse(caps);
                }
                let id = parse_id(hash, hex)?;
                if !request.wants.contains(&id) {
                    request.wants.push(id);
                }
            } else if let Some(hex) = text.strip_prefix("shallow ") {
                request.client_shallow.push(parse_id(hash, hex)?);
            } else if let Some(depth) = text.strip_prefix("deepen ") {
                let depth = depth
                    .parse::<u32>()
                    .ok()
                    .filter(|d| *d > 0)
                    .ok_or_else(|| {
                        ProtocolError::InvalidRequest(format!("invalid deepen `{depth}`"))
                    })?;
                request.depth = Some(depth);
            } else if text.starts_with("deepen-since ")
                || text.starts_with("deepen-not ")
                || text.starts_with("filter ")
            {
                return Err(ProtocolError::Unsupported(text.to_string()));
            } else {
                return Err(ProtocolError::InvalidRequest(format!(
                    "unexpected line `{text}`"
                )));
            }
        }

        if request.wants.is_empty() {
            return Err(ProtocolError::MissingWant);
        }
        Ok(Some(request))
    }
}

/// Outcome of the have/ACK exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Negotiation {
    /// Client objects the store also has, in the order they were received.
    pub common: Vec<ObjectId>,
    pub shallow: ShallowUpdate,
    /// `false` when a stateless round ended on a flush: no pack follows.
    pub done: bool,
}

/// Drop wants the store cannot serve. They surface as a smaller (possibly empty) pack rather
/// than a failed session.
pub async fn retain_known_wants<S: RepositoryStore + ?Sized>(
    store: &S,
    request: &mut UploadRequest,
) -> Result<(), ProtocolError> {
    let mut known = Vec::with_capacity(request.wants.len());
    for want in request.wants.drain(..) {
        if store.has_object(&want).await? {
            known.push(want);
        } else {
            tracing::warn!(%want, "client wants an object the repository does not have");
        }
    }
    request.wants = known;
    Ok(())
}

/// Answer the shallow section (if a depth was requested) and run the have rounds.
pub async fn negotiate<S, R, W>(
    store: &S,
    request: &UploadRequest,
    reader: &mut PktLineReader<R>,
    writer: &mut PktLineWriter<W>,
    stateless: bool,
    policy: UploadPolicy,
) -> Result<Negotiation, ProtocolError>
where
    S: RepositoryStore + ?Sized,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let hash = store.hash_kind();
    let mut negotiation = Negotiation::default();

    if let Some(depth) = request.depth {
        let client_shallow: HashSet<ObjectId> = request.client_shallow.iter().copied().collect();
        let update = shallow_boundary(store, &request.wants, depth, &client_shallow).await?;
        for id in &update.shallow {
            writer.write_text(&format!("shallow {id}")).await?;
        }
        for id in &update.unshallow {
            writer.write_text(&format!("unshallow {id}")).await?;
        }
        writer.write_flush().await?;
        writer.flush().await?;
        negotiation.shallow = update;
    }

    loop {
        match reader.read_pkt().await? {
            Some(PktLine::Data(line)) => {
                let text = line_text(&line)?;
                if let Some(hex) = text.strip_prefix("have ") {
                    let id = parse_id(hash, hex)?;
                    if !negotiation.common.contains(&id) && store.has_object(&id).await? {
                        if policy.ack_common && negotiation.common.is_empty() {
                            writer.write_text(&format!("ACK {id}")).await?;
                        }
                        negotiation.common.push(id);
                    }
                } else if text == "done" {
                    if !policy.ack_common || negotiation.common.is_empty() {
                        writer.write_text("NAK").await?;
                    }
                    negotiation.done = true;
                    break;
                } else {
                    return Err(ProtocolError::InvalidRequest(format!(
                        "unexpected line `{text}` during negotiation"
                    )));
                }
            }
            Some(PktLine::Flush) => {
                if !policy.ack_common || negotiation.common.is_empty() {
                    writer.write_text("NAK").await?;
                }
                writer.flush().await?;
                if stateless {
                    break;
                }
            }
            Some(other) => {
                return Err(ProtocolError::InvalidRequest(format!(
                    "unexpected {other:?} during negotiation"
                )));
            }
            None => {
                return Err(ProtocolError::invalid_request(
                    "client closed the stream before done",
                ));
            }
        }
    }
    tracing::debug!(
        common = negotiation.common.len(),
        done = negotiation.done,
        "negotiation finished"
    );
    Ok(negotiation)
}

/// Everything the client is missing, given the negotiation result.
pub fn plan_objects(
    advertisement: &Advertisement,
    request: &UploadRequest,
    negotiation: &Negotiation,
    capabilities: &CapabilitySet,
) -> WalkRequest {
    let unshallow: HashSet<ObjectId> = negotiation.shallow.unshallow.iter().copied().collect();
    let shallow = request
        .client_shallow
        .iter()
        .filter(|id| !unshallow.contains(id))
        .chain(negotiation.shallow.shallow.iter())
        .copied()
        .collect();
    WalkRequest {
        wants: request.wants.clone(),
        haves: negotiation.common.clone(),
        shallow,
        client_shallow: request.client_shallow.iter().copied().collect(),
        unshallow,
        include_tags: capabilities.contains(&Capability::IncludeTag),
        tag_refs: advertisement.tag_ids(),
    }
}

/// Generate the pack and stream it, side-band framed when negotiated. Returns the number of
/// objects sent.
pub async fn send_pack<S, W>(
    store: &S,
    walk: &WalkRequest,
    capabilities: &CapabilitySet,
    writer: &mut PktLineWriter<W>,
) -> Result<usize, ProtocolError>
where
    S: RepositoryStore + ?Sized,
    W: AsyncWrite + Unpin,
{
    let mode = SideBandMode::from_capabilities(capabilities);
    let mut sideband = SideBandWriter::new(PktLineWriter::new(writer.get_mut()), mode)
        .suppress_progress(capabilities.contains(&Capability::NoProgress));

    match write_pack(store, walk, &mut sideband).await {
        Ok(count) => {
            sideband.finish().await?;
            Ok(count)
        }
        Err(e) => {
            tracing::error!(error = %e, "pack generation failed");
            Err(e)
        }
    }
}

async fn write_pack<S, W>(
    store: &S,
    walk: &WalkRequest,
    sideband: &mut SideBandWriter<W>,
) -> Result<usize, ProtocolError>
where
    S: RepositoryStore + ?Sized,
    W: AsyncWrite + Unpin,
{
    let objects = collect_objects(store, walk).await?;
    let total = objects.len();
    sideband
        .progress(&format!("Enumerating objects: {total}, done.\n"))
        .await?;

    let pack_err = |e: crate::errors::GitError| ProtocolError::Pack(e.to_string());
    let mut encoder = PackEncoder::new(store.hash_kind(), total);
    let mut chunk = encoder.header().map_err(pack_err)?;
    for object in &objects {
        chunk.extend(encoder.entry(object.kind, &object.data).map_err(pack_err)?);
        if chunk.len() >= PACK_CHUNK {
            sideband.write_data(&chunk).await?;
            chunk.clear();
        }
    }
    chunk.extend(encoder.finish().map_err(pack_err)?);
    sideband.write_data(&chunk).await?;
    sideband
        .progress(&format!("Total {total} (delta 0), reused 0 (delta 0)\n"))
        .await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::{UploadPolicy, UploadRequest, negotiate};
    use crate::{
        hash::HashKind,
        protocol::{
            pktline::{PktLineReader, PktLineWriter, encode},
            types::{Capability, ProtocolError},
        },
        store::{memory::MemoryStore, walk::tests::commit_file},
    };

    fn request(lines: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for line in lines {
            if line.is_empty() {
                out.extend_from_slice(b"0000");
            } else {
                out.extend_from_slice(&encode(format!("{line}\n").as_bytes()).unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn parses_wants_capabilities_and_depth() {
        let store = MemoryStore::new(HashKind::Sha1);
        let (c1, _, _) = commit_file(&store, "one", &[], 1);
        let body = request(&[
            &format!("want {c1} side-band-64k ofs-delta agent=git/2.45"),
            &format!("want {c1}"),
            "deepen 1",
            "",
        ]);
        let mut reader = PktLineReader::new(&body[..]);
        let req = UploadRequest::read(&mut reader, HashKind::Sha1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.wants, vec![c1]);
        assert_eq!(req.depth, Some(1));
        assert!(req.capabilities.contains(&Capability::SideBand64k));
        assert_eq!(req.capabilities.agent(), Some("git/2.45"));
    }

    #[tokio::test]
    async fn missing_want_and_bad_depth_fail() {
        let body = request(&["deepen 2", ""]);
        let err = UploadRequest::read(&mut PktLineReader::new(&body[..]), HashKind::Sha1).await;
        assert!(matches!(err, Err(ProtocolError::MissingWant)));

        let id = HashKind::Sha1.digest(b"x");
        let body = request(&[&format!("want {id}"), "deepen 0", ""]);
        let err = UploadRequest::read(&mut PktLineReader::new(&body[..]), HashKind::Sha1).await;
        assert!(matches!(err, Err(ProtocolError::InvalidRequest(_))));

        let body = request(&[""]);
        let none = UploadRequest::read(&mut PktLineReader::new(&body[..]), HashKind::Sha1)
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn acks_first_common_and_naks_unknown_rounds() {
        let store = MemoryStore::new(HashKind::Sha1);
        let (c1, _, _) = commit_file(&store, "one", &[], 1);
        let (c2, _, _) = commit_file(&store, "two", &[c1], 2);
        let unknown = HashKind::Sha1.digest(b"client only");
        let req = UploadRequest {
            wants: vec![c2],
            ..Default::default()
        };

        let body = request(&[
            &format!("have {unknown}"),
            "",
            &format!("have {c1}"),
            &format!("have {c2}"),
            "",
            "done",
        ]);
        let mut reader = PktLineReader::new(&body[..]);
        let mut writer = PktLineWriter::new(Vec::new());
        let acking = UploadPolicy { ack_common: true };
        let negotiation = negotiate(&store, &req, &mut reader, &mut writer, false, acking)
            .await
            .unwrap();
        assert!(negotiation.done);
        assert_eq!(negotiation.common, vec![c1, c2]);
        let out = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(out, format!("0008NAK\n0031ACK {c1}\n"));
    }

    #[tokio::test]
    async fn nak_only_still_records_common_commits() {
        let store = MemoryStore::new(HashKind::Sha1);
        let (c1, _, _) = commit_file(&store, "one", &[], 1);
        let req = UploadRequest {
            wants: vec![c1],
            ..Default::default()
        };
        let body = request(&[&format!("have {c1}"), "", "done"]);
        let mut writer = PktLineWriter::new(Vec::new());
        let negotiation = negotiate(
            &store,
            &req,
            &mut PktLineReader::new(&body[..]),
            &mut writer,
            false,
            UploadPolicy::default(),
        )
        .await
        .unwrap();
        assert_eq!(negotiation.common, vec![c1]);
        assert_eq!(writer.into_inner(), b"0008NAK\n0008NAK\n");
    }

    #[tokio::test]
    async fn stateless_flush_ends_the_round() {
        let store = MemoryStore::new(HashKind::Sha1);
        let (c1, _, _) = commit_file(&store, "one", &[], 1);
        let req = UploadRequest {
            wants: vec![c1],
            ..Default::default()
        };
        let body = request(&[&format!("have {}", HashKind::Sha1.digest(b"nope")), ""]);
        let mut writer = PktLineWriter::new(Vec::new());
        let negotiation = negotiate(
            &store,
            &req,
            &mut PktLineReader::new(&body[..]),
            &mut writer,
            true,
            UploadPolicy::default(),
        )
        .await
        .unwrap();
        assert!(!negotiation.done);
        assert_eq!(writer.into_inner(), b"0008NAK\n");
    }

    #[tokio::test]
    async fn shallow_section_precedes_acks() {
        let store = MemoryStore::new(HashKind::Sha1);
        let (c1, _, _) = commit_file(&store, "one", &[], 1);
        let (c2, _, _) = commit_file(&store, "two", &[c1], 2);
        let req = UploadRequest {
            wants: vec![c2],
            depth: Some(1),
            ..Default::default()
        };
        let body = request(&["done"]);
        let mut writer = PktLineWriter::new(Vec::new());
        let negotiation = negotiate(
            &store,
            &req,
            &mut PktLineReader::new(&body[..]),
            &mut writer,
            false,
            UploadPolicy::default(),
        )
        .await
        .unwrap();
        assert_eq!(negotiation.shallow.shallow, vec![c2]);
        let out = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(out, format!("0035shallow {c2}\n00000008NAK\n"));
    }
}
