//! receive-pack: the push side of the protocol.
//!
//! The client sends `old new ref` commands (capabilities after a NUL on the first), a flush,
//! and then a pack unless every command is a delete. The pack is read to its trailer, checked
//! and fully resolved (thin-pack bases come from the store) before anything is written. Each
//! command is then checked against policy and applied through the store's compare-and-swap
//! on its own: one rejected ref never undoes another. The report lists `unpack ok` or
//! `unpack error <reason>` followed by one `ok`/`ng` line per command.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{
    pktline::{FLUSH_PKT, PktLine, PktLineReader, PktLineWriter, add_pkt_line_string},
    sideband::{SideBandMode, SideBandWriter},
    types::{Capability, CapabilitySet, CommandType, ProtocolError, RefCommand},
    upload::{line_text, parse_id},
};
use crate::{
    errors::GitError,
    hash::{HashKind, ObjectId},
    internal::{
        object::ObjectKind,
        pack::{decode::PackDecoder, stream::read_pack},
    },
    store::{RepositoryStore, StoreError, is_valid_ref_name, walk::is_ancestor},
};

/// Ref update rules applied on top of the compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivePolicy {
    pub deny_non_fast_forwards: bool,
    pub deny_deletes: bool,
    /// Largest pack accepted, in bytes.
    pub max_pack_size: usize,
}

impl Default for ReceivePolicy {
    fn default() -> Self {
        Self {
            deny_non_fast_forwards: false,
            deny_deletes: false,
            max_pack_size: 512 * 1024 * 1024,
        }
    }
}

/// Decoded command section of a push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub commands: Vec<RefCommand>,
    /// Capabilities listed on the first command, as sent.
    pub capabilities: CapabilitySet,
}

impl ReceiveRequest {
    /// Read commands up to the flush. `Ok(None)` when the client sends no commands, which is
    /// how a push with nothing to update ends.
    pub async fn read<R: AsyncRead + Unpin>(
        reader: &mut PktLineReader<R>,
        hash: HashKind,
    ) -> Result<Option<Self>, ProtocolError> {
        let mut request = ReceiveRequest::default();
        loop {
            let line = match reader.read_pkt().await? {
                None if request.commands.is_empty() => return Ok(None),
                None => return Err(ProtocolError::invalid_request("command list truncated")),
                Some(PktLine::Flush) => break,
                Some(PktLine::Data(data)) => data,
                Some(other) => {
                    return Err(ProtocolError::InvalidRequest(format!(
                        "unexpected {other:?} in command list"
                    )));
                }
            };

            let (command, caps) = match line.iter().position(|b| *b == 0) {
                Some(nul) => (&line[..nul], Some(&line[nul + 1..])),
                None => (&line[..], None),
            };
            let text = line_text(command)?;
            tracing::debug!(command = text, "receive-pack command");
            if text.starts_with("shallow ") || text.starts_with("push-cert") {
                return Err(ProtocolError::Unsupported(text.to_string()));
            }

            let mut parts = text.splitn(3, ' ');
            let (Some(old), Some(new), Some(name)) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(ProtocolError::InvalidRequest(format!(
                    "malformed command `{text}`"
                )));
            };
            if request.commands.is_empty() {
                if let Some(caps) = caps {
                    request.capabilities = CapabilitySet::parse(line_text(caps)?);
                }
            }
            if request.commands.iter().any(|c| c.ref_name == name) {
                return Err(ProtocolError::InvalidRequest(format!(
                    "duplicate ref {name} in command list"
                )));
            }
            request.commands.push(RefCommand::new(
                parse_id(hash, old)?,
                parse_id(hash, new)?,
                name.to_string(),
            ));
        }

        if request.commands.is_empty() {
            return Ok(None);
        }
        Ok(Some(request))
    }

    /// Deletes alone carry no pack.
    pub fn needs_pack(&self) -> bool {
        self.commands
            .iter()
            .any(|c| c.command_type() != CommandType::Delete)
    }
}

fn pack_error(e: GitError) -> ProtocolError {
    match e {
        GitError::IOError(e) => ProtocolError::Io(e),
        other => ProtocolError::Pack(other.to_string()),
    }
}

/// Read, verify and store the pushed pack. Returns the number of objects stored.
///
/// [`ProtocolError::Pack`] means the pack itself was bad and should be reported as an unpack
/// error; every other error is fatal to the session.
pub async fn unpack<S, R>(
    store: &S,
    reader: &mut R,
    max_pack_size: usize,
) -> Result<usize, ProtocolError>
where
    S: RepositoryStore + ?Sized,
    R: AsyncRead + Unpin,
{
    let hash = store.hash_kind();
    let pack = read_pack(reader, hash, max_pack_size)
        .await
        .map_err(pack_error)?;
    let mut decoded = PackDecoder::new(hash)
        .with_max_object_size(max_pack_size)
        .decode(&pack)
        .map_err(pack_error)?;
    for base in decoded.missing_bases() {
        match store.try_read_object(&base).await? {
            Some(object) => decoded.resolve_external(&object).map_err(pack_error)?,
            None => {
                return Err(ProtocolError::Pack(format!(
                    "thin pack base {base} is missing"
                )));
            }
        }
    }
    let objects = decoded.finish().map_err(pack_error)?;
    let count = objects.len();
    store.write_objects(objects).await?;
    tracing::debug!(objects = count, bytes = pack.len(), "stored pushed pack");
    Ok(count)
}

/// Check and apply every pending command, recording its outcome on the command.
pub async fn apply_commands<S: RepositoryStore + ?Sized>(
    store: &S,
    commands: &mut [RefCommand],
    capabilities: &CapabilitySet,
    policy: &ReceivePolicy,
) -> Result<(), ProtocolError> {
    for command in commands.iter_mut().filter(|c| c.is_pending()) {
        if let Some(reason) = check_command(store, command, capabilities, policy).await? {
            tracing::warn!(ref_name = %command.ref_name, reason, "ref update rejected");
            command.failed(reason);
            continue;
        }
        match store
            .update_ref(&command.ref_name, command.expected(), command.target())
            .await
        {
            Ok(()) => {
                tracing::info!(
                    ref_name = %command.ref_name,
                    old = %command.old_id,
                    new = %command.new_id,
                    "ref updated"
                );
                command.success();
            }
            Err(StoreError::StaleRef(_)) => {
                tracing::warn!(ref_name = %command.ref_name, "stale info");
                command.failed("stale info");
            }
            Err(StoreError::InvalidRefName(_)) => command.failed("funny refname"),
            Err(e) => {
                tracing::error!(ref_name = %command.ref_name, error = %e, "ref update failed");
                return Err(e.into());
            }
        }
    }
    Ok(())
}

async fn check_command<S: RepositoryStore + ?Sized>(
    store: &S,
    command: &RefCommand,
    capabilities: &CapabilitySet,
    policy: &ReceivePolicy,
) -> Result<Option<&'static str>, ProtocolError> {
    if !is_valid_ref_name(&command.ref_name) {
        return Ok(Some("funny refname"));
    }
    if command.old_id.is_zero() && command.new_id.is_zero() {
        return Ok(Some("invalid command"));
    }
    match command.command_type() {
        CommandType::Delete => {
            if !capabilities.contains(&Capability::DeleteRefs) {
                return Ok(Some("delete-refs not negotiated"));
            }
            if policy.deny_deletes {
                return Ok(Some("deletion prohibited"));
            }
        }
        CommandType::Create => {
            if !store.has_object(&command.new_id).await? {
                return Ok(Some("missing necessary objects"));
            }
        }
        CommandType::Update => {
            if !store.has_object(&command.new_id).await? {
                return Ok(Some("missing necessary objects"));
            }
            if policy.deny_non_fast_forwards && is_commit(store, &command.old_id).await? {
                if !is_ancestor(store, &command.old_id, &command.new_id).await? {
                    return Ok(Some("non-fast-forward"));
                }
            }
        }
    }
    Ok(None)
}

async fn is_commit<S: RepositoryStore + ?Sized>(
    store: &S,
    id: &ObjectId,
) -> Result<bool, ProtocolError> {
    Ok(store
        .try_read_object(id)
        .await?
        .is_some_and(|object| object.kind == ObjectKind::Commit))
}

/// Mark every command as failed because the pack could not be used.
pub fn reject_all(commands: &mut [RefCommand], reason: &str) {
    for command in commands {
        command.failed(reason);
    }
}

/// The report-status pkt-lines, flush included.
pub fn encode_report(
    unpack: &Result<usize, String>,
    commands: &[RefCommand],
) -> Result<BytesMut, ProtocolError> {
    let mut buf = BytesMut::new();
    match unpack {
        Ok(_) => add_pkt_line_string(&mut buf, "unpack ok")?,
        Err(reason) => add_pkt_line_string(&mut buf, &format!("unpack error {reason}"))?,
    }
    for command in commands {
        add_pkt_line_string(&mut buf, &command.status_line())?;
    }
    buf.put(&FLUSH_PKT[..]);
    Ok(buf)
}

/// Send the report if the client asked for one, on channel 1 when side-band is active.
pub async fn send_report<W: AsyncWrite + Unpin>(
    unpack: &Result<usize, String>,
    commands: &[RefCommand],
    capabilities: &CapabilitySet,
    writer: &mut PktLineWriter<W>,
) -> Result<(), ProtocolError> {
    let mode = SideBandMode::from_capabilities(capabilities);
    let mut sideband = SideBandWriter::new(PktLineWriter::new(writer.get_mut()), mode)
        .suppress_progress(capabilities.contains(&Capability::Quiet));
    if let Ok(count) = unpack {
        sideband
            .progress(&format!("Received {count} objects\n"))
            .await?;
    }
    if capabilities.contains(&Capability::ReportStatus) {
        let report = encode_report(unpack, commands)?;
        sideband.write_data(&report).await?;
    }
    sideband.finish().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{ReceivePolicy, ReceiveRequest, apply_commands, encode_report, unpack};
    use crate::{
        hash::{HashKind, ObjectId},
        internal::{
            object::{ObjectKind, RawObject},
            pack::encode::encode_pack,
        },
        protocol::{
            pktline::{PktLineReader, encode},
            types::{CapabilitySet, CommandStatus, ProtocolError, RefCommand},
        },
        store::{RepositoryStore, memory::MemoryStore, walk::tests::commit_file},
    };

    fn commands(lines: &[String]) -> Vec<u8> {
        let mut out = Vec::new();
        for line in lines {
            out.extend_from_slice(&encode(line.as_bytes()).unwrap());
        }
        out.extend_from_slice(b"0000");
        out
    }

    #[tokio::test]
    async fn parses_commands_and_capabilities() {
        let zero = ObjectId::zero(HashKind::Sha1);
        let id = HashKind::Sha1.digest(b"x");
        let body = commands(&[
            format!("{zero} {id} refs/heads/main\0report-status side-band-64k agent=git/2\n"),
            format!("{id} {zero} refs/heads/old\n"),
        ]);
        let request = ReceiveRequest::read(&mut PktLineReader::new(&body[..]), HashKind::Sha1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.commands.len(), 2);
        assert_eq!(request.commands[0].ref_name, "refs/heads/main");
        assert_eq!(request.capabilities.agent(), Some("git/2"));
        assert!(request.needs_pack());
    }

    #[tokio::test]
    async fn duplicate_refs_are_a_protocol_error() {
        let zero = ObjectId::zero(HashKind::Sha1);
        let id = HashKind::Sha1.digest(b"x");
        let body = commands(&[
            format!("{zero} {id} refs/heads/main\0report-status\n"),
            format!("{zero} {id} refs/heads/main\n"),
        ]);
        let err = ReceiveRequest::read(&mut PktLineReader::new(&body[..]), HashKind::Sha1).await;
        assert!(matches!(err, Err(ProtocolError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn stale_and_missing_objects_are_rejected_per_ref() {
        let store = MemoryStore::new(HashKind::Sha1);
        let (c1, _, _) = commit_file(&store, "one", &[], 1);
        let (c2, _, _) = commit_file(&store, "two", &[c1], 2);
        let (other, _, _) = commit_file(&store, "other", &[], 3);
        store.set_ref("refs/heads/main", c1);
        store.set_ref("refs/heads/dev", other);
        let ghost = HashKind::Sha1.digest(b"ghost");

        let mut cmds = vec![
            RefCommand::new(c1, c2, "refs/heads/main".to_string()),
            RefCommand::new(c1, c2, "refs/heads/dev".to_string()),
            RefCommand::new(ObjectId::zero(HashKind::Sha1), ghost, "refs/heads/x".to_string()),
            RefCommand::new(ObjectId::zero(HashKind::Sha1), c2, "refs/heads/bad..name".to_string()),
        ];
        apply_commands(
            &store,
            &mut cmds,
            &CapabilitySet::parse("report-status"),
            &ReceivePolicy::default(),
        )
        .await
        .unwrap();

        let lines: Vec<String> = cmds.iter().map(|c| c.status_line()).collect();
        assert_eq!(
            lines,
            vec![
                "ok refs/heads/main",
                "ng refs/heads/dev stale info",
                "ng refs/heads/x missing necessary objects",
                "ng refs/heads/bad..name funny refname",
            ]
        );
        assert_eq!(store.get_ref("refs/heads/main"), Some(c2));
        assert_eq!(store.get_ref("refs/heads/dev"), Some(other));
    }

    #[tokio::test]
    async fn policy_blocks_rewinds_and_deletes() {
        let store = MemoryStore::new(HashKind::Sha1);
        let (c1, _, _) = commit_file(&store, "one", &[], 1);
        let (c2, _, _) = commit_file(&store, "two", &[c1], 2);
        store.set_ref("refs/heads/main", c2);
        store.set_ref("refs/heads/gone", c1);
        let policy = ReceivePolicy {
            deny_non_fast_forwards: true,
            deny_deletes: true,
            ..Default::default()
        };
        let mut cmds = vec![
            RefCommand::new(c2, c1, "refs/heads/main".to_string()),
            RefCommand::new(c1, ObjectId::zero(HashKind::Sha1), "refs/heads/gone".to_string()),
        ];
        apply_commands(
            &store,
            &mut cmds,
            &CapabilitySet::parse("delete-refs"),
            &policy,
        )
        .await
        .unwrap();
        assert_eq!(
            cmds[0].status,
            CommandStatus::Failed("non-fast-forward".to_string())
        );
        assert_eq!(
            cmds[1].status,
            CommandStatus::Failed("deletion prohibited".to_string())
        );
        assert_eq!(store.get_ref("refs/heads/gone"), Some(c1));
    }

    #[tokio::test]
    async fn unpack_stores_objects_and_rejects_garbage() {
        let store = MemoryStore::new(HashKind::Sha1);
        let blob = RawObject::new(HashKind::Sha1, ObjectKind::Blob, b"pushed\n".to_vec());
        let pack = encode_pack(HashKind::Sha1, std::slice::from_ref(&blob)).unwrap();
        let count = unpack(&store, &mut &pack[..], usize::MAX).await.unwrap();
        assert_eq!(count, 1);
        assert!(store.has_object(&blob.id).await.unwrap());

        let mut corrupt = pack.clone();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xff;
        let err = unpack(&store, &mut &corrupt[..], usize::MAX).await;
        assert!(matches!(err, Err(ProtocolError::Pack(_))));
    }

    #[test]
    fn report_lists_unpack_then_commands() {
        let id = HashKind::Sha1.digest(b"x");
        let mut ok = RefCommand::new(ObjectId::zero(HashKind::Sha1), id, "refs/heads/a".into());
        ok.success();
        let report = encode_report(&Ok(1), &[ok]).unwrap();
        assert_eq!(&report[..], b"000eunpack ok\n0014ok refs/heads/a\n0000");
        let failed = encode_report(&Err("bad pack".to_string()), &[]).unwrap();
        assert_eq!(&failed[..], b"001aunpack error bad pack\n0000");
    }
}
