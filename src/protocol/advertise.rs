//! Reference advertisement.
//!
//! The first line carries the capability list after a NUL. upload-pack leads with `HEAD` when
//! it resolves and follows annotated tags with their peeled `^{}` line; receive-pack lists
//! only `refs/`. A repository without refs still advertises one `capabilities^{}` line so the
//! client learns the capabilities.

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    pktline::{FLUSH_PKT, add_pkt_line_string},
    types::{Capability, CapabilitySet, LF, NUL, ProtocolError, SP, ServiceType},
};
use crate::{
    hash::{HashKind, ObjectId},
    internal::object::{ObjectKind, tag::TagTarget},
    store::{RepositoryStore, StoreError},
};

/// Refs and capabilities captured for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub service: ServiceType,
    pub hash: HashKind,
    pub capabilities: CapabilitySet,
    /// `(name, id)` in advertisement order, peeled entries included.
    pub refs: Vec<(String, ObjectId)>,
}

/// Capabilities the gateway offers for `service`.
pub fn server_capabilities(
    service: ServiceType,
    hash: HashKind,
    head_target: Option<&str>,
    agent: &str,
) -> CapabilitySet {
    let mut caps = CapabilitySet::new();
    match service {
        ServiceType::UploadPack => {
            caps.push(Capability::SideBand);
            caps.push(Capability::SideBand64k);
            caps.push(Capability::OfsDelta);
            caps.push(Capability::Shallow);
            caps.push(Capability::NoProgress);
            caps.push(Capability::IncludeTag);
            if let Some(target) = head_target {
                caps.push(Capability::Symref(format!("HEAD:{target}")));
            }
        }
        ServiceType::ReceivePack => {
            caps.push(Capability::ReportStatus);
            caps.push(Capability::DeleteRefs);
            caps.push(Capability::SideBand64k);
            caps.push(Capability::Quiet);
            caps.push(Capability::OfsDelta);
        }
    }
    caps.push(Capability::ObjectFormat(hash.as_str().to_string()));
    caps.push(Capability::Agent(agent.to_string()));
    caps
}

async fn peeled<S: RepositoryStore + ?Sized>(
    store: &S,
    id: &ObjectId,
) -> Result<Option<ObjectId>, StoreError> {
    let Some(object) = store.try_read_object(id).await? else {
        return Ok(None);
    };
    if object.kind != ObjectKind::Tag {
        return Ok(None);
    }
    let mut target = TagTarget::parse(store.hash_kind(), &object.data)?;
    for _ in 0..32 {
        if target.kind != ObjectKind::Tag {
            return Ok(Some(target.object));
        }
        let Some(next) = store.try_read_object(&target.object).await? else {
            return Ok(None);
        };
        target = TagTarget::parse(store.hash_kind(), &next.data)?;
    }
    Ok(None)
}

impl Advertisement {
    pub async fn collect<S: RepositoryStore + ?Sized>(
        store: &S,
        service: ServiceType,
        agent: &str,
    ) -> Result<Self, ProtocolError> {
        let hash = store.hash_kind();
        let head = store.head().await?;
        let mut refs = Vec::new();

        let head_target = match (service, head.id) {
            (ServiceType::UploadPack, Some(id)) => {
                refs.push(("HEAD".to_string(), id));
                head.symref.as_deref()
            }
            _ => None,
        };
        let capabilities = server_capabilities(service, hash, head_target, agent);

        for (name, id) in store.refs().await? {
            refs.push((name.clone(), id));
            if service == ServiceType::UploadPack && name.starts_with("refs/tags/") {
                if let Some(peeled) = peeled(store, &id).await? {
                    refs.push((format!("{name}^{{}}"), peeled));
                }
            }
        }
        tracing::debug!(%service, refs = refs.len(), "collected advertisement");

        Ok(Self {
            service,
            hash,
            capabilities,
            refs,
        })
    }

    /// Ids the client may legitimately name in `want` lines.
    pub fn tips(&self) -> impl Iterator<Item = &ObjectId> {
        self.refs.iter().map(|(_, id)| id)
    }

    /// Ids of refs under `refs/tags/`, unpeeled.
    pub fn tag_ids(&self) -> Vec<ObjectId> {
        self.refs
            .iter()
            .filter(|(name, _)| name.starts_with("refs/tags/") && !name.ends_with("^{}"))
            .map(|(_, id)| *id)
            .collect()
    }

    /// Serialise as pkt-lines. `http` adds the `# service=` preamble and its flush.
    pub fn encode(&self, http: bool) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        if http {
            add_pkt_line_string(&mut buf, &format!("# service={}{LF}", self.service))?;
            buf.put(&FLUSH_PKT[..]);
        }

        let caps = self.capabilities.to_string();
        match self.refs.split_first() {
            Some(((name, id), rest)) => {
                add_pkt_line_string(&mut buf, &format!("{id}{SP}{name}{NUL}{caps}{LF}"))?;
                for (name, id) in rest {
                    add_pkt_line_string(&mut buf, &format!("{id}{SP}{name}{LF}"))?;
                }
            }
            None => {
                let zero = ObjectId::zero(self.hash);
                add_pkt_line_string(
                    &mut buf,
                    &format!("{zero}{SP}capabilities^{{}}{NUL}{caps}{LF}"),
                )?;
            }
        }
        buf.put(&FLUSH_PKT[..]);
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::Advertisement;
    use crate::{
        hash::HashKind,
        internal::object::ObjectKind,
        protocol::{
            pktline::{PktLine, decode_frame},
            types::ServiceType,
        },
        store::{memory::MemoryStore, walk::tests::commit_file},
    };

    fn lines(mut bytes: &[u8]) -> Vec<PktLine> {
        let mut out = Vec::new();
        while let Some((line, used)) = decode_frame(bytes).unwrap() {
            out.push(line);
            bytes = &bytes[used..];
        }
        out
    }

    #[tokio::test]
    async fn empty_repository_advertises_capabilities_placeholder() {
        let store = MemoryStore::new(HashKind::Sha1);
        let adv = Advertisement::collect(&store, ServiceType::ReceivePack, "gw/1")
            .await
            .unwrap();
        let bytes = adv.encode(true).unwrap();
        let lines = lines(&bytes);
        assert_eq!(lines.len(), 4);
        assert_eq!(
            lines[0],
            PktLine::Data("# service=git-receive-pack\n".into())
        );
        assert_eq!(lines[1], PktLine::Flush);
        let PktLine::Data(first) = &lines[2] else {
            panic!("expected data line");
        };
        let expected = format!(
            "{} capabilities^{{}}\0report-status delete-refs side-band-64k quiet ofs-delta object-format=sha1 agent=gw/1\n",
            "0".repeat(40)
        );
        assert_eq!(first, expected.as_bytes());
        assert_eq!(lines[3], PktLine::Flush);
    }

    #[tokio::test]
    async fn upload_pack_leads_with_head_and_peels_tags() {
        let store = MemoryStore::new(HashKind::Sha1);
        let (commit, _, _) = commit_file(&store, "one", &[], 1);
        store.set_ref("refs/heads/main", commit);
        let tag = store.insert(
            ObjectKind::Tag,
            format!(
                "object {commit}\ntype commit\ntag v1\ntagger t <t@example.com> 1 +0000\n\nv1\n"
            )
            .into_bytes(),
        );
        store.set_ref("refs/tags/v1", tag);

        let adv = Advertisement::collect(&store, ServiceType::UploadPack, "gw/1")
            .await
            .unwrap();
        let names: Vec<&str> = adv.refs.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["HEAD", "refs/heads/main", "refs/tags/v1", "refs/tags/v1^{}"]
        );
        assert_eq!(adv.refs[3].1, commit);
        assert_eq!(adv.tag_ids(), vec![tag]);

        let bytes = adv.encode(false).unwrap();
        let lines = lines(&bytes);
        let PktLine::Data(first) = &lines[0] else {
            panic!("expected data line");
        };
        let text = String::from_utf8_lossy(first);
        assert!(text.starts_with(&format!("{commit} HEAD\0side-band side-band-64k")));
        assert!(text.contains("symref=HEAD:refs/heads/main"));
        assert_eq!(
            lines[1],
            PktLine::Data(format!("{commit} refs/heads/main\n").into())
        );
    }

    #[tokio::test]
    async fn advertisement_is_idempotent() {
        let store = MemoryStore::new(HashKind::Sha1);
        let (commit, _, _) = commit_file(&store, "one", &[], 1);
        store.set_ref("refs/heads/main", commit);
        store.set_ref("refs/heads/dev", commit);
        let first = Advertisement::collect(&store, ServiceType::UploadPack, "gw")
            .await
            .unwrap()
            .encode(true)
            .unwrap();
        let second = Advertisement::collect(&store, ServiceType::UploadPack, "gw")
            .await
            .unwrap()
            .encode(true)
            .unwrap();
        assert_eq!(first, second);
    }
}
