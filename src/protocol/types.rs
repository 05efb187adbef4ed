use std::fmt;
use std::str::FromStr;

use crate::{
    hash::{HashKind, ObjectId},
    store::StoreError,
};

use super::pktline::FramingError;

/// Protocol error types
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid service: {0}")]
    InvalidService(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("upload-pack request carries no want lines")]
    MissingWant,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Pack error: {0}")]
    Pack(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub fn invalid_service(service: &str) -> Self {
        ProtocolError::InvalidService(service.to_string())
    }

    pub fn invalid_request(msg: &str) -> Self {
        ProtocolError::InvalidRequest(msg.to_string())
    }

    pub fn forbidden(msg: &str) -> Self {
        ProtocolError::Forbidden(msg.to_string())
    }
}

/// Git service types for smart protocol
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ServiceType {
    UploadPack,
    ReceivePack,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::UploadPack => "git-upload-pack",
            ServiceType::ReceivePack => "git-receive-pack",
        }
    }

    pub fn advertisement_content_type(&self) -> &'static str {
        match self {
            ServiceType::UploadPack => "application/x-git-upload-pack-advertisement",
            ServiceType::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    pub fn result_content_type(&self) -> &'static str {
        match self {
            ServiceType::UploadPack => "application/x-git-upload-pack-result",
            ServiceType::ReceivePack => "application/x-git-receive-pack-result",
        }
    }

    /// Whether the service mutates the repository.
    pub fn is_write(&self) -> bool {
        matches!(self, ServiceType::ReceivePack)
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git-upload-pack" => Ok(ServiceType::UploadPack),
            "git-receive-pack" => Ok(ServiceType::ReceivePack),
            _ => Err(ProtocolError::InvalidService(s.to_string())),
        }
    }
}

/// Git protocol capabilities.
///
/// Tokens the gateway does not understand parse to [`Capability::Unknown`] and are ignored
/// during negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    MultiAck,
    MultiAckDetailed,
    NoDone,
    SideBand,
    SideBand64k,
    ReportStatus,
    ReportStatusv2,
    OfsDelta,
    DeepenSince,
    DeepenNot,
    DeepenRelative,
    ThinPack,
    NoThin,
    NoProgress,
    Shallow,
    IncludeTag,
    DeleteRefs,
    Quiet,
    Atomic,
    AllowTipSha1InWant,
    AllowReachableSha1InWant,
    PushOptions,
    Symref(String),
    ObjectFormat(String),
    SessionId(String),
    Agent(String),
    Unknown(String),
}

impl Capability {
    /// Token name without any `=value` part.
    pub fn name(&self) -> &str {
        match self {
            Capability::MultiAck => "multi_ack",
            Capability::MultiAckDetailed => "multi_ack_detailed",
            Capability::NoDone => "no-done",
            Capability::SideBand => "side-band",
            Capability::SideBand64k => "side-band-64k",
            Capability::ReportStatus => "report-status",
            Capability::ReportStatusv2 => "report-status-v2",
            Capability::OfsDelta => "ofs-delta",
            Capability::DeepenSince => "deepen-since",
            Capability::DeepenNot => "deepen-not",
            Capability::DeepenRelative => "deepen-relative",
            Capability::ThinPack => "thin-pack",
            Capability::NoThin => "no-thin",
            Capability::NoProgress => "no-progress",
            Capability::Shallow => "shallow",
            Capability::IncludeTag => "include-tag",
            Capability::DeleteRefs => "delete-refs",
            Capability::Quiet => "quiet",
            Capability::Atomic => "atomic",
            Capability::AllowTipSha1InWant => "allow-tip-sha1-in-want",
            Capability::AllowReachableSha1InWant => "allow-reachable-sha1-in-want",
            Capability::PushOptions => "push-options",
            Capability::Symref(_) => "symref",
            Capability::ObjectFormat(_) => "object-format",
            Capability::SessionId(_) => "session-id",
            Capability::Agent(_) => "agent",
            Capability::Unknown(token) => token.split('=').next().unwrap_or(token),
        }
    }
}

impl FromStr for Capability {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((key, value)) = s.split_once('=') {
            let value = value.to_string();
            return Ok(match key {
                "agent" => Capability::Agent(value),
                "symref" => Capability::Symref(value),
                "object-format" => Capability::ObjectFormat(value),
                "session-id" => Capability::SessionId(value),
                _ => Capability::Unknown(s.to_string()),
            });
        }

        Ok(match s {
            "multi_ack" => Capability::MultiAck,
            "multi_ack_detailed" => Capability::MultiAckDetailed,
            "no-done" => Capability::NoDone,
            "side-band" => Capability::SideBand,
            "side-band-64k" => Capability::SideBand64k,
            "report-status" => Capability::ReportStatus,
            "report-status-v2" => Capability::ReportStatusv2,
            "ofs-delta" => Capability::OfsDelta,
            "deepen-since" => Capability::DeepenSince,
            "deepen-not" => Capability::DeepenNot,
            "deepen-relative" => Capability::DeepenRelative,
            "thin-pack" => Capability::ThinPack,
            "no-thin" => Capability::NoThin,
            "no-progress" => Capability::NoProgress,
            "shallow" => Capability::Shallow,
            "include-tag" => Capability::IncludeTag,
            "delete-refs" => Capability::DeleteRefs,
            "quiet" => Capability::Quiet,
            "atomic" => Capability::Atomic,
            "allow-tip-sha1-in-want" => Capability::AllowTipSha1InWant,
            "allow-reachable-sha1-in-want" => Capability::AllowReachableSha1InWant,
            "push-options" => Capability::PushOptions,
            _ => Capability::Unknown(s.to_string()),
        })
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Symref(value)
            | Capability::ObjectFormat(value)
            | Capability::SessionId(value)
            | Capability::Agent(value) => write!(f, "{}={}", self.name(), value),
            Capability::Unknown(token) => f.write_str(token),
            _ => f.write_str(self.name()),
        }
    }
}

/// Ordered, duplicate-free list of capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    caps: Vec<Capability>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a space separated token list.
    pub fn parse(tokens: &str) -> Self {
        tokens
            .split_ascii_whitespace()
            .filter_map(|token| token.parse().ok())
            .collect()
    }

    pub fn push(&mut self, cap: Capability) {
        if !self.caps.contains(&cap) {
            self.caps.push(cap);
        }
    }

    pub fn contains(&self, cap: &Capability) -> bool {
        self.caps.contains(cap)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.caps.iter().any(|cap| cap.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.caps.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    /// Value of the requested `object-format`, if any.
    pub fn object_format(&self) -> Option<&str> {
        self.caps.iter().find_map(|cap| match cap {
            Capability::ObjectFormat(value) => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn agent(&self) -> Option<&str> {
        self.caps.iter().find_map(|cap| match cap {
            Capability::Agent(value) => Some(value.as_str()),
            _ => None,
        })
    }

    /// What the client asked for, restricted to what the server offered.
    ///
    /// Unknown tokens and capabilities the server never advertised are dropped. Valued
    /// capabilities are matched by name and keep the client's value.
    pub fn negotiate(&self, requested: &CapabilitySet) -> CapabilitySet {
        let mut out = CapabilitySet::new();
        for cap in requested.iter() {
            if matches!(cap, Capability::Unknown(_)) || !self.contains_name(cap.name()) {
                tracing::debug!(capability = %cap, "ignoring capability not offered by server");
                continue;
            }
            out.push(cap.clone());
        }
        out
    }

    /// Reject a client object format that differs from the repository's.
    pub fn check_object_format(&self, hash: HashKind) -> Result<(), ProtocolError> {
        match self.object_format() {
            Some(format) if format != hash.as_str() => Err(ProtocolError::Unsupported(format!(
                "client object-format {format}, repository uses {hash}"
            ))),
            _ => Ok(()),
        }
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        let mut set = CapabilitySet::new();
        for cap in iter {
            set.push(cap);
        }
        set
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, cap) in self.caps.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{cap}")?;
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CommandType {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Success,
    Failed(String),
}

/// Reference command for push operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefCommand {
    pub old_id: ObjectId,
    pub new_id: ObjectId,
    pub ref_name: String,
    pub status: CommandStatus,
}

impl RefCommand {
    pub fn new(old_id: ObjectId, new_id: ObjectId, ref_name: String) -> Self {
        Self {
            old_id,
            new_id,
            ref_name,
            status: CommandStatus::Pending,
        }
    }

    pub fn command_type(&self) -> CommandType {
        if self.old_id.is_zero() {
            CommandType::Create
        } else if self.new_id.is_zero() {
            CommandType::Delete
        } else {
            CommandType::Update
        }
    }

    /// Expected current value for the compare-and-swap, `None` for a create.
    pub fn expected(&self) -> Option<ObjectId> {
        (!self.old_id.is_zero()).then_some(self.old_id)
    }

    /// Target value, `None` for a delete.
    pub fn target(&self) -> Option<ObjectId> {
        (!self.new_id.is_zero()).then_some(self.new_id)
    }

    pub fn failed(&mut self, reason: impl Into<String>) {
        self.status = CommandStatus::Failed(reason.into());
    }

    pub fn success(&mut self) {
        self.status = CommandStatus::Success;
    }

    pub fn is_pending(&self) -> bool {
        self.status == CommandStatus::Pending
    }

    /// `ok <ref>` or `ng <ref> <reason>` as sent in report-status.
    pub fn status_line(&self) -> String {
        match &self.status {
            CommandStatus::Success => format!("ok {}", self.ref_name),
            CommandStatus::Failed(reason) => format!("ng {} {}", self.ref_name, reason),
            CommandStatus::Pending => format!("ng {} not processed", self.ref_name),
        }
    }
}

/// Protocol constants
pub const LF: char = '\n';
pub const SP: char = ' ';
pub const NUL: char = '\0';

#[cfg(test)]
mod tests {
    use super::{Capability, CapabilitySet, CommandType, RefCommand, ServiceType};
    use crate::hash::{HashKind, ObjectId};

    #[test]
    fn service_tokens() {
        assert_eq!(
            "git-upload-pack".parse::<ServiceType>().unwrap(),
            ServiceType::UploadPack
        );
        assert_eq!(ServiceType::ReceivePack.to_string(), "git-receive-pack");
        assert!("git-upload-archive".parse::<ServiceType>().is_err());
        assert_eq!(
            ServiceType::UploadPack.result_content_type(),
            "application/x-git-upload-pack-result"
        );
    }

    #[test]
    fn capability_parse_and_display() {
        let caps = CapabilitySet::parse("side-band-64k ofs-delta agent=git/2.45.0 frobnicate");
        assert!(caps.contains(&Capability::SideBand64k));
        assert_eq!(caps.agent(), Some("git/2.45.0"));
        assert!(caps.contains(&Capability::Unknown("frobnicate".to_string())));
        assert_eq!(
            caps.to_string(),
            "side-band-64k ofs-delta agent=git/2.45.0 frobnicate"
        );
        assert_eq!(
            "symref=HEAD:refs/heads/main".parse::<Capability>().unwrap(),
            Capability::Symref("HEAD:refs/heads/main".to_string())
        );
    }

    #[test]
    fn negotiation_keeps_only_offered() {
        let server = CapabilitySet::parse("side-band-64k ofs-delta agent=gw object-format=sha1");
        let client =
            CapabilitySet::parse("multi_ack side-band-64k thin-pack agent=git/2 mystery");
        let agreed = server.negotiate(&client);
        assert_eq!(agreed.to_string(), "side-band-64k agent=git/2");
    }

    #[test]
    fn object_format_mismatch_is_rejected() {
        let caps = CapabilitySet::parse("object-format=sha256");
        assert!(caps.check_object_format(HashKind::Sha1).is_err());
        assert!(caps.check_object_format(HashKind::Sha256).is_ok());
        assert!(CapabilitySet::new().check_object_format(HashKind::Sha1).is_ok());
    }

    #[test]
    fn command_types_and_status() {
        let zero = ObjectId::zero(HashKind::Sha1);
        let id = HashKind::Sha1.digest(b"x");
        let mut create = RefCommand::new(zero, id, "refs/heads/main".to_string());
        assert_eq!(create.command_type(), CommandType::Create);
        assert_eq!(create.expected(), None);
        create.success();
        assert_eq!(create.status_line(), "ok refs/heads/main");

        let mut delete = RefCommand::new(id, zero, "refs/heads/dev".to_string());
        assert_eq!(delete.command_type(), CommandType::Delete);
        assert_eq!(delete.target(), None);
        delete.failed("stale info");
        assert_eq!(delete.status_line(), "ng refs/heads/dev stale info");
    }
}
