//! Authorization hook consulted before a session advertises anything.

use async_trait::async_trait;

use super::types::{ProtocolError, ServiceType};

/// Who is asking, as far as the transport can tell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Peer {
    /// Remote socket address, when known.
    pub addr: Option<std::net::SocketAddr>,
    /// SSH user name.
    pub user: Option<String>,
}

#[async_trait]
pub trait AccessControl: Send + Sync {
    /// `Err(ProtocolError::Forbidden)` to refuse the session.
    async fn authorize(
        &self,
        service: ServiceType,
        repository: &str,
        peer: &Peer,
    ) -> Result<(), ProtocolError>;
}

/// Every fetch and every push is allowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AccessControl for AllowAll {
    async fn authorize(
        &self,
        _service: ServiceType,
        _repository: &str,
        _peer: &Peer,
    ) -> Result<(), ProtocolError> {
        Ok(())
    }
}

/// Fetches only; receive-pack is refused.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOnly;

#[async_trait]
impl AccessControl for ReadOnly {
    async fn authorize(
        &self,
        service: ServiceType,
        repository: &str,
        peer: &Peer,
    ) -> Result<(), ProtocolError> {
        if service.is_write() {
            tracing::warn!(repository, ?peer, "push refused: gateway is read-only");
            return Err(ProtocolError::forbidden("push access is disabled"));
        }
        Ok(())
    }
}

/// Built from the `access` section of the configuration.
#[derive(Debug, Clone, Copy)]
pub struct ServicePolicy {
    pub allow_fetch: bool,
    pub allow_push: bool,
}

#[async_trait]
impl AccessControl for ServicePolicy {
    async fn authorize(
        &self,
        service: ServiceType,
        repository: &str,
        peer: &Peer,
    ) -> Result<(), ProtocolError> {
        let allowed = match service {
            ServiceType::UploadPack => self.allow_fetch,
            ServiceType::ReceivePack => self.allow_push,
        };
        if allowed {
            Ok(())
        } else {
            tracing::warn!(repository, %service, ?peer, "service refused by access policy");
            Err(ProtocolError::Forbidden(format!("{service} is disabled")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessControl, AllowAll, Peer, ReadOnly, ServicePolicy};
    use crate::protocol::types::{ProtocolError, ServiceType};

    #[tokio::test]
    async fn read_only_refuses_push() {
        let peer = Peer::default();
        assert!(
            ReadOnly
                .authorize(ServiceType::UploadPack, "repo", &peer)
                .await
                .is_ok()
        );
        assert!(matches!(
            ReadOnly
                .authorize(ServiceType::ReceivePack, "repo", &peer)
                .await,
            Err(ProtocolError::Forbidden(_))
        ));
        assert!(
            AllowAll
                .authorize(ServiceType::ReceivePack, "repo", &peer)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn service_policy_follows_flags() {
        let policy = ServicePolicy {
            allow_fetch: false,
            allow_push: true,
        };
        let peer = Peer::default();
        assert!(
            policy
                .authorize(ServiceType::UploadPack, "repo", &peer)
                .await
                .is_err()
        );
        assert!(
            policy
                .authorize(ServiceType::ReceivePack, "repo", &peer)
                .await
                .is_ok()
        );
    }
}
