//! State shared by the transport bindings: where repositories live, who may use them and the
//! push policy. Each binding asks it for a fresh [`Session`] per request or channel.

use std::{collections::HashMap, sync::Arc};

use crate::{
    config::GatewayConfig,
    errors::GatewayError,
    protocol::{
        access::{AccessControl, AllowAll, Peer, ReadOnly, ServicePolicy},
        receive::ReceivePolicy,
        session::{Session, SessionContext},
        types::ServiceType,
        upload::UploadPolicy,
    },
    resolve::Resolver,
    store::{RepositoryStore, fs::FsStore},
};

#[derive(Clone)]
pub struct Gateway {
    pub resolver: Resolver,
    pub access: Arc<dyn AccessControl>,
    pub policy: ReceivePolicy,
    pub upload: UploadPolicy,
    pub agent: String,
    /// Largest HTTP request body accepted, after gzip inflation.
    pub max_request_body: usize,
}

impl Gateway {
    /// Open every repository under `root`, fetch and push allowed.
    pub fn new(resolver: Resolver) -> Self {
        let policy = ReceivePolicy::default();
        Self {
            resolver,
            access: Arc::new(AllowAll),
            max_request_body: policy.max_pack_size,
            policy,
            upload: UploadPolicy::default(),
            agent: default_agent(),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        let access: Arc<dyn AccessControl> =
            match (config.access.allow_fetch, config.access.allow_push) {
                (true, true) => Arc::new(AllowAll),
                (true, false) => Arc::new(ReadOnly),
                (allow_fetch, allow_push) => Arc::new(ServicePolicy {
                    allow_fetch,
                    allow_push,
                }),
            };
        Self {
            resolver: Resolver::new(&config.repo.scan_path),
            access,
            policy: config.receive_policy(),
            upload: config.upload_policy(),
            agent: config.agent.clone().unwrap_or_else(default_agent),
            max_request_body: config.http.max_request_body,
        }
    }

    pub fn with_access(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = access;
        self
    }

    /// Resolve `repository`, check access and open a session on it.
    pub async fn open_session(
        &self,
        repository: &str,
        service: ServiceType,
        stateless: bool,
        env: HashMap<String, String>,
        peer: Peer,
    ) -> Result<Session, GatewayError> {
        let location = self.resolver.resolve(repository).await?;
        let store: Arc<dyn RepositoryStore> = Arc::new(FsStore::open(&location.git_dir).await?);
        let ctx = SessionContext {
            stateless,
            env,
            peer,
            agent: self.agent.clone(),
            policy: self.policy.clone(),
            upload: self.upload,
            ..SessionContext::new(location.name, service)
        };
        Ok(Session::open(store, ctx, self.access.as_ref()).await?)
    }
}

fn default_agent() -> String {
    concat!("git-gateway/", env!("CARGO_PKG_VERSION")).to_string()
}
