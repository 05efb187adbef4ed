//! One client interaction: a single HTTP request or a single SSH exec channel.
//!
//! The session owns everything negotiated along the way (advertised refs, agreed capabilities,
//! the channel environment) so nothing leaks between connections. Transports only hand it a
//! byte reader and writer:
//!
//! ```text
//! Created -> Advertised -> RequestReceived -> Negotiated -> ResponseSent -> Closed
//!     \_______________________________________________________________/
//!                                   Failed
//! ```
//!
//! `Advertised -> Closed` covers clients that only wanted the refs (`ls-remote`, `info/refs`).
//! A session that fails after the client negotiated side-band gets a channel 3 frame saying
//! why; bytes already written stay written.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use super::{
    access::{AccessControl, Peer},
    advertise::Advertisement,
    pktline::{PktLineReader, PktLineWriter},
    receive::{ReceivePolicy, ReceiveRequest, apply_commands, reject_all, send_report, unpack},
    sideband::{SideBandMode, SideBandWriter},
    types::{CapabilitySet, ProtocolError, ServiceType},
    upload::{UploadPolicy, UploadRequest, negotiate, plan_objects, retain_known_wants, send_pack},
};
use crate::store::RepositoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Advertised,
    RequestReceived,
    Negotiated,
    ResponseSent,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    fn can_move_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match next {
            Failed => !self.is_terminal(),
            _ => matches!(
                (self, next),
                (Created, Advertised)
                    | (Advertised, RequestReceived)
                    | (Advertised, Closed)
                    | (RequestReceived, Negotiated)
                    | (Negotiated, ResponseSent)
                    | (ResponseSent, Closed)
            ),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-session inputs collected by the transport.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub repository: String,
    pub service: ServiceType,
    /// HTTP: one request per negotiation round, advertisement sent by a separate request.
    pub stateless: bool,
    /// SSH `env` requests, or the `Git-Protocol` header as `GIT_PROTOCOL`.
    pub env: HashMap<String, String>,
    pub peer: Peer,
    pub agent: String,
    pub policy: ReceivePolicy,
    pub upload: UploadPolicy,
}

impl SessionContext {
    pub fn new(repository: impl Into<String>, service: ServiceType) -> Self {
        Self {
            repository: repository.into(),
            service,
            stateless: false,
            env: HashMap::new(),
            peer: Peer::default(),
            agent: concat!("git-gateway/", env!("CARGO_PKG_VERSION")).to_string(),
            policy: ReceivePolicy::default(),
            upload: UploadPolicy::default(),
        }
    }

    /// Value of `GIT_PROTOCOL`, e.g. `version=2`.
    pub fn git_protocol(&self) -> Option<&str> {
        self.env.get("GIT_PROTOCOL").map(String::as_str)
    }
}

pub struct Session {
    store: Arc<dyn RepositoryStore>,
    ctx: SessionContext,
    state: SessionState,
    advertisement: Option<Advertisement>,
    capabilities: CapabilitySet,
}

impl Session {
    pub fn new(store: Arc<dyn RepositoryStore>, ctx: SessionContext) -> Self {
        if let Some(protocol) = ctx.git_protocol() {
            tracing::debug!(protocol, "client asked for a newer protocol, answering with v0");
        }
        Self {
            store,
            ctx,
            state: SessionState::Created,
            advertisement: None,
            capabilities: CapabilitySet::new(),
        }
    }

    /// Consult `access`, then create the session.
    pub async fn open(
        store: Arc<dyn RepositoryStore>,
        ctx: SessionContext,
        access: &dyn AccessControl,
    ) -> Result<Self, ProtocolError> {
        access
            .authorize(ctx.service, &ctx.repository, &ctx.peer)
            .await?;
        tracing::info!(
            repository = %ctx.repository,
            service = %ctx.service,
            peer = ?ctx.peer.addr,
            "session opened"
        );
        Ok(Self::new(store, ctx))
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Capabilities agreed with the client, empty before the request is read.
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    fn transition(&mut self, next: SessionState) -> Result<(), ProtocolError> {
        if !self.state.can_move_to(next) {
            return Err(ProtocolError::Session(format!(
                "cannot move from {} to {}",
                self.state, next
            )));
        }
        tracing::debug!(from = %self.state, to = %next, "session transition");
        self.state = next;
        Ok(())
    }

    fn fail(&mut self, error: &ProtocolError) {
        if !self.state.is_terminal() {
            tracing::warn!(
                repository = %self.ctx.repository,
                service = %self.ctx.service,
                state = %self.state,
                %error,
                "session failed"
            );
            self.state = SessionState::Failed;
        }
    }

    async fn collect(&mut self) -> Result<&Advertisement, ProtocolError> {
        let advertisement =
            Advertisement::collect(&*self.store, self.ctx.service, &self.ctx.agent).await?;
        Ok(self.advertisement.insert(advertisement))
    }

    /// Write the ref advertisement.
    pub async fn advertise<W: AsyncWrite + Unpin + Send>(
        &mut self,
        writer: &mut W,
    ) -> Result<(), ProtocolError> {
        let result = async {
            self.transition(SessionState::Advertised)?;
            let stateless = self.ctx.stateless;
            let bytes = self.collect().await?.encode(stateless)?;
            let mut writer = PktLineWriter::new(writer);
            writer.write_raw(&bytes).await?;
            writer.flush().await?;
            Ok::<(), ProtocolError>(())
        }
        .await;
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    /// Stateless requests: the client saw the advertisement in an earlier request, so only
    /// rebuild it for the negotiation without sending it again.
    pub async fn mark_advertised(&mut self) -> Result<(), ProtocolError> {
        let result = async {
            self.transition(SessionState::Advertised)?;
            self.collect().await?;
            Ok::<(), ProtocolError>(())
        }
        .await;
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    /// End a session that never got past the advertisement.
    pub fn close(&mut self) -> Result<(), ProtocolError> {
        self.transition(SessionState::Closed)
    }

    /// Read the request and answer it. Requires a prior advertisement.
    pub async fn serve<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let result = match self.ctx.service {
            ServiceType::UploadPack => self.serve_upload(reader, writer).await,
            ServiceType::ReceivePack => self.serve_receive(reader, writer).await,
        };
        match result {
            Ok(()) => {
                self.transition(SessionState::Closed)?;
                tracing::info!(
                    repository = %self.ctx.repository,
                    service = %self.ctx.service,
                    "session closed"
                );
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                self.report_fatal(writer, &e).await;
                Err(e)
            }
        }
    }

    /// Channel 3 frame for a client that negotiated side-band.
    async fn report_fatal<W: AsyncWrite + Unpin>(&self, writer: &mut W, error: &ProtocolError) {
        let mode = SideBandMode::from_capabilities(&self.capabilities);
        if mode == SideBandMode::Disabled {
            return;
        }
        let mut sideband = SideBandWriter::new(PktLineWriter::new(writer), mode);
        let message = format!("{}: {error}\n", self.ctx.service);
        if let Err(e) = sideband.error(&message).await {
            tracing::debug!(error = %e, "could not deliver the error frame");
        }
    }

    /// Advertise, then serve: the whole exchange over one bidirectional stream.
    pub async fn run<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        self.advertise(writer).await?;
        self.serve(reader, writer).await
    }

    fn advertisement(&self) -> Result<&Advertisement, ProtocolError> {
        self.advertisement
            .as_ref()
            .ok_or_else(|| ProtocolError::Session("request served before advertisement".into()))
    }

    async fn serve_upload<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let store = self.store.clone();
        let hash = store.hash_kind();
        let mut reader = PktLineReader::new(reader);
        let mut writer = PktLineWriter::new(writer);

        let Some(mut request) = UploadRequest::read(&mut reader, hash).await? else {
            tracing::debug!("client ended the session after the advertisement");
            return Ok(());
        };
        self.transition(SessionState::RequestReceived)?;
        request.capabilities.check_object_format(hash)?;
        self.capabilities = self.advertisement()?.capabilities.negotiate(&request.capabilities);
        tracing::debug!(capabilities = %self.capabilities, wants = request.wants.len(), "upload-pack request");
        retain_known_wants(&*store, &mut request).await?;

        let negotiation = negotiate(
            &*store,
            &request,
            &mut reader,
            &mut writer,
            self.ctx.stateless,
            self.ctx.upload,
        )
        .await?;
        self.transition(SessionState::Negotiated)?;

        if negotiation.done {
            let walk = plan_objects(self.advertisement()?, &request, &negotiation, &self.capabilities);
            let count = send_pack(&*store, &walk, &self.capabilities, &mut writer).await?;
            tracing::info!(repository = %self.ctx.repository, objects = count, "pack sent");
        } else {
            writer.flush().await?;
        }
        self.transition(SessionState::ResponseSent)
    }

    async fn serve_receive<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let store = self.store.clone();
        let hash = store.hash_kind();
        let mut reader = PktLineReader::new(reader);
        let mut writer = PktLineWriter::new(writer);

        let Some(mut request) = ReceiveRequest::read(&mut reader, hash).await? else {
            tracing::debug!("push with no commands");
            return Ok(());
        };
        self.transition(SessionState::RequestReceived)?;
        request.capabilities.check_object_format(hash)?;
        self.capabilities = self.advertisement()?.capabilities.negotiate(&request.capabilities);
        tracing::debug!(capabilities = %self.capabilities, commands = request.commands.len(), "receive-pack request");

        let unpacked = if request.needs_pack() {
            match unpack(&*store, reader.get_mut(), self.ctx.policy.max_pack_size).await {
                Ok(count) => Ok(count),
                Err(ProtocolError::Pack(reason)) => {
                    tracing::warn!(repository = %self.ctx.repository, %reason, "unpack failed");
                    Err(reason)
                }
                Err(e) => return Err(e),
            }
        } else {
            Ok(0)
        };
        match &unpacked {
            Ok(_) => {
                apply_commands(
                    &*store,
                    &mut request.commands,
                    &self.capabilities,
                    &self.ctx.policy,
                )
                .await?
            }
            Err(_) => reject_all(&mut request.commands, "unpacker error"),
        }
        self.transition(SessionState::Negotiated)?;

        send_report(&unpacked, &request.commands, &self.capabilities, &mut writer).await?;
        self.transition(SessionState::ResponseSent)
    }
}
