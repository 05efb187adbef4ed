//! SSH binding.
//!
//! Every session channel collects `env` requests and then runs exactly one `exec`, whose
//! command line is `git-upload-pack '<repo>'` or `git-receive-pack '<repo>'`. The exchange is
//! framed straight over the channel with no HTTP-style preamble, then the channel gets an
//! exit status, EOF and close. Shells, subsystems and any other command end the channel with
//! exit status 1.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use russh::{
    Channel, ChannelId, CryptoVec,
    server::{self, Auth, Handle, Msg, Server as _, Session as SshSession},
};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::io::AsyncWriteExt;

use super::{
    access::Peer,
    types::{ProtocolError, ServiceType},
};
use crate::{errors::GatewayError, gateway::Gateway};

/// Extended data type for stderr.
const STDERR: u32 = 1;

/// Parse an exec command line into the service and repository name.
pub fn parse_exec(command: &str) -> Result<(ServiceType, String), ProtocolError> {
    let args = shlex::split(command)
        .ok_or_else(|| ProtocolError::invalid_request("unbalanced quotes in command"))?;
    let [program, repo] = args.as_slice() else {
        return Err(ProtocolError::InvalidRequest(format!(
            "expected `<service> <repository>`, got {} arguments",
            args.len()
        )));
    };
    let service = program.parse::<ServiceType>()?;
    let repo = repo.trim_start_matches('/');
    if repo.is_empty() {
        return Err(ProtocolError::invalid_request("empty repository name"));
    }
    Ok((service, repo.to_string()))
}

/// Server settings with a freshly generated ed25519 host key.
pub fn server_config() -> server::Config {
    server::Config {
        inactivity_timeout: Some(Duration::from_secs(3600)),
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![KeyPair::generate_ed25519().expect("ed25519 key generation")],
        ..Default::default()
    }
}

/// Accept SSH connections on `addr` until the listener fails.
pub async fn serve(gateway: Gateway, addr: SocketAddr) -> std::io::Result<()> {
    let mut server = SshServer {
        gateway: Arc::new(gateway),
    };
    tracing::info!(%addr, "SSH gateway listening");
    server
        .run_on_address(Arc::new(server_config()), addr)
        .await
}

pub struct SshServer {
    gateway: Arc<Gateway>,
}

impl server::Server for SshServer {
    type Handler = SshConnection;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> SshConnection {
        tracing::debug!(peer = ?peer_addr, "SSH connection accepted");
        SshConnection {
            gateway: self.gateway.clone(),
            peer: Peer {
                addr: peer_addr,
                user: None,
            },
            channels: HashMap::new(),
        }
    }
}

/// A session channel waiting for its `exec`.
struct PendingChannel {
    channel: Channel<Msg>,
    env: HashMap<String, String>,
}

pub struct SshConnection {
    gateway: Arc<Gateway>,
    peer: Peer,
    channels: HashMap<ChannelId, PendingChannel>,
}

impl SshConnection {
    fn reject(&mut self, channel: ChannelId, message: &str, session: &mut SshSession) {
        tracing::warn!(peer = ?self.peer.addr, message, "SSH channel request rejected");
        self.channels.remove(&channel);
        session.extended_data(
            channel,
            STDERR,
            CryptoVec::from_slice(format!("fatal: {message}\n").as_bytes()),
        );
        session.exit_status_request(channel, 1);
        session.eof(channel);
        session.close(channel);
    }
}

#[async_trait]
impl server::Handler for SshConnection {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        self.peer.user = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.peer.user = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(
            channel.id(),
            PendingChannel {
                channel,
                env: HashMap::new(),
            },
        );
        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        if let Some(pending) = self.channels.get_mut(&channel) {
            tracing::debug!(variable_name, variable_value, "SSH env request");
            pending
                .env
                .insert(variable_name.to_string(), variable_value.to_string());
            session.channel_success(channel);
        } else {
            session.channel_failure(channel);
        }
        Ok(())
    }

    /// `auth-agent-req@openssh.com`: acknowledged, never used.
    async fn agent_request(
        &mut self,
        _channel: ChannelId,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        self.reject(channel, "interactive shells are not supported", session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        self.reject(channel, &format!("subsystem `{name}` is not supported"), session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data);
        let (service, repo) = match parse_exec(&command) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.reject(channel, &e.to_string(), session);
                return Ok(());
            }
        };
        let Some(pending) = self.channels.remove(&channel) else {
            session.channel_failure(channel);
            return Ok(());
        };
        session.channel_success(channel);

        let handle = session.handle();
        let gateway = self.gateway.clone();
        let peer = self.peer.clone();
        tokio::spawn(async move {
            let status = run_exec(&gateway, service, &repo, pending, peer, &handle).await;
            let _ = handle.exit_status_request(channel, status).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });
        Ok(())
    }
}

/// Run one exec to completion and return the channel's exit status.
async fn run_exec(
    gateway: &Gateway,
    service: ServiceType,
    repo: &str,
    pending: PendingChannel,
    peer: Peer,
    handle: &Handle,
) -> u32 {
    let PendingChannel { channel, env } = pending;
    let id = channel.id();
    let mut session = match gateway
        .open_session(repo, service, false, env, peer)
        .await
    {
        Ok(session) => session,
        Err(e) => return report_failure(handle, id, e).await,
    };

    let (mut reader, mut writer) = tokio::io::split(channel.into_stream());
    let result = session.run(&mut reader, &mut writer).await;
    let _ = writer.flush().await;
    match result {
        Ok(()) => 0,
        Err(e) => report_failure(handle, id, e.into()).await,
    }
}

async fn report_failure(handle: &Handle, channel: ChannelId, error: GatewayError) -> u32 {
    tracing::warn!(%error, "SSH exec failed");
    let message = format!("fatal: {error}\n");
    let _ = handle
        .extended_data(channel, STDERR, CryptoVec::from_slice(message.as_bytes()))
        .await;
    error.exit_status()
}

#[cfg(test)]
mod tests {
    use super::parse_exec;
    use crate::protocol::types::{ProtocolError, ServiceType};

    #[test]
    fn exec_command_lines() {
        assert_eq!(
            parse_exec("git-upload-pack '/group/repo.git'").unwrap(),
            (ServiceType::UploadPack, "group/repo.git".to_string())
        );
        assert_eq!(
            parse_exec("git-receive-pack repo").unwrap(),
            (ServiceType::ReceivePack, "repo".to_string())
        );
        assert!(matches!(
            parse_exec("rm -rf /"),
            Err(ProtocolError::InvalidRequest(_))
        ));
        assert!(matches!(
            parse_exec("git-upload-archive repo"),
            Err(ProtocolError::InvalidService(_))
        ));
        assert!(parse_exec("git-upload-pack 'unterminated").is_err());
        assert!(parse_exec("git-upload-pack /").is_err());
    }
}
