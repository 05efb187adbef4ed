//! Gateway configuration, read from a YAML file.
//!
//! Every section and key is optional; anything left out keeps its default, and a missing file
//! yields [`GatewayConfig::default`].

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    errors::GatewayError,
    protocol::{receive::ReceivePolicy, upload::UploadPolicy},
};

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub repo: RepoConfig,
    pub access: AccessConfig,
    pub receive: ReceiveConfig,
    pub upload: UploadConfig,
    pub http: HttpConfig,
    /// Advertised as `agent=<value>`; the crate name and version when unset.
    pub agent: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    pub ssh_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            ssh_port: 2222,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RepoConfig {
    pub scan_path: PathBuf,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            scan_path: PathBuf::from("./repos"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AccessConfig {
    pub allow_fetch: bool,
    pub allow_push: bool,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            allow_fetch: true,
            allow_push: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ReceiveConfig {
    pub deny_non_fast_forwards: bool,
    pub deny_deletes: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct UploadConfig {
    /// Answer the first common `have` with `ACK <id>` instead of `NAK`.
    pub ack_common: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct HttpConfig {
    /// Plain byte count or a size such as `"512M"`.
    #[serde(deserialize_with = "string_or_usize")]
    pub max_request_body: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_request_body: 512 * 1024 * 1024,
        }
    }
}

impl GatewayConfig {
    /// Load `path`, falling back to the defaults when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_yaml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(GatewayError::Io(e)),
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self, GatewayError> {
        serde_yaml::from_str(text).map_err(|e| GatewayError::Config(e.to_string()))
    }

    pub fn http_addr(&self) -> Result<SocketAddr, GatewayError> {
        socket_addr(&self.server.host, self.server.http_port)
    }

    pub fn ssh_addr(&self) -> Result<SocketAddr, GatewayError> {
        socket_addr(&self.server.host, self.server.ssh_port)
    }

    pub fn receive_policy(&self) -> ReceivePolicy {
        ReceivePolicy {
            deny_non_fast_forwards: self.receive.deny_non_fast_forwards,
            deny_deletes: self.receive.deny_deletes,
            max_pack_size: self.http.max_request_body,
        }
    }

    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy {
            ack_common: self.upload.ack_common,
        }
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr, GatewayError> {
    format!("{host}:{port}")
        .parse()
        .map_err(|e| GatewayError::Config(format!("invalid listen address {host}:{port}: {e}")))
}

/// Parse `"64K"`, `"512M"`, `"2G"` or a bare number of bytes.
fn parse_size(text: &str) -> Option<usize> {
    let text = text.trim();
    let (digits, scale) = match text.char_indices().last()? {
        (i, 'k' | 'K') => (&text[..i], 1usize << 10),
        (i, 'm' | 'M') => (&text[..i], 1 << 20),
        (i, 'g' | 'G') => (&text[..i], 1 << 30),
        _ => (text, 1),
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(scale)
}

fn string_or_usize<'deserialize, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'deserialize>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrUSize {
        String(String),
        USize(usize),
    }

    match StringOrUSize::deserialize(deserializer)? {
        StringOrUSize::USize(v) => Ok(v),
        StringOrUSize::String(v) => parse_size(&v)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid size `{v}`"))),
    }
}
