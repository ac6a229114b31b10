use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;

use crate::state::node_pool::GuildId;

/// Convenient result alias returning [`GatewayError`] failures.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Failures talking to the voice gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Building the HTTP client failed.
    #[error("failed to build voice gateway client")]
    ClientBuilder {
        /// Underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// The request never produced a response.
    #[error("voice gateway request for guild {guild_id} failed")]
    Request {
        /// Guild the request targeted.
        guild_id: GuildId,
        /// Underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// The gateway answered with a non-success status.
    #[error("voice gateway answered {status} for guild {guild_id}")]
    Status {
        /// Guild the request targeted.
        guild_id: GuildId,
        /// Status returned by the gateway.
        status: StatusCode,
    },
}

/// Outbound voice channel membership calls.
pub trait VoiceGateway: Send + Sync {
    /// Join (or move to) a voice channel.
    fn join(&self, guild_id: GuildId, voice_channel_id: u64) -> BoxFuture<'static, GatewayResult<()>>;
    /// Leave the guild's voice channel.
    fn leave(&self, guild_id: GuildId) -> BoxFuture<'static, GatewayResult<()>>;
}

#[derive(Serialize)]
struct JoinBody {
    channel_id: u64,
}

/// [`VoiceGateway`] backed by the gateway sidecar's HTTP API.
#[derive(Clone)]
pub struct HttpVoiceGateway {
    client: Client,
    base_url: Arc<str>,
}

impl HttpVoiceGateway {
    /// Build a client for the gateway listening at `base_url`.
    pub fn new(base_url: &str) -> GatewayResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|source| GatewayError::ClientBuilder { source })?;
        Ok(Self {
            client,
            base_url: Arc::from(base_url.trim_end_matches('/')),
        })
    }

    fn voice_url(&self, guild_id: GuildId) -> String {
        format!("{}/guilds/{}/voice", self.base_url, guild_id)
    }

    fn check(guild_id: GuildId, response: reqwest::Response) -> GatewayResult<()> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(GatewayError::Status {
                guild_id,
                status: response.status(),
            })
        }
    }
}

impl VoiceGateway for HttpVoiceGateway {
    fn join(&self, guild_id: GuildId, voice_channel_id: u64) -> BoxFuture<'static, GatewayResult<()>> {
        let gateway = self.clone();
        Box::pin(async move {
            let response = gateway
                .client
                .put(gateway.voice_url(guild_id))
                .json(&JoinBody {
                    channel_id: voice_channel_id,
                })
                .send()
                .await
                .map_err(|source| GatewayError::Request { guild_id, source })?;
            Self::check(guild_id, response)
        })
    }

    fn leave(&self, guild_id: GuildId) -> BoxFuture<'static, GatewayResult<()>> {
        let gateway = self.clone();
        Box::pin(async move {
            let response = gateway
                .client
                .delete(gateway.voice_url(guild_id))
                .send()
                .await
                .map_err(|source| GatewayError::Request { guild_id, source })?;
            Self::check(guild_id, response)
        })
    }
}
