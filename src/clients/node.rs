use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use thiserror::Error;

use crate::state::{
    node_pool::{GuildId, NodeDescriptor, NodeId},
    queue::Track,
};

const AUTHORIZATION_HEADER: &str = "Authorization";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Convenient result alias returning [`NodeError`] failures.
pub type NodeResult<T> = Result<T, NodeError>;

/// Failures talking to an audio node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The HTTP client could not be constructed.
    #[error("failed to build audio node client")]
    ClientBuilder {
        /// Underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// The request never produced a response.
    #[error("request to audio node `{node_id}` failed on `{path}`")]
    Request {
        /// Target node.
        node_id: NodeId,
        /// Request path.
        path: String,
        /// Underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// The node answered with a non-success status.
    #[error("audio node `{node_id}` answered {status} on `{path}`")]
    Status {
        /// Target node.
        node_id: NodeId,
        /// Request path.
        path: String,
        /// Status code returned by the node.
        status: StatusCode,
    },
}

/// Player handle on a node, created by [`NodeClient::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSession {
    /// Node hosting the player.
    pub node_id: NodeId,
    /// Base URL of the node.
    pub address: String,
    /// Secret for the node.
    pub password: Option<String>,
    /// Guild the player streams for.
    pub guild_id: GuildId,
    /// Voice channel the player is attached to.
    pub voice_channel_id: u64,
}

/// Request/response contract of an audio node.
///
/// Track lifecycle events flow back asynchronously through the node event route rather
/// than through these calls.
pub trait NodeClient: Send + Sync {
    /// Create (or reattach) the guild's player on the node.
    fn connect(
        &self,
        node: NodeDescriptor,
        guild_id: GuildId,
        voice_channel_id: u64,
    ) -> BoxFuture<'static, NodeResult<NodeSession>>;
    /// Start a track, optionally at an offset.
    ///
    /// The node echoes `play_id` on every track event of this play.
    fn play(
        &self,
        session: NodeSession,
        track: Track,
        start_ms: u64,
        play_id: u64,
    ) -> BoxFuture<'static, NodeResult<()>>;
    /// Pause the player.
    fn pause(&self, session: NodeSession) -> BoxFuture<'static, NodeResult<()>>;
    /// Resume the player.
    fn resume(&self, session: NodeSession) -> BoxFuture<'static, NodeResult<()>>;
    /// Stop the current track, keeping the player.
    fn stop(&self, session: NodeSession) -> BoxFuture<'static, NodeResult<()>>;
    /// Destroy the player.
    fn disconnect(&self, session: NodeSession) -> BoxFuture<'static, NodeResult<()>>;
    /// Health check used by the heartbeat.
    fn ping(&self, node: NodeDescriptor) -> BoxFuture<'static, NodeResult<()>>;
}

#[derive(Serialize)]
struct ConnectBody {
    voice_channel_id: u64,
}

#[derive(Serialize)]
struct PlayBody {
    identifier: String,
    uri: String,
    start_ms: u64,
    play_id: u64,
}

/// [`NodeClient`] speaking JSON over HTTP.
#[derive(Clone)]
pub struct RestNodeClient {
    client: Client,
}

impl RestNodeClient {
    /// Build the HTTP client.
    pub fn new() -> NodeResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| NodeError::ClientBuilder { source })?;
        Ok(Self { client })
    }

    fn request(
        &self,
        method: Method,
        address: &str,
        password: Option<&str>,
        path: &str,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", address.trim_end_matches('/'), path);
        let builder = self.client.request(method, url);
        match password {
            Some(password) => builder.header(AUTHORIZATION_HEADER, password),
            None => builder,
        }
    }

    async fn send(
        &self,
        node_id: &str,
        path: &str,
        builder: reqwest::RequestBuilder,
    ) -> NodeResult<()> {
        let response = builder.send().await.map_err(|source| NodeError::Request {
            node_id: node_id.to_string(),
            path: path.to_string(),
            source,
        })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(NodeError::Status {
                node_id: node_id.to_string(),
                path: path.to_string(),
                status: response.status(),
            })
        }
    }

    async fn player_action(&self, session: NodeSession, action: &str) -> NodeResult<()> {
        let path = format!("players/{}/{}", session.guild_id, action);
        let builder = self.request(
            Method::POST,
            &session.address,
            session.password.as_deref(),
            &path,
        );
        self.send(&session.node_id, &path, builder).await
    }
}

impl NodeClient for RestNodeClient {
    fn connect(
        &self,
        node: NodeDescriptor,
        guild_id: GuildId,
        voice_channel_id: u64,
    ) -> BoxFuture<'static, NodeResult<NodeSession>> {
        let client = self.clone();
        Box::pin(async move {
            let path = format!("players/{guild_id}");
            let builder = client
                .request(Method::POST, &node.address, node.password.as_deref(), &path)
                .json(&ConnectBody { voice_channel_id });
            client.send(&node.id, &path, builder).await?;
            Ok(NodeSession {
                node_id: node.id,
                address: node.address,
                password: node.password,
                guild_id,
                voice_channel_id,
            })
        })
    }

    fn play(
        &self,
        session: NodeSession,
        track: Track,
        start_ms: u64,
        play_id: u64,
    ) -> BoxFuture<'static, NodeResult<()>> {
        let client = self.clone();
        Box::pin(async move {
            let path = format!("players/{}/play", session.guild_id);
            let builder = client
                .request(
                    Method::POST,
                    &session.address,
                    session.password.as_deref(),
                    &path,
                )
                .json(&PlayBody {
                    identifier: track.identifier,
                    uri: track.uri,
                    start_ms,
                    play_id,
                });
            client.send(&session.node_id, &path, builder).await
        })
    }

    fn pause(&self, session: NodeSession) -> BoxFuture<'static, NodeResult<()>> {
        let client = self.clone();
        Box::pin(async move { client.player_action(session, "pause").await })
    }

    fn resume(&self, session: NodeSession) -> BoxFuture<'static, NodeResult<()>> {
        let client = self.clone();
        Box::pin(async move { client.player_action(session, "resume").await })
    }

    fn stop(&self, session: NodeSession) -> BoxFuture<'static, NodeResult<()>> {
        let client = self.clone();
        Box::pin(async move { client.player_action(session, "stop").await })
    }

    fn disconnect(&self, session: NodeSession) -> BoxFuture<'static, NodeResult<()>> {
        let client = self.clone();
        Box::pin(async move {
            let path = format!("players/{}", session.guild_id);
            let builder = client.request(
                Method::DELETE,
                &session.address,
                session.password.as_deref(),
                &path,
            );
            client.send(&session.node_id, &path, builder).await
        })
    }

    fn ping(&self, node: NodeDescriptor) -> BoxFuture<'static, NodeResult<()>> {
        let client = self.clone();
        Box::pin(async move {
            let path = "health";
            let builder = client.request(Method::GET, &node.address, node.password.as_deref(), path);
            client.send(&node.id, path, builder).await
        })
    }
}
