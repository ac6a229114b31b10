use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use crate::{
    clients::node::{NodeClient, NodeResult, NodeSession},
    state::{
        node_pool::{GuildId, NodeDescriptor},
        queue::Track,
    },
};

/// Node client that accepts every request and records the calls it saw.
#[derive(Clone, Default)]
pub struct FakeNodeClient {
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeNodeClient {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> BoxFuture<'static, NodeResult<()>> {
        self.calls.lock().unwrap().push(call);
        Box::pin(async { Ok(()) })
    }
}

impl NodeClient for FakeNodeClient {
    fn connect(
        &self,
        node: NodeDescriptor,
        guild_id: GuildId,
        voice_channel_id: u64,
    ) -> BoxFuture<'static, NodeResult<NodeSession>> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("connect {} {guild_id}", node.id));
        Box::pin(async move {
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
        _play_id: u64,
    ) -> BoxFuture<'static, NodeResult<()>> {
        self.record(format!("play {} {} {start_ms}", session.node_id, track.identifier))
    }

    fn pause(&self, session: NodeSession) -> BoxFuture<'static, NodeResult<()>> {
        self.record(format!("pause {}", session.node_id))
    }

    fn resume(&self, session: NodeSession) -> BoxFuture<'static, NodeResult<()>> {
        self.record(format!("resume {}", session.node_id))
    }

    fn stop(&self, session: NodeSession) -> BoxFuture<'static, NodeResult<()>> {
        self.record(format!("stop {}", session.node_id))
    }

    fn disconnect(&self, session: NodeSession) -> BoxFuture<'static, NodeResult<()>> {
        self.record(format!("disconnect {}", session.node_id))
    }

    fn ping(&self, node: NodeDescriptor) -> BoxFuture<'static, NodeResult<()>> {
        self.record(format!("ping {}", node.id))
    }
}
