//! AsyncDht node.

use std::time::Duration;

use bytes::Bytes;

use crate::{
    actor::Info,
    common::{DataEntry, Message, NodeId, PeerDescriptor, RecursiveOperation, RouteMessageAck},
    dht::{ActorMessage, Dht, DhtLookupError, DhtStoreError, DhtWasShutdown},
    finder::RecursiveOperationResult,
};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub async fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.0.send_actor_message(ActorMessage::Info(sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Wait until the bootstrapping lookup is done.
    pub async fn bootstrapped(&self) -> Result<bool, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<bool>(1);

        self.0
            .send_actor_message(ActorMessage::Bootstrapped(sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Stream of routed messages addressed to this node by other applications.
    pub fn messages(&self) -> flume::r#async::RecvStream<'static, Message> {
        self.0.messages().into_stream()
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop.
    pub async fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0.send_actor_message(ActorMessage::Shutdown(sender));
        let _ = receiver.recv_async().await;
    }

    /// Async version of [Dht::ping]
    pub async fn ping(&self, peer: &PeerDescriptor) -> Result<bool, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<bool>(1);

        self.0
            .send_actor_message(ActorMessage::Ping(peer.clone(), sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    // === Lookups ===

    /// Async version of [Dht::find_closest_nodes]
    pub async fn find_closest_nodes(
        &self,
        target: NodeId,
    ) -> Result<Vec<PeerDescriptor>, DhtLookupError> {
        Ok(self
            .lookup(target, RecursiveOperation::FindClosestNodes, false)
            .await?
            .closest_nodes)
    }

    /// Async version of [Dht::find_data]
    pub async fn find_data(&self, key: NodeId) -> Result<Vec<DataEntry>, DhtLookupError> {
        Ok(self
            .lookup(key, RecursiveOperation::FindData, false)
            .await?
            .data_entries)
    }

    /// Async version of [Dht::find_recursively]
    pub async fn find_recursively(
        &self,
        target: NodeId,
        operation: RecursiveOperation,
    ) -> Result<RecursiveOperationResult, DhtLookupError> {
        self.lookup(target, operation, true).await
    }

    // === Data ===

    /// Async version of [Dht::store_data]
    pub async fn store_data(
        &self,
        key: NodeId,
        data: impl Into<Bytes>,
        ttl: Option<Duration>,
    ) -> Result<Vec<PeerDescriptor>, DhtStoreError> {
        let (sender, receiver) = flume::bounded(1);

        self.0
            .send_actor_message(ActorMessage::Store(key, data.into(), ttl, sender))?;

        Ok(receiver.recv_async().await.map_err(|_| DhtWasShutdown)??)
    }

    /// Async version of [Dht::delete_data]
    pub async fn delete_data(&self, key: NodeId) -> Result<Vec<PeerDescriptor>, DhtStoreError> {
        let (sender, receiver) = flume::bounded(1);

        self.0
            .send_actor_message(ActorMessage::Delete(key, sender))?;

        Ok(receiver.recv_async().await.map_err(|_| DhtWasShutdown)??)
    }

    /// Async version of [Dht::local_entries]
    pub async fn local_entries(&self, key: NodeId) -> Result<Vec<DataEntry>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<DataEntry>>(1);

        self.0
            .send_actor_message(ActorMessage::LocalEntries(key, sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    // === Routing ===

    /// Async version of [Dht::send]
    pub async fn send(&self, message: Message) -> Result<RouteMessageAck, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<RouteMessageAck>(1);

        self.0
            .send_actor_message(ActorMessage::Send(message, sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    // === Private Methods ===

    async fn lookup(
        &self,
        target: NodeId,
        operation: RecursiveOperation,
        recursive: bool,
    ) -> Result<RecursiveOperationResult, DhtLookupError> {
        let (sender, receiver) = flume::bounded(1);

        self.0.send_actor_message(ActorMessage::Lookup {
            target,
            operation,
            recursive,
            sender,
        })?;

        Ok(receiver.recv_async().await.map_err(|_| DhtWasShutdown)??)
    }
}
