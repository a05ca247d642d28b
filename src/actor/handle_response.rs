use tracing::trace;

use crate::common::{
    methods, ClosestPeersResponse, DeleteDataResponse, FindDataResponse, HandshakeResponse,
    RequestConnectionResponse, RouteMessageAck, StoreDataResponse,
};
use crate::finder::PeerResponse;
use crate::rpc::{RpcError, RpcResponse};

use super::{Actor, TickReport};

impl Actor {
    /// Settle one of our requests, answered or failed, with the component that sent it.
    pub(super) fn handle_response(&mut self, response: RpcResponse, report: &mut TickReport) {
        let request_id = response.request_id;

        match &response.result {
            Ok(_) => self
                .state
                .add_contact(response.peer.clone(), &mut self.outbox),
            // The peer is gone, or was never reachable.
            Err(RpcError::Timeout | RpcError::Transport(_)) => {
                self.state.remove_contact(response.peer.node_id())
            }
            Err(error) => {
                trace!(?request_id, method = ?response.method, ?error, "Rpc request failed");
            }
        }

        if self.pings.remove(&request_id) {
            report
                .done_pings
                .push((request_id, response.result.is_ok()));

            return;
        }

        let state = &mut self.state;

        if state.finder.owns(&request_id) {
            let result = match response.method.as_str() {
                methods::FIND_DATA => {
                    response
                        .decode::<FindDataResponse>()
                        .map(|found| PeerResponse {
                            peers: found.peers,
                            entries: found.entries,
                        })
                }
                _ => response
                    .decode::<ClosestPeersResponse>()
                    .map(|closest| PeerResponse {
                        peers: closest.peers,
                        entries: vec![],
                    }),
            };

            state.finder.on_response(&request_id, result);
        } else if state.router.owns(&request_id) {
            let (router, _, mut io) = state.split(&mut self.outbox);

            router.on_response(&request_id, response.decode::<RouteMessageAck>(), &mut io);
        } else if state.store_manager.owns(&request_id) {
            let accepted = match response.method.as_str() {
                methods::DELETE_DATA => response
                    .decode::<DeleteDataResponse>()
                    .map(|deleted| deleted.deleted),
                _ => response
                    .decode::<StoreDataResponse>()
                    .map(|stored| stored.error.is_empty()),
            }
            .unwrap_or(false);

            state.store_manager.on_response(
                &request_id,
                accepted,
                &state.local,
                &mut state.local_store,
                &mut self.outbox,
            );
        } else if state.connections.owns(&request_id) {
            let accepted = match response.method.as_str() {
                methods::REQUEST_CONNECTION => response
                    .decode::<RequestConnectionResponse>()
                    .map(|requested| requested.accepted),
                _ => response
                    .decode::<HandshakeResponse>()
                    .map(|handshake| handshake.accepted),
            };

            state.connections.on_response(&request_id, accepted);
        } else {
            trace!(?request_id, method = ?response.method, "Settled a request nobody waits for");
        }
    }
}
