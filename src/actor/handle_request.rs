use tracing::trace;

use crate::common::{
    methods, ClosestPeersRequest, ClosestPeersResponse, DeleteDataRequest, DeleteDataResponse,
    Empty, FindDataRequest, FindDataResponse, HandshakeRequest, HandshakeResponse, NodeId,
    PeerDescriptor, PingRequest, PingResponse, RecursiveOperationResponse, ReplicateDataRequest,
    RequestConnectionRequest, RequestConnectionResponse, RouteMessageAck, RouteMessageWrapper,
    StoreDataRequest, StoreDataResponse, MAX_BUCKET_SIZE_K,
};
use crate::finder::handle_routed_request;
use crate::router::Routing;
use crate::rpc::{CallContext, RpcCommunicator, RpcError};

use super::NodeState;

/// Register the handler of every DHT method.
pub(super) fn register_rpc_methods(rpc: &mut RpcCommunicator<NodeState>) -> Result<(), RpcError> {
    rpc.register_rpc_method(methods::PING, ping)?;
    rpc.register_rpc_method(methods::GET_CLOSEST_PEERS, get_closest_peers)?;
    rpc.register_rpc_method(methods::FIND_DATA, find_data)?;
    rpc.register_rpc_method(methods::ROUTE_MESSAGE, route_message)?;
    rpc.register_rpc_method(methods::FORWARD_MESSAGE, forward_message)?;
    rpc.register_rpc_method(methods::FIND_RECURSIVELY, find_recursively)?;
    rpc.register_rpc_method(
        methods::SEND_RECURSIVE_OPERATION_RESPONSE,
        recursive_operation_response,
    )?;
    rpc.register_rpc_method(methods::STORE_DATA, store_data)?;
    rpc.register_rpc_method(methods::DELETE_DATA, delete_data)?;
    rpc.register_rpc_method(methods::REPLICATE_DATA, replicate_data)?;
    rpc.register_rpc_method(methods::HANDSHAKE, handshake)?;
    rpc.register_rpc_method(methods::REQUEST_CONNECTION, request_connection)?;

    Ok(())
}

/// Every peer sending us a request is a live contact.
fn contact(state: &mut NodeState, context: &mut CallContext<'_>) -> PeerDescriptor {
    let source = context.source().clone();

    state.add_contact(source.clone(), context.outbox());

    source
}

/// Our closest known peers to `target`, leaving out the one asking.
fn closest_peers(state: &NodeState, target: &NodeId, source: &PeerDescriptor) -> Vec<PeerDescriptor> {
    state
        .routing_table
        .closest_n(target, MAX_BUCKET_SIZE_K + 1)
        .into_iter()
        .filter(|peer| peer != source)
        .take(MAX_BUCKET_SIZE_K)
        .collect()
}

fn ping(
    state: &mut NodeState,
    request: PingRequest,
    context: &mut CallContext<'_>,
) -> Result<PingResponse, RpcError> {
    contact(state, context);

    Ok(PingResponse {
        request_id: request.request_id,
    })
}

fn get_closest_peers(
    state: &mut NodeState,
    request: ClosestPeersRequest,
    context: &mut CallContext<'_>,
) -> Result<ClosestPeersResponse, RpcError> {
    let source = contact(state, context);

    Ok(ClosestPeersResponse {
        peers: closest_peers(state, &request.node_id, &source),
        request_id: request.request_id,
    })
}

fn find_data(
    state: &mut NodeState,
    request: FindDataRequest,
    context: &mut CallContext<'_>,
) -> Result<FindDataResponse, RpcError> {
    let source = contact(state, context);

    Ok(FindDataResponse {
        peers: closest_peers(state, &request.key, &source),
        entries: state.local_store.entries_for(&request.key),
        request_id: request.request_id,
    })
}

fn route_message(
    state: &mut NodeState,
    wrapper: RouteMessageWrapper,
    context: &mut CallContext<'_>,
) -> Result<RouteMessageAck, RpcError> {
    contact(state, context);

    let (router, _, mut io) = state.split(context.outbox());

    Ok(router.route_message(wrapper, &mut io))
}

fn forward_message(
    state: &mut NodeState,
    wrapper: RouteMessageWrapper,
    context: &mut CallContext<'_>,
) -> Result<RouteMessageAck, RpcError> {
    contact(state, context);

    let (router, _, mut io) = state.split(context.outbox());

    Ok(router.forward_message(wrapper, &mut io))
}

/// Serve a hop of a recursive operation, reporting to its origin.
fn find_recursively(
    state: &mut NodeState,
    wrapper: RouteMessageWrapper,
    context: &mut CallContext<'_>,
) -> Result<RouteMessageAck, RpcError> {
    contact(state, context);

    let local_entries = state.local_store.entries_for(&wrapper.target);

    let (router, finder, mut io) = state.split(context.outbox());

    let (ack, report) = handle_routed_request(wrapper, local_entries, router, &mut io)?;

    if let Some((origin, report)) = report {
        if origin.node_id() == io.local.node_id() {
            finder.on_report(report);
        } else {
            trace!(session_id = ?report.session_id, to = ?origin.node_id(), "Reporting to origin");

            io.outbox
                .call(methods::SEND_RECURSIVE_OPERATION_RESPONSE, &report, &origin);
        }
    }

    Ok(ack)
}

fn recursive_operation_response(
    state: &mut NodeState,
    response: RecursiveOperationResponse,
    context: &mut CallContext<'_>,
) -> Result<Empty, RpcError> {
    contact(state, context);

    state.finder.on_report(response);

    Ok(Empty {})
}

fn store_data(
    state: &mut NodeState,
    request: StoreDataRequest,
    context: &mut CallContext<'_>,
) -> Result<StoreDataResponse, RpcError> {
    let source = contact(state, context);

    Ok(state.store_manager.handle_store_data(
        request,
        &source,
        &state.local,
        &state.routing_table,
        &mut state.local_store,
    ))
}

fn delete_data(
    state: &mut NodeState,
    request: DeleteDataRequest,
    context: &mut CallContext<'_>,
) -> Result<DeleteDataResponse, RpcError> {
    let source = contact(state, context);

    Ok(state
        .store_manager
        .handle_delete_data(request, &source, &mut state.local_store))
}

fn replicate_data(
    state: &mut NodeState,
    request: ReplicateDataRequest,
    context: &mut CallContext<'_>,
) -> Result<Empty, RpcError> {
    let source = contact(state, context);

    state.store_manager.handle_replicate_data(
        request,
        &source,
        &state.local,
        &state.routing_table,
        &mut state.local_store,
        context.outbox(),
    );

    Ok(Empty {})
}

fn handshake(
    state: &mut NodeState,
    request: HandshakeRequest,
    context: &mut CallContext<'_>,
) -> Result<HandshakeResponse, RpcError> {
    // Accept first, so adding the contact finds the connection open.
    let response = state
        .connections
        .on_handshake_request(context.source(), request);

    contact(state, context);

    Ok(response)
}

fn request_connection(
    state: &mut NodeState,
    request: RequestConnectionRequest,
    context: &mut CallContext<'_>,
) -> Result<RequestConnectionResponse, RpcError> {
    let source = contact(state, context);

    Ok(state
        .connections
        .on_request_connection(&source, request, context.outbox()))
}
