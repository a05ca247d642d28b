//! Transport-agnostic request/response correlation, timeouts and per-method dispatch.
//!
//! Handlers never send directly; they queue calls in an [Outbox] which the
//! owner flushes through [RpcCommunicator::flush] once the handler returns.
//! Every queued call gets its [RequestId] immediately, so callers can track
//! it before it leaves the node.

mod inflight_requests;

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::time::Duration;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, trace};

use crate::common::{
    decode, encode, Message, MessageBody, PeerDescriptor, RequestId, RpcErrorCode, RpcMessage,
    RpcPayload,
};
use crate::transport::Transport;

use inflight_requests::InflightRequests;

/// Default deadline of an outbound call.
pub const DEFAULT_RPC_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Classified failure of a single RPC call.
pub enum RpcError {
    /// No answer within the call's deadline.
    #[error("Rpc request timed out")]
    Timeout,

    /// The remote has no handler for the invoked method.
    #[error("Unknown rpc method: {0}")]
    UnknownRpcMethod(String),

    /// A second handler was registered for the same method.
    #[error("Rpc method {0} is already registered")]
    DuplicateRpcMethod(String),

    /// The handler failed, locally or on the remote.
    #[error("Rpc handler failed: {0}")]
    Handler(String),

    /// The request could not be handed to the transport.
    #[error("Failed to send rpc request: {0}")]
    Transport(String),

    /// The payload could not be encoded or decoded.
    #[error("Invalid rpc payload: {0}")]
    Payload(String),
}

type Handler<S> =
    Box<dyn FnMut(&mut S, &[u8], &mut CallContext<'_>) -> Result<Bytes, RpcError> + Send>;

/// What a handler knows about the call it is serving.
pub struct CallContext<'a> {
    source: &'a PeerDescriptor,
    outbox: &'a mut Outbox,
}

impl<'a> CallContext<'a> {
    pub fn new(source: &'a PeerDescriptor, outbox: &'a mut Outbox) -> Self {
        Self { source, outbox }
    }

    /// The peer that sent the request.
    pub fn source(&self) -> &PeerDescriptor {
        self.source
    }

    pub fn outbox(&mut self) -> &mut Outbox {
        self.outbox
    }
}

#[derive(Debug)]
pub struct OutgoingCall {
    pub request_id: RequestId,
    pub method: String,
    pub target: PeerDescriptor,
    body: Result<Bytes, RpcError>,
    timeout: Option<Duration>,
}

#[derive(Debug, Default)]
/// Calls queued for the next [RpcCommunicator::flush].
pub struct Outbox {
    calls: Vec<OutgoingCall>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a call with the communicator's default deadline.
    pub fn call<Req: Serialize>(
        &mut self,
        method: &str,
        request: &Req,
        target: &PeerDescriptor,
    ) -> RequestId {
        self.call_with_timeout(method, request, target, None)
    }

    /// Queue a call, overriding the deadline when `timeout` is set.
    pub fn call_with_timeout<Req: Serialize>(
        &mut self,
        method: &str,
        request: &Req,
        target: &PeerDescriptor,
        timeout: Option<Duration>,
    ) -> RequestId {
        let request_id = RequestId::random();

        self.calls.push(OutgoingCall {
            request_id,
            method: method.to_string(),
            target: target.clone(),
            body: encode(request).map_err(|error| RpcError::Payload(error.to_string())),
            timeout,
        });

        request_id
    }

    pub fn calls(&self) -> &[OutgoingCall] {
        &self.calls
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}

#[derive(Debug, Clone)]
/// The settled outcome of an outbound call.
pub struct RpcResponse {
    pub request_id: RequestId,
    pub method: String,
    /// The peer the request was sent to.
    pub peer: PeerDescriptor,
    pub result: Result<Bytes, RpcError>,
}

impl RpcResponse {
    /// Decode the response body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        match &self.result {
            Ok(body) => decode(body).map_err(|error| RpcError::Payload(error.to_string())),
            Err(error) => Err(error.clone()),
        }
    }
}

/// Sends typed requests to remote peers and dispatches incoming ones to
/// registered handlers operating on the node state `S`.
pub struct RpcCommunicator<S> {
    local: PeerDescriptor,
    service_id: String,
    transport: Box<dyn Transport>,
    methods: HashMap<String, Handler<S>>,
    inflight: InflightRequests,
    request_timeout: Duration,
    failed: Vec<RpcResponse>,
}

impl<S> RpcCommunicator<S> {
    pub fn new(
        local: PeerDescriptor,
        service_id: impl Into<String>,
        transport: Box<dyn Transport>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            local,
            service_id: service_id.into(),
            transport,
            methods: HashMap::new(),
            inflight: InflightRequests::new(),
            request_timeout,
            failed: Vec::new(),
        }
    }

    // === Getters ===

    pub fn local_peer_descriptor(&self) -> &PeerDescriptor {
        &self.local
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Returns true if this request is still awaiting an answer.
    pub fn is_inflight(&self, request_id: &RequestId) -> bool {
        self.inflight.contains(request_id)
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    // === Public Methods ===

    /// Register the handler of `method`. Registering the same method twice is an error.
    pub fn register_rpc_method<Req, Res, F>(
        &mut self,
        method: &str,
        mut handler: F,
    ) -> Result<(), RpcError>
    where
        S: 'static,
        Req: DeserializeOwned + 'static,
        Res: Serialize + 'static,
        F: FnMut(&mut S, Req, &mut CallContext<'_>) -> Result<Res, RpcError> + Send + 'static,
    {
        if self.methods.contains_key(method) {
            return Err(RpcError::DuplicateRpcMethod(method.to_string()));
        }

        self.methods.insert(
            method.to_string(),
            Box::new(move |state: &mut S, body: &[u8], context: &mut CallContext<'_>| {
                let request: Req =
                    decode(body).map_err(|error| RpcError::Payload(error.to_string()))?;

                let response = handler(state, request, context)?;

                encode(&response).map_err(|error| RpcError::Payload(error.to_string()))
            }),
        );

        Ok(())
    }

    /// Send a request right away and return its [RequestId]. The outcome is
    /// returned by [Self::handle_incoming_message] or [Self::take_failures].
    pub fn call<Req: Serialize>(
        &mut self,
        method: &str,
        request: &Req,
        target: &PeerDescriptor,
    ) -> RequestId {
        let mut outbox = Outbox::new();
        let request_id = outbox.call(method, request, target);

        self.flush(&mut outbox);

        request_id
    }

    /// Send every call queued in the `outbox`.
    pub fn flush(&mut self, outbox: &mut Outbox) {
        for call in outbox.calls.drain(..) {
            let OutgoingCall {
                request_id,
                method,
                target,
                body,
                timeout,
            } = call;

            let sent = body.and_then(|body| {
                let message = RpcMessage {
                    request_id,
                    method: method.clone(),
                    payload: RpcPayload::Request(body),
                };

                self.send_rpc_message(&target, message)
            });

            match sent {
                Ok(()) => {
                    self.inflight.add(
                        request_id,
                        &method,
                        target,
                        timeout.unwrap_or(self.request_timeout),
                    );
                }
                Err(error) => {
                    debug!(?request_id, ?method, ?error, "Failed to send rpc request");

                    self.failed.push(RpcResponse {
                        request_id,
                        method,
                        peer: target,
                        result: Err(error),
                    });
                }
            }
        }
    }

    /// Receive a single [Message] from the transport, if any.
    pub fn recv(&mut self) -> Option<Message> {
        let bytes = self.transport.recv()?;

        match Message::from_bytes(&bytes) {
            Ok(message) => {
                trace!(context = "rpc_message_receiving", ?message);
                Some(message)
            }
            Err(error) => {
                trace!(
                    context = "rpc_error",
                    ?error,
                    message = ?String::from_utf8_lossy(&bytes),
                    "Received invalid Bencode message."
                );
                None
            }
        }
    }

    /// Dispatch an incoming message.
    ///
    /// Requests are answered through the registered handler, responses and
    /// errors settle the matching inflight request and are returned.
    pub fn handle_incoming_message(
        &mut self,
        state: &mut S,
        message: Message,
        outbox: &mut Outbox,
    ) -> Option<RpcResponse> {
        if message.service_id != self.service_id {
            trace!(service_id = ?message.service_id, "Ignoring message for another service");
            return None;
        }

        let MessageBody::Rpc(rpc) = message.body else {
            debug!(from = ?message.source.node_id(), "Ignoring non-rpc message");
            return None;
        };

        match rpc.payload {
            RpcPayload::Request(body) => {
                self.handle_request(
                    state,
                    &message.source,
                    rpc.request_id,
                    rpc.method,
                    &body,
                    outbox,
                );

                None
            }
            RpcPayload::Response(body) => self.settle(rpc.request_id, &message.source, Ok(body)),
            RpcPayload::Error { code, description } => {
                let error = match code {
                    RpcErrorCode::UnknownRpcMethod => RpcError::UnknownRpcMethod(rpc.method),
                    RpcErrorCode::ServerError => RpcError::Handler(description),
                };

                self.settle(rpc.request_id, &message.source, Err(error))
            }
        }
    }

    /// Calls that failed to send, and calls whose deadline passed.
    pub fn take_failures(&mut self) -> Vec<RpcResponse> {
        let mut failures = std::mem::take(&mut self.failed);

        for request in self.inflight.cleanup() {
            debug!(request_id = ?request.request_id, method = ?request.method, to = ?request.to.node_id(), "Rpc request timed out");

            failures.push(RpcResponse {
                request_id: request.request_id,
                method: request.method,
                peer: request.to,
                result: Err(RpcError::Timeout),
            });
        }

        failures
    }

    // === Private Methods ===

    fn handle_request(
        &mut self,
        state: &mut S,
        source: &PeerDescriptor,
        request_id: RequestId,
        method: String,
        body: &[u8],
        outbox: &mut Outbox,
    ) {
        let result = match self.methods.get_mut(&method) {
            Some(handler) => {
                let mut context = CallContext::new(source, outbox);
                handler(state, body, &mut context)
            }
            None => Err(RpcError::UnknownRpcMethod(method.clone())),
        };

        let payload = match result {
            Ok(body) => RpcPayload::Response(body),
            Err(RpcError::UnknownRpcMethod(method)) => {
                debug!(?method, from = ?source.node_id(), "Unknown rpc method");

                RpcPayload::Error {
                    code: RpcErrorCode::UnknownRpcMethod,
                    description: method,
                }
            }
            Err(error) => {
                debug!(?method, ?error, from = ?source.node_id(), "Rpc handler failed");

                RpcPayload::Error {
                    code: RpcErrorCode::ServerError,
                    description: error.to_string(),
                }
            }
        };

        let response = RpcMessage {
            request_id,
            method,
            payload,
        };

        if let Err(error) = self.send_rpc_message(source, response) {
            debug!(?error, to = ?source.node_id(), "Failed to send rpc response");
        }
    }

    fn settle(
        &mut self,
        request_id: RequestId,
        from: &PeerDescriptor,
        result: Result<Bytes, RpcError>,
    ) -> Option<RpcResponse> {
        match self.inflight.remove(&request_id, from.node_id()) {
            Some(request) => Some(RpcResponse {
                request_id,
                method: request.method,
                // Prefer the descriptor the peer sent, it may be more recent.
                peer: from.clone(),
                result,
            }),
            None => {
                trace!(
                    context = "rpc_validation",
                    ?request_id,
                    "Unexpected response id"
                );
                None
            }
        }
    }

    fn send_rpc_message(
        &mut self,
        target: &PeerDescriptor,
        message: RpcMessage,
    ) -> Result<(), RpcError> {
        let message = Message::new(
            self.service_id.clone(),
            self.local.clone(),
            Some(target.clone()),
            MessageBody::Rpc(message),
        );

        let bytes = message
            .to_bytes()
            .map_err(|error| RpcError::Payload(error.to_string()))?;

        trace!(context = "rpc_message_sending", ?message);

        self.transport
            .send(target, &bytes)
            .map_err(|error| RpcError::Transport(error.to_string()))
    }
}

impl<S> Debug for RpcCommunicator<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcCommunicator")
            .field("local", &self.local.node_id())
            .field("service_id", &self.service_id)
            .field("transport", &self.transport)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::common::{methods, PingRequest, PingResponse, DHT_SERVICE_ID};
    use crate::transport::Simulator;

    use super::*;

    #[derive(Default)]
    struct Counter {
        pings: usize,
    }

    fn ping(state: &mut Counter, request: PingRequest, _: &mut CallContext<'_>) -> Result<PingResponse, RpcError> {
        state.pings += 1;

        Ok(PingResponse {
            request_id: request.request_id,
        })
    }

    fn failing(_: &mut Counter, _: PingRequest, _: &mut CallContext<'_>) -> Result<PingResponse, RpcError> {
        Err(RpcError::Handler("boom".to_string()))
    }

    fn communicator(simulator: &Simulator) -> RpcCommunicator<Counter> {
        let local = PeerDescriptor::random();
        let transport = simulator.transport(&local);

        let mut rpc = RpcCommunicator::new(
            local,
            DHT_SERVICE_ID,
            Box::new(transport),
            Duration::from_millis(500),
        );

        rpc.register_rpc_method(methods::PING, ping).unwrap();
        rpc.register_rpc_method("fail", failing).unwrap();

        rpc
    }

    /// Pump `rpc` until it yields a settled response or the deadline passes.
    fn wait_response(rpc: &mut RpcCommunicator<Counter>, state: &mut Counter) -> Option<RpcResponse> {
        let deadline = Instant::now() + Duration::from_secs(2);

        while Instant::now() < deadline {
            if let Some(message) = rpc.recv() {
                let mut outbox = Outbox::new();
                if let Some(response) = rpc.handle_incoming_message(state, message, &mut outbox) {
                    return Some(response);
                }
            }

            if let Some(failure) = rpc.take_failures().pop() {
                return Some(failure);
            }
        }

        None
    }

    fn serve_one(rpc: &mut RpcCommunicator<Counter>, state: &mut Counter) {
        let deadline = Instant::now() + Duration::from_secs(2);

        while Instant::now() < deadline {
            if let Some(message) = rpc.recv() {
                let mut outbox = Outbox::new();
                rpc.handle_incoming_message(state, message, &mut outbox);
                return;
            }
        }
    }

    #[test]
    fn call_and_respond() {
        let simulator = Simulator::new();

        let mut client = communicator(&simulator);
        let mut server = communicator(&simulator);
        let server_peer = server.local_peer_descriptor().clone();

        let request = PingRequest {
            request_id: RequestId::random(),
        };
        let request_id = client.call(methods::PING, &request, &server_peer);
        assert!(client.is_inflight(&request_id));

        let mut server_state = Counter::default();
        serve_one(&mut server, &mut server_state);
        assert_eq!(server_state.pings, 1);

        let response = wait_response(&mut client, &mut Counter::default()).unwrap();

        assert_eq!(response.request_id, request_id);
        assert_eq!(response.peer, server_peer);
        assert_eq!(
            response.decode::<PingResponse>().unwrap().request_id,
            request.request_id
        );
        assert!(!client.is_inflight(&request_id));
    }

    #[test]
    fn unknown_method() {
        let simulator = Simulator::new();

        let mut client = communicator(&simulator);
        let mut server = communicator(&simulator);
        let server_peer = server.local_peer_descriptor().clone();

        client.call("missing", &PingRequest { request_id: RequestId::random() }, &server_peer);

        serve_one(&mut server, &mut Counter::default());

        let response = wait_response(&mut client, &mut Counter::default()).unwrap();

        assert_eq!(
            response.result,
            Err(RpcError::UnknownRpcMethod("missing".to_string()))
        );
    }

    #[test]
    fn handler_error_becomes_error_response() {
        let simulator = Simulator::new();

        let mut client = communicator(&simulator);
        let mut server = communicator(&simulator);
        let server_peer = server.local_peer_descriptor().clone();

        client.call("fail", &PingRequest { request_id: RequestId::random() }, &server_peer);

        serve_one(&mut server, &mut Counter::default());

        let response = wait_response(&mut client, &mut Counter::default()).unwrap();

        assert!(matches!(response.result, Err(RpcError::Handler(message)) if message.contains("boom")));
    }

    #[test]
    fn timeout() {
        let simulator = Simulator::new();

        let mut client = communicator(&simulator);
        // Registered but never polled.
        let silent = communicator(&simulator);

        let request_id = client.call(
            methods::PING,
            &PingRequest { request_id: RequestId::random() },
            silent.local_peer_descriptor(),
        );

        thread::sleep(Duration::from_millis(600));

        let failures = client.take_failures();

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].request_id, request_id);
        assert_eq!(failures[0].result, Err(RpcError::Timeout));
        assert!(!client.is_inflight(&request_id));
    }

    #[test]
    fn unreachable_peer_fails_immediately() {
        let simulator = Simulator::new();

        let mut client = communicator(&simulator);

        let request_id = client.call(
            methods::PING,
            &PingRequest { request_id: RequestId::random() },
            &PeerDescriptor::random(),
        );

        let failures = client.take_failures();

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].request_id, request_id);
        assert!(matches!(failures[0].result, Err(RpcError::Transport(_))));
    }

    #[test]
    fn duplicate_registration() {
        let simulator = Simulator::new();

        let mut rpc = communicator(&simulator);

        assert_eq!(
            rpc.register_rpc_method(methods::PING, ping),
            Err(RpcError::DuplicateRpcMethod(methods::PING.to_string()))
        );
    }
}
