use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::common::PeerDescriptor;
use crate::Error;

use super::{
    FindRequest, Message, MessageBody, RecursiveOperationRequest, RequestId, RpcErrorCode,
    RpcMessage, RpcPayload,
};

const KIND_REQUEST: u8 = 0;
const KIND_RESPONSE: u8 = 1;
const KIND_ERROR: u8 = 2;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WireMessage {
    #[serde(rename = "s")]
    pub service_id: String,

    #[serde(rename = "i")]
    pub message_id: RequestId,

    #[serde(rename = "src")]
    pub source: PeerDescriptor,

    #[serde(default, rename = "dst", skip_serializing_if = "Option::is_none")]
    pub target: Option<PeerDescriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc: Option<WireRpcMessage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub find: Option<FindRequest>,

    #[serde(default, rename = "rop", skip_serializing_if = "Option::is_none")]
    pub recursive_operation: Option<RecursiveOperationRequest>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WireRpcMessage {
    #[serde(rename = "r")]
    pub request_id: RequestId,

    #[serde(rename = "m")]
    pub method: String,

    #[serde(rename = "y")]
    pub kind: u8,

    #[serde(default, rename = "b", skip_serializing_if = "Option::is_none")]
    pub body: Option<ByteBuf>,

    #[serde(default, rename = "c", skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u8>,

    #[serde(default, rename = "d", skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl From<Message> for WireMessage {
    fn from(message: Message) -> Self {
        let mut wire = WireMessage {
            service_id: message.service_id,
            message_id: message.message_id,
            source: message.source,
            target: message.target,
            rpc: None,
            find: None,
            recursive_operation: None,
        };

        match message.body {
            MessageBody::Rpc(rpc) => wire.rpc = Some(rpc.into()),
            MessageBody::FindRequest(find) => wire.find = Some(find),
            MessageBody::RecursiveOperationRequest(request) => {
                wire.recursive_operation = Some(request)
            }
        }

        wire
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = Error;

    fn try_from(wire: WireMessage) -> Result<Self, Error> {
        let body = match (wire.rpc, wire.find, wire.recursive_operation) {
            (Some(rpc), None, None) => MessageBody::Rpc(rpc.try_into()?),
            (None, Some(find), None) => MessageBody::FindRequest(find),
            (None, None, Some(request)) => MessageBody::RecursiveOperationRequest(request),
            (None, None, None) => return Err(Error::InvalidMessage("message without a body")),
            _ => return Err(Error::InvalidMessage("message with more than one body")),
        };

        Ok(Message {
            service_id: wire.service_id,
            message_id: wire.message_id,
            body,
            source: wire.source,
            target: wire.target,
        })
    }
}

impl From<RpcMessage> for WireRpcMessage {
    fn from(message: RpcMessage) -> Self {
        let (kind, body, error_code, error_description) = match message.payload {
            RpcPayload::Request(body) => (KIND_REQUEST, Some(body), None, None),
            RpcPayload::Response(body) => (KIND_RESPONSE, Some(body), None, None),
            RpcPayload::Error { code, description } => {
                (KIND_ERROR, None, Some(code.into()), Some(description))
            }
        };

        WireRpcMessage {
            request_id: message.request_id,
            method: message.method,
            kind,
            body: body.map(|body| ByteBuf::from(body.to_vec())),
            error_code,
            error_description,
        }
    }
}

impl TryFrom<WireRpcMessage> for RpcMessage {
    type Error = Error;

    fn try_from(wire: WireRpcMessage) -> Result<Self, Error> {
        let payload = match wire.kind {
            KIND_REQUEST => RpcPayload::Request(
                wire.body
                    .ok_or(Error::InvalidMessage("rpc request without a body"))?
                    .into_vec()
                    .into(),
            ),
            KIND_RESPONSE => RpcPayload::Response(
                wire.body
                    .ok_or(Error::InvalidMessage("rpc response without a body"))?
                    .into_vec()
                    .into(),
            ),
            KIND_ERROR => RpcPayload::Error {
                code: RpcErrorCode::try_from(
                    wire.error_code
                        .ok_or(Error::InvalidMessage("rpc error without a code"))?,
                )?,
                description: wire.error_description.unwrap_or_default(),
            },
            other => return Err(Error::UnknownVariant("RpcMessage kind", other)),
        };

        Ok(RpcMessage {
            request_id: wire.request_id,
            method: wire.method,
            payload,
        })
    }
}
