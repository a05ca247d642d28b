use std::time::{Duration, Instant};

use overlay_dht::{
    Bytes, Message, MessageBody, NodeId, RecursiveOperation, RequestId, RpcMessage, RpcPayload,
    Testnet,
};

mod common;

fn chat(source: &Testnet, from: usize, to: usize, text: &'static str) -> Message {
    let source_peer = source.nodes[from].info().unwrap().peer_descriptor().clone();
    let target_peer = source.nodes[to].info().unwrap().peer_descriptor().clone();

    Message::new(
        "chat",
        source_peer,
        Some(target_peer),
        MessageBody::Rpc(RpcMessage {
            request_id: RequestId::random(),
            method: "say".to_string(),
            payload: RpcPayload::Request(Bytes::from_static(text.as_bytes())),
        }),
    )
}

#[test]
fn messages_reach_their_target() {
    common::init_tracing();

    let testnet = Testnet::new(6).unwrap();

    let messages = testnet.nodes[5].messages();
    let mut sent = Vec::new();

    // Connections open while the first messages are routed, so retry with a
    // fresh message each time until one arrives.
    let deadline = Instant::now() + Duration::from_secs(5);
    let received = loop {
        let message = chat(&testnet, 2, 5, "hello");
        let _ = testnet.nodes[2].send(message.clone()).unwrap();
        sent.push(message);

        if let Ok(received) = messages.recv_timeout(Duration::from_millis(200)) {
            break received;
        }

        assert!(Instant::now() < deadline, "message never arrived");
    };

    let message = sent
        .iter()
        .find(|message| message.message_id == received.message_id)
        .expect("delivered message was sent");

    assert_eq!(received.service_id, "chat");
    assert_eq!(received.body, message.body);

    // Parallel routes reach the target more than once, the duplicates are
    // dropped before delivery.
    let mut delivered = vec![received.message_id];
    while let Ok(late) = messages.recv_timeout(Duration::from_millis(500)) {
        assert!(
            !delivered.contains(&late.message_id),
            "message delivered twice"
        );
        delivered.push(late.message_id);
    }

    // Nobody else got it.
    for (index, node) in testnet.nodes.iter().enumerate() {
        if index != 5 {
            assert!(node.messages().try_recv().is_err());
        }
    }
}

#[test]
fn lonely_node_has_no_targets() {
    common::init_tracing();

    let testnet = Testnet::new(1).unwrap();

    let node = &testnet.nodes[0];
    let message = Message::new(
        "chat",
        node.info().unwrap().peer_descriptor().clone(),
        Some(Testnet::peer_descriptor(NodeId::random())),
        MessageBody::Rpc(RpcMessage {
            request_id: RequestId::random(),
            method: "say".to_string(),
            payload: RpcPayload::Request(Bytes::new()),
        }),
    );

    let ack = node.send(message).unwrap();

    assert!(!ack.is_ok());
}

#[test]
fn recursive_find_on_lonely_node() {
    common::init_tracing();

    let testnet = Testnet::new(1).unwrap();
    let node = &testnet.nodes[0];

    let result = node
        .find_recursively(NodeId::random(), RecursiveOperation::FindClosestNodes)
        .unwrap();

    assert_eq!(result.closest_nodes, vec![testnet.bootstrap[0].clone()]);
}

#[test]
fn recursive_find_data() {
    common::init_tracing();

    let testnet = Testnet::new(5).unwrap();

    let key = NodeId::random();
    testnet.nodes[1]
        .store_data(key, Bytes::from_static(b"Hello World!"), None)
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let result = testnet.nodes[3]
            .find_recursively(key, RecursiveOperation::FindData)
            .unwrap();

        if result
            .data_entries
            .iter()
            .any(|entry| entry.data == Bytes::from_static(b"Hello World!"))
        {
            assert!(!result.closest_nodes.is_empty());
            break;
        }

        assert!(Instant::now() < deadline, "entry never found");
    }
}
