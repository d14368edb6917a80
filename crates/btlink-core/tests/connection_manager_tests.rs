//! End-to-end tests for publishers and searchers over the loopback network


use std::time::Duration;

use btlink_core::{
    LinkConfig, LinkError, LinkEvent, LinkState, LoopbackNetwork, PeerAddress, Role, Tag,
    Transport,
};
use test_utils::{connect, payload, Node, SESSION};

// ----------------------------------------------------------------------------
// Discovery and Connection
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_searcher_connects_to_publisher() {
    let network = LoopbackNetwork::new();
    let mut host = Node::new(&network, "host");
    let mut guest = Node::new(&network, "guest");

    connect(&mut host, &mut guest).await;

    assert!(guest.manager.is_connected_to_server());
    assert_eq!(guest.manager.server_address(), Some(host.address.clone()));
    assert_eq!(
        guest.manager.state(),
        LinkState::Connected { role: Role::Searcher }
    );
    assert_eq!(
        host.manager.state(),
        LinkState::Connected { role: Role::Publisher }
    );
    assert_eq!(host.manager.connections().await.as_slice(), &[guest.address.clone()]);

    // Exactly one PeerConnected per link
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!host
        .drain()
        .iter()
        .any(|e| matches!(e, LinkEvent::PeerConnected { .. })));
}

#[tokio::test]
async fn test_publisher_advertises_with_session_suffix() {
    let network = LoopbackNetwork::new();
    let host = Node::new(&network, "host");
    host.manager.start_publishing().await.unwrap();

    let scanner = Node::new(&network, "scanner");
    let server = scanner.transport.scan_and_connect(SESSION).await.unwrap();
    assert_eq!(server, host.address);
    assert!(scanner.transport.scan_and_connect("other").await.is_err());
}

#[tokio::test]
async fn test_search_without_publisher_fails() {
    let network = LoopbackNetwork::new();
    let mut guest = Node::new(&network, "guest");

    guest.manager.start_searching().unwrap();
    match guest.next_event().await {
        LinkEvent::SearchFailed { error } => {
            assert!(matches!(error, LinkError::TransportFailure(_)));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(guest.manager.state(), LinkState::Idle);
    assert!(!guest.manager.is_connected_to_server());
}

#[tokio::test]
async fn test_stop_searching_abandons_search() {
    let network = LoopbackNetwork::new();
    let mut guest = Node::new(&network, "guest");

    guest.manager.start_searching().unwrap();
    guest.manager.stop_searching().unwrap();
    assert_eq!(guest.manager.state(), LinkState::Idle);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(guest.drain().is_empty());
    assert!(guest.manager.stop_searching().is_err());
}

// ----------------------------------------------------------------------------
// Reads and Writes
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_chunked_round_trip() {
    let network = LoopbackNetwork::new();
    let mut host = Node::new(&network, "host");
    let mut guest = Node::with_config(&network, "guest", LinkConfig::testing(SESSION), Some(3));
    connect(&mut host, &mut guest).await;

    let guest_addr = guest.address.clone();
    let host_addr = host.address.clone();
    host.manager
        .read_data_to_length(&guest_addr, 10, None, Tag(1))
        .await;
    guest.manager
        .write_data(&host_addr, payload(10), None, Tag(2))
        .await;

    assert_eq!(
        guest.next_event().await,
        LinkEvent::WriteCompleted {
            peer: host_addr.clone(),
            tag: Tag(2)
        }
    );
    assert_eq!(
        host.next_event().await,
        LinkEvent::ReadCompleted {
            peer: guest_addr.clone(),
            length: 10,
            tag: Tag(1),
            data: payload(10),
        }
    );

    let socket = host.manager.socket(&guest_addr).await.unwrap();
    assert_eq!(socket.stats().bytes_received, 10);
    assert_eq!(socket.stats().reads_completed, 1);
    assert_eq!(socket.buffered_len(), 0);
}

#[tokio::test]
async fn test_messages_in_both_directions() {
    let network = LoopbackNetwork::new();
    let mut host = Node::new(&network, "host");
    let mut guest = Node::new(&network, "guest");
    connect(&mut host, &mut guest).await;

    let host_addr = host.address.clone();
    let guest_addr = guest.address.clone();

    guest.manager.read_data_to_length(&host_addr, 5, None, Tag(10)).await;
    host.manager.send_device_message(&guest_addr, "hello", Tag(11)).await;
    assert!(matches!(
        host.next_event().await,
        LinkEvent::WriteCompleted { tag: Tag(11), .. }
    ));
    match guest.next_event().await {
        LinkEvent::ReadCompleted { tag, data, .. } => {
            assert_eq!(tag, Tag(10));
            assert_eq!(data, b"hello");
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_writes_complete_in_submission_order() {
    let network = LoopbackNetwork::new();
    let mut host = Node::new(&network, "host");
    let mut guest = Node::new(&network, "guest");
    connect(&mut host, &mut guest).await;

    let host_addr = host.address.clone();
    for tag in 0..5u64 {
        guest.manager
            .write_data(&host_addr, vec![tag as u8; 4], None, Tag(tag))
            .await;
    }

    let mut tags = Vec::new();
    for _ in 0..5 {
        match guest.next_event().await {
            LinkEvent::WriteCompleted { tag, .. } => tags.push(tag.value()),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(tags, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_broadcast_reaches_every_peer() {
    let network = LoopbackNetwork::new();
    let mut host = Node::new(&network, "host");
    let mut first = Node::new(&network, "guest-1");
    let mut second = Node::new(&network, "guest-2");
    connect(&mut host, &mut first).await;
    connect(&mut host, &mut second).await;

    let host_addr = host.address.clone();
    first.manager.read_data_to_length(&host_addr, 2, None, Tag(1)).await;
    second.manager.read_data_to_length(&host_addr, 2, None, Tag(1)).await;

    assert_eq!(host.manager.broadcast_message("hi", Tag(9)).await, 2);

    for _ in 0..2 {
        assert!(matches!(
            host.next_event().await,
            LinkEvent::WriteCompleted { tag: Tag(9), .. }
        ));
    }
    for guest in [&mut first, &mut second] {
        match guest.next_event().await {
            LinkEvent::ReadCompleted { data, .. } => assert_eq!(data, b"hi"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}

// ----------------------------------------------------------------------------
// Teardown
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_remote_disconnect_cancels_pending_reads() {
    let network = LoopbackNetwork::new();
    let mut host = Node::new(&network, "host");
    let mut guest = Node::new(&network, "guest");
    connect(&mut host, &mut guest).await;

    let guest_addr = guest.address.clone();
    host.manager
        .read_data_to_length(&guest_addr, 100, None, Tag(5))
        .await;

    guest.manager.disconnect().await.unwrap();
    assert_eq!(guest.manager.state(), LinkState::Idle);
    assert!(!guest.manager.is_connected_to_server());
    assert_eq!(
        guest.next_event().await,
        LinkEvent::PeerDisconnected {
            peer: host.address.clone()
        }
    );

    match host.next_event().await {
        LinkEvent::ReadFailed { tag, error, .. } => {
            assert_eq!(tag, Tag(5));
            assert!(error.is_cancelled());
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(
        host.next_event().await,
        LinkEvent::PeerDisconnected { peer: guest_addr }
    );
    assert_eq!(host.manager.state(), LinkState::Advertising);
    assert!(host.manager.connections().await.is_empty());
}

#[tokio::test]
async fn test_link_loss_is_reported_on_both_sides() {
    let network = LoopbackNetwork::new();
    let mut host = Node::new(&network, "host");
    let mut guest = Node::new(&network, "guest");
    connect(&mut host, &mut guest).await;

    assert!(network.drop_link(&host.address, &guest.address));

    let guest_addr = guest.address.clone();
    let host_addr = host.address.clone();
    host.wait_for(|e| *e == LinkEvent::PeerDisconnected { peer: guest_addr.clone() })
        .await;
    guest
        .wait_for(|e| *e == LinkEvent::PeerDisconnected { peer: host_addr.clone() })
        .await;
    assert!(!guest.manager.is_connected_to_server());
    assert_eq!(guest.manager.state(), LinkState::Idle);
}

#[tokio::test]
async fn test_disconnect_single_peer() {
    let network = LoopbackNetwork::new();
    let mut host = Node::new(&network, "host");
    let mut first = Node::new(&network, "guest-1");
    let mut second = Node::new(&network, "guest-2");
    connect(&mut host, &mut first).await;
    connect(&mut host, &mut second).await;

    host.manager.disconnect_peer(&first.address).await.unwrap();
    assert_eq!(
        host.next_event().await,
        LinkEvent::PeerDisconnected {
            peer: first.address.clone()
        }
    );
    assert_eq!(host.manager.connections().await.as_slice(), &[second.address.clone()]);
    assert_eq!(
        host.manager.state(),
        LinkState::Connected { role: Role::Publisher }
    );
    assert!(host.manager.disconnect_peer(&first.address).await.is_err());
}

#[tokio::test]
async fn test_shutdown_cancels_everything() {
    let network = LoopbackNetwork::new();
    let mut host = Node::new(&network, "host");
    let mut guest = Node::new(&network, "guest");
    connect(&mut host, &mut guest).await;

    let guest_addr = guest.address.clone();
    host.manager.read_data_to_length(&guest_addr, 8, None, Tag(1)).await;
    host.manager.read_data_to_length(&guest_addr, 8, None, Tag(2)).await;

    host.manager.shutdown().await.unwrap();
    assert_eq!(host.manager.state(), LinkState::ShutDown);

    let events = host.drain();
    let cancelled: Vec<Tag> = events
        .iter()
        .filter_map(|e| match e {
            LinkEvent::ReadFailed { tag, error, .. } if error.is_cancelled() => Some(*tag),
            _ => None,
        })
        .collect();
    assert_eq!(cancelled, vec![Tag(1), Tag(2)]);
    assert!(events.contains(&LinkEvent::PublishingStopped));
    assert!(events.contains(&LinkEvent::PeerDisconnected { peer: guest_addr.clone() }));

    // Operations after shutdown fail as cancelled
    host.manager.read_data_to_length(&guest_addr, 1, None, Tag(3)).await;
    match host.next_event().await {
        LinkEvent::ReadFailed { tag, error, .. } => {
            assert_eq!(tag, Tag(3));
            assert!(error.is_cancelled());
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(host.manager.start_publishing().await, Err(LinkError::ShutDown));

    let host_addr = host.address.clone();
    guest
        .wait_for(|e| *e == LinkEvent::PeerDisconnected { peer: host_addr.clone() })
        .await;
}

// ----------------------------------------------------------------------------
// Connection Limits
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_max_connections_stops_advertising() {
    let network = LoopbackNetwork::new();
    let config = LinkConfig::testing(SESSION).with_max_connections(2);
    let mut host = Node::with_config(&network, "host", config, None);
    let mut first = Node::new(&network, "guest-1");
    let mut second = Node::new(&network, "guest-2");
    let mut third = Node::new(&network, "guest-3");

    connect(&mut host, &mut first).await;
    connect(&mut host, &mut second).await;
    assert_eq!(
        host.next_event().await,
        LinkEvent::MaxConnectionsReached { max: 2 }
    );

    third.manager.start_searching().unwrap();
    assert!(matches!(
        third.next_event().await,
        LinkEvent::SearchFailed { .. }
    ));
    assert_eq!(host.manager.connections().await.len(), 2);
}

#[tokio::test]
async fn test_reconnect_replaces_socket() {
    let network = LoopbackNetwork::new();
    let mut host = Node::new(&network, "host");
    let mut guest = Node::new(&network, "guest");
    connect(&mut host, &mut guest).await;

    let guest_addr = guest.address.clone();
    host.manager.read_data_to_length(&guest_addr, 4, None, Tag(7)).await;
    let original = host.manager.socket(&guest_addr).await.unwrap();

    // Same address connects again at the radio level
    guest.transport.scan_and_connect(SESSION).await.unwrap();

    match host.next_event().await {
        LinkEvent::ReadFailed { tag, error, .. } => {
            assert_eq!(tag, Tag(7));
            assert!(error.is_cancelled());
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(
        host.next_event().await,
        LinkEvent::PeerConnected {
            peer: guest_addr.clone()
        }
    );
    assert!(!original.is_connected());
    let replacement = host.manager.socket(&guest_addr).await.unwrap();
    assert!(replacement.is_connected());
    assert_eq!(host.manager.connections().await.len(), 1);
}

#[tokio::test]
async fn test_socket_failure_reports_transport_reset() {
    let network = LoopbackNetwork::new();
    let mut host = Node::new(&network, "host");

    assert!(network.inject_socket_failure(&host.address, "adapter reset"));
    assert_eq!(
        host.next_event().await,
        LinkEvent::TransportReset {
            reason: "adapter reset".to_string()
        }
    );
}

#[tokio::test]
async fn test_read_from_unknown_peer_fails() {
    let network = LoopbackNetwork::new();
    let mut host = Node::new(&network, "host");
    let mut guest = Node::new(&network, "guest");
    connect(&mut host, &mut guest).await;

    let stranger = PeerAddress::new("stranger");
    host.manager.read_data_to_length(&stranger, 1, None, Tag(1)).await;
    assert!(matches!(
        host.next_event().await,
        LinkEvent::ReadFailed {
            error: LinkError::UnknownPeer { .. },
            ..
        }
    ));
}
