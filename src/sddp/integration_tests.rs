//! End-to-end exercises of the engine/subscriber pipeline over real
//! loopback UDP sockets (unicast only — no multicast group membership
//! is needed to exercise dispatch, backpressure, and shutdown).

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use super::binding::SocketBinding;
use super::datagram::Datagram;
use super::engine::{Engine, FinalResult};

fn loopback() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[tokio::test]
async fn backpressure_drops_for_a_full_subscriber_only() {
    let receiver = SocketBinding::new_unicast(loopback()).unwrap();
    let target = receiver.unicast_addr();
    let engine = Engine::start(vec![receiver]).unwrap();

    let mut narrow = engine.subscribe_with_capacity(1);
    let mut wide = engine.subscribe_with_capacity(2);

    let sender = SocketBinding::new_unicast(loopback()).unwrap();
    for i in 0..2 {
        let datagram = Datagram::new(format!("NOTIFY ALIVE SDDP/1.{}", i));
        sender.send_to(&datagram.to_bytes(), target).await.unwrap();
    }
    // Give the receive loop time to pull both datagrams off the socket
    // and dispatch them before either subscriber drains its queue.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let first = narrow.receive().await.unwrap().expect("first item delivered");
    assert_eq!(first.2.statement_line(), "NOTIFY ALIVE SDDP/1.0");
    let second_for_narrow = tokio::time::timeout(Duration::from_millis(200), narrow.receive()).await;
    assert!(second_for_narrow.is_err(), "capacity-1 subscriber should never see the second datagram");

    let first_wide = wide.receive().await.unwrap().expect("wide subscriber sees first item");
    let second_wide = wide.receive().await.unwrap().expect("wide subscriber sees second item");
    assert_eq!(first_wide.2.statement_line(), "NOTIFY ALIVE SDDP/1.0");
    assert_eq!(second_wide.2.statement_line(), "NOTIFY ALIVE SDDP/1.1");

    engine.stop().await;
}

#[tokio::test]
async fn final_result_is_set_once_and_subscribers_reach_end_of_stream_after_draining() {
    let receiver = SocketBinding::new_unicast(loopback()).unwrap();
    let target = receiver.unicast_addr();
    let engine = Engine::start(vec![receiver]).unwrap();
    let mut subscriber = engine.subscribe();

    let sender = SocketBinding::new_unicast(loopback()).unwrap();
    let datagram = Datagram::new("NOTIFY ALIVE SDDP/1.0");
    sender.send_to(&datagram.to_bytes(), target).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine.stop().await;
    assert!(!engine.set_final_result(FinalResult::Success));
    engine.wait_for_done().await.unwrap();

    let item = subscriber.receive().await.unwrap();
    assert!(item.is_some(), "queued datagram must be drained before end-of-stream");
    let end = subscriber.receive().await.unwrap();
    assert!(end.is_none());
    // Reaching end-of-stream is terminal: a further call keeps returning None.
    assert!(subscriber.receive().await.unwrap().is_none());
}

#[tokio::test]
async fn transport_error_is_surfaced_to_subscribers_after_draining() {
    let receiver = SocketBinding::new_unicast(loopback()).unwrap();
    let engine = Engine::start(vec![receiver]).unwrap();
    let mut subscriber = engine.subscribe();

    assert!(engine.set_final_result(FinalResult::Error(std::sync::Arc::new(
        "simulated transport failure".to_string()
    ))));
    // A later, different result must not override the first.
    assert!(!engine.set_final_result(FinalResult::Success));

    let outcome = subscriber.receive().await;
    assert!(outcome.is_err());
    assert!(subscriber.receive().await.unwrap().is_none());
    assert!(engine.wait_for_done().await.is_err());
}

#[tokio::test]
async fn subscribing_after_final_result_is_set_yields_immediate_end_of_stream() {
    let receiver = SocketBinding::new_unicast(loopback()).unwrap();
    let engine = Engine::start(vec![receiver]).unwrap();

    engine.stop().await;
    assert!(engine.is_done());

    // A subscriber registered after shutdown must not hang forever waiting
    // for an end-of-stream that nothing will ever deliver.
    let mut late = engine.subscribe();
    let item = tokio::time::timeout(Duration::from_millis(200), late.receive())
        .await
        .expect("receive() must not hang for a subscriber registered post-shutdown")
        .unwrap();
    assert!(item.is_none());
}

#[tokio::test]
async fn stop_unblocks_the_receive_loop_with_no_further_traffic() {
    let receiver = SocketBinding::new_unicast(loopback()).unwrap();
    let engine = Engine::start(vec![receiver]).unwrap();
    let mut subscriber = engine.subscribe();

    // Nothing is ever sent on this binding; before the fix the per-binding
    // receive task would stay parked in `recv_from` forever after `stop()`.
    tokio::time::timeout(Duration::from_millis(500), engine.stop())
        .await
        .expect("stop() must not hang");
    tokio::time::timeout(Duration::from_millis(500), engine.wait_for_done())
        .await
        .expect("wait_for_done() must resolve once stop() has run")
        .unwrap();
    assert!(subscriber.receive().await.unwrap().is_none());
}
