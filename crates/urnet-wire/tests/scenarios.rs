//! End-to-end routing scenarios over in-process loopback links.

use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use urnet_types::config::DirectoryConfig;
use urnet_types::{Address, BusError, BusResult, Frame, InvocationKind, Packet};
use urnet_wire::loopback::link;
use urnet_wire::services::{REFLECT, SERVICE_LIST};
use urnet_wire::socket::Outbox;
use urnet_wire::{Directory, Messager, SocketAdapter, TransportKind};

const WAIT: Duration = Duration::from_secs(2);

fn hub_with(config: DirectoryConfig) -> Messager {
    let dir = Directory::new(DirectoryConfig {
        address: Some("SVR_01".into()),
        ..config
    })
    .unwrap();
    urnet_wire::services::register_builtins(&dir).unwrap();
    Messager::new(dir)
}

fn hub() -> Messager {
    hub_with(DirectoryConfig::default())
}

fn client() -> Messager {
    Messager::new(Directory::new(DirectoryConfig::default()).unwrap())
}

fn client_with_timeout(ms: u64) -> Messager {
    Messager::new(
        Directory::new(DirectoryConfig {
            call_timeout_ms: ms,
            ..DirectoryConfig::default()
        })
        .unwrap(),
    )
}

async fn never() -> Result<Value, String> {
    futures::future::pending::<()>().await;
    Ok(Value::Null)
}

/// A socket whose outbound frames the test reads directly.
struct Probe {
    outbox: Outbox,
}

impl SocketAdapter for Probe {
    fn transport(&self) -> TransportKind {
        TransportKind::Loopback
    }
    fn label(&self) -> String {
        "probe".into()
    }
    fn address(&self) -> Option<Address> {
        self.outbox.address()
    }
    fn bind_address(&self, address: Address) -> bool {
        self.outbox.bind_address(address)
    }
    fn send(&self, frame: Frame) -> BusResult<()> {
        self.outbox.send(frame)
    }
    fn close(&self) {
        self.outbox.close()
    }
}

fn probe() -> (Arc<Probe>, mpsc::UnboundedReceiver<Frame>) {
    let (outbox, rx) = Outbox::channel();
    (Arc::new(Probe { outbox }), rx)
}

async fn next_packet(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Packet {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Some(Frame::Packet(p)) => return p,
                Some(_) => continue,
                None => panic!("probe closed"),
            }
        }
    })
    .await
    .expect("a packet should be forwarded")
}

#[tokio::test]
async fn test_local_call_echoes_payload() {
    let bus = hub();
    bus.handle_fn("FOO", |p| async move { Ok(json!({"echo": p["x"]})) })
        .unwrap();
    assert_eq!(
        bus.call("FOO", json!({"x": 5})).await.unwrap(),
        json!({"echo": 5})
    );
}

#[tokio::test]
async fn test_unrouted_call_rejects_with_no_route() {
    let bus = hub();
    assert!(matches!(
        bus.call("BAR", json!({})).await,
        Err(BusError::NoRoute(_))
    ));
    assert_eq!(bus.directory().pending_transactions(), 0);
}

#[tokio::test]
async fn test_two_hop_call_records_both_addresses() {
    let a = hub();
    let b = client();
    b.handle_fn("BAZ", |_| async move { Ok(json!({"ok": true})) })
        .unwrap();
    link(a.directory(), b.directory()).unwrap();
    a.directory().wait_for_route("BAZ", WAIT).await.unwrap();

    let response = a.call_response("BAZ", json!({})).await.unwrap();
    assert_eq!(response.outcome().unwrap(), json!({"ok": true}));
    assert_eq!(
        response.hops(),
        &[a.directory().address(), b.directory().address()]
    );
    assert!(!response.hop_log().is_empty());
}

#[tokio::test]
async fn test_call_between_clients_goes_through_the_hub() {
    let h = hub();
    let c1 = client();
    let c2 = client();
    c2.handle_fn("QUX", |p| async move { Ok(json!({"got": p})) })
        .unwrap();
    link(h.directory(), c1.directory()).unwrap();
    link(h.directory(), c2.directory()).unwrap();
    assert_ne!(c1.directory().address(), c2.directory().address());
    c1.directory().wait_for_route("QUX", WAIT).await.unwrap();

    let response = c1.call_response("QUX", json!(7)).await.unwrap();
    assert_eq!(response.outcome().unwrap(), json!({"got": 7}));
    assert_eq!(
        response.hops(),
        &[
            c1.directory().address(),
            h.directory().address(),
            c2.directory().address()
        ]
    );
    assert_eq!(h.directory().pending_transactions(), 0);
    assert_eq!(c1.directory().pending_transactions(), 0);
}

#[tokio::test]
async fn test_remote_errors_keep_their_type() {
    let h = hub();
    let c1 = client();
    let c2 = client();
    c2.handle_fn("FAIL", |_| async move { Err("bad input".to_string()) })
        .unwrap();
    link(h.directory(), c1.directory()).unwrap();
    link(h.directory(), c2.directory()).unwrap();
    c1.directory().wait_for_route("FAIL", WAIT).await.unwrap();

    match c1.call("FAIL", json!({})).await {
        Err(BusError::Remote(msg)) => assert_eq!(msg, "bad input"),
        other => panic!("Expected Remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_builtin_services_answer_across_a_hop() {
    let h = hub();
    let c = client();
    c.handle_fn("MINE", |v| async move { Ok(v) }).unwrap();
    link(h.directory(), c.directory()).unwrap();
    h.directory().wait_for_route("MINE", WAIT).await.unwrap();

    let echoed = c.call(REFLECT, json!({"a": 1})).await.unwrap();
    assert_eq!(echoed, json!({"a": 1}));

    let list = c.call(SERVICE_LIST, json!({})).await.unwrap();
    assert_eq!(list["address"], json!("SVR_01"));
    assert_eq!(
        list["services"]["MINE"],
        json!([c.directory().address().to_string()])
    );

    // NET names are never answered without crossing a hop.
    assert!(matches!(
        h.call(REFLECT, json!({})).await,
        Err(BusError::NoRoute(_))
    ));
}

#[tokio::test]
async fn test_unanswered_call_times_out_and_is_forgotten() {
    let h = hub();
    let c = client_with_timeout(50);
    h.handle_fn("SLOW", |_| never()).unwrap();
    link(h.directory(), c.directory()).unwrap();

    assert!(matches!(
        c.call("SLOW", json!({})).await,
        Err(BusError::Timeout(_))
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(c.directory().pending_transactions(), 0);
}

#[tokio::test]
async fn test_detach_purges_routes_and_fails_calls_promptly() {
    let a = hub_with(DirectoryConfig {
        call_timeout_ms: 30_000,
        ..DirectoryConfig::default()
    });
    let b = client();
    b.handle_fn("SLOW", |_| never()).unwrap();
    let (on_a, _) = link(a.directory(), b.directory()).unwrap();
    a.directory().wait_for_route("SLOW", WAIT).await.unwrap();

    let caller = {
        let a = a.clone();
        tokio::spawn(async move { a.call("SLOW", json!({})).await })
    };
    tokio::time::timeout(WAIT, async {
        while a.directory().pending_transactions() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    a.directory().detach(&on_a).unwrap();
    assert!(a.directory().forwarding_targets("SLOW").unwrap().is_empty());
    let outcome = tokio::time::timeout(WAIT, caller)
        .await
        .expect("call must fail before its timeout")
        .unwrap();
    assert!(matches!(outcome, Err(BusError::TransportSendFailure(_))));
    assert_eq!(a.directory().pending_transactions(), 0);
}

#[tokio::test]
async fn test_duplicate_response_resolves_once() {
    let bus = hub();
    let dir = bus.directory().clone();
    let (socket, mut rx) = probe();
    let link_addr = dir.attach(socket).unwrap();
    dir.register_forwarding(&link_addr, ["FOO"]).unwrap();

    let caller = {
        let bus = bus.clone();
        tokio::spawn(async move { bus.call("FOO", json!({})).await })
    };
    let forwarded = next_packet(&mut rx).await;

    for value in [1, 2] {
        let mut response = forwarded.make_response(Ok(json!(value)));
        response.mark_responder(&link_addr);
        dir.receive(&link_addr, Frame::Packet(response));
    }
    assert_eq!(caller.await.unwrap().unwrap(), json!(1));
    assert_eq!(dir.pending_transactions(), 0);
}

#[tokio::test]
async fn test_forwarding_to_an_address_in_the_hop_sequence_is_a_loop() {
    let bus = hub();
    let dir = bus.directory().clone();
    let (socket, mut rx) = probe();
    let link_addr = dir.attach(socket).unwrap();
    dir.register_forwarding(&link_addr, ["FOO"]).unwrap();

    let mut packet = Packet::create("FOO", json!({})).unwrap();
    packet
        .assign_identity(InvocationKind::Send, "NODE_03")
        .unwrap();
    packet.append_hop(&link_addr).unwrap();
    assert!(matches!(
        dir.dispatch(packet),
        Err(BusError::LoopDetected(_))
    ));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_local_handler_shadows_remote_forward() {
    let a = hub();
    let b = client();
    b.handle_fn("DUAL", |_| async move { Ok(json!("remote")) })
        .unwrap();
    link(a.directory(), b.directory()).unwrap();
    a.directory().wait_for_route("DUAL", WAIT).await.unwrap();
    a.handle_fn("DUAL", |_| async move { Ok(json!("local")) })
        .unwrap();

    for _ in 0..5 {
        assert_eq!(a.call("DUAL", json!({})).await.unwrap(), json!("local"));
    }
    let delivery = a.send("DUAL", json!({})).unwrap();
    assert_eq!(delivery.local, 1);
    assert!(delivery.forwarded.is_empty());
}

#[tokio::test]
async fn test_fan_out_takes_the_first_success() {
    let h = hub();
    let good = client();
    let bad = client();
    good.handle_fn("MULTI", |_| async move { Ok(json!("good")) })
        .unwrap();
    bad.handle_fn("MULTI", |_| async move { Err("bad".to_string()) })
        .unwrap();
    link(h.directory(), good.directory()).unwrap();
    link(h.directory(), bad.directory()).unwrap();

    tokio::time::timeout(WAIT, async {
        while h.directory().forwarding_targets("MULTI").unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(h.call("MULTI", json!({})).await.unwrap(), json!("good"));
    let delivery = h.send("MULTI", json!({})).unwrap();
    assert_eq!(delivery.forwarded.len(), 2);
}

#[tokio::test]
async fn test_attached_addresses_stay_unique() {
    let h = hub();
    let mut live = BTreeSet::new();
    let mut links = Vec::new();
    for round in 0..12 {
        let c = client();
        let (on_hub, _) = link(h.directory(), c.directory()).unwrap();
        assert!(live.insert(on_hub.clone()), "{on_hub} handed out twice");
        assert_ne!(on_hub, h.directory().address());
        links.push(c);
        if round % 4 == 1 {
            h.directory().detach(&on_hub).unwrap();
            live.remove(&on_hub);
        }
    }
    let attached: BTreeSet<Address> = h
        .directory()
        .links()
        .into_iter()
        .map(|l| l.address)
        .collect();
    assert_eq!(attached, live);
}

#[tokio::test]
async fn test_hub_shutdown_fails_client_calls_instead_of_timing_out() {
    let h = hub();
    let c = client_with_timeout(30_000);
    h.handle_fn("SLOW", |_| never()).unwrap();
    link(h.directory(), c.directory()).unwrap();

    let caller = {
        let c = c.clone();
        tokio::spawn(async move { c.call("SLOW", json!({})).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.directory().shutdown("maintenance");

    let outcome = tokio::time::timeout(WAIT, caller)
        .await
        .expect("client must see the hub go away")
        .unwrap();
    assert!(matches!(outcome, Err(BusError::TransportSendFailure(_))));
    assert!(c.directory().links().is_empty());
    assert!(matches!(
        h.call("ANY", json!({})).await,
        Err(BusError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_shared_secret_admits_matching_peers_only() {
    let secured = |address: Option<&str>, secret: &str| {
        Messager::new(
            Directory::with_secret(
                DirectoryConfig {
                    address: address.map(String::from),
                    ..DirectoryConfig::default()
                },
                Some(secret.to_string()),
            )
            .unwrap(),
        )
    };
    let h = secured(Some("SVR_01"), "hunter2");
    h.handle_fn("SECRET", |_| async move { Ok(json!("ok")) })
        .unwrap();

    let good = secured(None, "hunter2");
    let (good_link, _) = link(h.directory(), good.directory()).unwrap();
    assert_eq!(good.call("SECRET", json!({})).await.unwrap(), json!("ok"));

    let bad = secured(None, "wrong");
    let (bad_link, _) = link(h.directory(), bad.directory()).unwrap();
    tokio::time::timeout(WAIT, async {
        while h.directory().is_attached(&bad_link) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("hub should drop the unauthenticated peer");
    assert!(h.directory().is_attached(&good_link));
}

#[tokio::test]
async fn test_secured_hub_drops_packets_sent_before_announcing() {
    let h = Messager::new(
        Directory::with_secret(
            DirectoryConfig {
                address: Some("SVR_01".into()),
                ..DirectoryConfig::default()
            },
            Some("hunter2".to_string()),
        )
        .unwrap(),
    );
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    h.handle_fn("SECRET", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok(json!("leaked")) }
    })
    .unwrap();

    let (socket, mut rx) = probe();
    let raw = h.directory().attach(socket).unwrap();
    h.directory().greet(&raw).unwrap();

    let caller = Address::parse("UADDR_09").unwrap();
    let mut request = Packet::create("SECRET", json!({})).unwrap();
    request
        .assign_identity(InvocationKind::Call, caller.as_str())
        .unwrap();
    request.append_hop(&caller).unwrap();
    h.directory().receive(&raw, Frame::Packet(request));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(!h.directory().is_attached(&raw));
    let kinds: Vec<&'static str> = std::iter::from_fn(|| rx.try_recv().ok())
        .map(|f| f.kind())
        .collect();
    assert_eq!(kinds, vec!["welcome", "goodbye"]);
}
