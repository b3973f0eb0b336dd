//! Client mirrors against a live registry over the in-memory transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use entangle_client::{ClientConfig, Member, ServiceEvent};
use entangle_core::{EntangleError, ExposeOptions, Response};
use entangle_server::{MethodError, Object};
use parking_lot::Mutex;
use serde_json::{Value, json};

use common::{MemoryLink, client, eventually, registry};

fn counter_object() -> Object {
    Object::new()
        .data("count", 1)
        .async_method("inc", |store, _args| async move {
            store
                .update("count", |current| json!(current.and_then(Value::as_i64).unwrap_or(0) + 1))
                .map_err(MethodError::from)
        })
}

#[tokio::test]
async fn counter_scenario_end_to_end() {
    let registry = registry();
    let store = registry.register("counter", counter_object(), ExposeOptions::new());
    let link = MemoryLink::new(Arc::clone(&registry));

    let first = client(&link, ClientConfig::default());
    let second = client(&link, ClientConfig::default());
    let a = first.subscribe("counter").unwrap();
    let b = second.subscribe("counter").unwrap();
    a.wait_ready().await.unwrap();
    b.wait_ready().await.unwrap();

    assert_eq!(a.get("count"), Some(json!(1)));
    assert!(a.is_method("inc"));
    assert_eq!(a.method("inc").call(vec![]).await.unwrap(), json!(2));
    assert_eq!(store.get("count"), Some(json!(2)));
    eventually(|| b.get("count") == Some(json!(2))).await;
    eventually(|| a.get("count") == Some(json!(2))).await;
}

#[tokio::test]
async fn server_writes_converge_in_order() {
    let registry = registry();
    let store = registry.register("svc", Object::new().data("x", 0), ExposeOptions::new());
    let link = MemoryLink::new(Arc::clone(&registry));

    let clients: Vec<_> = (0..3).map(|_| client(&link, ClientConfig::default())).collect();
    let mirrors: Vec<_> = clients.iter().map(|c| c.subscribe("svc").unwrap()).collect();
    for mirror in &mirrors {
        mirror.wait_ready().await.unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _handle = mirrors[0].on(move |event| {
        if let ServiceEvent::Change { value: Some(value), .. } = event {
            sink.lock().push(value.clone());
        }
    });

    for n in 1..=50 {
        store.set("x", n).unwrap();
    }

    for mirror in &mirrors {
        eventually(|| mirror.get("x") == Some(json!(50))).await;
    }
    let expected: Vec<Value> = (1..=50).map(|n| json!(n)).collect();
    assert_eq!(*seen.lock(), expected);
}

#[tokio::test]
async fn async_method_results_and_rejections() {
    let registry = registry();
    let object = Object::new()
        .async_method("echo", |_store, args| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        })
        .async_method("fail", |_store, _args| async move { Err(MethodError::new("m")) });
    let _store = registry.register("svc", object, ExposeOptions::new());
    let link = MemoryLink::new(Arc::clone(&registry));
    let client = client(&link, ClientConfig::default());
    let svc = client.subscribe("svc").unwrap();
    svc.wait_ready().await.unwrap();

    assert_eq!(svc.call("echo", vec![json!({"v": 1})]).await.unwrap(), json!({"v": 1}));
    assert_matches!(
        svc.call("fail", vec![]).await,
        Err(EntangleError::RemoteCall { message }) if message == "m"
    );
}

#[tokio::test]
async fn calling_data_or_missing_members_fails_remotely() {
    let registry = registry();
    let _store = registry.register("svc", Object::new().data("count", 1), ExposeOptions::new());
    let link = MemoryLink::new(Arc::clone(&registry));
    let client = client(&link, ClientConfig::default());
    let svc = client.subscribe("svc").unwrap();
    svc.wait_ready().await.unwrap();

    assert_matches!(
        svc.call("count", vec![]).await,
        Err(EntangleError::RemoteCall { message }) if message == "\"count\" is not a function"
    );
    assert_matches!(svc.call("nope", vec![]).await, Err(EntangleError::RemoteCall { .. }));
}

#[tokio::test]
async fn omitted_keys_never_leave_the_server() {
    let registry = registry();
    let object = Object::new()
        .data("public", 1)
        .data("secret", "hunter2")
        .sync_method("reveal", |store, _| Ok(json!(store.keys().len())));
    let store = registry.register("svc", object, ExposeOptions::new().omit(["secret", "reveal"]));
    let link = MemoryLink::new(Arc::clone(&registry));
    let client = client(&link, ClientConfig::default());
    let svc = client.subscribe("svc").unwrap();
    svc.wait_ready().await.unwrap();

    store.set("secret", "changed").unwrap();
    store.set("public", 2).unwrap();
    svc.set("secret", "from client").unwrap();
    assert_matches!(svc.call("reveal", vec![]).await, Err(EntangleError::RemoteCall { .. }));
    assert_matches!(svc.fetch("secret").await, Err(EntangleError::RemoteCall { .. }));
    eventually(|| svc.get("public") == Some(json!(2))).await;

    assert_eq!(store.get("secret"), Some(json!("changed")));
    assert!(!svc.contains("secret"));
    for response in link.delivered() {
        let text = serde_json::to_string(&response).unwrap();
        assert!(!text.contains("secret"), "leaked in {text}");
        assert!(!text.contains("hunter2"), "leaked in {text}");
        assert!(!text.contains("reveal"), "leaked in {text}");
    }
}

#[tokio::test]
async fn client_write_round_trips_to_every_subscriber() {
    let registry = registry();
    let store = registry.register("svc", Object::new().data("x", 0), ExposeOptions::new());
    let link = MemoryLink::new(Arc::clone(&registry));
    let writer = client(&link, ClientConfig::default());
    let reader = client(&link, ClientConfig::default());
    let w = writer.subscribe("svc").unwrap();
    let r = reader.subscribe("svc").unwrap();
    w.wait_ready().await.unwrap();
    r.wait_ready().await.unwrap();

    w.set("x", 5).unwrap();
    eventually(|| w.get("x") == Some(json!(5))).await;
    eventually(|| r.get("x") == Some(json!(5))).await;
    assert_eq!(store.get("x"), Some(json!(5)));

    w.delete("x").unwrap();
    eventually(|| !r.contains("x")).await;
    assert!(!store.contains("x"));
}

#[tokio::test]
async fn refused_write_is_corrected_not_applied() {
    let registry = registry();
    let store = registry.register(
        "svc",
        Object::new().data("locked", 1).data("open", 1),
        ExposeOptions::new().readonly(["locked"]),
    );
    let link = MemoryLink::new(Arc::clone(&registry));
    let client = client(&link, ClientConfig::default());
    let svc = client.subscribe("svc").unwrap();
    svc.wait_ready().await.unwrap();
    let before = link.delivered().len();

    svc.set("locked", 99).unwrap();
    svc.delete("locked").unwrap();

    let corrections = || {
        link.delivered()[before..]
            .iter()
            .filter(|r| {
                matches!(r, Response::Write { key, value, .. }
                    if key == "locked" && *value == json!(1))
            })
            .count()
    };
    eventually(|| corrections() == 2).await;
    assert_eq!(store.get("locked"), Some(json!(1)));
    assert_eq!(svc.get("locked"), Some(json!(1)));
}

#[tokio::test]
async fn client_readonly_refuses_every_write() {
    let registry = registry();
    let store = registry.register(
        "svc",
        Object::new().data("a", 1),
        ExposeOptions::new().client_readonly(true),
    );
    let link = MemoryLink::new(Arc::clone(&registry));
    let client = client(&link, ClientConfig::default());
    let svc = client.subscribe("svc").unwrap();
    svc.wait_ready().await.unwrap();

    svc.set("a", 2).unwrap();
    assert_eq!(svc.fetch("a").await.unwrap(), Some(Member::Data(json!(1))));
    assert_eq!(store.get("a"), Some(json!(1)));
}

#[tokio::test(start_paused = true)]
async fn concurrent_calls_settle_by_id_not_order() {
    let registry = registry();
    let object = Object::new().async_method("wait", |_store, args| async move {
        let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!(ms))
    });
    let _store = registry.register("svc", object, ExposeOptions::new());
    let link = MemoryLink::new(Arc::clone(&registry));
    let client = client(&link, ClientConfig::default());
    let svc = client.subscribe("svc").unwrap();
    svc.wait_ready().await.unwrap();

    let slow = {
        let svc = svc.clone();
        tokio::spawn(async move { svc.call("wait", vec![json!(500)]).await })
    };
    let fast = {
        let svc = svc.clone();
        tokio::spawn(async move { svc.call("wait", vec![json!(10)]).await })
    };

    assert_eq!(fast.await.unwrap().unwrap(), json!(10));
    assert!(!slow.is_finished());
    assert_eq!(slow.await.unwrap().unwrap(), json!(500));
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out_and_late_result_is_dropped() {
    let registry = registry();
    let object = Object::new().async_method("slow", |_store, _args| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(json!("late"))
    });
    let _store = registry.register("svc", object, ExposeOptions::new());
    let link = MemoryLink::new(Arc::clone(&registry));
    let client = client(&link, ClientConfig::default());
    let svc = client.subscribe("svc").unwrap();
    svc.wait_ready().await.unwrap();

    let result = svc.call_with_timeout("slow", vec![], Duration::from_millis(10)).await;
    assert_matches!(result, Err(EntangleError::Timeout));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        link.delivered()
            .iter()
            .any(|r| matches!(r, Response::CallResult { value, .. } if *value == json!("late")))
    );
    assert_eq!(svc.pending_calls(), 0);
    assert!(svc.is_subscribed());
}

#[tokio::test]
async fn uncached_mirror_is_cleared_across_reconnect() {
    let registry = registry();
    let store = registry.register("svc", Object::new().data("x", 1), ExposeOptions::new());
    let link = MemoryLink::new(Arc::clone(&registry));
    let config = ClientConfig {
        cached: false,
        ..ClientConfig::default()
    };
    let client = client(&link, config);
    let svc = client.subscribe("svc").unwrap();
    svc.wait_ready().await.unwrap();
    assert_eq!(svc.get("x"), Some(json!(1)));

    link.hold();
    link.drop_all();
    eventually(|| !svc.is_ready()).await;
    assert!(svc.keys().is_empty());

    store.set("x", 2).unwrap();
    link.release();
    svc.wait_ready().await.unwrap();
    assert_eq!(svc.get("x"), Some(json!(2)));
}

#[tokio::test]
async fn cached_mirror_keeps_stale_values_until_resync() {
    let registry = registry();
    let object = Object::new().data("x", 1).data("y", 1);
    let store = registry.register("svc", object, ExposeOptions::new());
    let link = MemoryLink::new(Arc::clone(&registry));
    let client = client(&link, ClientConfig::default());
    let svc = client.subscribe("svc").unwrap();
    svc.wait_ready().await.unwrap();

    link.hold();
    link.drop_all();
    eventually(|| !svc.is_ready()).await;
    assert_eq!(svc.get("x"), Some(json!(1)));

    store.set("x", 2).unwrap();
    store.delete("y").unwrap();
    assert_eq!(svc.get("x"), Some(json!(1)));
    assert_eq!(svc.get("y"), Some(json!(1)));
    link.release();
    svc.wait_ready().await.unwrap();
    assert_eq!(svc.get("x"), Some(json!(2)));
    assert!(!svc.contains("y"));
}

#[tokio::test]
async fn pending_call_fails_when_connection_drops() {
    let registry = registry();
    let object = Object::new().async_method("hang", |_store, _args| async move {
        futures_pending().await;
        Ok(Value::Null)
    });
    let _store = registry.register("svc", object, ExposeOptions::new());
    let link = MemoryLink::new(Arc::clone(&registry));
    let client = client(&link, ClientConfig::default());
    let svc = client.subscribe("svc").unwrap();
    svc.wait_ready().await.unwrap();

    let call = {
        let svc = svc.clone();
        tokio::spawn(async move { svc.call("hang", vec![]).await })
    };
    eventually(|| svc.pending_calls() == 1).await;
    link.drop_all();
    assert_matches!(call.await.unwrap(), Err(EntangleError::ConnectionLost));

    // The client reconnects on its own and the mirror comes back.
    svc.wait_ready().await.unwrap();
}

#[tokio::test]
async fn call_abandoned_before_open_is_never_replayed() {
    let registry = registry();
    let store = registry.register("counter", counter_object(), ExposeOptions::new());
    let link = MemoryLink::new(Arc::clone(&registry));
    let client = client(&link, ClientConfig::default());
    let svc = client.subscribe("counter").unwrap();
    svc.wait_ready().await.unwrap();

    link.hold();
    link.drop_all();
    eventually(|| !svc.is_ready()).await;

    let call = {
        let svc = svc.clone();
        tokio::spawn(async move { svc.call("inc", vec![]).await })
    };
    eventually(|| client.adaptor().queued_frames() == 1).await;

    // The held transport closes without ever opening.
    link.drop_all();
    assert_matches!(call.await.unwrap(), Err(EntangleError::ConnectionLost));
    assert_eq!(client.adaptor().queued_frames(), 0);

    link.release();
    svc.wait_ready().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.get("count"), Some(json!(1)));
    assert_eq!(svc.get("count"), Some(json!(1)));
}

async fn futures_pending() {
    std::future::pending::<()>().await;
}

#[tokio::test]
async fn unregister_silences_the_service() {
    let registry = registry();
    let store = registry.register("svc", Object::new().data("x", 1), ExposeOptions::new());
    let link = MemoryLink::new(Arc::clone(&registry));
    let client = client(&link, ClientConfig::default());
    let svc = client.subscribe("svc").unwrap();
    svc.wait_ready().await.unwrap();

    assert!(registry.unregister("svc"));
    let before = link.delivered().len();
    store.set("x", 2).unwrap();
    assert_matches!(
        svc.call_with_timeout("anything", vec![], Duration::from_millis(50)).await,
        Err(EntangleError::Timeout)
    );
    assert_eq!(link.delivered().len(), before);
    assert_eq!(svc.get("x"), Some(json!(1)));
}

#[tokio::test]
async fn registry_broadcast_reaches_every_session() {
    let registry = registry();
    let _store = registry.register("svc", Object::new(), ExposeOptions::new());
    let link = MemoryLink::new(Arc::clone(&registry));
    let client = client(&link, ClientConfig::default());
    let svc = client.subscribe("svc").unwrap();
    svc.wait_ready().await.unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let _handle = svc.on(move |event| {
        if let ServiceEvent::Error(message) = event {
            sink.lock().push(message.clone());
        }
    });

    let delivered = registry.broadcast(&Response::ServiceError {
        service_id: "svc".into(),
        message: "maintenance".into(),
    });
    assert_eq!(delivered, 1);
    eventually(|| errors.lock().as_slice() == ["maintenance".to_owned()]).await;
}
