//! The demo service served by `entangle serve`.

use std::time::Duration;

use entangle_core::ExposeOptions;
use entangle_server::{Object, Registry, Store};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Id the demo object is registered under.
pub const DEMO_SERVICE: &str = "data1";

/// The full server-side object, `adminKey` included.
pub fn demo_object() -> Object {
    Object::new()
        .data(
            "persons",
            json!([
                { "name": "Alice", "age": 30 },
                { "name": "Bob", "age": 25 },
                { "name": "Charlie", "age": 35 },
            ]),
        )
        .data("luckyNumber", 7)
        .data("adminKey", "12345678")
        .sync_method("sayHi", |_store, _args| {
            info!("server says hi");
            Ok(json!({ "ok": true }))
        })
}

/// Register the demo under [`DEMO_SERVICE`] with `adminKey` cut from the
/// registered view.
pub fn register(registry: &Registry) -> Store {
    registry.register_with_view(
        DEMO_SERVICE,
        demo_object(),
        |object| object.omit(["adminKey"]),
        ExposeOptions::new(),
    )
}

/// Increment `luckyNumber` every `period` until `cancel` fires.
pub fn spawn_lucky_number(
    store: Store,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        let _ = ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let bumped = store.update("luckyNumber", |current| {
                        let n = current.and_then(Value::as_i64).unwrap_or(0);
                        json!(n + 1)
                    });
                    match bumped {
                        Ok(value) => debug!(%value, "luckyNumber bumped"),
                        Err(err) => {
                            debug!(error = %err, "luckyNumber not writable, stopping");
                            break;
                        }
                    }
                }
            }
        }
    })
}
