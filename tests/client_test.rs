//! Integration tests for the producer API.

use std::sync::Arc;

use serde_json::{Map, json};
use taskq::broker::Broker;
use taskq::model::*;
use taskq::store::{MemoryStore, Store};
use taskq::{CommitHooks, Error, Invocation, Submitted, TaskClient, TaskRegistry};

fn test_client() -> TaskClient {
    let mut registry = TaskRegistry::new();
    registry
        .register("send", "mail", |_, _, _| Ok(json!(null)))
        .register("log", "audit", |_, _, _| Ok(json!(null)));
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    TaskClient::new(Broker::new(store), Arc::new(registry))
}

#[test]
fn invoke_uses_default_queue() {
    let client = test_client();
    let submitted = client
        .invoke(Invocation::new("send").arg("bob@example.com"))
        .unwrap();
    assert!(matches!(submitted, Submitted::Enqueued(ref e) if e.created));
    assert_eq!(client.broker().queue_len("mail").unwrap(), 1);
}

#[test]
fn queue_resolution_order() {
    let client = test_client();
    let explicit = client
        .envelope(&Invocation::new("bulk:send").queue("urgent"))
        .unwrap();
    assert_eq!(explicit.call.target, Target::new("urgent", "send"));

    let qualified = client.envelope(&Invocation::new("bulk:send")).unwrap();
    assert_eq!(qualified.call.target, Target::new("bulk", "send"));

    let default = client.envelope(&Invocation::new("send")).unwrap();
    assert_eq!(default.call.target, Target::new("mail", "send"));

    assert!(matches!(
        client.envelope(&Invocation::new("nope")),
        Err(Error::UnknownTask(_))
    ));
}

#[test]
fn identical_invocations_collapse() {
    let client = test_client();
    let inv = Invocation::new("send").arg(1).kwarg("cc", "x");
    let first = client.invoke(inv.clone()).unwrap();
    let second = client.invoke(inv).unwrap();
    assert_eq!(first.key(), second.key());
    assert!(matches!(second, Submitted::Enqueued(ref e) if !e.created));
    assert_eq!(client.broker().queue_len("mail").unwrap(), 1);
}

#[test]
fn priority_goes_to_head() {
    let client = test_client();
    client.invoke(Invocation::new("send").arg(1)).unwrap();
    client
        .invoke(Invocation::new("send").arg(2).priority())
        .unwrap();
    let queued = client.broker().list_queued("mail").unwrap();
    assert_eq!(queued[0].1.call.args[0], json!(2));
}

#[test]
fn via_buffer_lands_in_buffer() {
    let client = test_client();
    let submitted = client
        .invoke(Invocation::new("send").arg(1).via_buffer())
        .unwrap();
    assert!(matches!(submitted, Submitted::Buffered(ref b) if b.accepted));
    assert_eq!(client.broker().buffer_len("mail").unwrap(), 1);
    assert_eq!(client.broker().queue_len("mail").unwrap(), 0);
}

#[test]
fn continuations_change_the_key() {
    let client = test_client();
    let callback = client
        .prepare_callback("log", vec![json!("sent")], Map::new())
        .unwrap();
    assert_eq!(callback.target, Target::new("audit", "log"));

    let plain = client.invoke(Invocation::new("send").arg(1)).unwrap();
    let chained = client
        .invoke(Invocation::new("send").arg(1).on_success(callback))
        .unwrap();
    assert_ne!(plain.key(), chained.key());
    assert_eq!(client.broker().queue_len("mail").unwrap(), 2);
}

#[test]
fn prepare_callback_accepts_qualified_names() {
    let client = test_client();
    let call = client
        .prepare_callback("other:thing", vec![], Map::new())
        .unwrap();
    assert_eq!(call.target, Target::new("other", "thing"));
}

#[test]
fn invoke_on_commit_waits_for_commit() {
    let client = test_client();
    let unit = CommitHooks::new();
    let key = client
        .invoke_on_commit(Invocation::new("send").arg(1), &unit)
        .unwrap();
    assert_eq!(client.broker().queue_len("mail").unwrap(), 0);

    unit.commit();
    let queued = client.broker().list_queued("mail").unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].0, key);
}

#[test]
fn invoke_on_commit_dropped_on_rollback() {
    let client = test_client();
    let unit = CommitHooks::new();
    client
        .invoke_on_commit(Invocation::new("send").arg(1), &unit)
        .unwrap();
    unit.rollback();
    assert_eq!(client.broker().queue_len("mail").unwrap(), 0);
}

#[test]
fn invoke_on_commit_rejects_unknown_function_up_front() {
    let client = test_client();
    let unit = CommitHooks::new();
    assert!(
        client
            .invoke_on_commit(Invocation::new("nope"), &unit)
            .is_err()
    );
}

#[test]
fn status_tracks_and_promotes() {
    let client = test_client();
    let first = Invocation::new("send").arg(1);
    let second = Invocation::new("send").arg(2);
    assert_eq!(client.status(&first, false).unwrap(), TaskStatus::Absent);

    client.invoke(first.clone()).unwrap();
    client.invoke(second.clone()).unwrap();
    assert_eq!(client.status(&second, true).unwrap(), TaskStatus::Queued);

    let queued = client.broker().list_queued("mail").unwrap();
    assert_eq!(queued[0].1.call.args[0], json!(2));
}
