//! Integration tests for the broker: dedup, ordering, error records, the
//! intake buffer and status lookup, all against the in-memory store.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use taskq::broker::Broker;
use taskq::engine::buffer;
use taskq::model::*;
use taskq::store::{End, MemoryStore, Store};
use uuid::Uuid;

fn test_broker() -> Broker {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    Broker::new(store)
}

fn envelope(queue: &str, n: i64) -> Envelope {
    Envelope::new(
        TaskCall::new(Target::new(queue, "work")).arg(json!(n)),
        Continuations::default(),
    )
}

fn drain(broker: &Broker, queue: &str) -> Vec<i64> {
    let mut out = Vec::new();
    while let Some((_, env)) = broker.dequeue(queue, None, End::Head).unwrap() {
        out.push(env.call.args[0].as_i64().unwrap());
    }
    out
}

// ---------------------------------------------------------------------------
// Enqueue / dequeue
// ---------------------------------------------------------------------------

#[test]
fn duplicate_enqueue_keeps_one_entry() {
    let broker = test_broker();
    let env = envelope("q", 1);

    let first = broker.enqueue(&env, false).unwrap();
    let second = broker.enqueue(&env, false).unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.key, second.key);
    assert_eq!(broker.queue_len("q").unwrap(), 1);
    assert_eq!(broker.store().map_keys("hash:task:q").unwrap().len(), 1);
}

#[test]
fn tail_enqueues_come_out_in_order() {
    let broker = test_broker();
    for n in 1..=5 {
        broker.enqueue(&envelope("q", n), false).unwrap();
    }
    assert_eq!(drain(&broker, "q"), vec![1, 2, 3, 4, 5]);
}

#[test]
fn head_enqueue_jumps_the_line() {
    let broker = test_broker();
    broker.enqueue(&envelope("q", 1), false).unwrap();
    broker.enqueue(&envelope("q", 2), false).unwrap();
    broker.enqueue(&envelope("q", 3), true).unwrap();
    assert_eq!(drain(&broker, "q"), vec![3, 1, 2]);
}

#[test]
fn duplicate_keeps_original_position() {
    let broker = test_broker();
    broker.enqueue(&envelope("q", 1), false).unwrap();
    broker.enqueue(&envelope("q", 2), false).unwrap();
    broker.enqueue(&envelope("q", 1), true).unwrap();
    assert_eq!(drain(&broker, "q"), vec![1, 2]);
}

#[test]
fn dequeue_removes_map_entry_and_allows_requeue() {
    let broker = test_broker();
    let env = envelope("q", 7);
    broker.enqueue(&env, false).unwrap();

    let (key, got) = broker.dequeue("q", None, End::Head).unwrap().unwrap();
    assert_eq!(key, env.dedup_key().unwrap());
    assert_eq!(got.call, env.call);
    assert!(broker.store().map_keys("hash:task:q").unwrap().is_empty());

    assert!(broker.enqueue(&env, false).unwrap().created);
}

#[test]
fn key_without_envelope_dequeues_as_none() {
    let broker = test_broker();
    broker.push_key("q", "dangling", End::Tail).unwrap();
    broker.wake("q").unwrap();
    assert!(broker.dequeue("q", None, End::Head).unwrap().is_none());
    assert!(broker.dequeue("q", None, End::Head).unwrap().is_none());
    assert_eq!(broker.queue_len("q").unwrap(), 0);
}

#[test]
fn tail_direction_pops_newest_first() {
    let broker = test_broker();
    broker.enqueue(&envelope("q", 1), false).unwrap();
    broker.enqueue(&envelope("q", 2), false).unwrap();
    let (_, env) = broker.dequeue("q", None, End::Tail).unwrap().unwrap();
    assert_eq!(env.call.args[0], json!(2));
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[test]
fn peek_status_reports_queued_and_absent() {
    let broker = test_broker();
    let env = envelope("q", 1);
    let none = Continuations::default();

    assert_eq!(
        broker.peek_status(&env.call, &none, false).unwrap(),
        TaskStatus::Absent
    );
    broker.enqueue(&env, false).unwrap();
    assert_eq!(
        broker.peek_status(&env.call, &none, false).unwrap(),
        TaskStatus::Queued
    );
}

#[test]
fn peek_status_promote_moves_to_head() {
    let broker = test_broker();
    for n in 1..=3 {
        broker.enqueue(&envelope("q", n), false).unwrap();
    }
    let third = envelope("q", 3);
    broker
        .peek_status(&third.call, &Continuations::default(), true)
        .unwrap();
    assert_eq!(drain(&broker, "q"), vec![3, 1, 2]);
}

#[test]
fn peek_status_finds_running_job_first() {
    let broker = test_broker();
    let mut env = envelope("q", 1);
    env.mark_started("w1", "q-0");
    broker
        .write_job_state(&JobState {
            worker: "w1".into(),
            thread: "q-0".into(),
            boot_id: Uuid::new_v4(),
            envelope: env.clone(),
            updated_at: Utc::now(),
        })
        .unwrap();

    let status = broker
        .peek_status(&env.call, &Continuations::default(), false)
        .unwrap();
    assert_eq!(
        status,
        TaskStatus::Running {
            worker: "w1".into(),
            thread: "q-0".into()
        }
    );
}

// ---------------------------------------------------------------------------
// Error records
// ---------------------------------------------------------------------------

fn failed(queue: &str, n: i64) -> Envelope {
    let mut env = envelope(queue, n);
    env.mark_started("w1", "q-0");
    env.mark_finished(return_code::FAILED, Some("boom".into()));
    env
}

#[test]
fn filing_same_failure_twice_keeps_one_record() {
    let broker = test_broker();
    broker.file_error(&failed("q", 1)).unwrap();
    broker.file_error(&failed("q", 1)).unwrap();
    broker.file_error(&failed("q", 2)).unwrap();
    assert_eq!(broker.error_count("q").unwrap(), 2);

    let records = broker.list_errors("q").unwrap();
    assert_eq!(records[0].1.call.args[0], json!(1));
    assert_eq!(records[0].1.runtime.reason.as_deref(), Some("boom"));
}

#[test]
fn replay_moves_record_back_with_clean_runtime() {
    let broker = test_broker();
    let env = failed("q", 1);
    let key = broker.file_error(&env).unwrap();

    let enqueued = broker.replay_error("q", &key).unwrap();
    assert!(enqueued.created);
    assert_eq!(enqueued.key, key);
    assert_eq!(broker.error_count("q").unwrap(), 0);

    let (_, back) = broker.dequeue("q", None, End::Head).unwrap().unwrap();
    assert_eq!(back.call, env.call);
    assert!(back.runtime.started_at.is_none());
    assert!(back.runtime.return_code.is_none());
    assert!(back.runtime.reason.is_none());
    assert_eq!(back.runtime.created_at, env.runtime.created_at);
}

#[test]
fn replay_all_and_delete() {
    let broker = test_broker();
    for n in 1..=3 {
        broker.file_error(&failed("q", n)).unwrap();
    }
    let doomed = failed("q", 4);
    let doomed_key = broker.file_error(&doomed).unwrap();
    broker.delete_error("q", &doomed_key).unwrap();

    assert_eq!(broker.replay_all_errors("q").unwrap(), 3);
    assert_eq!(drain(&broker, "q"), vec![1, 2, 3]);
    assert!(matches!(
        broker.delete_error("q", &doomed_key),
        Err(taskq::Error::NotFound(_))
    ));
}

#[test]
fn job_states_of_one_worker_exclude_ids_sharing_its_prefix() {
    let broker = test_broker();
    for worker in ["w1", "w1:x"] {
        broker
            .write_job_state(&JobState {
                worker: worker.into(),
                thread: "q-0".into(),
                boot_id: Uuid::new_v4(),
                envelope: envelope("q", 1),
                updated_at: Utc::now(),
            })
            .unwrap();
    }

    let mine = broker.job_states(Some("w1")).unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].worker, "w1");
    assert_eq!(broker.job_states(None).unwrap().len(), 2);
}

// ---------------------------------------------------------------------------
// Buffer and backpressure
// ---------------------------------------------------------------------------

#[test]
fn buffer_skips_calls_already_queued() {
    let broker = test_broker();
    let env = envelope("q", 1);
    broker.enqueue(&env, false).unwrap();
    assert!(!broker.push_buffer(&env, false).unwrap().accepted);
    assert!(broker.push_buffer(&envelope("q", 2), false).unwrap().accepted);
    assert_eq!(broker.buffer_len("q").unwrap(), 1);
}

#[test]
fn buffering_the_same_call_twice_keeps_one_entry() {
    let broker = test_broker();
    let env = envelope("q", 1);
    let first = broker.push_buffer(&env, false).unwrap();
    let second = broker.push_buffer(&env, false).unwrap();
    assert!(first.accepted);
    assert!(!second.accepted);
    assert_eq!(first.key, second.key);
    assert_eq!(broker.buffer_len("q").unwrap(), 1);
    assert_eq!(
        broker.peek_status(&env.call, &env.continuations, false).unwrap(),
        TaskStatus::Queued
    );

    // A direct enqueue of a buffered call is a duplicate too.
    assert!(!broker.enqueue(&env, false).unwrap().created);

    assert_eq!(buffer::admit(&broker, "q", 10).unwrap(), 1);
    assert_eq!(broker.buffer_len("q").unwrap(), 0);
    assert_eq!(broker.queue_len("q").unwrap(), 1);
    assert_eq!(drain(&broker, "q"), vec![1]);
}

#[test]
fn promoting_a_buffered_call_moves_it_to_the_work_queue_head() {
    let broker = test_broker();
    broker.enqueue(&envelope("q", 1), false).unwrap();
    let buffered = envelope("q", 2);
    broker.push_buffer(&buffered, false).unwrap();

    assert_eq!(
        broker
            .peek_status(&buffered.call, &buffered.continuations, true)
            .unwrap(),
        TaskStatus::Queued
    );
    assert_eq!(broker.buffer_len("q").unwrap(), 0);
    assert_eq!(drain(&broker, "q"), vec![2, 1]);
}

#[test]
fn admit_fills_until_room_is_one() {
    let broker = test_broker();
    broker.enqueue(&envelope("q", 0), false).unwrap();
    for n in 1..=5 {
        broker.push_buffer(&envelope("q", n), false).unwrap();
    }

    assert_eq!(buffer::admit(&broker, "q", 3).unwrap(), 1);
    assert_eq!(broker.queue_len("q").unwrap(), 2);
    assert_eq!(broker.buffer_len("q").unwrap(), 4);
}

#[test]
fn admit_nothing_when_queue_is_at_limit() {
    let broker = test_broker();
    for n in 0..3 {
        broker.enqueue(&envelope("q", n), false).unwrap();
    }
    broker.push_buffer(&envelope("q", 9), false).unwrap();

    assert_eq!(buffer::admit(&broker, "q", 3).unwrap(), 0);
    assert_eq!(broker.queue_len("q").unwrap(), 3);
}

#[test]
fn admit_stops_when_buffer_runs_dry() {
    let broker = test_broker();
    broker.push_buffer(&envelope("q", 1), false).unwrap();
    broker.push_buffer(&envelope("q", 2), false).unwrap();
    assert_eq!(buffer::admit(&broker, "q", 10).unwrap(), 2);
    assert_eq!(drain(&broker, "q"), vec![1, 2]);
}

#[test]
fn pass_only_touches_queues_with_a_limit() {
    let broker = test_broker();
    broker
        .set_queue_settings(
            "limited",
            &QueueSettings {
                thread_limit: Some(5),
                ..Default::default()
            },
        )
        .unwrap();
    broker
        .set_queue_settings("open", &QueueSettings::default())
        .unwrap();
    for n in 1..=3 {
        broker.push_buffer(&envelope("limited", n), false).unwrap();
        broker.push_buffer(&envelope("open", n), false).unwrap();
    }

    assert_eq!(buffer::pass(&broker).unwrap(), 3);
    assert_eq!(broker.queue_len("limited").unwrap(), 3);
    assert_eq!(broker.buffer_len("open").unwrap(), 3);
}

// ---------------------------------------------------------------------------
// Worklog and commands
// ---------------------------------------------------------------------------

#[test]
fn worklog_is_bounded_and_newest_first() {
    let broker = test_broker().with_worklog_len(3);
    for n in 1..=5 {
        let mut env = envelope("q", n);
        env.mark_started("w1", "q-0");
        env.mark_finished(return_code::OK, None);
        broker
            .append_worklog(&WorklogRecord::from_envelope(&env.dedup_key().unwrap(), &env))
            .unwrap();
    }
    let log = broker.worklog(10).unwrap();
    assert_eq!(log.len(), 3);
    assert_eq!(log[0].key, envelope("q", 5).dedup_key().unwrap());
    assert_eq!(log[2].key, envelope("q", 3).dedup_key().unwrap());
}

#[test]
fn command_channel_delivers_in_order_and_wakes() {
    use taskq::broker::control::Delivery;

    let broker = test_broker();
    assert!(broker.push_command("w1", &Command::report()).unwrap());
    assert!(!broker.push_command("w1", &Command::report()).unwrap());
    assert!(broker.push_command("w1", &Command::kill(42)).unwrap());
    broker.wake_commands("w1").unwrap();

    assert_eq!(broker.pop_command("w1", None).unwrap(), Some(Delivery::Wake));
    match broker.pop_command("w1", None).unwrap() {
        Some(Delivery::Command(c)) => assert_eq!(c.verb, Verb::Report),
        other => panic!("expected report, got {other:?}"),
    }
    match broker.pop_command("w1", None).unwrap() {
        Some(Delivery::Command(c)) => assert_eq!(c.pid, Some(42)),
        other => panic!("expected kill, got {other:?}"),
    }
    assert!(broker.pop_command("w1", None).unwrap().is_none());
}
