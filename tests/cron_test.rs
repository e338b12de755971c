//! Integration tests for the cron scheduler.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::json;
use taskq::broker::Broker;
use taskq::engine::CronScheduler;
use taskq::model::CronEntry;
use taskq::store::{End, MemoryStore, Store};

fn test_broker() -> Broker {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    Broker::new(store)
}

fn at(day: u32, hour: u32, minute: u32, second: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, day, hour, minute, second)
        .unwrap()
}

#[test]
fn hour_only_entry_fires_at_top_of_its_hour() {
    let broker = test_broker();
    broker
        .add_cron(&CronEntry::new("nightly", "maint").at(Some(3), None))
        .unwrap();
    let mut cron = CronScheduler::new(broker.clone());

    assert_eq!(cron.tick(&at(1, 2, 59, 30)).unwrap(), 0);
    assert_eq!(cron.tick(&at(1, 3, 0, 5)).unwrap(), 1);
    assert_eq!(cron.tick(&at(1, 3, 1, 0)).unwrap(), 0);
    assert_eq!(cron.tick(&at(1, 3, 30, 0)).unwrap(), 0);
    assert_eq!(cron.tick(&at(1, 4, 0, 0)).unwrap(), 0);
    assert_eq!(broker.queue_len("maint").unwrap(), 1);

    let (_, env) = broker.dequeue("maint", None, End::Head).unwrap().unwrap();
    assert_eq!(env.call.target.function, "nightly");
}

#[test]
fn two_ticks_in_one_minute_fire_once() {
    let broker = test_broker();
    broker
        .add_cron(&CronEntry::new("ping", "default").at(None, Some(15)))
        .unwrap();
    let mut cron = CronScheduler::new(broker.clone());

    assert_eq!(cron.tick(&at(1, 10, 15, 1)).unwrap(), 1);
    broker.dequeue("default", None, End::Head).unwrap();
    assert_eq!(cron.tick(&at(1, 10, 15, 56)).unwrap(), 0);
    assert_eq!(broker.queue_len("default").unwrap(), 0);

    assert_eq!(cron.tick(&at(1, 11, 15, 0)).unwrap(), 1);
    assert_eq!(cron.tick(&at(2, 10, 15, 0)).unwrap(), 1);
}

#[test]
fn entry_arguments_are_passed_through() {
    let broker = test_broker();
    let mut entry = CronEntry::new("report", "default").at(Some(8), Some(30));
    entry.args = vec![json!("daily")];
    entry.kwargs.insert("format".into(), json!("pdf"));
    broker.add_cron(&entry).unwrap();
    let mut cron = CronScheduler::new(broker.clone());

    assert_eq!(cron.tick(&at(5, 8, 30, 0)).unwrap(), 1);
    let (_, env) = broker.dequeue("default", None, End::Head).unwrap().unwrap();
    assert_eq!(env.call.args, vec![json!("daily")]);
    assert_eq!(env.call.kwargs["format"], json!("pdf"));
}

#[test]
fn removed_entry_no_longer_fires() {
    let broker = test_broker();
    let entry = CronEntry::new("tick", "default");
    assert!(broker.add_cron(&entry).unwrap());
    assert!(!broker.add_cron(&entry).unwrap());
    assert_eq!(broker.cron_entries().unwrap().len(), 1);
    assert!(broker.remove_cron(&entry).unwrap());

    let mut cron = CronScheduler::new(broker.clone());
    assert_eq!(cron.tick(&at(1, 0, 0, 0)).unwrap(), 0);
}
