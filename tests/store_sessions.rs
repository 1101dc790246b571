use chrono::{Duration, Utc};
use std::collections::BTreeSet;

use nettally::models::flow::Protocol;
use nettally::models::session::{EndOutcome, NewRecord, RecordFilter};
use nettally::SessionStore;

fn sample(offset_secs: i64, protocol: Protocol, process: &str, in_rate: f64) -> NewRecord {
    let base = Utc::now();
    NewRecord {
        in_rate,
        out_rate: 10.0,
        in_bytes: in_rate as u64,
        out_bytes: 10,
        src_addr: Some("10.0.0.5".to_string()),
        dst_addr: Some("10.0.0.9".to_string()),
        process_name: Some(process.to_string()),
        protocol: Some(protocol),
        record_time: base + Duration::seconds(offset_secs),
    }
}

fn temp_store() -> (tempfile::TempDir, SessionStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::open(dir.path().join("history.db"), 3).unwrap();
    (dir, store)
}

#[tokio::test]
async fn protocol_and_rate_filters_compose_and_keep_capture_order() {
    let (_dir, store) = temp_store();
    let id = store.start_session("eth0").await.unwrap();

    // Appended out of capture order on purpose
    store.append_record(id, sample(3, Protocol::Tcp, "firefox", 80.0)).await.unwrap();
    store.append_record(id, sample(1, Protocol::Tcp, "curl", 120.0)).await.unwrap();
    store.append_record(id, sample(2, Protocol::Udp, "dnsmasq", 500.0)).await.unwrap();
    store.append_record(id, sample(4, Protocol::Tcp, "curl", 20.0)).await.unwrap();
    store.append_record(id, sample(0, Protocol::Other, "ping", 90.0)).await.unwrap();

    let filter = RecordFilter {
        protocols: BTreeSet::from([Protocol::Tcp]),
        min_in_rate: Some(50.0),
        ..RecordFilter::default()
    };
    let records = store.get_records(id, Some(&filter)).await.unwrap();

    let rates: Vec<f64> = records.iter().map(|r| r.in_rate).collect();
    assert_eq!(rates, vec![120.0, 80.0]);
    assert!(records.iter().all(|r| filter.matches(r)));
    assert!(records.windows(2).all(|w| w[0].record_time <= w[1].record_time));

    let by_process = RecordFilter {
        process_name: Some("curl".to_string()),
        ..RecordFilter::default()
    };
    assert_eq!(store.get_records(id, Some(&by_process)).await.unwrap().len(), 2);

    let any = RecordFilter {
        protocols: BTreeSet::from([Protocol::Udp, Protocol::Other]),
        ..RecordFilter::default()
    };
    assert_eq!(store.get_records(id, Some(&any)).await.unwrap().len(), 2);

    // An empty filter constrains nothing
    let everything = store.get_records(id, Some(&RecordFilter::default())).await.unwrap();
    assert_eq!(everything.len(), 5);
}

#[tokio::test]
async fn ending_twice_is_harmless_and_keeps_the_first_end_time() {
    let (_dir, store) = temp_store();
    let a = store.start_session("eth0").await.unwrap();
    let b = store.start_session("wlan0").await.unwrap();

    store.append_record(a, sample(0, Protocol::Tcp, "curl", 100.0)).await.unwrap();
    store.append_record(b, sample(0, Protocol::Udp, "dig", 300.0)).await.unwrap();
    store.append_record(b, sample(1, Protocol::Udp, "dig", 100.0)).await.unwrap();

    let EndOutcome::Ended(first) = store.end_session(a).await.unwrap() else {
        panic!("session a exists");
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let EndOutcome::Ended(second) = store.end_session(a).await.unwrap() else {
        panic!("session a exists");
    };

    assert_eq!(first.end_time, second.end_time);
    assert_eq!(second.record_count, 1);
    assert_eq!(second.avg_in, 100.0);

    let EndOutcome::Ended(other) = store.end_session(b).await.unwrap() else {
        panic!("session b exists");
    };
    assert_eq!(other.record_count, 2);
    assert_eq!(other.avg_in, 200.0);
    assert_eq!(other.max_in, 300.0);
    assert_eq!(other.total_in_bytes, 400);
}

#[tokio::test]
async fn ending_an_unknown_session_reports_not_found() {
    let (_dir, store) = temp_store();
    assert_eq!(store.end_session(12345).await.unwrap(), EndOutcome::NotFound);
    assert!(store.list_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn deleting_sessions_cascades_to_records() {
    let (_dir, store) = temp_store();
    let keep = store.start_session("eth0").await.unwrap();
    let drop_a = store.start_session("eth0").await.unwrap();
    let drop_b = store.start_session("eth1").await.unwrap();

    for id in [keep, drop_a, drop_b] {
        store.append_record(id, sample(0, Protocol::Tcp, "curl", 1.0)).await.unwrap();
    }

    let deleted = store.delete_sessions(&[drop_a, drop_b, 999]).await.unwrap();
    assert_eq!(deleted, 2);

    assert!(store.get_session(drop_a).await.unwrap().is_none());
    assert!(store.get_records(drop_a, None).await.unwrap().is_empty());
    assert!(store.get_records(drop_b, None).await.unwrap().is_empty());
    assert_eq!(store.get_records(keep, None).await.unwrap().len(), 1);

    let remaining: Vec<_> = store.list_sessions().await.unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(remaining, vec![keep]);
    assert_eq!(store.delete_sessions(&[]).await.unwrap(), 0);
}

#[tokio::test]
async fn history_survives_reopening_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.db");

    let id = {
        let store = SessionStore::open(&path, 3).unwrap();
        let id = store.start_session("eth0").await.unwrap();
        store.append_record(id, sample(0, Protocol::Tcp, "curl", 64.0)).await.unwrap();
        store.end_session(id).await.unwrap();
        id
    };

    let reopened = SessionStore::open(&path, 3).unwrap();
    let session = reopened.get_session(id).await.unwrap().unwrap();
    assert_eq!(session.interface_name, "eth0");
    assert_eq!(session.record_count, 1);
    assert_eq!(session.total_in_bytes, 64);
    assert!(!session.is_active());
}
