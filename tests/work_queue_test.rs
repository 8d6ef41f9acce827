//! Work Queue Integration Tests
//!
//! Queue behavior across separately opened handles on one database file.

use goal_supervisor::work_queue::{WorkItemStatus, WorkQueue};
use std::collections::HashSet;
use tempfile::TempDir;

fn create_test_queue(name: &str) -> (WorkQueue, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("work_queues.db");
    let queue = WorkQueue::open(&db_path, name).expect("Failed to open queue");
    (queue, temp_dir)
}

#[test]
fn test_claims_in_fifo_order() {
    let (queue, _temp) = create_test_queue("fifo");

    let first = queue.enqueue("first", None, 3).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    let second = queue.enqueue("second", None, 3).unwrap();

    let claimed = queue.claim("w1").unwrap().unwrap();
    assert_eq!(claimed.id, first);
    assert_eq!(claimed.status, WorkItemStatus::Assigned);
    assert_eq!(claimed.assigned_to.as_deref(), Some("w1"));
    assert_eq!(claimed.attempt_count, 1);

    let claimed = queue.claim("w2").unwrap().unwrap();
    assert_eq!(claimed.id, second);

    assert!(queue.claim("w3").unwrap().is_none());
}

#[test]
fn test_fail_retries_until_attempts_spent() {
    let (queue, _temp) = create_test_queue("retry");
    let id = queue.enqueue("flaky", None, 2).unwrap();

    let item = queue.claim("w1").unwrap().unwrap();
    assert_eq!(queue.fail(&item.id, "boom").unwrap(), WorkItemStatus::Pending);
    assert_eq!(queue.pending_count().unwrap(), 1);

    let item = queue.claim("w2").unwrap().unwrap();
    assert_eq!(item.id, id);
    assert_eq!(item.attempt_count, 2);
    assert_eq!(queue.fail(&item.id, "boom again").unwrap(), WorkItemStatus::Failed);

    assert_eq!(queue.pending_count().unwrap(), 0);
    assert!(queue.claim("w3").unwrap().is_none());

    let item = queue.get_item(&id).unwrap().unwrap();
    assert_eq!(item.status, WorkItemStatus::Failed);
    assert_eq!(item.error.as_deref(), Some("boom again"));
}

#[test]
fn test_terminal_items_stay_terminal() {
    let (queue, _temp) = create_test_queue("terminal");
    let id = queue.enqueue("task", None, 3).unwrap();

    queue.claim("w1").unwrap().unwrap();
    queue.complete(&id, "done").unwrap();

    assert!(queue.fail(&id, "late failure").is_err());
    assert!(queue.claim("w2").unwrap().is_none());

    let item = queue.get_item(&id).unwrap().unwrap();
    assert_eq!(item.status, WorkItemStatus::Completed);
    assert_eq!(item.result.as_deref(), Some("done"));
}

#[test]
fn test_handles_share_one_database() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("work_queues.db");

    let producer = WorkQueue::open(&db_path, "shared").unwrap();
    let consumer = WorkQueue::open(&db_path, "shared").unwrap();
    let other = WorkQueue::open(&db_path, "other").unwrap();

    let id = producer.enqueue("cross-process", Some("{}"), 3).unwrap();
    assert!(other.claim("w").unwrap().is_none());

    let item = consumer.claim("w").unwrap().unwrap();
    assert_eq!(item.id, id);
    assert_eq!(item.context.as_deref(), Some("{}"));

    consumer.complete(&id, "ok").unwrap();
    assert_eq!(
        producer.get_item(&id).unwrap().unwrap().status,
        WorkItemStatus::Completed
    );
}

#[test]
fn test_concurrent_claims_are_exclusive() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("work_queues.db");

    let producer = WorkQueue::open(&db_path, "contended").unwrap();
    let mut enqueued = HashSet::new();
    for i in 0..200 {
        enqueued.insert(producer.enqueue(&format!("task {}", i), None, 3).unwrap());
    }

    // One connection per worker, like separate processes
    let workers: Vec<_> = (0..8)
        .map(|n| (n, WorkQueue::open(&db_path, "contended").unwrap()))
        .collect();
    let handles: Vec<_> = workers
        .into_iter()
        .map(|(n, queue)| {
            std::thread::spawn(move || {
                let worker_id = format!("w{}", n);
                let mut claimed = Vec::new();
                while let Some(item) = queue.claim(&worker_id).unwrap() {
                    assert_eq!(item.assigned_to.as_deref(), Some(worker_id.as_str()));
                    claimed.push(item.id);
                }
                claimed
            })
        })
        .collect();

    let mut total = 0;
    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            total += 1;
            assert!(seen.insert(id), "item claimed twice");
        }
    }

    assert_eq!(total, 200);
    assert_eq!(seen, enqueued);
    assert_eq!(producer.pending_count().unwrap(), 0);
}
