//! Orphan Recovery Integration Tests
//!
//! Running actions left behind by a dead supervisor, reconciled against the
//! work queue they were dispatched to.

use goal_supervisor::goap::Assertions;
use goal_supervisor::store::{
    ActionStatus, ActionStore, NewAction, SqliteActionStore, SqliteGoalStore,
};
use goal_supervisor::supervisor::recover_orphaned_actions;
use goal_supervisor::work_queue::WorkQueue;
use tempfile::TempDir;

struct Fixture {
    actions: SqliteActionStore,
    queue: WorkQueue,
    goal_id: String,
    _temp: TempDir,
}

fn fixture() -> Fixture {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let goals = SqliteGoalStore::open(temp.path().join("goals.db")).unwrap();
    let actions = SqliteActionStore::open(temp.path().join("goals.db")).unwrap();

    let state: Assertions = [("shipped".to_string(), true)].into_iter().collect();
    let goal = goals.create("ship", None, &state, Some("ship-queue")).unwrap();
    let queue = WorkQueue::open(&temp.path().join("work_queues.db"), &goal.queue_name).unwrap();

    Fixture {
        actions,
        queue,
        goal_id: goal.id,
        _temp: temp,
    }
}

impl Fixture {
    /// A Running action, optionally linked to a work item
    fn running_action(&self, description: &str, work_item: Option<&str>) -> String {
        let id = self
            .actions
            .insert(&NewAction {
                goal_id: &self.goal_id,
                description,
                ..Default::default()
            })
            .unwrap();
        self.actions.update_status(&id, ActionStatus::Running, None).unwrap();
        if let Some(item) = work_item {
            self.actions.update_work_item(&id, item).unwrap();
        }
        id
    }

    fn status(&self, id: &str) -> ActionStatus {
        self.actions.get(id).unwrap().unwrap().status
    }
}

#[test]
fn test_recovery_table() {
    let f = fixture();

    let no_item = f.running_action("never linked", None);
    let missing = f.running_action("linked to nothing", Some("no-such-item"));

    // Claims take the oldest pending item, so set up claimed items first
    let claimed_item = f.queue.enqueue("claimed", None, 3).unwrap();
    f.queue.claim("w1").unwrap().unwrap();
    let claimed = f.running_action("claimed", Some(&claimed_item));

    let done_item = f.queue.enqueue("done", None, 3).unwrap();
    f.queue.claim("w2").unwrap().unwrap();
    f.queue.complete(&done_item, "built it").unwrap();
    let done = f.running_action("done", Some(&done_item));

    let failed_item = f.queue.enqueue("failed", None, 1).unwrap();
    f.queue.claim("w3").unwrap().unwrap();
    f.queue.fail(&failed_item, "compiler exploded").unwrap();
    let failed = f.running_action("failed", Some(&failed_item));

    let queued_item = f.queue.enqueue("queued", None, 3).unwrap();
    let queued = f.running_action("queued", Some(&queued_item));

    let recovered = recover_orphaned_actions(&f.actions, &f.queue, &f.goal_id).unwrap();
    // Everything except the claimed one changes
    assert_eq!(recovered, 5);

    assert_eq!(f.status(&no_item), ActionStatus::Pending);
    assert_eq!(f.status(&missing), ActionStatus::Pending);
    assert_eq!(f.status(&queued), ActionStatus::Pending);
    assert_eq!(f.status(&claimed), ActionStatus::Running);

    let done = f.actions.get(&done).unwrap().unwrap();
    assert_eq!(done.status, ActionStatus::Completed);
    assert_eq!(done.result.as_deref(), Some("built it"));

    let failed = f.actions.get(&failed).unwrap().unwrap();
    assert_eq!(failed.status, ActionStatus::Failed);
    assert_eq!(failed.result.as_deref(), Some("compiler exploded"));
}

#[test]
fn test_pending_item_resets_action() {
    let f = fixture();
    let item = f.queue.enqueue("waiting", None, 3).unwrap();
    let action = f.running_action("waiting", Some(&item));

    assert_eq!(recover_orphaned_actions(&f.actions, &f.queue, &f.goal_id).unwrap(), 1);
    assert_eq!(f.status(&action), ActionStatus::Pending);
}

#[test]
fn test_recovery_is_idempotent() {
    let f = fixture();
    f.running_action("orphan", None);

    assert_eq!(recover_orphaned_actions(&f.actions, &f.queue, &f.goal_id).unwrap(), 1);
    assert_eq!(recover_orphaned_actions(&f.actions, &f.queue, &f.goal_id).unwrap(), 0);
}
