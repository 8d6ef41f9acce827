//! Orphan recovery
//!
//! After a crash, actions can be left Running with nobody tracking them.
//! Each one is reconciled against the work queue before execution resumes:
//!
//! | work item            | action becomes     |
//! |----------------------|--------------------|
//! | none / missing       | Pending            |
//! | Pending              | Pending            |
//! | Assigned             | Running (as is)    |
//! | Completed            | Completed + result |
//! | Failed               | Failed             |

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::store::{ActionStatus, ActionStore};
use crate::work_queue::{WorkItemStatus, WorkQueue};

/// Reconcile every Running action of a goal. Returns how many changed.
pub fn recover_orphaned_actions(
    actions: &dyn ActionStore,
    queue: &WorkQueue,
    goal_id: &str,
) -> Result<usize> {
    let running = actions
        .list_running(goal_id)
        .with_context(|| format!("listing running actions of {}", goal_id))?;

    let mut recovered = 0;
    for action in running {
        let item = match action.work_item_id.as_deref() {
            Some(item_id) => queue
                .get_item(item_id)
                .with_context(|| format!("looking up work item {}", item_id))?,
            None => None,
        };

        let (status, result) = match &item {
            None => (ActionStatus::Pending, None),
            Some(item) => match item.status {
                WorkItemStatus::Assigned => {
                    debug!("Action {} still claimed by {:?}", action.id, item.assigned_to);
                    continue;
                }
                WorkItemStatus::Completed => (ActionStatus::Completed, item.result.as_deref()),
                WorkItemStatus::Failed => (ActionStatus::Failed, item.error.as_deref()),
                // Still queued; it may be claimed again later
                WorkItemStatus::Pending => (ActionStatus::Pending, None),
            },
        };

        actions
            .update_status(&action.id, status, result)
            .with_context(|| format!("recovering action {}", action.id))?;
        info!(
            "Recovered orphaned action {} -> {} (work item {})",
            action.id,
            status.as_str(),
            item.as_ref().map(|i| i.status.as_str()).unwrap_or("missing")
        );
        recovered += 1;
    }

    if recovered > 0 {
        info!("Recovered {} orphaned actions for goal {}", recovered, goal_id);
    }
    Ok(recovered)
}
