//! Deterministic processing order and dependency eligibility.
//!
//! The sort key is `(group_rank, priority_rank, id)`, ascending and stable:
//! the "current" group first, any other named group second, ungrouped items
//! last and only when explicitly included.

use std::collections::HashSet;

use tracing::warn;

use crate::store::item::{Item, ItemId, ItemState};

/// Group name that always sorts first.
pub const CURRENT_GROUP: &str = "current";

fn group_rank(group: Option<&str>) -> u8 {
    match group {
        Some(CURRENT_GROUP) => 1,
        Some(g) if !g.trim().is_empty() => 2,
        _ => 3,
    }
}

/// Filter and sort pending items into the processing queue.
///
/// Ungrouped items are excluded unless `include_ungrouped` is set, in which
/// case they rank after every named group.
pub fn build_queue(items: &[Item], include_ungrouped: bool) -> Vec<Item> {
    let mut queue: Vec<Item> = items
        .iter()
        .filter(|item| item.state == ItemState::Pending)
        .filter(|item| include_ungrouped || group_rank(item.group.as_deref()) < 3)
        .cloned()
        .collect();
    queue.sort_by_key(|item| {
        (
            group_rank(item.group.as_deref()),
            item.priority.rank(),
            item.id,
        )
    });
    queue
}

/// First queue item whose dependencies are all in `completed`. Scanned fresh
/// on every call; the completed set changes mid-run as items finish.
pub fn next_eligible<'a>(queue: &'a [Item], completed: &HashSet<ItemId>) -> Option<&'a Item> {
    queue
        .iter()
        .find(|item| item.dependencies.iter().all(|dep| completed.contains(dep)))
}

/// Queue items that can never become eligible because a dependency points at
/// an id that neither exists nor has completed. Returned as (item, missing
/// dependency) pairs so the orchestrator can block them loudly instead of
/// letting them sit in the queue forever.
pub fn stalled_items<'a>(
    queue: &'a [Item],
    known: &HashSet<ItemId>,
    completed: &HashSet<ItemId>,
) -> Vec<(&'a Item, ItemId)> {
    let mut stalled = Vec::new();
    for item in queue {
        for dep in &item.dependencies {
            if !known.contains(dep) && !completed.contains(dep) {
                warn!(
                    id = %item.id,
                    missing = %dep,
                    "Item depends on an id that does not exist"
                );
                stalled.push((item, *dep));
                break;
            }
        }
    }
    stalled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::item::{slugify, Priority};

    fn item(id: u32, priority: Priority, group: Option<&str>, deps: &[u32]) -> Item {
        let title = format!("Item {id}");
        Item {
            id: ItemId::new(id),
            state: ItemState::Pending,
            priority,
            group: group.map(str::to_string),
            external_ref: None,
            dependencies: deps.iter().copied().map(ItemId::new).collect(),
            slug: slugify(&title),
            title,
            body: String::new(),
            completed_at: None,
            blocked_at: None,
            blocked_reason: None,
            result_ref: None,
        }
    }

    #[test]
    fn queue_orders_by_group_then_priority_then_id() {
        let items = vec![
            item(5, Priority::P1, None, &[]),
            item(4, Priority::P3, Some("current"), &[]),
            item(3, Priority::P1, Some("next"), &[]),
            item(2, Priority::P1, Some("current"), &[]),
            item(1, Priority::P2, Some("current"), &[]),
        ];
        let queue = build_queue(&items, true);
        let order: Vec<u32> = queue.iter().map(|i| i.id.as_u32()).collect();
        // current/p1, current/p2, current/p3, next/p1, ungrouped/p1
        assert_eq!(order, vec![2, 1, 4, 3, 5]);
    }

    #[test]
    fn ungrouped_items_are_excluded_by_default() {
        let items = vec![
            item(1, Priority::P1, None, &[]),
            item(2, Priority::P1, Some("current"), &[]),
        ];
        let queue = build_queue(&items, false);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, ItemId::new(2));
    }

    #[test]
    fn ties_break_by_ascending_id() {
        let items = vec![
            item(9, Priority::P2, Some("current"), &[]),
            item(3, Priority::P2, Some("current"), &[]),
            item(7, Priority::P2, Some("current"), &[]),
        ];
        let queue = build_queue(&items, false);
        let order: Vec<u32> = queue.iter().map(|i| i.id.as_u32()).collect();
        assert_eq!(order, vec![3, 7, 9]);
    }

    #[test]
    fn non_pending_items_never_enter_the_queue() {
        let mut blocked = item(1, Priority::P1, Some("current"), &[]);
        blocked.state = ItemState::Blocked;
        let queue = build_queue(&[blocked], true);
        assert!(queue.is_empty());
    }

    #[test]
    fn dependency_gates_eligibility_until_completed() {
        let queue = build_queue(
            &[
                item(2, Priority::P1, Some("current"), &[1]),
                item(3, Priority::P2, Some("current"), &[]),
            ],
            false,
        );

        let mut completed = HashSet::new();
        // 002 depends on uncompleted 001, so 003 goes first.
        assert_eq!(
            next_eligible(&queue, &completed).map(|i| i.id),
            Some(ItemId::new(3))
        );

        completed.insert(ItemId::new(1));
        assert_eq!(
            next_eligible(&queue, &completed).map(|i| i.id),
            Some(ItemId::new(2))
        );
    }

    #[test]
    fn no_eligible_item_returns_none() {
        let queue = build_queue(&[item(2, Priority::P1, Some("current"), &[1])], false);
        assert!(next_eligible(&queue, &HashSet::new()).is_none());
    }

    #[test]
    fn missing_dependency_is_surfaced_not_silent() {
        let queue = build_queue(&[item(2, Priority::P1, Some("current"), &[99])], false);
        let known: HashSet<ItemId> = [ItemId::new(2)].into_iter().collect();
        let stalled = stalled_items(&queue, &known, &HashSet::new());
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].0.id, ItemId::new(2));
        assert_eq!(stalled[0].1, ItemId::new(99));
    }

    #[test]
    fn completed_dependency_outside_known_set_is_not_stalled() {
        let queue = build_queue(&[item(2, Priority::P1, Some("current"), &[1])], false);
        let known: HashSet<ItemId> = [ItemId::new(2)].into_iter().collect();
        let completed: HashSet<ItemId> = [ItemId::new(1)].into_iter().collect();
        assert!(stalled_items(&queue, &known, &completed).is_empty());
    }
}
