//! GOAP State Evaluation
//!
//! Pure assertion-set checks used to decide whether actions are ready and
//! whether a goal is done:
//! - Precondition checks against the current world state
//! - Goal progress (satisfied / total assertions)
//!
//! State is decoded from JSON once at the store boundary; nothing in here
//! ever fails. Malformed input means "no constraint" for preconditions and
//! "not satisfied" for goal state.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Assertion map: key -> truth value
pub type Assertions = HashMap<String, bool>;

/// Decode a JSON object into an assertion map.
///
/// Returns `None` for anything that is not a JSON object. Non-boolean
/// values are kept as `false` so they count toward totals but never
/// satisfy a requirement.
pub fn parse_assertions(json: &str) -> Option<Assertions> {
    match serde_json::from_str::<Value>(json).ok()? {
        Value::Object(map) => Some(
            map.into_iter()
                .map(|(k, v)| (k, v.as_bool().unwrap_or(false)))
                .collect(),
        ),
        _ => None,
    }
}

/// Decode a JSON array of precondition keys. Non-string entries are skipped.
pub fn parse_preconditions(json: &str) -> Option<Vec<String>> {
    match serde_json::from_str::<Value>(json).ok()? {
        Value::Array(items) => Some(
            items
                .into_iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
        ),
        _ => None,
    }
}

/// Encode an assertion map back to JSON for storage
pub fn assertions_to_json(assertions: &Assertions) -> String {
    serde_json::to_string(assertions).unwrap_or_else(|_| "{}".to_string())
}

/// True if every listed key is present and `true` in `world`.
///
/// Empty or absent preconditions are always met.
pub fn preconditions_met(preconditions: Option<&[String]>, world: Option<&Assertions>) -> bool {
    let Some(keys) = preconditions else {
        return true;
    };
    keys.iter().all(|k| is_true(world, k))
}

/// Goal progress against the world state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub satisfied: usize,
    pub total: usize,
    pub complete: bool,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.satisfied, self.total)
    }
}

/// Count goal assertions satisfied by the world state.
///
/// A missing goal state yields `total == 0` and is never complete.
pub fn check_progress(goal: Option<&Assertions>, world: Option<&Assertions>) -> Progress {
    let Some(goal) = goal else {
        return Progress::default();
    };

    let total = goal.len();
    let satisfied = goal.keys().filter(|k| is_true(world, k)).count();

    Progress {
        satisfied,
        total,
        complete: total > 0 && satisfied == total,
    }
}

/// Mark each effect key true in the world state
pub fn apply_effects(world: &mut Assertions, effects: &[String]) {
    for key in effects {
        world.insert(key.clone(), true);
    }
}

fn is_true(world: Option<&Assertions>, key: &str) -> bool {
    world
        .and_then(|w| w.get(key))
        .copied()
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world(pairs: &[(&str, bool)]) -> Assertions {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn keys(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_preconditions_always_met() {
        assert!(preconditions_met(None, None));
        assert!(preconditions_met(Some(&[]), None));
        assert!(preconditions_met(Some(&[]), Some(&world(&[("x", false)]))));
    }

    #[test]
    fn test_preconditions_conjunction() {
        let w = world(&[("built", true), ("tested", false)]);
        assert!(preconditions_met(Some(&keys(&["built"])), Some(&w)));
        assert!(!preconditions_met(Some(&keys(&["built", "tested"])), Some(&w)));
        assert!(!preconditions_met(Some(&keys(&["deployed"])), Some(&w)));
        assert!(!preconditions_met(Some(&keys(&["built"])), None));
    }

    #[test]
    fn test_unparseable_preconditions_mean_no_constraint() {
        let parsed = parse_preconditions("not json");
        assert!(parsed.is_none());
        assert!(preconditions_met(parsed.as_deref(), None));
    }

    #[test]
    fn test_progress_counts() {
        let goal = world(&[("a", true), ("b", true)]);
        let w = world(&[("a", true), ("b", false)]);
        let p = check_progress(Some(&goal), Some(&w));
        assert_eq!(p.total, 2);
        assert_eq!(p.satisfied, 1);
        assert!(!p.complete);
        assert_eq!(p.to_string(), "1/2");

        let w = world(&[("a", true), ("b", true)]);
        assert!(check_progress(Some(&goal), Some(&w)).complete);
    }

    #[test]
    fn test_progress_missing_states() {
        let p = check_progress(None, None);
        assert_eq!(p, Progress::default());

        let goal = world(&[("a", true)]);
        let p = check_progress(Some(&goal), None);
        assert_eq!((p.satisfied, p.total, p.complete), (0, 1, false));

        // An empty goal state is never complete
        let p = check_progress(Some(&Assertions::new()), None);
        assert!(!p.complete);
    }

    #[test]
    fn test_parse_assertions() {
        let a = parse_assertions(r#"{"built": true, "count": 3}"#).unwrap();
        assert_eq!(a.get("built"), Some(&true));
        assert_eq!(a.get("count"), Some(&false));
        assert!(parse_assertions("[1,2]").is_none());
        assert!(parse_assertions("{broken").is_none());
    }

    #[test]
    fn test_apply_effects() {
        let mut w = world(&[("a", false)]);
        apply_effects(&mut w, &keys(&["a", "b"]));
        assert_eq!(w.get("a"), Some(&true));
        assert_eq!(w.get("b"), Some(&true));
    }
}
