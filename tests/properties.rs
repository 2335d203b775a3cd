// tests/properties.rs

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;
use serde_json::{Value, json};

use auditflow::condition::{Comparator, Condition, Literal};
use auditflow::engine::flowr::partition_objects;
use auditflow::graph::FlowObject;
use auditflow::ledger::record_attempt;
use auditflow::store::Resource;
use auditflow::types::{ObjectStatus, ResourceKind};

proptest! {
    // The attempt counter never passes the ceiling, and only calls made at
    // the ceiling report it.
    #[test]
    fn ledger_never_counts_past_the_ceiling(ceiling in 1u32..6, calls in 1usize..15) {
        let mut tasks = Vec::new();
        for n in 0..calls {
            let maxed = record_attempt(&mut tasks, "html", &format!("t{n}"), Value::Null, ceiling);
            prop_assert_eq!(maxed, n as u32 >= ceiling);
        }
        prop_assert_eq!(tasks.len(), 1);
        prop_assert_eq!(tasks[0].attempts, (calls as u32).min(ceiling));
        prop_assert_eq!(&tasks[0].task_id, &format!("t{}", calls - 1));
    }

    // Each object lands in exactly one bucket, under a fresh parent, and the
    // bucket agrees with the threshold.
    #[test]
    fn routing_sends_every_object_to_exactly_one_branch(
        healths in proptest::collection::vec(0u32..=100, 0..20),
        threshold in 0u32..=100,
    ) {
        let mut resources = HashMap::new();
        let mut objects = Vec::new();
        for (i, health) in healths.iter().enumerate() {
            let mut resource = Resource::new(ResourceKind::Scan, "acct", Vec::new());
            resource.data = json!({ "health": health });
            objects.push(FlowObject {
                parent: format!("p{i}"),
                id: Some(resource.id.clone()),
                status: ObjectStatus::Passed,
            });
            resources.insert(resource.id.clone(), resource);
        }

        let condition =
            Condition::comparison("health", Comparator::Ge, Literal::Number(f64::from(threshold)));
        let lookup = |id: &str| resources.get(id).cloned();
        let (yes, no) = partition_objects(&condition, &objects, &lookup);

        prop_assert_eq!(yes.len() + no.len(), objects.len());

        let ids: HashSet<_> = yes.iter().chain(&no).filter_map(|o| o.id.clone()).collect();
        prop_assert_eq!(ids.len(), objects.len());

        let parents: HashSet<_> = yes.iter().chain(&no).map(|o| o.parent.as_str()).collect();
        prop_assert_eq!(parents.len(), objects.len());
        for object in &objects {
            prop_assert!(!parents.contains(object.parent.as_str()));
        }

        for routed in yes.iter().chain(&no) {
            prop_assert_eq!(routed.status, ObjectStatus::Working);
        }
        let expected_yes = healths.iter().filter(|&&h| h >= threshold).count();
        prop_assert_eq!(yes.len(), expected_yes);
    }

    // `a and b` / `a or b` agree with evaluating the sides separately.
    #[test]
    fn joiners_follow_boolean_logic(x in -50i64..50, a in -50i64..50, b in -50i64..50) {
        let doc = json!({ "m": { "x": x } });
        let left = Condition::comparison("m.x", Comparator::Gt, Literal::Number(a as f64));
        let right = Condition::comparison("m.x", Comparator::Le, Literal::Number(b as f64));

        let l = left.evaluate(&doc);
        let r = right.evaluate(&doc);
        prop_assert_eq!(l, x > a);
        prop_assert_eq!(r, x <= b);
        prop_assert_eq!(left.clone().and(right.clone()).evaluate(&doc), l && r);
        prop_assert_eq!(left.or(right).evaluate(&doc), l || r);
    }
}
