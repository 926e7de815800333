/// Property-based tests for the port pool
///
/// Random sequences of allocate/release calls must never hand out a port
/// twice, never leave the range, and re-allocating an unchanged pair must
/// return the same ports.
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use stool::pool::{NoProbe, Pool, PortRange};

#[derive(Debug, Clone)]
enum Operation {
    Allocate(String, String),
    Release(String, String),
    ReleaseStage(String),
}

fn name_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "web", "api", "stage1", "stage2"]).prop_map(str::to_string)
}

fn operation_strategy() -> impl Strategy<Value = Operation> {
    prop_oneof![
        3 => (name_strategy(), name_strategy()).prop_map(|(s, a)| Operation::Allocate(s, a)),
        1 => (name_strategy(), name_strategy()).prop_map(|(s, a)| Operation::Release(s, a)),
        1 => name_strategy().prop_map(Operation::ReleaseStage),
    ]
}

fn pool() -> Pool {
    Pool::new(PortRange::new(9000, 9199).unwrap(), Arc::new(NoProbe))
}

fn assert_disjoint(pool: &Pool) {
    let mut seen = HashSet::new();
    for allocation in pool.allocations() {
        for port in [
            allocation.ports.http,
            allocation.ports.https,
            allocation.ports.jmxmp,
            allocation.ports.debug,
        ]
        .into_iter()
        .flatten()
        {
            assert!(pool.range().contains(port), "port {} outside range", port);
            assert!(seen.insert(port), "port {} allocated twice", port);
        }
    }
}

proptest! {
    #[test]
    fn no_port_is_allocated_twice(ops in prop::collection::vec(operation_strategy(), 1..60)) {
        let mut pool = pool();
        for op in &ops {
            match op {
                Operation::Allocate(stage, app) => {
                    pool.allocate(stage, app, None, None).unwrap();
                }
                Operation::Release(stage, app) => {
                    pool.release(stage, app);
                }
                Operation::ReleaseStage(stage) => {
                    pool.release_stage(stage);
                }
            }
            assert_disjoint(&pool);
        }
    }

    #[test]
    fn allocate_is_idempotent(stage in name_strategy(), app in name_strategy(), others in prop::collection::vec((name_strategy(), name_strategy()), 0..10)) {
        let mut pool = pool();
        for (s, a) in &others {
            pool.allocate(s, a, None, None).unwrap();
        }
        let first = pool.allocate(&stage, &app, None, None).unwrap();
        let count = pool.allocations().len();
        let second = pool.allocate(&stage, &app, None, None).unwrap();
        prop_assert_eq!(first, second);
        prop_assert_eq!(pool.allocations().len(), count);

        let http = first.http;
        let again = pool.allocate(&stage, &app, http, None).unwrap();
        prop_assert_eq!(first, again);
    }

    #[test]
    fn start_port_is_even_and_in_range(stage in "[a-z0-9]{1,12}", app in "[a-z]{1,8}") {
        let pool = pool();
        let start = pool.start_port(&app, &stage);
        prop_assert!(pool.range().contains(start));
        prop_assert_eq!(start % 2, 0);
    }
}
