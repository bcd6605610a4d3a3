// tests/properties.rs

mod common;
use crate::common::{fake_engine, rule, FakeScript};

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use tempfile::tempdir;

use ruleflow::dag::{JobState, MemoryStorage};
use ruleflow::workflow::{Pattern, Workflow, CORES_RESOURCE};

const CORES: u64 = 4;
const MEM_LIMIT: u64 = 5;

#[derive(Debug, Clone)]
struct Node {
    deps: Vec<usize>,
    threads: u64,
    mem: u64,
    fails: bool,
}

/// Acyclic graphs: node `i` only depends on nodes below `i`.
fn arb_dag() -> impl Strategy<Value = Vec<Node>> {
    prop::collection::vec((1u64..=3, 0u64..=4, prop::bool::weighted(0.2), any::<u8>()), 1..8).prop_map(
        |specs| {
            specs
                .into_iter()
                .enumerate()
                .map(|(i, (threads, mem, fails, mask))| Node {
                    deps: (0..i.min(8)).filter(|j| mask & (1 << j) != 0).collect(),
                    threads,
                    mem,
                    fails,
                })
                .collect()
        },
    )
}

fn build_workflow(nodes: &[Node]) -> (Workflow, FakeScript) {
    let mut script = FakeScript::new();
    let rules = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let inputs: Vec<String> = node.deps.iter().map(|d| format!("f{}.txt", d)).collect();
            let inputs: Vec<&str> = inputs.iter().map(String::as_str).collect();
            if node.fails {
                script = script.clone().failing(&format!("r{}", i), 1);
            }
            rule(&format!("r{}", i), &inputs, &format!("f{}.txt", i))
                .with_threads(node.threads)
                .with_resource("mem", node.mem)
        })
        .collect();
    (Workflow::from_rules(rules), script)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn scheduler_respects_limits_and_dependencies(nodes in arb_dag()) {
        let dir = tempdir().unwrap();
        let (workflow, script) = build_workflow(&nodes);
        let (mut engine, _, log) = fake_engine(workflow, Arc::new(MemoryStorage::new()), dir.path(), script);
        engine.settings_mut().resources.limits.insert("mem".to_string(), MEM_LIMIT);

        let targets: Vec<String> = (0..nodes.len()).map(|i| format!("f{}.txt", i)).collect();
        let report = engine.run(&targets).unwrap();

        let log = log.lock().unwrap();
        prop_assert!(log.peak.get(CORES_RESOURCE).copied().unwrap_or(0) <= CORES);
        prop_assert!(log.peak.get("mem").copied().unwrap_or(0) <= MEM_LIMIT);
        prop_assert!(log.violations.is_empty(), "{:?}", log.violations);

        let states: BTreeMap<String, JobState> =
            report.jobs.iter().map(|j| (j.label.clone(), j.state)).collect();
        prop_assert_eq!(states.len(), nodes.len());

        for (i, node) in nodes.iter().enumerate() {
            let state = states[&format!("r{}", i)];
            prop_assert!(
                matches!(state, JobState::Completed | JobState::Failed | JobState::Skipped),
                "r{} ended {:?}", i, state
            );
            if state == JobState::Completed {
                for dep in &node.deps {
                    prop_assert_eq!(states[&format!("r{}", dep)], JobState::Completed);
                }
            }
            if node.fails && state != JobState::Skipped {
                prop_assert_eq!(state, JobState::Failed);
            }
        }
    }

    #[test]
    fn applied_pattern_matches_its_binding(
        sample in "[a-z][a-z0-9]{0,7}",
        lane in "[0-9]{1,3}",
    ) {
        let pattern = Pattern::parse("reads/{sample}/L{lane}.fq").unwrap();
        let compiled = pattern.compile(&BTreeMap::new()).unwrap();

        let mut binding = BTreeMap::new();
        binding.insert("sample".to_string(), sample);
        binding.insert("lane".to_string(), lane);

        let path = pattern.apply(&binding).unwrap();
        prop_assert_eq!(compiled.match_path(&path).unwrap(), binding);
    }
}
