//! The work plan: which jobs exist, which are ready, and which still wait on
//! an ancestor store reaching their start block.

use std::{
    collections::BTreeMap,
    fmt,
    sync::Mutex,
};

use common::{BlockNum, BoxError};
use storage::{manifest::ModuleGraph, state::ModuleStateMap};

use crate::job::Job;

/// Shared, mutex-protected plan state. All three fields move together under
/// one lock; every operation on them is short.
#[derive(Debug, Default)]
struct PlanInner {
    waiting_jobs: Vec<Job>,
    ready_jobs: Vec<Job>,
    modules_ready_up_to_block: BTreeMap<String, BlockNum>,
}

pub struct Plan {
    inner: Mutex<PlanInner>,
}

impl Plan {
    /// Expands the probed storage states into prioritized jobs.
    ///
    /// Every missing range becomes jobs of at most `subrequest_split` blocks.
    /// Priority is `highest dependency depth - module depth + 1`, so leaf
    /// stores run first and unblock their descendants; ties resolve to the
    /// lower start block.
    pub fn build(
        graph: &ModuleGraph,
        states: &ModuleStateMap,
        subrequest_split: u64,
    ) -> Result<Plan, BoxError> {
        let highest_depth =
            graph.highest_dependency_depth(states.keys().map(String::as_str))?;

        let mut inner = PlanInner::default();
        for (name, state) in states {
            // A module with no complete snapshot has no watermark at all.
            // "Nothing on disk" and "complete up to block zero" are distinct
            // states; a dependent is unblocked only by an actual snapshot.
            if let Some(file) = &state.initial_complete_file {
                inner
                    .modules_ready_up_to_block
                    .insert(name.clone(), file.range.exclusive_end_block);
            }
        }

        for (name, state) in states {
            let depth = graph.ancestors_depth(name)?;
            let priority = (highest_depth as i32) - (depth as i32) + 1;
            let required_modules: Vec<String> = graph
                .store_ancestors(name)?
                .into_iter()
                .map(|module| module.name.clone())
                .collect();

            for range in state.batch_requests(subrequest_split) {
                let job = Job::new(name.clone(), range, required_modules.clone(), priority);
                if all_dependencies_met(&inner.modules_ready_up_to_block, &job) {
                    inner.ready_jobs.push(job);
                } else {
                    inner.waiting_jobs.push(job);
                }
            }
        }
        prioritize(&mut inner.ready_jobs);

        tracing::info!(
            ready = inner.ready_jobs.len(),
            waiting = inner.waiting_jobs.len(),
            "work plan built"
        );
        Ok(Plan {
            inner: Mutex::new(inner),
        })
    }

    /// Removes and returns the highest-priority ready job. The second value
    /// says whether more jobs may still come: waiting jobs remain, or ready
    /// jobs remain after this removal.
    pub fn next_job(&self) -> (Option<Job>, bool) {
        let mut inner = self.inner.lock().unwrap();
        let job = if inner.ready_jobs.is_empty() {
            None
        } else {
            Some(inner.ready_jobs.remove(0))
        };
        let more_coming = !inner.waiting_jobs.is_empty() || !inner.ready_jobs.is_empty();
        (job, more_coming)
    }

    /// Invoked when a store's snapshot becomes available up to `up_to_block`:
    /// bumps the watermark (monotonically) and promotes every waiting job
    /// whose dependencies are now met.
    pub fn mark_dependency_complete(&self, module: &str, up_to_block: BlockNum) {
        let mut inner = self.inner.lock().unwrap();
        let watermark = inner
            .modules_ready_up_to_block
            .entry(module.to_string())
            .or_insert(up_to_block);
        *watermark = (*watermark).max(up_to_block);

        let inner = &mut *inner;
        let mut promoted = 0;
        let mut idx = 0;
        while idx < inner.waiting_jobs.len() {
            if all_dependencies_met(&inner.modules_ready_up_to_block, &inner.waiting_jobs[idx]) {
                inner.ready_jobs.push(inner.waiting_jobs.remove(idx));
                promoted += 1;
            } else {
                idx += 1;
            }
        }
        if promoted > 0 {
            prioritize(&mut inner.ready_jobs);
            tracing::debug!(module, up_to_block, promoted, "promoted waiting jobs");
        }
    }

    /// The current availability watermark of a module, when known.
    pub fn ready_up_to(&self, module: &str) -> Option<BlockNum> {
        self.inner
            .lock()
            .unwrap()
            .modules_ready_up_to_block
            .get(module)
            .copied()
    }

    /// Snapshot of (ready, waiting) jobs, for diagnostics and tests.
    pub fn jobs(&self) -> (Vec<Job>, Vec<Job>) {
        let inner = self.inner.lock().unwrap();
        (inner.ready_jobs.clone(), inner.waiting_jobs.clone())
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        let list = |jobs: &[Job]| {
            jobs.iter()
                .map(|j| format!("{}({})", j.module_name, j.request_range))
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "ready: [{}] waiting: [{}]",
            list(&inner.ready_jobs),
            list(&inner.waiting_jobs)
        )
    }
}

fn all_dependencies_met(watermarks: &BTreeMap<String, BlockNum>, job: &Job) -> bool {
    job.required_modules.iter().all(|module| {
        watermarks
            .get(module)
            .is_some_and(|up_to| *up_to >= job.request_range.start_block)
    })
}

/// Stable sort by descending priority, then ascending start block.
fn prioritize(ready_jobs: &mut [Job]) {
    ready_jobs.sort_by_key(|job| (-(job.priority as i64), job.request_range.start_block));
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use common::{BlockRange, Ranges};
    use storage::{
        kv::UpdatePolicy,
        manifest::{Module, ModuleGraph, ModuleKind},
        state::{ModuleStateMap, StoreStorageState},
    };

    use super::{all_dependencies_met, prioritize, Plan};
    use crate::job::Job;

    fn store_module(name: &str, inputs: &[&str]) -> Module {
        Module {
            name: name.to_string(),
            hash: format!("hash-{name}"),
            kind: ModuleKind::Store {
                update_policy: UpdatePolicy::Set,
            },
            initial_block: 0,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn state(name: &str, missing: &str) -> StoreStorageState {
        StoreStorageState {
            module_name: name.to_string(),
            module_hash: format!("hash-{name}"),
            module_initial_block: 0,
            update_policy: UpdatePolicy::Set,
            initial_complete_file: None,
            partials_present: Ranges::default(),
            partials_missing: Ranges::parse(missing).unwrap(),
        }
    }

    fn job(module: &str, range: &str, required: &[&str], priority: i32) -> Job {
        Job::new(
            module.to_string(),
            BlockRange::parse(range).unwrap(),
            required.iter().map(|s| s.to_string()).collect(),
            priority,
        )
    }

    fn job_list(jobs: &[Job]) -> String {
        jobs.iter()
            .map(|j| format!("{}:{}:p{}", j.module_name, j.request_range, j.priority))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn build_classifies_and_prioritizes() {
        let graph =
            ModuleGraph::new(vec![store_module("As", &[]), store_module("B", &["As"])]).unwrap();

        let mut states = ModuleStateMap::new();
        states.insert(
            "As".to_string(),
            state("As", "0-10,10-20,30-40,40-50,50-60"),
        );
        states.insert("B".to_string(), state("B", "0-10"));

        let plan = Plan::build(&graph, &states, 20).unwrap();
        let (ready, waiting) = plan.jobs();

        // Leaf store As (depth 1 of 2) outranks B. B waits: As has produced
        // no snapshot yet, so its watermark is absent, not zero.
        assert_eq!(job_list(&ready), "As:0-20:p2 As:30-50:p2 As:50-60:p2");
        assert_eq!(job_list(&waiting), "B:0-10:p1");

        // As's first persisted snapshot unblocks B.
        plan.mark_dependency_complete("As", 10);
        let (ready, _) = plan.jobs();
        assert_eq!(
            job_list(&ready),
            "As:0-20:p2 As:30-50:p2 As:50-60:p2 B:0-10:p1"
        );
    }

    #[test]
    fn build_holds_back_jobs_past_the_dependency_watermark() {
        let graph =
            ModuleGraph::new(vec![store_module("As", &[]), store_module("B", &["As"])]).unwrap();

        let mut states = ModuleStateMap::new();
        states.insert("As".to_string(), state("As", "0-100"));
        states.insert("B".to_string(), state("B", "100-200"));

        let plan = Plan::build(&graph, &states, 100).unwrap();
        let (ready, waiting) = plan.jobs();
        assert_eq!(job_list(&ready), "As:0-100:p2");
        assert_eq!(job_list(&waiting), "B:100-200:p1");

        // As's snapshot reaching block 100 promotes B.
        plan.mark_dependency_complete("As", 100);
        let (ready, waiting) = plan.jobs();
        assert_eq!(job_list(&ready), "B:100-200:p1");
        assert!(waiting.is_empty());
    }

    #[test]
    fn existing_complete_snapshot_seeds_the_watermark() {
        let graph =
            ModuleGraph::new(vec![store_module("As", &[]), store_module("B", &["As"])]).unwrap();

        let mut as_state = state("As", "500-600");
        as_state.initial_complete_file = Some(storage::snapshot::FileInfo::complete(0, 500));
        let mut states = ModuleStateMap::new();
        states.insert("As".to_string(), as_state);
        states.insert("B".to_string(), state("B", "0-100,100-200"));

        let plan = Plan::build(&graph, &states, 100).unwrap();
        assert_eq!(plan.ready_up_to("As"), Some(500));

        // B's jobs start below As's snapshot end, so both are ready at once.
        let (ready, waiting) = plan.jobs();
        assert_eq!(
            job_list(&ready),
            "As:500-600:p2 B:0-100:p1 B:100-200:p1"
        );
        assert!(waiting.is_empty());
    }

    #[test]
    fn next_job_reports_more_coming() {
        let cases: &[(&[Job], &[Job], Option<&str>, bool)] = &[
            // (ready, waiting, expected module, expected more)
            (&[job("B", "0-100", &[], 1)], &[job("As", "0-100", &["x"], 1)], Some("B"), true),
            (&[], &[job("As", "0-100", &["x"], 1)], None, true),
            (&[job("As", "0-100", &[], 1)], &[], Some("As"), false),
            (&[], &[], None, false),
            (
                &[
                    job("As", "0-100", &[], 3),
                    job("B", "0-100", &[], 2),
                    job("C", "0-100", &[], 1),
                ],
                &[],
                Some("As"),
                true,
            ),
        ];

        for (ready, waiting, expect_module, expect_more) in cases {
            let plan = Plan {
                inner: std::sync::Mutex::new(super::PlanInner {
                    ready_jobs: ready.to_vec(),
                    waiting_jobs: waiting.to_vec(),
                    modules_ready_up_to_block: BTreeMap::new(),
                }),
            };
            let (got, more) = plan.next_job();
            assert_eq!(got.map(|j| j.module_name), expect_module.map(String::from));
            assert_eq!(more, *expect_more);
        }
    }

    #[test]
    fn dependencies_met_checks_every_required_module() {
        let watermarks = BTreeMap::from([
            ("foo".to_string(), 100u64),
            ("bar".to_string(), 50u64),
        ]);
        let met = |bar_at: u64| {
            let watermarks = BTreeMap::from([
                ("foo".to_string(), 100u64),
                ("bar".to_string(), bar_at),
            ]);
            all_dependencies_met(&watermarks, &job("x", "10-20", &["foo", "bar"], 1))
        };
        assert!(met(50));
        assert!(!met(0));
        assert!(all_dependencies_met(
            &watermarks,
            &job("x", "10-20", &[], 1)
        ));
        // An unknown dependency is never met.
        assert!(!all_dependencies_met(
            &watermarks,
            &job("x", "10-20", &["baz"], 1)
        ));
    }

    #[test]
    fn watermark_bumps_are_monotonic() {
        let graph = ModuleGraph::new(vec![store_module("A", &[])]).unwrap();
        let mut states = ModuleStateMap::new();
        states.insert("A".to_string(), state("A", "0-10"));
        let plan = Plan::build(&graph, &states, 10).unwrap();

        assert_eq!(plan.ready_up_to("A"), None, "no snapshot, no watermark");
        plan.mark_dependency_complete("A", 20);
        assert_eq!(plan.ready_up_to("A"), Some(20));
        plan.mark_dependency_complete("A", 10);
        assert_eq!(plan.ready_up_to("A"), Some(20), "watermarks never regress");
    }

    #[test]
    fn prioritize_is_stable_by_priority_then_start() {
        let mut jobs = vec![
            job("B", "100-200", &[], 2),
            job("C", "0-100", &[], 1),
            job("A", "200-300", &[], 3),
            job("B2", "0-100", &[], 2),
        ];
        prioritize(&mut jobs);
        assert_eq!(
            job_list(&jobs),
            "A:200-300:p3 B2:0-100:p2 B:100-200:p2 C:0-100:p1"
        );
    }
}
