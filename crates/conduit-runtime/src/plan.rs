//! Stage dependency plan for one run.
//!
//! Each stage's predecessors are every stage of a strictly lower tier plus
//! the stages it names in `depends_on`. The plan is checked for cycles with
//! Kahn's algorithm when it is built, so the orchestrator can assume every
//! stage is eventually released or short-circuited.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use conduit_core::agent::{AgentContract, AgentRegistry};
use conduit_core::stage::{AgentInstance, StageKind};
use thiserror::Error;

/// Why a plan could not be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// The request names no stages.
    #[error("run requests no stages")]
    Empty,
    /// A requested stage is not registered.
    #[error("unknown stage `{0}`")]
    UnknownStage(String),
    /// A stage is requested twice.
    #[error("stage `{0}` requested more than once")]
    DuplicateStage(String),
    /// A declared dependency is not part of this run.
    #[error("stage `{stage}` depends on `{dependency}`, which is not in the run")]
    UnknownDependency {
        /// Declaring stage.
        stage: String,
        /// Missing dependency.
        dependency: String,
    },
    /// Dependencies form a cycle among these stages.
    #[error("dependency cycle among stages: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// One stage with its resolved edges.
pub struct PlannedStage {
    /// Agent implementation.
    pub agent: Arc<dyn AgentContract>,
    /// Agent name.
    pub name: String,
    /// Stage kind.
    pub kind: StageKind,
    /// Tools the stage declared.
    pub tools: Vec<String>,
    /// Indices that must complete first.
    pub predecessors: Vec<usize>,
    /// Indices waiting on this stage.
    pub dependents: Vec<usize>,
}

/// Validated dependency graph of a run's stages.
pub struct StagePlan {
    stages: Vec<PlannedStage>,
}

impl StagePlan {
    /// Resolve `names` against the registry and wire the edges.
    pub fn build(agents: &AgentRegistry, names: &[String]) -> Result<Self, PlanError> {
        if names.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut index_of: HashMap<&str, usize> = HashMap::with_capacity(names.len());
        let mut resolved = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            if index_of.insert(name.as_str(), i).is_some() {
                return Err(PlanError::DuplicateStage(name.clone()));
            }
            let agent = agents
                .get(name)
                .ok_or_else(|| PlanError::UnknownStage(name.clone()))?;
            resolved.push(agent);
        }

        let mut edges: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); names.len()];
        for (i, agent) in resolved.iter().enumerate() {
            let tier = agent.stage_kind().tier();
            for (j, other) in resolved.iter().enumerate() {
                if other.stage_kind().tier() < tier {
                    let _ = edges[i].insert(j);
                }
            }
            for dependency in agent.depends_on() {
                let j = *index_of.get(dependency.as_str()).ok_or_else(|| {
                    PlanError::UnknownDependency {
                        stage: names[i].clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                let _ = edges[i].insert(j);
            }
        }

        let mut stages: Vec<PlannedStage> = resolved
            .into_iter()
            .zip(&edges)
            .map(|(agent, preds)| PlannedStage {
                name: agent.name().to_owned(),
                kind: agent.stage_kind(),
                tools: agent.required_tools(),
                predecessors: preds.iter().copied().collect(),
                dependents: Vec::new(),
                agent,
            })
            .collect();
        for (i, preds) in edges.iter().enumerate() {
            for &p in preds {
                stages[p].dependents.push(i);
            }
        }

        let plan = Self { stages };
        plan.check_acyclic()?;
        Ok(plan)
    }

    fn check_acyclic(&self) -> Result<(), PlanError> {
        let mut in_degree: Vec<usize> = self.stages.iter().map(|s| s.predecessors.len()).collect();
        let mut queue: VecDeque<usize> = self.roots().into();
        let mut visited = 0;
        while let Some(i) = queue.pop_front() {
            visited += 1;
            for &d in &self.stages[i].dependents {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    queue.push_back(d);
                }
            }
        }
        if visited == self.stages.len() {
            return Ok(());
        }
        let stuck = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > 0)
            .map(|(i, _)| self.stages[i].name.clone())
            .collect();
        Err(PlanError::Cycle(stuck))
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the plan has no stages. Never true for a built plan.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage at `index`.
    pub fn stage(&self, index: usize) -> &PlannedStage {
        &self.stages[index]
    }

    /// All stages in request order.
    pub fn stages(&self) -> &[PlannedStage] {
        &self.stages
    }

    /// Stages with no predecessors.
    pub fn roots(&self) -> Vec<usize> {
        self.stages
            .iter()
            .enumerate()
            .filter(|(_, s)| s.predecessors.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Every stage reachable from `index` through dependent edges, ascending.
    pub fn transitive_dependents(&self, index: usize) -> Vec<usize> {
        let mut seen = BTreeSet::new();
        let mut stack = self.stages[index].dependents.clone();
        while let Some(i) = stack.pop() {
            if seen.insert(i) {
                stack.extend(self.stages[i].dependents.iter().copied());
            }
        }
        seen.into_iter().collect()
    }

    /// Pending instances for a fresh run record.
    pub fn instances(&self) -> Vec<AgentInstance> {
        self.stages
            .iter()
            .map(|s| AgentInstance::new(s.name.clone(), s.kind))
            .collect()
    }

    /// Stage names in request order.
    pub fn names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RunRecord;
    use crate::testing::{registry_of, ScriptedAgent};
    use conduit_core::context::ExecutionContext;
    use conduit_core::ids::{ThreadId, UserId};
    use proptest::prelude::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn tiers_become_edges() {
        let registry = registry_of(vec![
            ScriptedAgent::ok("triage", StageKind::Triage),
            ScriptedAgent::ok("d1", StageKind::Data),
            ScriptedAgent::ok("d2", StageKind::Data),
            ScriptedAgent::ok("opt", StageKind::Optimization),
        ]);
        let plan = StagePlan::build(&registry, &names(&["opt", "d1", "triage", "d2"])).unwrap();
        assert_eq!(plan.roots(), vec![2]);
        assert_eq!(plan.stage(0).predecessors, vec![1, 2, 3]);
        assert_eq!(plan.stage(1).predecessors, vec![2]);
        assert_eq!(plan.transitive_dependents(2), vec![0, 1, 3]);
        assert_eq!(plan.transitive_dependents(1), vec![0]);
    }

    #[test]
    fn explicit_dependencies_within_a_tier() {
        let registry = registry_of(vec![
            ScriptedAgent::ok("opt", StageKind::Optimization),
            ScriptedAgent::ok("report", StageKind::Reporting).depends_on(&["opt"]),
        ]);
        let plan = StagePlan::build(&registry, &names(&["report", "opt"])).unwrap();
        assert_eq!(plan.roots(), vec![1]);
        assert_eq!(plan.stage(0).predecessors, vec![1]);
    }

    #[test]
    fn rejects_unknown_and_duplicate() {
        let registry = registry_of(vec![ScriptedAgent::ok("d1", StageKind::Data)]);
        assert_eq!(
            StagePlan::build(&registry, &names(&["nope"])).err(),
            Some(PlanError::UnknownStage("nope".into()))
        );
        assert_eq!(
            StagePlan::build(&registry, &names(&["d1", "d1"])).err(),
            Some(PlanError::DuplicateStage("d1".into()))
        );
        assert_eq!(StagePlan::build(&registry, &[]).err(), Some(PlanError::Empty));
    }

    #[test]
    fn rejects_dependency_outside_run() {
        let registry = registry_of(vec![
            ScriptedAgent::ok("report", StageKind::Reporting).depends_on(&["opt"]),
        ]);
        assert!(matches!(
            StagePlan::build(&registry, &names(&["report"])),
            Err(PlanError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn rejects_cycles() {
        let registry = registry_of(vec![
            ScriptedAgent::ok("a", StageKind::Action).depends_on(&["b"]),
            ScriptedAgent::ok("b", StageKind::Action).depends_on(&["a"]),
            ScriptedAgent::ok("d", StageKind::Data).depends_on(&["a"]),
        ]);
        let err = StagePlan::build(&registry, &names(&["a", "b"])).err().unwrap();
        assert_eq!(err, PlanError::Cycle(names(&["a", "b"])));
        // A lower tier waiting on a higher tier is a cycle too.
        assert!(matches!(
            StagePlan::build(&registry, &names(&["a", "b", "d"])),
            Err(PlanError::Cycle(_))
        ));
    }

    const KINDS: [StageKind; 5] = [
        StageKind::Triage,
        StageKind::Data,
        StageKind::Optimization,
        StageKind::Reporting,
        StageKind::Action,
    ];

    proptest! {
        /// Releasing stages only when their predecessors completed never
        /// violates tier order, whatever the completion order.
        #[test]
        fn release_order_respects_tiers(
            kinds in prop::collection::vec(0usize..5, 1..12),
            picks in prop::collection::vec(any::<prop::sample::Index>(), 12),
        ) {
            let agents: Vec<ScriptedAgent> = kinds
                .iter()
                .enumerate()
                .map(|(i, k)| ScriptedAgent::ok(&format!("s{i}"), KINDS[*k]))
                .collect();
            let stage_names: Vec<String> = agents.iter().map(|a| a.name().to_owned()).collect();
            let plan = StagePlan::build(&registry_of(agents), &stage_names).unwrap();
            let ctx = ExecutionContext::builder(UserId::from("u"), ThreadId::from("t")).build();
            let mut record = RunRecord::new(&ctx, plan.instances());

            let mut remaining: Vec<usize> =
                plan.stages().iter().map(|s| s.predecessors.len()).collect();
            let mut running: Vec<usize> = Vec::new();
            for i in plan.roots() {
                record.start_stage(i).unwrap();
                running.push(i);
            }
            let mut step = 0;
            while !running.is_empty() {
                let pick = picks[step % picks.len()].index(running.len());
                step += 1;
                let done = running.swap_remove(pick);
                record.complete_stage(done).unwrap();
                for &d in &plan.stage(done).dependents {
                    remaining[d] -= 1;
                    if remaining[d] == 0 {
                        prop_assert!(record.start_stage(d).is_ok());
                        running.push(d);
                    }
                }
            }
            prop_assert_eq!(
                record.indices_with(conduit_core::stage::AgentStatus::Completed).len(),
                plan.len()
            );
        }
    }
}
