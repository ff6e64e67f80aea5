//! Plan construction and dependency ordering.
//!
//! A plan is validated exactly once, when it is built: every dependency
//! must name a declared step and the dependency graph must be acyclic.
//! The resulting topological order is stable with respect to declaration
//! order, so a plan of independent steps runs in the order it was written.

use std::collections::{BTreeSet, HashMap, VecDeque};

use super::error::InvalidPlanError;
use super::step::Step;

/// Immutable, validated collection of steps
#[derive(Debug, Clone)]
pub struct Plan {
    name: String,
    description: String,
    steps: Vec<Step>,
    index: HashMap<String, usize>,
    order: Vec<usize>,
    /// dependents[i] = steps that list step i in `depends_on`
    dependents: Vec<Vec<usize>>,
    /// deps[i] = indices of step i's dependencies
    deps: Vec<Vec<usize>>,
}

impl Plan {
    /// Build and validate a plan
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Result<Self, InvalidPlanError> {
        let name = name.into();
        if steps.is_empty() {
            return Err(InvalidPlanError::Empty { plan: name });
        }

        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(InvalidPlanError::EmptyId { index: i });
            }
            if index.insert(step.id.clone(), i).is_some() {
                return Err(InvalidPlanError::DuplicateStep {
                    id: step.id.clone(),
                });
            }
        }

        let mut deps = vec![Vec::new(); steps.len()];
        let mut dependents = vec![Vec::new(); steps.len()];
        for (i, step) in steps.iter().enumerate() {
            for dep in &step.depends_on {
                if *dep == step.id {
                    return Err(InvalidPlanError::SelfDependency {
                        step: step.id.clone(),
                    });
                }
                let Some(&d) = index.get(dep) else {
                    return Err(InvalidPlanError::UnknownDependency {
                        step: step.id.clone(),
                        missing: dep.clone(),
                    });
                };
                deps[i].push(d);
                dependents[d].push(i);
            }
        }

        let order = topological_order(&deps, &dependents)
            .map_err(|cycle| InvalidPlanError::Cycle {
                steps: cycle.into_iter().map(|i| steps[i].id.clone()).collect(),
            })?;

        Ok(Self {
            name,
            description: String::new(),
            steps,
            index,
            order,
            dependents,
            deps,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps in declaration order
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> &Step {
        &self.steps[index]
    }

    /// Get a step by id
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Step indices in execution order
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Steps in execution order
    pub fn ordered_steps(&self) -> impl Iterator<Item = &Step> {
        self.order.iter().map(move |&i| &self.steps[i])
    }

    pub fn dependencies_of(&self, index: usize) -> &[usize] {
        &self.deps[index]
    }

    /// Every step whose dependency chain includes `index`
    pub fn transitive_dependents(&self, index: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<usize> = self.dependents[index].iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(self.dependents[next].iter().copied());
            }
        }
        seen
    }
}

/// Kahn's algorithm, always taking the lowest-declared ready step.
///
/// On failure returns the steps of one cycle, first step repeated at the end.
fn topological_order(deps: &[Vec<usize>], dependents: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let mut remaining: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut ready: BTreeSet<usize> = (0..deps.len()).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(deps.len());

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() == deps.len() {
        return Ok(order);
    }

    Err(find_cycle(deps, &remaining))
}

/// Walk unresolved dependencies until a step repeats
fn find_cycle(deps: &[Vec<usize>], remaining: &[usize]) -> Vec<usize> {
    let Some(start) = (0..deps.len()).find(|&i| remaining[i] > 0) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut position: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;

    loop {
        // Every unresolved step has at least one unresolved dependency
        let Some(&next) = deps[current].iter().find(|&&d| remaining[d] > 0) else {
            return path;
        };
        if let Some(&at) = position.get(&next) {
            let mut cycle = path[at..].to_vec();
            cycle.push(next);
            cycle.reverse();
            return cycle;
        }
        position.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Outcome;
    use crate::core::step::FnAction;

    fn step(id: &str, deps: &[&str]) -> Step {
        Step::new(id, FnAction::new(id, |_| Ok(Outcome::ok()))).depends_on(deps.iter().copied())
    }

    fn ids(plan: &Plan) -> Vec<&str> {
        plan.ordered_steps().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn test_declaration_order_for_independent_steps() {
        let plan = Plan::new("p", vec![step("a", &[]), step("b", &[]), step("c", &[])]).unwrap();
        assert_eq!(ids(&plan), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_dependencies_come_first() {
        let plan = Plan::new(
            "p",
            vec![step("place", &["build", "packages"]), step("build", &["clone"]), step("clone", &[]), step("packages", &[])],
        )
        .unwrap();
        assert_eq!(ids(&plan), vec!["clone", "build", "packages", "place"]);
    }

    #[test]
    fn test_cycle_rejected_with_ids() {
        let err = Plan::new(
            "p",
            vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"]), step("d", &[])],
        )
        .unwrap_err();

        let InvalidPlanError::Cycle { steps } = err else {
            panic!("expected cycle error");
        };
        assert_eq!(steps.first(), steps.last());
        for id in ["a", "b", "c"] {
            assert!(steps.iter().any(|s| s == id), "cycle should name {}", id);
        }
        assert!(!steps.iter().any(|s| s == "d"));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = Plan::new("p", vec![step("a", &["ghost"])]).unwrap_err();
        assert_eq!(
            err,
            InvalidPlanError::UnknownDependency {
                step: "a".into(),
                missing: "ghost".into()
            }
        );
    }

    #[test]
    fn test_duplicate_and_self_dependency() {
        let dup = Plan::new("p", vec![step("a", &[]), step("a", &[])]).unwrap_err();
        assert_eq!(dup, InvalidPlanError::DuplicateStep { id: "a".into() });

        let own = Plan::new("p", vec![step("a", &["a"])]).unwrap_err();
        assert_eq!(own, InvalidPlanError::SelfDependency { step: "a".into() });
    }

    #[test]
    fn test_empty_plan_rejected() {
        assert!(matches!(
            Plan::new("p", Vec::new()),
            Err(InvalidPlanError::Empty { .. })
        ));
    }

    #[test]
    fn test_transitive_dependents() {
        let plan = Plan::new(
            "p",
            vec![step("a", &[]), step("b", &[]), step("c", &["b"]), step("d", &["a", "c"])],
        )
        .unwrap();
        let b = plan.step_index("b").unwrap();
        let found: Vec<&str> = plan
            .transitive_dependents(b)
            .into_iter()
            .map(|i| plan.step(i).id.as_str())
            .collect();
        assert_eq!(found, vec!["c", "d"]);
    }
}
