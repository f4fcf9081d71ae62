//! Dependency graph of a module and its deployment order.

use std::collections::{BTreeSet, HashMap};

use crate::{
    error::GraphError,
    module::{DeploymentSpec, Module},
};

/// Dependency graph derived from the `deployment` references of a module.
///
/// Nodes are indices into `module.deployments`. The graph is only built for
/// valid modules: names are unique, every reference resolves and there is no
/// cycle.
#[derive(Debug)]
pub struct DeploymentGraph<'a> {
    module: &'a Module,
    /// Direct dependencies of each node, deduplicated, in declaration order.
    dependencies: Vec<Vec<usize>>,
    /// Topological order, ties broken by declaration order.
    order: Vec<usize>,
}

impl<'a> DeploymentGraph<'a> {
    pub fn build(module: &'a Module) -> Result<Self, GraphError> {
        module.validate_names()?;

        let index: HashMap<&str, usize> = module
            .deployments
            .iter()
            .enumerate()
            .map(|(i, spec)| (spec.name.as_str(), i))
            .collect();

        let mut dependencies = Vec::with_capacity(module.deployments.len());
        for spec in &module.deployments {
            let mut deps = BTreeSet::new();
            for dep in spec.dependencies() {
                let Some(&i) = index.get(dep) else {
                    return Err(GraphError::UnknownReference {
                        spec: spec.name.clone(),
                        missing: dep.to_string(),
                    });
                };
                deps.insert(i);
            }
            dependencies.push(deps.into_iter().collect::<Vec<_>>());
        }

        let order = topological_order(&dependencies).map_err(|cycle| GraphError::Cycle {
            cycle: cycle
                .into_iter()
                .map(|i| module.deployments[i].name.clone())
                .collect(),
        })?;

        Ok(Self {
            module,
            dependencies,
            order,
        })
    }

    /// Specs in deployment order.
    pub fn ordered_specs(&self) -> impl Iterator<Item = &'a DeploymentSpec> + '_ {
        self.order.iter().map(|&i| &self.module.deployments[i])
    }

    /// Node indices in deployment order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Direct dependencies of the node at `index`.
    pub fn dependencies(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }
}

/// Compute the deployment order of a module.
///
/// Every referenced deployment precedes the specs referencing it; specs without a
/// relative constraint keep their declaration order, so the result is stable for a
/// given module.
pub fn build_order(module: &Module) -> Result<Vec<&DeploymentSpec>, GraphError> {
    let graph = DeploymentGraph::build(module)?;
    Ok(graph.ordered_specs().collect())
}

/// Kahn's algorithm, always releasing the lowest ready index first.
///
/// On failure returns one cycle among the nodes that could not be ordered.
fn topological_order(dependencies: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let n = dependencies.len();
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut dependents = vec![Vec::new(); n];
    for (node, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(node);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &dependent in &dependents[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() == n {
        return Ok(order);
    }

    let blocked: Vec<bool> = in_degree.iter().map(|&d| d > 0).collect();
    Err(find_cycle(dependencies, &blocked))
}

/// Walk dependency edges among blocked nodes until a node repeats.
///
/// Every blocked node keeps at least one blocked dependency, so the walk cannot
/// dead-end and must close a cycle.
fn find_cycle(dependencies: &[Vec<usize>], blocked: &[bool]) -> Vec<usize> {
    let Some(start) = blocked.iter().position(|&b| b) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut position = HashMap::from([(start, 0)]);
    let mut current = start;

    loop {
        let Some(&next) = dependencies[current].iter().find(|&&d| blocked[d]) else {
            return path;
        };
        if let Some(&at) = position.get(&next) {
            return path.split_off(at);
        }
        position.insert(next, path.len());
        path.push(next);
        current = next;
    }
}
