//! Dependency resolution and readiness waits for `depends_on`.
//!
//! Start ordering is a depth-first topological sort over container names
//! with a three-colour marker set; cycles and unknown names are fatal to
//! the caller.

use crate::constants::DEPENDENCY_POLL_INTERVAL;
use crate::container::Container;
use crate::error::{Error, Result};
use crate::manager::Manager;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Visit state for the DFS marker set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Dependency graph over a set of containers, keyed by name.
#[derive(Default)]
pub struct DependencyGraph {
    edges: HashMap<String, Vec<String>>,
    containers: HashMap<String, Container>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a container and its dependency edges.
    pub fn add(&mut self, ctr: Container) {
        self.edges.insert(ctr.name.clone(), ctr.depends_on.clone());
        self.containers.insert(ctr.name.clone(), ctr);
    }

    /// Returns a start ordering in which every container appears after all
    /// of its dependencies.
    pub fn start_order(&self) -> Result<Vec<&Container>> {
        let mut marks: HashMap<&str, Mark> = self
            .containers
            .keys()
            .map(|name| (name.as_str(), Mark::Unvisited))
            .collect();
        let mut order = Vec::with_capacity(self.containers.len());

        // Names sorted for deterministic output across runs.
        let mut names: Vec<&String> = self.containers.keys().collect();
        names.sort();

        for name in names {
            self.visit(name, &mut marks, &mut order)?;
        }

        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        name: &str,
        marks: &mut HashMap<&'a str, Mark>,
        order: &mut Vec<&'a Container>,
    ) -> Result<()> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => return Err(Error::DependencyCycle(name.to_string())),
            _ => {}
        }

        let ctr = self
            .containers
            .get(name)
            .ok_or_else(|| Error::Internal(format!("graph entry missing for {name}")))?;

        marks.insert(ctr.name.as_str(), Mark::InProgress);

        if let Some(deps) = self.edges.get(name) {
            for dep in deps {
                if !self.containers.contains_key(dep) {
                    return Err(Error::UnknownDependency {
                        container: name.to_string(),
                        dependency: dep.clone(),
                    });
                }
                self.visit(dep, marks, order)?;
            }
        }

        marks.insert(ctr.name.as_str(), Mark::Done);
        order.push(ctr);
        Ok(())
    }

    /// Validates the graph by attempting a full sort.
    pub fn validate(&self) -> Result<()> {
        self.start_order().map(|_| ())
    }

    /// Returns the names of containers that depend on `name`.
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(_, deps)| deps.iter().any(|d| d == name))
            .map(|(n, _)| n.clone())
            .collect()
    }
}

/// Polls the manager until every named dependency is running, the timeout
/// fires, or a dependency disappears.
pub async fn wait_for_dependencies(
    manager: &Arc<Manager>,
    ctr_name: &str,
    dependencies: &[String],
    timeout: Duration,
) -> Result<()> {
    if dependencies.is_empty() {
        return Ok(());
    }

    info!("waiting for dependencies of {ctr_name}: {dependencies:?}");

    let deadline = tokio::time::Instant::now() + timeout;
    let mut ticker = tokio::time::interval(DEPENDENCY_POLL_INTERVAL);

    loop {
        ticker.tick().await;
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::DependencyTimeout(ctr_name.to_string()));
        }

        let containers = manager.list().await;
        let mut all_ready = true;
        for dep in dependencies {
            match containers.iter().find(|c| &c.name == dep) {
                Some(dep_ctr) if dep_ctr.is_running() => {}
                Some(dep_ctr) => {
                    debug!("dependency {dep} not running (state: {})", dep_ctr.state);
                    all_ready = false;
                    break;
                }
                None => {
                    return Err(Error::UnknownDependency {
                        container: ctr_name.to_string(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        if all_ready {
            info!("all dependencies of {ctr_name} are ready");
            return Ok(());
        }
    }
}
