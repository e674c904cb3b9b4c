//! Task graph loading and validation.
//!
//! The graph is the static half of a feature run: which tasks exist, which
//! level each belongs to and what each depends on. It is validated once at
//! load and never changes afterwards; runtime status lives in the state
//! document.

use crate::core::task::{TaskId, TaskSpec};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

/// Optional level metadata in the graph document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LevelSpec {
    pub number: u32,
    pub name: String,
}

/// On-disk graph document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphDocument {
    pub feature: String,
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub levels: Vec<LevelSpec>,
}

/// Derived information about one level.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelInfo {
    pub number: u32,
    pub name: String,
    pub tasks: Vec<TaskId>,
    pub depends_on_levels: Vec<u32>,
}

/// A validated task graph.
///
/// Edges point from a dependency to its dependent.
pub struct TaskGraph {
    feature: String,
    tasks: Vec<TaskSpec>,
    graph: DiGraph<TaskId, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
    levels: BTreeMap<u32, LevelInfo>,
}

impl TaskGraph {
    /// Parse and validate a JSON graph document.
    pub fn from_json(json: &str) -> Result<Self> {
        let document: GraphDocument = serde_json::from_str(json)
            .map_err(|e| Error::Validation(format!("Malformed task graph: {}", e)))?;
        Self::from_document(document)
    }

    /// Read, parse and validate a graph document from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Validate an already-parsed document.
    pub fn from_document(document: GraphDocument) -> Result<Self> {
        let GraphDocument {
            feature,
            tasks,
            levels: level_specs,
        } = document;

        if feature.trim().is_empty() {
            return Err(Error::Validation("Feature name is empty".to_string()));
        }
        if tasks.is_empty() {
            return Err(Error::Validation(format!(
                "Feature {} has no tasks",
                feature
            )));
        }

        let mut graph = DiGraph::new();
        let mut task_index = HashMap::new();
        for spec in &tasks {
            if task_index.contains_key(&spec.id) {
                return Err(Error::Validation(format!("Duplicate task id {}", spec.id)));
            }
            if spec.level < 1 {
                return Err(Error::Validation(format!(
                    "Task {} has level {}; levels start at 1",
                    spec.id, spec.level
                )));
            }
            if spec.verification.command.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "Task {} has an empty verification command",
                    spec.id
                )));
            }
            let index = graph.add_node(spec.id.clone());
            task_index.insert(spec.id.clone(), index);
        }

        let level_of: HashMap<&TaskId, u32> = tasks.iter().map(|t| (&t.id, t.level)).collect();

        for spec in &tasks {
            for dep in &spec.dependencies {
                if dep == &spec.id {
                    return Err(Error::Validation(format!(
                        "Task {} depends on itself",
                        spec.id
                    )));
                }
                let dep_level = *level_of.get(dep).ok_or_else(|| {
                    Error::Validation(format!(
                        "Task {} depends on unknown task {}",
                        spec.id, dep
                    ))
                })?;
                if dep_level > spec.level {
                    return Err(Error::Validation(format!(
                        "Task {} (level {}) depends on {} at later level {}",
                        spec.id, spec.level, dep, dep_level
                    )));
                }
                graph.add_edge(task_index[dep], task_index[&spec.id], ());
            }
        }

        if is_cyclic_directed(&graph) {
            let culprit = toposort(&graph, None)
                .err()
                .and_then(|cycle| graph.node_weight(cycle.node_id()).cloned())
                .map(|id| id.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(Error::Validation(format!(
                "Dependency cycle detected at task {}",
                culprit
            )));
        }

        check_file_ownership(&tasks)?;
        let levels = build_levels(&tasks, &level_specs, &level_of)?;

        Ok(Self {
            feature,
            tasks,
            graph,
            task_index,
            levels,
        })
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }

    /// Tasks in graph order.
    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Declared dependencies of a task, empty for unknown ids.
    pub fn dependencies(&self, id: &TaskId) -> &[TaskId] {
        self.task(id)
            .map(|t| t.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Tasks that declare `id` as a dependency.
    pub fn dependents(&self, id: &TaskId) -> Vec<&TaskId> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, petgraph::Direction::Outgoing)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Level numbers in ascending order.
    pub fn level_numbers(&self) -> Vec<u32> {
        self.levels.keys().copied().collect()
    }

    pub fn levels(&self) -> impl Iterator<Item = &LevelInfo> {
        self.levels.values()
    }

    pub fn level(&self, number: u32) -> Option<&LevelInfo> {
        self.levels.get(&number)
    }

    pub fn first_level(&self) -> Option<u32> {
        self.levels.keys().next().copied()
    }

    /// The next level after `number`, if any.
    pub fn next_level(&self, number: u32) -> Option<u32> {
        self.levels
            .range((number + 1)..)
            .next()
            .map(|(n, _)| *n)
    }

    /// Tasks of one level in graph order.
    pub fn level_tasks(&self, number: u32) -> Vec<&TaskSpec> {
        self.tasks.iter().filter(|t| t.level == number).collect()
    }

    /// Tasks ordered so every task follows its dependencies.
    pub fn topological_order(&self) -> Vec<&TaskId> {
        // Validated acyclic at construction.
        toposort(&self.graph, None)
            .map(|order| {
                order
                    .into_iter()
                    .filter_map(|i| self.graph.node_weight(i))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("feature", &self.feature)
            .field("tasks", &self.tasks.len())
            .field("dependencies", &self.graph.edge_count())
            .field("levels", &self.levels.len())
            .finish()
    }
}

/// Create/modify targets must not be shared by two tasks of one level.
fn check_file_ownership(tasks: &[TaskSpec]) -> Result<()> {
    let mut owners: HashMap<(u32, &str), &TaskId> = HashMap::new();
    for spec in tasks {
        let mut own = BTreeSet::new();
        for file in spec.files.owned() {
            if !own.insert(file.as_str()) {
                continue;
            }
            if let Some(other) = owners.insert((spec.level, file.as_str()), &spec.id) {
                return Err(Error::Validation(format!(
                    "Tasks {} and {} in level {} both write {}",
                    other, spec.id, spec.level, file
                )));
            }
        }
    }
    Ok(())
}

fn build_levels(
    tasks: &[TaskSpec],
    specs: &[LevelSpec],
    level_of: &HashMap<&TaskId, u32>,
) -> Result<BTreeMap<u32, LevelInfo>> {
    let mut levels: BTreeMap<u32, LevelInfo> = BTreeMap::new();
    for spec in tasks {
        let info = levels.entry(spec.level).or_insert_with(|| LevelInfo {
            number: spec.level,
            name: format!("level-{}", spec.level),
            tasks: Vec::new(),
            depends_on_levels: Vec::new(),
        });
        info.tasks.push(spec.id.clone());
        for dep in &spec.dependencies {
            if let Some(&dep_level) = level_of.get(dep) {
                if dep_level != spec.level && !info.depends_on_levels.contains(&dep_level) {
                    info.depends_on_levels.push(dep_level);
                }
            }
        }
    }

    let mut named = BTreeSet::new();
    for spec in specs {
        if !named.insert(spec.number) {
            return Err(Error::Validation(format!(
                "Level {} is named more than once",
                spec.number
            )));
        }
        let info = levels.get_mut(&spec.number).ok_or_else(|| {
            Error::Validation(format!("Level {} is named but has no tasks", spec.number))
        })?;
        info.name = spec.name.clone();
    }

    for info in levels.values_mut() {
        info.depends_on_levels.sort_unstable();
    }
    Ok(levels)
}
