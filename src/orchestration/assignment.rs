//! Load-balanced task placement.
//!
//! Placement is advisory: workers still claim through the state store.
//! The plan decides which worker *should* take each task, and rebalancing
//! moves planned work away from failing or stalled workers.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info};

use crate::config::AssignmentConfig;
use crate::core::{TaskGraph, TaskId, TaskSpec, WorkerId};
use crate::error::Result;
use crate::orchestration::roles::{Role, RoleMatcher};
use crate::state::StateStore;

/// Planned placement of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Placement {
    pub task: TaskId,
    pub worker: WorkerId,
    pub level: u32,
    pub estimate_minutes: u32,
    pub role: Option<Role>,
}

/// A task moved from one worker to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reassignment {
    pub task: TaskId,
    pub from: WorkerId,
    pub to: WorkerId,
}

#[derive(Debug, Clone)]
pub struct WorkerAssignment {
    config: AssignmentConfig,
    workers: Vec<WorkerId>,
    roles: BTreeMap<WorkerId, Vec<Role>>,
    matcher: RoleMatcher,
    placements: BTreeMap<TaskId, Placement>,
    level_minutes: BTreeMap<u32, BTreeMap<WorkerId, u32>>,
    global_minutes: BTreeMap<WorkerId, u32>,
}

impl WorkerAssignment {
    pub fn new(worker_count: u32, config: AssignmentConfig, matcher: RoleMatcher) -> Self {
        let roles = config.role_map();
        Self {
            config,
            workers: (0..worker_count).map(WorkerId).collect(),
            roles,
            matcher,
            placements: BTreeMap::new(),
            level_minutes: BTreeMap::new(),
            global_minutes: BTreeMap::new(),
        }
    }

    /// Place every task of the graph, level by level.
    pub fn assign(&mut self, graph: &TaskGraph) -> Vec<Placement> {
        let mut placed = Vec::new();
        for level in graph.level_numbers() {
            let mut tasks = graph.level_tasks(level);
            // Stable: equal estimates keep graph order.
            tasks.sort_by(|a, b| b.estimate_minutes.cmp(&a.estimate_minutes));
            for task in tasks {
                if let Some(placement) = self.place(task) {
                    placed.push(placement);
                }
            }
        }
        info!(
            tasks = placed.len(),
            workers = self.workers.len(),
            "Assignment plan computed"
        );
        placed
    }

    fn place(&mut self, task: &TaskSpec) -> Option<Placement> {
        let role = self.matcher.match_task(task);
        let candidates = self.candidates(role);
        let level = task.level;
        let worker = candidates
            .into_iter()
            .min_by_key(|w| (self.load_for_choice(level, *w), *w))?;

        let placement = Placement {
            task: task.id.clone(),
            worker,
            level,
            estimate_minutes: task.estimate_minutes,
            role,
        };
        self.add_minutes(level, worker, task.estimate_minutes);
        self.placements.insert(task.id.clone(), placement.clone());
        debug!(task = %task.id, worker = %worker, role = ?role, "Task placed");
        Some(placement)
    }

    /// Workers carrying `role`, or every worker when none does.
    fn candidates(&self, role: Option<Role>) -> Vec<WorkerId> {
        if let Some(role) = role {
            let matching: Vec<WorkerId> = self
                .workers
                .iter()
                .copied()
                .filter(|w| {
                    self.roles
                        .get(w)
                        .map(|roles| roles.contains(&role))
                        .unwrap_or(false)
                })
                .collect();
            if !matching.is_empty() {
                return matching;
            }
        }
        self.workers.clone()
    }

    fn load_for_choice(&self, level: u32, worker: WorkerId) -> u32 {
        if self.config.balance_by_level {
            self.level_load(level, worker)
        } else {
            self.global_load(worker)
        }
    }

    pub fn level_load(&self, level: u32, worker: WorkerId) -> u32 {
        self.level_minutes
            .get(&level)
            .and_then(|m| m.get(&worker))
            .copied()
            .unwrap_or(0)
    }

    pub fn global_load(&self, worker: WorkerId) -> u32 {
        self.global_minutes.get(&worker).copied().unwrap_or(0)
    }

    fn add_minutes(&mut self, level: u32, worker: WorkerId, minutes: u32) {
        *self
            .level_minutes
            .entry(level)
            .or_default()
            .entry(worker)
            .or_insert(0) += minutes;
        *self.global_minutes.entry(worker).or_insert(0) += minutes;
    }

    fn remove_minutes(&mut self, level: u32, worker: WorkerId, minutes: u32) {
        if let Some(load) = self
            .level_minutes
            .get_mut(&level)
            .and_then(|m| m.get_mut(&worker))
        {
            *load = load.saturating_sub(minutes);
        }
        if let Some(load) = self.global_minutes.get_mut(&worker) {
            *load = load.saturating_sub(minutes);
        }
    }

    pub fn placement(&self, task: &TaskId) -> Option<&Placement> {
        self.placements.get(task)
    }

    pub fn worker_for(&self, task: &TaskId) -> Option<WorkerId> {
        self.placements.get(task).map(|p| p.worker)
    }

    pub fn tasks_for(&self, worker: WorkerId) -> Vec<&Placement> {
        self.placements
            .values()
            .filter(|p| p.worker == worker)
            .collect()
    }

    /// Capacity left for `worker`: configured minutes minus the estimates
    /// of its unfinished planned tasks. May be negative.
    pub fn remaining_capacity<F>(&self, worker: WorkerId, is_finished: &F) -> i64
    where
        F: Fn(&TaskId) -> bool,
    {
        let committed: i64 = self
            .placements
            .values()
            .filter(|p| p.worker == worker && !is_finished(&p.task))
            .map(|p| p.estimate_minutes as i64)
            .sum();
        self.config.capacity_minutes as i64 - committed
    }

    /// Move failed tasks to the worker with the most remaining capacity.
    ///
    /// A task moves only when that worker differs from its current one and
    /// has strictly positive capacity. Failed tasks count as unfinished.
    pub fn rebalance<F>(&mut self, failed: &[TaskId], is_finished: F) -> Vec<Reassignment>
    where
        F: Fn(&TaskId) -> bool,
    {
        let all: BTreeSet<WorkerId> = self.workers.iter().copied().collect();
        failed
            .iter()
            .filter_map(|task| self.move_task(task, &all, &is_finished))
            .collect()
    }

    /// Move every unfinished task planned for `stalled` workers to healthy ones.
    pub fn reassign_from_workers<F>(
        &mut self,
        stalled: &[WorkerId],
        is_finished: F,
    ) -> Vec<Reassignment>
    where
        F: Fn(&TaskId) -> bool,
    {
        let healthy: BTreeSet<WorkerId> = self
            .workers
            .iter()
            .copied()
            .filter(|w| !stalled.contains(w))
            .collect();
        let tasks: Vec<TaskId> = self
            .placements
            .values()
            .filter(|p| stalled.contains(&p.worker) && !is_finished(&p.task))
            .map(|p| p.task.clone())
            .collect();
        tasks
            .iter()
            .filter_map(|task| self.move_task(task, &healthy, &is_finished))
            .collect()
    }

    fn move_task<F>(
        &mut self,
        task: &TaskId,
        candidates: &BTreeSet<WorkerId>,
        is_finished: &F,
    ) -> Option<Reassignment>
    where
        F: Fn(&TaskId) -> bool,
    {
        let placement = self.placements.get(task)?.clone();
        // Highest capacity, ties to the lowest id.
        let (best, capacity) = candidates
            .iter()
            .map(|w| (*w, self.remaining_capacity(*w, is_finished)))
            .fold(None, |best: Option<(WorkerId, i64)>, (w, c)| match best {
                Some((_, bc)) if bc >= c => best,
                _ => Some((w, c)),
            })?;

        if best == placement.worker || capacity <= 0 {
            debug!(
                task = %task,
                worker = %placement.worker,
                best = %best,
                capacity,
                "Task stays with current worker"
            );
            return None;
        }

        self.remove_minutes(placement.level, placement.worker, placement.estimate_minutes);
        self.add_minutes(placement.level, best, placement.estimate_minutes);
        if let Some(p) = self.placements.get_mut(task) {
            p.worker = best;
        }
        info!(task = %task, from = %placement.worker, to = %best, "Task rebalanced");
        Some(Reassignment {
            task: task.clone(),
            from: placement.worker,
            to: best,
        })
    }

    /// Record placements on the task records. Returns how many applied.
    pub fn apply(&self, store: &StateStore, changes: &[Reassignment]) -> Result<usize> {
        let mut applied = 0;
        for change in changes {
            if store.reassign_task(&change.task, change.to)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Record the whole plan on the task records.
    pub fn apply_plan(&self, store: &StateStore) -> Result<usize> {
        let mut applied = 0;
        for placement in self.placements.values() {
            if store.reassign_task(&placement.task, placement.worker)? {
                applied += 1;
            }
        }
        Ok(applied)
    }
}
