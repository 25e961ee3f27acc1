//! Strategies partitioning a task's workers into per-slave sub-tasks.
//!
//! All splitters keep the sum of sub-task worker counts equal to the
//! task's `total_workers` and fail with [`CoreError::NoSlavesAvailable`]
//! on an empty slave list.

use std::{collections::HashMap, fmt, sync::Arc};

use hive_model::{SlaveInfo, SplitStrategy, SubTask, Task};

use crate::CoreError;

pub trait TaskSplitter: Send + Sync + 'static {
    fn split(&self, task: &Task, slaves: &[SlaveInfo]) -> Result<Vec<SubTask>, CoreError>;

    fn name(&self) -> &'static str;
}

pub fn splitter_for(strategy: SplitStrategy) -> Arc<dyn TaskSplitter> {
    match strategy {
        SplitStrategy::Equal => Arc::new(EqualSplitter),
        SplitStrategy::Weighted => Arc::new(WeightedSplitter::new()),
    }
}

fn sub_task(task: &Task, sub_task_id: String, slave: &SlaveInfo, workers: u32) -> SubTask {
    SubTask {
        task_id: task.id.clone(),
        sub_task_id,
        slave_id: slave.id.clone(),
        worker_count: workers,
        config: task.config_data.clone(),
    }
}

/// Even split; the first `total % n` slaves take one extra worker.
/// Slaves that would get zero workers are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct EqualSplitter;

impl TaskSplitter for EqualSplitter {
    fn split(&self, task: &Task, slaves: &[SlaveInfo]) -> Result<Vec<SubTask>, CoreError> {
        if slaves.is_empty() {
            return Err(CoreError::NoSlavesAvailable);
        }

        let n = slaves.len() as u32;
        let per_slave = task.total_workers / n;
        let remainder = task.total_workers % n;

        let subtasks = slaves
            .iter()
            .enumerate()
            .filter_map(|(i, slave)| {
                let workers = per_slave + u32::from((i as u32) < remainder);
                (workers > 0)
                    .then(|| sub_task(task, format!("{}-part-{}", task.id, i), slave, workers))
            })
            .collect();
        Ok(subtasks)
    }

    fn name(&self) -> &'static str {
        "equal"
    }
}

/// Proportional split by weight.
///
/// A slave's weight is its CPU core count unless overridden. All slaves but
/// the last get `floor(total * weight / total_weight)`; the last absorbs the
/// rounding remainder. Zero shares are skipped.
#[derive(Debug, Default, Clone)]
pub struct WeightedSplitter {
    overrides: HashMap<String, u32>,
}

impl WeightedSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_weight(mut self, slave_id: impl Into<String>, weight: u32) -> Self {
        self.overrides.insert(slave_id.into(), weight);
        self
    }

    fn weight_of(&self, slave: &SlaveInfo) -> u64 {
        u64::from(
            self.overrides
                .get(&slave.id)
                .copied()
                .unwrap_or(slave.cpu_cores),
        )
    }
}

impl TaskSplitter for WeightedSplitter {
    fn split(&self, task: &Task, slaves: &[SlaveInfo]) -> Result<Vec<SubTask>, CoreError> {
        if slaves.is_empty() {
            return Err(CoreError::NoSlavesAvailable);
        }

        let weights: Vec<u64> = slaves.iter().map(|s| self.weight_of(s)).collect();
        let total_weight: u64 = weights.iter().sum();
        if total_weight == 0 {
            return Err(CoreError::ZeroTotalWeight);
        }

        let total = u64::from(task.total_workers);
        let last = slaves.len() - 1;
        let mut assigned = 0u64;
        let mut subtasks = Vec::with_capacity(slaves.len());

        for (i, (slave, weight)) in slaves.iter().zip(&weights).enumerate() {
            let share = if i == last {
                total - assigned
            } else {
                total * weight / total_weight
            };
            assigned += share;
            if share > 0 {
                let id = format!("{}-{}", task.id, slave.id);
                subtasks.push(sub_task(task, id, slave, share as u32));
            }
        }
        Ok(subtasks)
    }

    fn name(&self) -> &'static str {
        "weighted"
    }
}

type SplitFn = dyn Fn(&Task, &[SlaveInfo]) -> Result<Vec<SubTask>, CoreError> + Send + Sync;

/// Caller-supplied split function.
#[derive(Clone)]
pub struct CustomSplitter {
    split_fn: Arc<SplitFn>,
}

impl CustomSplitter {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Task, &[SlaveInfo]) -> Result<Vec<SubTask>, CoreError> + Send + Sync + 'static,
    {
        Self {
            split_fn: Arc::new(f),
        }
    }
}

impl fmt::Debug for CustomSplitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomSplitter").finish_non_exhaustive()
    }
}

impl TaskSplitter for CustomSplitter {
    fn split(&self, task: &Task, slaves: &[SlaveInfo]) -> Result<Vec<SubTask>, CoreError> {
        if slaves.is_empty() {
            return Err(CoreError::NoSlavesAvailable);
        }
        (self.split_fn)(task, slaves)
    }

    fn name(&self) -> &'static str {
        "custom"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slaves(cores: &[u32]) -> Vec<SlaveInfo> {
        cores
            .iter()
            .enumerate()
            .map(|(i, &c)| SlaveInfo::new(format!("s{i}")).with_cpu_cores(c))
            .collect()
    }

    fn workers(subtasks: &[SubTask]) -> Vec<u32> {
        subtasks.iter().map(|s| s.worker_count).collect()
    }

    #[test]
    fn equal_single_slave_gets_everything() {
        let task = Task::new("t1", 10);
        let subtasks = EqualSplitter.split(&task, &slaves(&[4])).unwrap();

        assert_eq!(subtasks.len(), 1);
        assert_eq!(subtasks[0].worker_count, 10);
        assert_eq!(subtasks[0].slave_id, "s0");
        assert_eq!(subtasks[0].sub_task_id, "t1-part-0");
    }

    #[test]
    fn equal_distributes_remainder_first() {
        let task = Task::new("t1", 10);
        let subtasks = EqualSplitter.split(&task, &slaves(&[1, 1, 1])).unwrap();
        assert_eq!(workers(&subtasks), vec![4, 3, 3]);
    }

    #[test]
    fn equal_sum_and_spread_invariant() {
        for total in 0..40u32 {
            for n in 1..8usize {
                let task = Task::new("t", total);
                let subtasks = EqualSplitter.split(&task, &slaves(&vec![1; n])).unwrap();
                let counts = workers(&subtasks);

                assert_eq!(counts.iter().sum::<u32>(), total, "total={total} n={n}");
                if let (Some(min), Some(max)) = (counts.iter().min(), counts.iter().max()) {
                    assert!(max - min <= 1, "total={total} n={n}");
                }
                assert!(counts.iter().all(|&c| c > 0));
            }
        }
    }

    #[test]
    fn equal_skips_zero_worker_slaves() {
        let task = Task::new("t1", 2);
        let subtasks = EqualSplitter.split(&task, &slaves(&[1, 1, 1, 1])).unwrap();
        let ids: Vec<_> = subtasks.iter().map(|s| s.slave_id.as_str()).collect();
        assert_eq!(ids, vec!["s0", "s1"]);
    }

    #[test]
    fn empty_slaves_fail() {
        let task = Task::new("t1", 10);
        assert_eq!(
            EqualSplitter.split(&task, &[]),
            Err(CoreError::NoSlavesAvailable)
        );
        assert_eq!(
            WeightedSplitter::new().split(&task, &[]),
            Err(CoreError::NoSlavesAvailable)
        );
    }

    #[test]
    fn weighted_by_cpu_cores() {
        let task = Task::new("t1", 10);
        let subtasks = WeightedSplitter::new()
            .split(&task, &slaves(&[1, 2, 2]))
            .unwrap();

        // floor(10*1/5)=2, floor(10*2/5)=4, last takes 10-6=4
        assert_eq!(workers(&subtasks), vec![2, 4, 4]);
        assert_eq!(subtasks[1].sub_task_id, "t1-s1");
    }

    #[test]
    fn weighted_last_absorbs_remainder() {
        let task = Task::new("t1", 7);
        let subtasks = WeightedSplitter::new()
            .split(&task, &slaves(&[1, 1, 1]))
            .unwrap();
        assert_eq!(workers(&subtasks), vec![2, 2, 3]);
    }

    #[test]
    fn weighted_override_and_zero_weight() {
        let task = Task::new("t1", 9);
        let splitter = WeightedSplitter::new().with_weight("s0", 0);
        let subtasks = splitter.split(&task, &slaves(&[8, 3])).unwrap();
        assert_eq!(workers(&subtasks), vec![9]);
        assert_eq!(subtasks[0].slave_id, "s1");

        assert_eq!(
            WeightedSplitter::new().split(&task, &slaves(&[0, 0])),
            Err(CoreError::ZeroTotalWeight)
        );
    }

    #[test]
    fn custom_splitter_delegates() {
        let splitter = CustomSplitter::new(|task, slaves| {
            Ok(vec![SubTask {
                task_id: task.id.clone(),
                sub_task_id: "only".into(),
                slave_id: slaves[0].id.clone(),
                worker_count: task.total_workers,
                config: vec![],
            }])
        });
        let task = Task::new("t1", 5);
        let subtasks = splitter.split(&task, &slaves(&[1, 1])).unwrap();
        assert_eq!(workers(&subtasks), vec![5]);
        assert_eq!(
            splitter.split(&task, &[]),
            Err(CoreError::NoSlavesAvailable)
        );
    }
}
