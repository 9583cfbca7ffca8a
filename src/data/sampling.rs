//! Batch samplers: sequential chunking and group-stratified composition.
//!
//! Both samplers produce restartable sequences of index batches. In `Epoch`
//! mode a sequence is finite and its length is well defined; in `Step` mode
//! it streams indefinitely and is cut off externally by the training-step
//! budget.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::{FbError, Result};

/// Length policy for a sampling session.
///
/// `Epoch` yields a finite number of batches per pass; `Step` streams
/// batches indefinitely for step-budget-driven training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingMode {
    Epoch,
    Step,
}

impl Default for TrainingMode {
    fn default() -> Self {
        TrainingMode::Epoch
    }
}

/// Number of batches a sequential pass over `num_samples` produces.
pub fn num_batches_per_epoch(num_samples: usize, batch_size: usize, drop_last: bool) -> usize {
    if drop_last {
        num_samples / batch_size
    } else {
        num_samples.div_ceil(batch_size)
    }
}

/// Plain chunked sampler over `0..num_samples`.
///
/// With `shuffle` the order is re-drawn at the start of every pass. In
/// `Step` mode batches are assembled across pass boundaries so the stream
/// never emits a short batch.
#[derive(Debug, Clone)]
pub struct SequentialBatchSampler {
    num_samples: usize,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    mode: TrainingMode,
    seed: u64,
}

impl SequentialBatchSampler {
    pub fn new(
        num_samples: usize,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        mode: TrainingMode,
        seed: u64,
    ) -> Result<Self> {
        if num_samples == 0 {
            return Err(FbError::Config("cannot sample from an empty dataset".to_string()));
        }
        if batch_size == 0 {
            return Err(FbError::Config("batch_size must be > 0".to_string()));
        }
        Ok(Self {
            num_samples,
            batch_size,
            shuffle,
            drop_last,
            mode,
            seed,
        })
    }

    pub fn mode(&self) -> TrainingMode {
        self.mode
    }

    /// Batches per epoch. Only defined in `Epoch` mode.
    pub fn num_batches(&self) -> Result<usize> {
        match self.mode {
            TrainingMode::Epoch => Ok(num_batches_per_epoch(
                self.num_samples,
                self.batch_size,
                self.drop_last,
            )),
            TrainingMode::Step => Err(FbError::Config(
                "the number of batches is undefined in step mode".to_string(),
            )),
        }
    }

    /// Start a fresh (restartable) pass.
    pub fn iter(&self) -> SequentialBatches {
        let mut order: Vec<usize> = (0..self.num_samples).collect();
        let mut rng = StdRng::seed_from_u64(self.seed);
        if self.shuffle {
            order.shuffle(&mut rng);
        }
        let remaining = match self.mode {
            TrainingMode::Epoch => Some(num_batches_per_epoch(
                self.num_samples,
                self.batch_size,
                self.drop_last,
            )),
            TrainingMode::Step => None,
        };
        SequentialBatches {
            order,
            pos: 0,
            batch_size: self.batch_size,
            shuffle: self.shuffle,
            wrap: self.mode == TrainingMode::Step,
            remaining,
            rng,
        }
    }
}

/// Iterator state for [`SequentialBatchSampler`].
pub struct SequentialBatches {
    order: Vec<usize>,
    pos: usize,
    batch_size: usize,
    shuffle: bool,
    wrap: bool,
    remaining: Option<usize>,
    rng: StdRng,
}

impl Iterator for SequentialBatches {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if let Some(0) = self.remaining {
            return None;
        }
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            if self.pos == self.order.len() {
                if !self.wrap {
                    break;
                }
                if self.shuffle {
                    self.order.shuffle(&mut self.rng);
                }
                self.pos = 0;
            }
            let take = (self.batch_size - batch.len()).min(self.order.len() - self.pos);
            batch.extend_from_slice(&self.order[self.pos..self.pos + take]);
            self.pos += take;
        }
        if let Some(n) = self.remaining.as_mut() {
            *n -= 1;
        }
        Some(batch)
    }
}

/// Configuration for [`StratifiedBatchSampler`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StratifiedSamplerConfig {
    /// Base number of samples drawn from each group per batch.
    pub num_samples_per_group: usize,
    /// Re-draw each group's order at the start of every pass over it.
    pub shuffle: bool,
    /// Per-group multiplier on `num_samples_per_group`; groups not listed
    /// default to 1 and a multiplier of 0 excludes the group entirely.
    pub multipliers: Option<BTreeMap<i64, usize>>,
    pub mode: TrainingMode,
    pub seed: u64,
}

impl Default for StratifiedSamplerConfig {
    fn default() -> Self {
        Self {
            num_samples_per_group: 1,
            shuffle: false,
            multipliers: None,
            mode: TrainingMode::Epoch,
            seed: 47,
        }
    }
}

struct GroupSlot {
    id: i64,
    indices: Vec<usize>,
    /// `num_samples_per_group * multiplier`, the group's share of each batch.
    take: usize,
}

/// Batch sampler with controlled per-group composition.
///
/// Every batch contains exactly `num_samples_per_group * multiplier[g]`
/// indices from each group `g`, concatenated in ascending group-id order.
/// Each group is cycled independently: without replacement within a pass
/// over the group's own indices, wrapping around (and reshuffling, when
/// `shuffle` is set) across passes. Smaller groups therefore recycle faster
/// than larger ones, and a one-sample group contributes its sample to every
/// batch.
///
/// In `Epoch` mode the sequence length is the number of batches the
/// largest-relative-effort group needs to complete one pass of its own
/// data: `max_g ceil(|group_g| / (multiplier[g] * num_samples_per_group))`.
pub struct StratifiedBatchSampler {
    groups: Vec<GroupSlot>,
    config: StratifiedSamplerConfig,
}

impl StratifiedBatchSampler {
    /// Build the group index table from one group id per dataset sample.
    pub fn new(group_ids: &[i64], config: StratifiedSamplerConfig) -> Result<Self> {
        if group_ids.is_empty() {
            return Err(FbError::Config(
                "cannot build a stratified sampler from an empty group-id vector".to_string(),
            ));
        }
        if config.num_samples_per_group == 0 {
            return Err(FbError::Config(
                "num_samples_per_group must be > 0".to_string(),
            ));
        }
        if let Some(&bad) = group_ids.iter().find(|&&g| g < 0) {
            return Err(FbError::Config(format!(
                "group ids must be non-negative integers, got {bad}"
            )));
        }

        let mut table: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (idx, &g) in group_ids.iter().enumerate() {
            table.entry(g).or_default().push(idx);
        }

        let groups: Vec<GroupSlot> = table
            .into_iter()
            .map(|(id, indices)| {
                let mult = config
                    .multipliers
                    .as_ref()
                    .and_then(|m| m.get(&id).copied())
                    .unwrap_or(1);
                GroupSlot {
                    id,
                    indices,
                    take: config.num_samples_per_group * mult,
                }
            })
            .collect();

        if groups.iter().all(|g| g.take == 0) {
            return Err(FbError::Config(
                "all groups have a zero multiplier; every batch would be empty".to_string(),
            ));
        }

        Ok(Self { groups, config })
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn mode(&self) -> TrainingMode {
        self.config.mode
    }

    /// Total number of indices in every batch.
    pub fn batch_len(&self) -> usize {
        self.groups.iter().map(|g| g.take).sum()
    }

    /// Samples in group `id`, if the group exists.
    pub fn group_size(&self, id: i64) -> Option<usize> {
        self.groups
            .iter()
            .find(|g| g.id == id)
            .map(|g| g.indices.len())
    }

    /// Batches per epoch: the pass length of the slowest-cycling group.
    /// Only defined in `Epoch` mode.
    pub fn num_batches(&self) -> Result<usize> {
        match self.config.mode {
            TrainingMode::Epoch => Ok(self.epoch_len()),
            TrainingMode::Step => Err(FbError::Config(
                "the number of batches is undefined in step mode".to_string(),
            )),
        }
    }

    fn epoch_len(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.take > 0)
            .map(|g| g.indices.len().div_ceil(g.take))
            .max()
            .unwrap_or(0)
    }

    /// Start a fresh (restartable) sequence of index batches.
    pub fn iter(&self) -> StratifiedBatches {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let decks = self
            .groups
            .iter()
            .map(|g| {
                let mut order = g.indices.clone();
                if self.config.shuffle {
                    order.shuffle(&mut rng);
                }
                Deck {
                    order,
                    pos: 0,
                    take: g.take,
                }
            })
            .collect();
        let remaining = match self.config.mode {
            TrainingMode::Epoch => Some(self.epoch_len()),
            TrainingMode::Step => None,
        };
        StratifiedBatches {
            decks,
            shuffle: self.config.shuffle,
            remaining,
            rng,
        }
    }
}

struct Deck {
    order: Vec<usize>,
    pos: usize,
    take: usize,
}

impl Deck {
    /// Draw `self.take` indices, wrapping (and optionally reshuffling) as
    /// often as needed. A group smaller than its per-batch share repeats
    /// within a single batch.
    fn draw_into(&mut self, batch: &mut Vec<usize>, shuffle: bool, rng: &mut StdRng) {
        let mut wanted = self.take;
        while wanted > 0 {
            if self.pos == self.order.len() {
                if shuffle {
                    self.order.shuffle(rng);
                }
                self.pos = 0;
            }
            let take = wanted.min(self.order.len() - self.pos);
            batch.extend_from_slice(&self.order[self.pos..self.pos + take]);
            self.pos += take;
            wanted -= take;
        }
    }
}

/// Iterator state for [`StratifiedBatchSampler`].
pub struct StratifiedBatches {
    decks: Vec<Deck>,
    shuffle: bool,
    remaining: Option<usize>,
    rng: StdRng,
}

impl Iterator for StratifiedBatches {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if let Some(0) = self.remaining {
            return None;
        }
        let total: usize = self.decks.iter().map(|d| d.take).sum();
        let mut batch = Vec::with_capacity(total);
        for deck in self.decks.iter_mut() {
            deck.draw_into(&mut batch, self.shuffle, &mut self.rng);
        }
        if let Some(n) = self.remaining.as_mut() {
            *n -= 1;
        }
        Some(batch)
    }
}
