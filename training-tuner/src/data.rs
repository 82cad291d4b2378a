//! Datasets, data loaders and the combined loader.
//!
//! A [`CombinedLoader`] aggregates one or more [`DataLoader`]s into a single
//! iterable whose length and underlying dataset length can be queried. The
//! batch size search uses [`CombinedLoader::dataset_length`] as the upper
//! bound for any candidate batch size.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TunerError};

/// One input sample.
pub type Sample = Vec<f32>;

/// Indexable source of samples.
pub trait Dataset: Send + Sync + fmt::Debug {
    /// Number of samples, or `None` for iterable-style datasets.
    fn len(&self) -> Option<usize>;

    /// Sample at `index`, or `None` past the end.
    fn get(&self, index: usize) -> Option<Sample>;

    /// Whether the dataset is known to be empty.
    fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

/// Seeded random feature vectors.
#[derive(Debug, Clone)]
pub struct RandomDataset {
    size: usize,
    data: Vec<Sample>,
}

impl RandomDataset {
    /// `length` samples of `size` standard-uniform features in `[-1, 1)`.
    pub fn new(size: usize, length: usize) -> Self {
        Self::with_seed(size, length, 0)
    }

    /// Same as [`RandomDataset::new`] with an explicit seed.
    pub fn with_seed(size: usize, length: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..length)
            .map(|_| (0..size).map(|_| rng.random_range(-1.0..1.0)).collect())
            .collect();
        Self { size, data }
    }

    /// Features per sample.
    pub fn feature_size(&self) -> usize {
        self.size
    }
}

impl Dataset for RandomDataset {
    fn len(&self) -> Option<usize> {
        Some(self.data.len())
    }

    fn get(&self, index: usize) -> Option<Sample> {
        self.data.get(index).cloned()
    }
}

/// A batch of samples.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Batch {
    /// The samples, one feature vector each.
    pub samples: Vec<Sample>,
}

impl Batch {
    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Shards dataset indices across data-parallel ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedSampler {
    rank: usize,
    world_size: usize,
}

impl DistributedSampler {
    /// Sampler for `rank` out of `world_size`.
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(TunerError::misconfig(format!(
                "invalid distributed sampler rank {rank} for world size {world_size}"
            )));
        }
        Ok(Self { rank, world_size })
    }

    /// Index of the `position`-th sample of this rank.
    fn index(&self, position: usize) -> usize {
        position * self.world_size + self.rank
    }

    /// Samples this rank sees out of `total`.
    fn num_samples(&self, total: usize) -> usize {
        total.saturating_sub(self.rank).div_ceil(self.world_size)
    }
}

/// Batches samples from a dataset.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    batch_size: usize,
    drop_last: bool,
    sampler: Option<DistributedSampler>,
}

impl DataLoader {
    /// Loader over `dataset` with the given batch size.
    pub fn new(dataset: Arc<dyn Dataset>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(TunerError::misconfig("batch_size should be a positive integer, got 0"));
        }
        Ok(Self {
            dataset,
            batch_size,
            drop_last: false,
            sampler: None,
        })
    }

    /// Drop the trailing incomplete batch.
    #[must_use]
    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Only read the shard of one data-parallel rank.
    #[must_use]
    pub fn with_sampler(mut self, sampler: DistributedSampler) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// The underlying dataset.
    pub fn dataset(&self) -> &Arc<dyn Dataset> {
        &self.dataset
    }

    /// Samples per batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn num_samples(&self) -> Option<usize> {
        let total = self.dataset.len()?;
        Some(match &self.sampler {
            Some(sampler) => sampler.num_samples(total),
            None => total,
        })
    }

    /// Number of batches per pass, `None` for iterable-style datasets.
    pub fn len(&self) -> Option<usize> {
        let samples = self.num_samples()?;
        Some(if self.drop_last {
            samples / self.batch_size
        } else {
            samples.div_ceil(self.batch_size)
        })
    }

    /// Whether a pass yields no batches.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Iterate one pass over the dataset.
    pub fn iter(&self) -> DataLoaderIter<'_> {
        DataLoaderIter {
            loader: self,
            position: 0,
        }
    }
}

/// Iterator over the batches of a [`DataLoader`].
#[derive(Debug)]
pub struct DataLoaderIter<'a> {
    loader: &'a DataLoader,
    position: usize,
}

impl Iterator for DataLoaderIter<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let loader = self.loader;
        let limit = loader.num_samples();
        let mut samples = Vec::with_capacity(loader.batch_size);

        while samples.len() < loader.batch_size {
            if limit.is_some_and(|n| self.position >= n) {
                break;
            }
            let index = match &loader.sampler {
                Some(sampler) => sampler.index(self.position),
                None => self.position,
            };
            match loader.dataset.get(index) {
                Some(sample) => samples.push(sample),
                None => break,
            }
            self.position += 1;
        }

        if samples.is_empty() || (loader.drop_last && samples.len() < loader.batch_size) {
            None
        } else {
            Some(Batch { samples })
        }
    }
}

/// How a [`CombinedLoader`] walks its loaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinedMode {
    /// Run until the longest loader ends, restarting shorter ones.
    #[default]
    MaxSizeCycle,
    /// Stop when the shortest loader ends.
    MinSize,
    /// Run until the longest loader ends, omitting finished loaders.
    MaxSize,
    /// One loader after the other.
    Sequential,
}

impl FromStr for CombinedMode {
    type Err = TunerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "max_size_cycle" => Ok(Self::MaxSizeCycle),
            "min_size" => Ok(Self::MinSize),
            "max_size" => Ok(Self::MaxSize),
            "sequential" => Ok(Self::Sequential),
            other => Err(TunerError::misconfig(format!(
                "Unsupported mode {other:?}, please select one of: \
                 max_size_cycle, min_size, max_size, sequential."
            ))),
        }
    }
}

/// One step of a [`CombinedLoader`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CombinedBatch {
    /// One batch per participating loader.
    pub batches: Vec<Batch>,
    /// Source loader in sequential mode.
    pub dataloader_idx: Option<usize>,
}

impl CombinedBatch {
    /// Total samples across all parts.
    pub fn num_samples(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    /// All samples, flattened.
    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.batches.iter().flat_map(|b| b.samples.iter())
    }
}

/// Aggregates one or more loaders into a single iterable.
#[derive(Debug, Clone)]
pub struct CombinedLoader {
    loaders: Vec<DataLoader>,
    mode: CombinedMode,
    reported_length: Option<usize>,
}

impl CombinedLoader {
    /// Combine `loaders` under `mode`.
    pub fn new(loaders: Vec<DataLoader>, mode: CombinedMode) -> Result<Self> {
        if loaders.is_empty() {
            return Err(TunerError::misconfig("CombinedLoader needs at least one loader"));
        }
        Ok(Self {
            loaders,
            mode,
            reported_length: None,
        })
    }

    /// Wrap a single loader.
    pub fn single(loader: DataLoader) -> Self {
        Self {
            loaders: vec![loader],
            mode: CombinedMode::default(),
            reported_length: None,
        }
    }

    /// Report `length` as the dataset length regardless of the datasets.
    #[must_use]
    pub fn with_dataset_length(mut self, length: usize) -> Self {
        self.reported_length = Some(length);
        self
    }

    /// The wrapped loaders.
    pub fn loaders(&self) -> &[DataLoader] {
        &self.loaders
    }

    /// Iteration mode.
    pub fn mode(&self) -> CombinedMode {
        self.mode
    }

    /// Copy whose loaders only read the shard of one data-parallel rank.
    #[must_use]
    pub fn sharded(&self, sampler: DistributedSampler) -> Self {
        Self {
            loaders: self
                .loaders
                .iter()
                .map(|loader| loader.clone().with_sampler(sampler))
                .collect(),
            mode: self.mode,
            reported_length: self.reported_length,
        }
    }

    /// Number of steps per pass, `None` if any loader is unsized.
    pub fn len(&self) -> Option<usize> {
        let lengths = self
            .loaders
            .iter()
            .map(DataLoader::len)
            .collect::<Option<Vec<_>>>()?;
        Some(combine_lengths(self.mode, &lengths))
    }

    /// Whether a pass yields no steps.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Total length of the sized datasets according to the mode, or the
    /// length set with [`CombinedLoader::with_dataset_length`].
    ///
    /// `None` when every dataset is iterable-style and nothing was reported.
    pub fn dataset_length(&self) -> Option<usize> {
        if self.reported_length.is_some() {
            return self.reported_length;
        }
        let lengths: Vec<usize> = self
            .loaders
            .iter()
            .filter_map(|loader| loader.dataset().len())
            .collect();
        if lengths.is_empty() {
            None
        } else {
            Some(combine_lengths(self.mode, &lengths))
        }
    }

    /// Iterate one pass.
    pub fn iter(&self) -> CombinedLoaderIter<'_> {
        CombinedLoaderIter {
            loader: self,
            iters: self.loaders.iter().map(DataLoader::iter).collect(),
            exhausted: vec![false; self.loaders.len()],
            remaining: self.len(),
            current: 0,
        }
    }
}

fn combine_lengths(mode: CombinedMode, lengths: &[usize]) -> usize {
    match mode {
        CombinedMode::MaxSizeCycle | CombinedMode::MaxSize => {
            lengths.iter().copied().max().unwrap_or(0)
        }
        CombinedMode::MinSize => lengths.iter().copied().min().unwrap_or(0),
        CombinedMode::Sequential => lengths.iter().sum(),
    }
}

/// Iterator over a [`CombinedLoader`].
#[derive(Debug)]
pub struct CombinedLoaderIter<'a> {
    loader: &'a CombinedLoader,
    iters: Vec<DataLoaderIter<'a>>,
    exhausted: Vec<bool>,
    remaining: Option<usize>,
    current: usize,
}

impl CombinedLoaderIter<'_> {
    fn next_sequential(&mut self) -> Option<CombinedBatch> {
        while self.current < self.iters.len() {
            if let Some(batch) = self.iters[self.current].next() {
                return Some(CombinedBatch {
                    batches: vec![batch],
                    dataloader_idx: Some(self.current),
                });
            }
            self.current += 1;
        }
        None
    }

    fn next_min_size(&mut self) -> Option<CombinedBatch> {
        let batches = self
            .iters
            .iter_mut()
            .map(Iterator::next)
            .collect::<Option<Vec<_>>>()?;
        Some(CombinedBatch {
            batches,
            dataloader_idx: None,
        })
    }

    fn next_max_size(&mut self, cycle: bool) -> Option<CombinedBatch> {
        if self.remaining == Some(0) {
            return None;
        }
        let mut batches = Vec::with_capacity(self.iters.len());
        for (i, iter) in self.iters.iter_mut().enumerate() {
            match iter.next() {
                Some(batch) => batches.push(batch),
                None => {
                    self.exhausted[i] = true;
                    if cycle {
                        *iter = self.loader.loaders[i].iter();
                        if let Some(batch) = iter.next() {
                            batches.push(batch);
                        }
                    }
                }
            }
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        // Unsized loaders: stop once every loader has run dry.
        let all_done = self.exhausted.iter().all(|&done| done);
        if batches.is_empty() || (self.remaining.is_none() && all_done) {
            None
        } else {
            Some(CombinedBatch {
                batches,
                dataloader_idx: None,
            })
        }
    }
}

impl Iterator for CombinedLoaderIter<'_> {
    type Item = CombinedBatch;

    fn next(&mut self) -> Option<CombinedBatch> {
        match self.loader.mode {
            CombinedMode::Sequential => self.next_sequential(),
            CombinedMode::MinSize => self.next_min_size(),
            CombinedMode::MaxSize => self.next_max_size(false),
            CombinedMode::MaxSizeCycle => self.next_max_size(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Stream(usize);

    impl Dataset for Stream {
        fn len(&self) -> Option<usize> {
            None
        }

        fn get(&self, index: usize) -> Option<Sample> {
            (index < self.0).then(|| vec![index as f32])
        }
    }

    fn loader(len: usize, batch_size: usize) -> DataLoader {
        DataLoader::new(Arc::new(RandomDataset::new(4, len)), batch_size).unwrap()
    }

    #[test]
    fn test_random_dataset_is_seeded() {
        let a = RandomDataset::new(8, 3);
        let b = RandomDataset::new(8, 3);
        assert_eq!(a.get(2), b.get(2));
        assert_eq!(a.len(), Some(3));
        assert_eq!(a.get(3), None);
        assert!(a.get(0).unwrap().iter().all(|x| (-1.0..1.0).contains(x)));
    }

    #[test]
    fn test_data_loader_len_and_batches() {
        let dl = loader(10, 4);
        assert_eq!(dl.len(), Some(3));
        let sizes: Vec<usize> = dl.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        let dl = loader(10, 4).with_drop_last(true);
        assert_eq!(dl.len(), Some(2));
        assert_eq!(dl.iter().count(), 2);
    }

    #[test]
    fn test_batch_larger_than_dataset() {
        let dl = loader(5, 8);
        assert_eq!(dl.len(), Some(1));
        let batches: Vec<Batch> = dl.iter().collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 5);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(DataLoader::new(Arc::new(RandomDataset::new(4, 4)), 0).is_err());
    }

    #[test]
    fn test_distributed_sampler_shards() {
        let rank0 = loader(5, 1).with_sampler(DistributedSampler::new(0, 2).unwrap());
        let rank1 = loader(5, 1).with_sampler(DistributedSampler::new(1, 2).unwrap());
        assert_eq!(rank0.len(), Some(3));
        assert_eq!(rank1.len(), Some(2));
        assert!(DistributedSampler::new(2, 2).is_err());

        let combined = CombinedLoader::single(loader(5, 1));
        let shard = combined.sharded(DistributedSampler::new(1, 2).unwrap());
        assert_eq!(shard.len(), Some(2));
        assert_eq!(shard.dataset_length(), Some(5));
    }

    #[test]
    fn test_iterable_dataset_loader() {
        let dl = DataLoader::new(Arc::new(Stream(5)), 2).unwrap();
        assert_eq!(dl.len(), None);
        let sizes: Vec<usize> = dl.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_combined_lengths_by_mode() {
        let make = |mode| CombinedLoader::new(vec![loader(10, 2), loader(4, 2)], mode).unwrap();

        let cycle = make(CombinedMode::MaxSizeCycle);
        assert_eq!(cycle.len(), Some(5));
        assert_eq!(cycle.dataset_length(), Some(10));
        assert_eq!(cycle.iter().count(), 5);
        assert!(cycle.iter().all(|step| step.batches.len() == 2));

        let min = make(CombinedMode::MinSize);
        assert_eq!(min.len(), Some(2));
        assert_eq!(min.dataset_length(), Some(4));
        assert_eq!(min.iter().count(), 2);

        let max = make(CombinedMode::MaxSize);
        assert_eq!(max.iter().count(), 5);
        assert_eq!(max.iter().last().unwrap().batches.len(), 1);

        let seq = make(CombinedMode::Sequential);
        assert_eq!(seq.len(), Some(7));
        assert_eq!(seq.dataset_length(), Some(14));
        let idx: Vec<Option<usize>> = seq.iter().map(|s| s.dataloader_idx).collect();
        assert_eq!(idx.first(), Some(&Some(0)));
        assert_eq!(idx.last(), Some(&Some(1)));
    }

    #[test]
    fn test_dataset_length_ignores_iterable_datasets() {
        let stream = DataLoader::new(Arc::new(Stream(3)), 1).unwrap();
        let only_stream = CombinedLoader::single(stream.clone());
        assert_eq!(only_stream.dataset_length(), None);
        assert_eq!(only_stream.len(), None);

        let mixed =
            CombinedLoader::new(vec![stream, loader(7, 2)], CombinedMode::MaxSizeCycle).unwrap();
        assert_eq!(mixed.dataset_length(), Some(7));
    }

    #[test]
    fn test_reported_dataset_length_overrides_datasets() {
        let combined = CombinedLoader::single(loader(64, 4)).with_dataset_length(5);
        assert_eq!(combined.dataset_length(), Some(5));
        // Iteration still covers every sample.
        assert_eq!(combined.len(), Some(16));

        let shard = combined.sharded(DistributedSampler::new(0, 2).unwrap());
        assert_eq!(shard.dataset_length(), Some(5));

        let stream = DataLoader::new(Arc::new(Stream(3)), 1).unwrap();
        assert_eq!(CombinedLoader::single(stream).with_dataset_length(2).dataset_length(), Some(2));
    }

    #[test]
    fn test_combined_batch_flattening() {
        let combined =
            CombinedLoader::new(vec![loader(4, 2), loader(4, 2)], CombinedMode::MinSize).unwrap();
        let step = combined.iter().next().unwrap();
        assert_eq!(step.num_samples(), 4);
        assert_eq!(step.samples().count(), 4);
    }

    #[test]
    fn test_combined_mode_parse() {
        assert_eq!(
            "min_size".parse::<CombinedMode>().unwrap(),
            CombinedMode::MinSize
        );
        assert!("zip".parse::<CombinedMode>().is_err());
    }
}
