use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread;

use anyhow::anyhow;
use burn::data::dataset::Dataset;
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};

use crate::image_folder::ImageItem;

// Batches each worker prepares ahead of the consumer.
const PREFETCH: usize = 4;

#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    // [n, 3, crop, crop]
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 1, Int>,
}

// Seeds are folded into this many shuffle keys, keeping the shuffle arithmetic
// far from overflow for any u64 seed.
const SHUFFLE_KEYS: u64 = 0x1_0000;

/// Which dataset indices make up each batch.
///
/// Every epoch is a fresh permutation of the dataset keyed by seed and epoch.
/// Batch `k` belongs to epoch `k / batches_per_epoch`; the tail that doesn't
/// fill a whole batch is skipped, so no batch mixes two epochs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOrder {
    len: usize,
    batch_size: usize,
    batches_per_epoch: usize,
    key: usize,
}

impl BatchOrder {
    pub fn new(len: usize, batch_size: usize, seed: u64) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            len,
            batch_size,
            batches_per_epoch: (len / batch_size).max(1),
            key: (seed % SHUFFLE_KEYS) as usize,
        }
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.batches_per_epoch
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn indices(&self, batch_index: usize) -> Vec<usize> {
        if self.len == 0 {
            return vec![];
        }
        let epoch = batch_index / self.batches_per_epoch;
        let first = (batch_index % self.batches_per_epoch) * self.batch_size;
        (first..first + self.batch_size)
            // Only wraps when the dataset is smaller than one batch.
            .map(|position| miller_shuffle(position % self.len, self.key + epoch, self.len))
            .collect()
    }
}

/// Streams shuffled batches from a dataset, read on background threads.
///
/// Worker `w` builds batches `w, w + workers, ...` counted from the first batch
/// of `start_epoch`; the consumer reads the workers round-robin so the batch
/// order doesn't depend on thread timing.
pub struct BatchLoader<B: Backend> {
    receivers: Vec<Receiver<anyhow::Result<ImageBatch<B>>>>,
    next: usize,
    batches_per_epoch: usize,
}

impl<B: Backend> BatchLoader<B> {
    pub fn new<D>(
        dataset: Arc<D>,
        batch_size: usize,
        num_workers: usize,
        seed: u64,
        start_epoch: usize,
        device: &B::Device,
    ) -> Self
    where
        D: Dataset<ImageItem> + 'static,
    {
        let order = BatchOrder::new(dataset.len(), batch_size, seed);
        let num_workers = num_workers.max(1);
        let first_batch = start_epoch * order.batches_per_epoch();

        let receivers = (0..num_workers)
            .map(|worker| {
                let (tx, rx) = sync_channel(PREFETCH);
                let dataset = dataset.clone();
                let device = device.clone();

                thread::spawn(move || {
                    let mut batch_index = first_batch + worker;
                    loop {
                        let batch = load_batch(dataset.as_ref(), &order, batch_index, &device);
                        // Receiver gone, loader was dropped.
                        if tx.send(batch).is_err() {
                            break;
                        }
                        batch_index += num_workers;
                    }
                });

                rx
            })
            .collect();

        Self {
            receivers,
            next: 0,
            batches_per_epoch: order.batches_per_epoch(),
        }
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.batches_per_epoch
    }

    pub fn next_batch(&mut self) -> anyhow::Result<ImageBatch<B>> {
        let receiver = &self.receivers[self.next % self.receivers.len()];
        self.next += 1;
        receiver
            .recv()
            .map_err(|_| anyhow!("Batch loader worker exited"))?
    }
}

fn load_batch<B: Backend, D: Dataset<ImageItem>>(
    dataset: &D,
    order: &BatchOrder,
    batch_index: usize,
    device: &B::Device,
) -> anyhow::Result<ImageBatch<B>> {
    if dataset.is_empty() {
        anyhow::bail!("Cannot load batches from an empty dataset");
    }

    let items: Vec<_> = order
        .indices(batch_index)
        .into_iter()
        .filter_map(|index| dataset.get(index))
        .collect();

    let Some(first) = items.first() else {
        anyhow::bail!("No image in batch {batch_index} could be loaded");
    };
    let (channels, height, width) = first.pixels.dim();

    let mut data = Vec::with_capacity(items.len() * channels * height * width);
    let mut labels = Vec::with_capacity(items.len());
    for item in &items {
        data.extend(item.pixels.iter().copied());
        labels.push(item.label as i32);
    }

    let images = Tensor::from_data(
        TensorData::new(data, [items.len(), channels, height, width]),
        device,
    );
    let labels = Tensor::<B, 1, Int>::from_ints(labels.as_slice(), device);

    Ok(ImageBatch { images, labels })
}

// Simple rust port of https://github.com/RondeSC/Miller_Shuffle_Algo/blob/main/MillerShuffle.c,
// "Miller Shuffle Algorithm E variant".
// Copyright 2022 Ronald R. Miller
// http://www.apache.org/licenses/LICENSE-2.0
fn miller_shuffle(inx: usize, shuffle_id: usize, list_size: usize) -> usize {
    let p1: usize = 24317;
    let p2: usize = 32141;
    let p3: usize = 63629;

    let shuffle_id = shuffle_id + 131 * (inx / list_size);
    let mut si = (inx + shuffle_id) % list_size;
    let r1 = shuffle_id % p1 + 42;
    let r2 = ((shuffle_id * 0x89) ^ r1) % p2;
    let r3 = (r1 + r2 + p3) % list_size;
    let r4 = r1 ^ r2 ^ r3;
    let rx = (shuffle_id / list_size) % list_size + 1;
    let rx2 = (shuffle_id / list_size / list_size) % list_size + 1;

    if si % 3 == 0 {
        si = (((si / 3) * p1 + r1) % ((list_size + 2) / 3)) * 3;
    }
    if si % 2 == 0 {
        si = (((si / 2) * p2 + r2) % ((list_size + 1) / 2)) * 2;
    }
    if si < list_size / 2 {
        si = (si * p3 + r4) % (list_size / 2);
    }
    if (si ^ rx) < list_size {
        si ^= rx;
    }
    si = (si * p3 + r3) % list_size;
    if (si ^ rx2) < list_size {
        si ^= rx2;
    }
    si
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::write_folder;
    use crate::{ImageFolder, Preprocess, RepeatDataset};
    use burn::backend::NdArray;
    use std::collections::HashSet;

    type TestBackend = NdArray;

    #[test]
    fn shuffle_is_a_permutation() {
        for len in [1, 2, 7, 64, 1000] {
            for shuffle_id in [0, 1, 42] {
                let indices: HashSet<_> = (0..len)
                    .map(|i| miller_shuffle(i, shuffle_id, len))
                    .collect();
                assert_eq!(indices.len(), len);
                assert!(indices.iter().all(|&i| i < len));
            }
        }
    }

    #[test]
    fn loads_batches_of_images() {
        let dir = tempfile::tempdir().unwrap();
        write_folder(dir.path());
        let folder = ImageFolder::new(dir.path(), Preprocess::new(20, 16)).unwrap();
        let dataset = Arc::new(RepeatDataset::new(folder, 4));

        let device = Default::default();
        let mut loader = BatchLoader::<TestBackend>::new(dataset, 5, 2, 42, 0, &device);
        assert_eq!(loader.batches_per_epoch(), 2);

        for _ in 0..3 {
            let batch = loader.next_batch().unwrap();
            assert_eq!(batch.images.dims(), [5, 3, 16, 16]);
            assert_eq!(batch.labels.dims(), [5]);

            let labels = batch.labels.into_data().convert::<i64>().to_vec::<i64>().unwrap();
            assert!(labels.iter().all(|&l| l == 0 || l == 1));
        }
    }

    fn epoch_order(order: &BatchOrder, epoch: usize) -> Vec<usize> {
        let first = epoch * order.batches_per_epoch();
        (first..first + order.batches_per_epoch())
            .flat_map(|batch| order.indices(batch))
            .collect()
    }

    #[test]
    fn any_seed_gives_valid_batches() {
        for seed in [0, 42, u64::MAX, 0x9E37_79B9_7F4A_7C15] {
            let order = BatchOrder::new(10, 3, seed);
            for batch in 0..20 {
                let indices = order.indices(batch);
                assert_eq!(indices.len(), 3);
                assert!(indices.iter().all(|&i| i < 10));
            }
        }
    }

    #[test]
    fn epochs_do_not_repeat_images() {
        // 12 images in batches of 5 drop a tail of 2 per epoch.
        let order = BatchOrder::new(12, 5, 7);
        assert_eq!(order.batches_per_epoch(), 2);
        for epoch in 0..4 {
            let indices = epoch_order(&order, epoch);
            let unique: HashSet<_> = indices.iter().collect();
            assert_eq!(indices.len(), 10);
            assert_eq!(unique.len(), 10);
        }
    }

    #[test]
    fn later_epochs_are_reshuffled() {
        let order = BatchOrder::new(64, 8, 3);
        assert_ne!(epoch_order(&order, 0), epoch_order(&order, 1));
        assert_eq!(epoch_order(&order, 1), epoch_order(&order, 1));
    }

    #[test]
    fn loader_starts_at_requested_epoch() {
        let dir = tempfile::tempdir().unwrap();
        write_folder(dir.path());
        let folder = ImageFolder::new(dir.path(), Preprocess::new(20, 16)).unwrap();
        let dataset = Arc::new(RepeatDataset::new(folder, 4));

        // Labels of every sample, in the order the loader should visit them.
        let order = BatchOrder::new(dataset.len(), 4, u64::MAX);
        let expected_labels = |batch: usize| -> Vec<i64> {
            order
                .indices(batch)
                .into_iter()
                .map(|i| dataset.get(i).unwrap().label as i64)
                .collect()
        };

        let device = Default::default();
        let mut loader =
            BatchLoader::<TestBackend>::new(dataset.clone(), 4, 2, u64::MAX, 2, &device);
        let first = 2 * loader.batches_per_epoch();
        for batch in first..first + 3 {
            let labels = loader.next_batch().unwrap().labels.into_data();
            let labels = labels.convert::<i64>().to_vec::<i64>().unwrap();
            assert_eq!(labels, expected_labels(batch));
        }
    }
}
