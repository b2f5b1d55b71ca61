use burn::data::dataset::Dataset;

/// Presents `inner` repeated `repeats` times without copying it. Index `i`
/// reads `inner[i % inner.len()]`.
#[derive(Debug, Clone)]
pub struct RepeatDataset<D> {
    inner: D,
    inner_len: usize,
    repeats: usize,
}

impl<D> RepeatDataset<D> {
    pub fn new<I>(inner: D, repeats: usize) -> Self
    where
        D: Dataset<I>,
    {
        let inner_len = inner.len();
        Self {
            inner,
            inner_len,
            repeats,
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn repeats(&self) -> usize {
        self.repeats
    }

    /// Index of the underlying sample served at `index`.
    pub fn source_index(&self, index: usize) -> Option<usize> {
        (index < self.inner_len * self.repeats).then(|| index % self.inner_len)
    }
}

impl<D, I> Dataset<I> for RepeatDataset<D>
where
    D: Dataset<I>,
{
    fn get(&self, index: usize) -> Option<I> {
        self.source_index(index).and_then(|i| self.inner.get(i))
    }

    fn len(&self) -> usize {
        self.inner_len * self.repeats
    }
}
