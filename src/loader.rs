use crate::data::Dataset;
use anyhow::{anyhow, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread;
use tokenizers::{Encoding, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

/// Batches each prefetch worker may run ahead of the training loop.
const PREFETCH_DEPTH: usize = 2;

/// Turns a group of dataset inputs into a model-ready batch.
pub trait Collate<I>: Send + Sync + 'static {
    type Batch: Send + 'static;

    fn collate(&self, inputs: Vec<I>) -> Result<Self::Batch>;
}

/// Moves a collated batch onto the compute device.
pub trait ToDevice: Sized {
    fn to_device(&self, device: &Device) -> candle_core::Result<Self>;
}

impl ToDevice for Tensor {
    fn to_device(&self, device: &Device) -> candle_core::Result<Self> {
        Tensor::to_device(self, device)
    }
}

pub struct Batch<B> {
    pub inputs: B,
    /// `(len,)` f32 targets
    pub targets: Tensor,
    pub len: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub shuffle: bool,
    pub num_workers: usize,
    pub seed: u64,
}

pub struct DataLoader<D, C> {
    dataset: Arc<D>,
    collate: Arc<C>,
    opts: LoaderOptions,
    rng: StdRng,
}

fn make_batch<D, C>(dataset: &D, collate: &C, indices: &[usize]) -> Result<Batch<C::Batch>>
where
    D: Dataset,
    C: Collate<D::Input>,
{
    let mut inputs = Vec::with_capacity(indices.len());
    let mut targets = Vec::with_capacity(indices.len());
    for &idx in indices {
        let (input, target) = dataset.get(idx)?;
        inputs.push(input);
        targets.push(target);
    }
    let len = targets.len();
    Ok(Batch {
        inputs: collate.collate(inputs)?,
        targets: Tensor::from_vec(targets, (len,), &Device::Cpu)?,
        len,
    })
}

impl<D, C> DataLoader<D, C>
where
    D: Dataset,
    C: Collate<D::Input>,
{
    pub fn new(dataset: D, collate: Arc<C>, opts: LoaderOptions) -> Self {
        Self {
            dataset: Arc::new(dataset),
            collate,
            rng: StdRng::seed_from_u64(opts.seed),
            opts: LoaderOptions {
                batch_size: opts.batch_size.max(1),
                ..opts
            },
        }
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.opts.batch_size)
    }

    /// Index groups for one pass; reshuffled on every call when shuffling.
    fn plan(&mut self) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.opts.shuffle {
            order.shuffle(&mut self.rng);
        }
        order
            .chunks(self.opts.batch_size)
            .map(|c| c.to_vec())
            .collect()
    }

    /// One pass over the dataset.
    pub fn epoch(&mut self) -> Batches<C::Batch> {
        let plan = self.plan();
        let remaining = plan.len();
        if self.opts.num_workers == 0 {
            let dataset = self.dataset.clone();
            let collate = self.collate.clone();
            let iter = plan
                .into_iter()
                .map(move |indices| make_batch(&*dataset, &*collate, &indices));
            return Batches {
                inner: Source::Inline(Box::new(iter)),
                remaining,
            };
        }

        // worker w collates batches w, w + n, w + 2n, ...; reading the
        // receivers round-robin restores the planned order
        let workers = self.opts.num_workers.min(remaining.max(1));
        let mut shares: Vec<Vec<Vec<usize>>> = vec![Vec::new(); workers];
        for (i, indices) in plan.into_iter().enumerate() {
            shares[i % workers].push(indices);
        }
        let receivers = shares
            .into_iter()
            .map(|share| {
                let (tx, rx) = sync_channel(PREFETCH_DEPTH);
                let dataset = self.dataset.clone();
                let collate = self.collate.clone();
                thread::spawn(move || {
                    for indices in share {
                        let batch = make_batch(&*dataset, &*collate, &indices);
                        if tx.send(batch).is_err() {
                            // consumer dropped the epoch early
                            break;
                        }
                    }
                });
                rx
            })
            .collect();
        Batches {
            inner: Source::Prefetch { receivers, next: 0 },
            remaining,
        }
    }
}

enum Source<B> {
    Inline(Box<dyn Iterator<Item = Result<Batch<B>>>>),
    Prefetch {
        receivers: Vec<Receiver<Result<Batch<B>>>>,
        next: usize,
    },
}

/// Ordered batch stream for a single epoch.
pub struct Batches<B> {
    inner: Source<B>,
    remaining: usize,
}

impl<B> Iterator for Batches<B> {
    type Item = Result<Batch<B>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match &mut self.inner {
            Source::Inline(iter) => iter.next(),
            Source::Prefetch { receivers, next } => {
                let rx = &receivers[*next % receivers.len()];
                *next += 1;
                match rx.recv() {
                    Ok(batch) => Some(batch),
                    Err(_) => {
                        self.remaining = 0;
                        Some(Err(anyhow!("prefetch worker exited before finishing its batches")))
                    }
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

/// Stacks `(features,)` rows into a `(batch, features)` tensor.
pub struct StackCollate;

impl Collate<Tensor> for StackCollate {
    type Batch = Tensor;

    fn collate(&self, inputs: Vec<Tensor>) -> Result<Tensor> {
        Ok(Tensor::stack(&inputs, 0)?)
    }
}

/// Token tensors for a BERT-style encoder, all `(batch, seq_len)` u32.
pub struct TextBatch {
    pub input_ids: Tensor,
    pub token_type_ids: Tensor,
    pub attention_mask: Tensor,
}

impl ToDevice for TextBatch {
    fn to_device(&self, device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            input_ids: self.input_ids.to_device(device)?,
            token_type_ids: self.token_type_ids.to_device(device)?,
            attention_mask: self.attention_mask.to_device(device)?,
        })
    }
}

fn stack_field(encodings: &[Encoding], field: fn(&Encoding) -> &[u32]) -> Result<Tensor> {
    let rows = encodings
        .iter()
        .map(|enc| Tensor::new(field(enc), &Device::Cpu))
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::stack(&rows, 0)?)
}

/// Tokenizes raw text, padding to the longest sequence in the batch.
pub struct TokenizeCollate {
    tokenizer: Tokenizer,
}

impl TokenizeCollate {
    pub fn new(mut tokenizer: Tokenizer, max_len: usize) -> Result<Self> {
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: max_len,
                ..Default::default()
            }))
            .map_err(anyhow::Error::msg)?;
        Ok(Self { tokenizer })
    }
}

impl Collate<String> for TokenizeCollate {
    type Batch = TextBatch;

    fn collate(&self, inputs: Vec<String>) -> Result<TextBatch> {
        let encodings = self
            .tokenizer
            .encode_batch(inputs, true)
            .map_err(anyhow::Error::msg)?;
        Ok(TextBatch {
            input_ids: stack_field(&encodings, Encoding::get_ids)?,
            token_type_ids: stack_field(&encodings, Encoding::get_type_ids)?,
            attention_mask: stack_field(&encodings, Encoding::get_attention_mask)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{EmbeddingDataset, TextDataset};
    use crate::fixtures::WORD_TOKENIZER;
    use candle_core::DType;

    /// Collates text by length so batches are easy to inspect.
    struct LenCollate;

    impl Collate<String> for LenCollate {
        type Batch = Vec<usize>;

        fn collate(&self, inputs: Vec<String>) -> Result<Vec<usize>> {
            Ok(inputs.iter().map(|s| s.len()).collect())
        }
    }

    fn text_loader(n: usize, opts: LoaderOptions) -> DataLoader<TextDataset, LenCollate> {
        let texts = (0..n).map(|i| "x".repeat(i)).collect();
        let labels = (0..n).map(|i| i as f32).collect();
        let ds = TextDataset::from_parts(texts, labels).unwrap();
        DataLoader::new(ds, Arc::new(LenCollate), opts)
    }

    fn opts(batch_size: usize, shuffle: bool, num_workers: usize) -> LoaderOptions {
        LoaderOptions {
            batch_size,
            shuffle,
            num_workers,
            seed: 421,
        }
    }

    fn order(loader: &mut DataLoader<TextDataset, LenCollate>) -> Vec<usize> {
        loader.epoch().flat_map(|b| b.unwrap().inputs).collect()
    }

    #[test]
    fn last_batch_may_be_smaller() {
        let mut loader = text_loader(10, opts(4, false, 0));
        assert_eq!(loader.num_batches(), 3);
        let sizes: Vec<usize> = loader.epoch().map(|b| b.unwrap().len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn targets_follow_inputs() {
        let mut loader = text_loader(5, opts(5, true, 0));
        let batch = loader.epoch().next().unwrap().unwrap();
        let targets = batch.targets.to_vec1::<f32>().unwrap();
        let lens: Vec<f32> = batch.inputs.iter().map(|&l| l as f32).collect();
        assert_eq!(targets, lens);
    }

    #[test]
    fn unshuffled_order_is_sequential() {
        let mut loader = text_loader(7, opts(3, false, 0));
        assert_eq!(order(&mut loader), (0..7).collect::<Vec<_>>());
        assert_eq!(order(&mut loader), (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn shuffle_is_a_seeded_permutation_per_epoch() {
        let mut a = text_loader(32, opts(5, true, 0));
        let mut b = text_loader(32, opts(5, true, 0));
        let first = order(&mut a);
        assert_eq!(first, order(&mut b));

        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(sorted, (0..32).collect::<Vec<_>>());

        let second = order(&mut a);
        assert_ne!(first, second);
    }

    #[test]
    fn prefetch_preserves_order() {
        let mut inline = text_loader(23, opts(4, true, 0));
        let mut prefetch = text_loader(23, opts(4, true, 3));
        for _ in 0..2 {
            assert_eq!(order(&mut inline), order(&mut prefetch));
        }
    }

    #[test]
    fn dropping_a_prefetching_epoch_early_is_fine() {
        let mut loader = text_loader(50, opts(2, false, 2));
        let first = loader.epoch().next().unwrap().unwrap();
        assert_eq!(first.inputs, vec![0, 1]);
        assert_eq!(order(&mut loader).len(), 50);
    }

    #[test]
    fn stack_collate_builds_a_matrix() {
        let emb = Tensor::arange(0f32, 12., &Device::Cpu)
            .unwrap()
            .reshape((6, 2))
            .unwrap();
        let ds = EmbeddingDataset::from_parts(emb, vec![0.; 6], 2).unwrap();
        let mut loader = DataLoader::new(ds, Arc::new(StackCollate), opts(4, false, 0));
        let batch = loader.epoch().next().unwrap().unwrap();
        assert_eq!(batch.inputs.dims(), &[4, 2]);
        assert_eq!(batch.inputs.dtype(), DType::F32);
        assert_eq!(
            batch.inputs.get(3).unwrap().to_vec1::<f32>().unwrap(),
            vec![6., 7.]
        );
    }

    fn word_collate(max_len: usize) -> TokenizeCollate {
        let tokenizer = Tokenizer::from_bytes(WORD_TOKENIZER.as_bytes()).unwrap();
        TokenizeCollate::new(tokenizer, max_len).unwrap()
    }

    #[test]
    fn tokenize_collate_pads_truncates_and_masks() {
        let batch = word_collate(4)
            .collate(vec![
                "red mug".to_string(),
                "big desk oak big red".to_string(),
                String::new(),
            ])
            .unwrap();
        assert_eq!(batch.input_ids.dims(), &[3, 4]);
        assert_eq!(
            batch.input_ids.to_vec2::<u32>().unwrap(),
            vec![vec![2, 3, 0, 0], vec![6, 5, 4, 6], vec![0, 0, 0, 0]]
        );
        assert_eq!(
            batch.attention_mask.to_vec2::<u32>().unwrap(),
            vec![vec![1, 1, 0, 0], vec![1, 1, 1, 1], vec![0, 0, 0, 0]]
        );
        assert_eq!(
            batch.token_type_ids.to_vec2::<u32>().unwrap(),
            vec![vec![0; 4]; 3]
        );
    }

    #[test]
    fn tokenize_collate_pads_only_to_the_longest_in_batch() {
        let batch = word_collate(16)
            .collate(vec!["blue".to_string(), "small oak chair".to_string()])
            .unwrap();
        assert_eq!(
            batch.input_ids.to_vec2::<u32>().unwrap(),
            vec![vec![7, 0, 0], vec![9, 4, 10]]
        );
        assert_eq!(batch.attention_mask.dims(), &[2, 3]);
    }
}
