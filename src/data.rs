use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use flate2::bufread::GzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Opens `filepath` for reading, transparently decompressing `.gz` files.
fn open_source(filepath: &Path) -> Result<Box<dyn Read>> {
    let file =
        File::open(filepath).with_context(|| format!("cannot open {}", filepath.display()))?;
    let bufreader = BufReader::new(file);
    if filepath.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(GzDecoder::new(bufreader)))
    } else {
        Ok(Box::new(bufreader))
    }
}

fn column_index(headers: &csv::StringRecord, name: &str, filepath: &Path) -> Result<usize> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .with_context(|| format!("{}: no column named {name:?}", filepath.display()))
}

/// Reads the label column of a CSV and, when `text_column` is given, the
/// matching text column. Rows keep their file order.
fn read_columns(
    filepath: &Path,
    text_column: Option<&str>,
    label_column: &str,
) -> Result<(Vec<String>, Vec<f32>)> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(open_source(filepath)?);
    let headers = rdr
        .headers()
        .with_context(|| format!("{}: missing header row", filepath.display()))?
        .clone();
    let label_idx = column_index(&headers, label_column, filepath)?;
    let text_idx = match text_column {
        Some(name) => Some(column_index(&headers, name, filepath)?),
        None => None,
    };

    let mut texts = Vec::new();
    let mut labels = Vec::new();
    for (row, record) in rdr.records().enumerate() {
        // header is line 1
        let line = row + 2;
        let record = record
            .with_context(|| format!("{}: malformed row at line {line}", filepath.display()))?;
        let raw = record.get(label_idx).unwrap_or("").trim();
        let label: f32 = raw.parse().with_context(|| {
            format!(
                "{}: line {line}: cannot parse {label_column} value {raw:?}",
                filepath.display()
            )
        })?;
        labels.push(label);
        if let Some(idx) = text_idx {
            texts.push(record.get(idx).unwrap_or("").to_string());
        }
    }
    Ok((texts, labels))
}

/// An indexable collection of `(input, target)` samples.
pub trait Dataset: Send + Sync + 'static {
    type Input: Send + 'static;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, idx: usize) -> Result<(Self::Input, f32)>;
}

fn check_index(idx: usize, len: usize) -> Result<()> {
    if idx >= len {
        bail!("index {idx} out of range for dataset of {len} samples");
    }
    Ok(())
}

/// Raw product text paired with its numeric label.
pub struct TextDataset {
    texts: Vec<String>,
    labels: Vec<f32>,
}

impl TextDataset {
    pub fn from_csv(filepath: &Path, text_column: &str, label_column: &str) -> Result<Self> {
        let (texts, labels) = read_columns(filepath, Some(text_column), label_column)?;
        Self::from_parts(texts, labels)
    }

    pub fn from_parts(texts: Vec<String>, labels: Vec<f32>) -> Result<Self> {
        if texts.len() != labels.len() {
            bail!(
                "text/label row mismatch: {} texts, {} labels",
                texts.len(),
                labels.len()
            );
        }
        Ok(Self { texts, labels })
    }
}

impl Dataset for TextDataset {
    type Input = String;

    fn len(&self) -> usize {
        self.labels.len()
    }

    fn get(&self, idx: usize) -> Result<(String, f32)> {
        check_index(idx, self.len())?;
        Ok((self.texts[idx].clone(), self.labels[idx]))
    }
}

/// Precomputed embedding rows (from a `.npy` array) aligned with labels
/// from a CSV file.
pub struct EmbeddingDataset {
    embeddings: Tensor,
    labels: Vec<f32>,
}

impl EmbeddingDataset {
    pub fn from_files(
        npy_path: &Path,
        csv_path: &Path,
        label_column: &str,
        features: usize,
    ) -> Result<Self> {
        let embeddings = Tensor::read_npy(npy_path)
            .with_context(|| format!("cannot read embeddings from {}", npy_path.display()))?;
        let (_, labels) = read_columns(csv_path, None, label_column)?;
        Self::from_parts(embeddings, labels, features).with_context(|| {
            format!(
                "{} and {} are not aligned",
                npy_path.display(),
                csv_path.display()
            )
        })
    }

    pub fn from_parts(embeddings: Tensor, labels: Vec<f32>, features: usize) -> Result<Self> {
        let (rows, width) = embeddings.dims2()?;
        if rows != labels.len() {
            bail!("embedding/label row mismatch: {rows} embeddings, {} labels", labels.len());
        }
        if width != features {
            bail!("embeddings have {width} features, expected {features}");
        }
        let embeddings = embeddings.to_dtype(DType::F32)?.to_device(&Device::Cpu)?;
        Ok(Self { embeddings, labels })
    }

    pub fn features(&self) -> usize {
        self.embeddings.dim(1).unwrap_or(0)
    }
}

impl Dataset for EmbeddingDataset {
    type Input = Tensor;

    fn len(&self) -> usize {
        self.labels.len()
    }

    fn get(&self, idx: usize) -> Result<(Tensor, f32)> {
        check_index(idx, self.len())?;
        Ok((self.embeddings.get(idx)?, self.labels[idx]))
    }
}
