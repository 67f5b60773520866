//! Monitoring histograms and their wire payload.
//!
//! A [`HistogramSet`] maps names to fixed-binning [`Histogram`]s with integer bin counts. Merging adds bin
//! counts, so it is commutative and associative and the empty set is its identity: however updates are grouped
//! across a tree of histogram servers, the total at the root is the same.
//!
//! On the wire a set travels as an EVENT with two frames, the source name and the set encoded with MessagePack
//! and compressed with zlib.

use std::{
    collections::{btree_map, BTreeMap},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_compression::{
    tokio::{bufread::ZlibDecoder, write::ZlibEncoder},
    Level,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    error::{CodecError, TransportError},
    message::Message,
};

/// A one-dimensional histogram with uniform bins over `[low, high)` plus underflow and overflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    low: f64,
    high: f64,
    bins: Vec<u64>,
    underflow: u64,
    overflow: u64,
    entries: u64,
}

impl Histogram {
    /// Creates an empty histogram with `bins` uniform bins.
    ///
    /// # Panics
    ///
    /// Panics if `bins` is zero or `low >= high`.
    pub fn new(bins: usize, low: f64, high: f64) -> Self {
        assert!(bins > 0, "a histogram needs at least one bin");
        assert!(low < high, "histogram range must not be empty");
        Histogram {
            low,
            high,
            bins: vec![0; bins],
            underflow: 0,
            overflow: 0,
            entries: 0,
        }
    }

    /// Adds one entry.
    pub fn fill(&mut self, x: f64) {
        self.fill_n(x, 1);
    }

    /// Adds `n` entries at `x`.
    pub fn fill_n(&mut self, x: f64, n: u64) {
        self.entries += n;
        if x < self.low {
            self.underflow += n;
        } else if x >= self.high || x.is_nan() {
            self.overflow += n;
        } else {
            let width = (self.high - self.low) / self.bins.len() as f64;
            let index = (((x - self.low) / width) as usize).min(self.bins.len() - 1);
            self.bins[index] += n;
        }
    }

    /// Bin counts, lowest bin first.
    pub fn bins(&self) -> &[u64] {
        &self.bins
    }

    /// Entries below the range.
    pub fn underflow(&self) -> u64 {
        self.underflow
    }

    /// Entries at or above the upper edge.
    pub fn overflow(&self) -> u64 {
        self.overflow
    }

    /// Total number of entries.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Whether `other` has the same binning.
    pub fn is_compatible(&self, other: &Histogram) -> bool {
        self.bins.len() == other.bins.len() && self.low == other.low && self.high == other.high
    }

    fn add(&mut self, other: &Histogram) {
        for (bin, count) in self.bins.iter_mut().zip(&other.bins) {
            *bin += count;
        }
        self.underflow += other.underflow;
        self.overflow += other.overflow;
        self.entries += other.entries;
    }
}

/// Named histograms from one source or merged from many.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSet {
    histograms: BTreeMap<String, Histogram>,
}

impl HistogramSet {
    /// An empty set.
    pub fn new() -> Self {
        HistogramSet::default()
    }

    /// Adds or replaces a histogram.
    pub fn insert(&mut self, name: impl Into<String>, histogram: Histogram) {
        self.histograms.insert(name.into(), histogram);
    }

    /// Looks up a histogram.
    pub fn get(&self, name: &str) -> Option<&Histogram> {
        self.histograms.get(name)
    }

    /// Looks up a histogram for filling.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Histogram> {
        self.histograms.get_mut(name)
    }

    /// Number of histograms.
    pub fn len(&self) -> usize {
        self.histograms.len()
    }

    /// Whether the set holds no histograms.
    pub fn is_empty(&self) -> bool {
        self.histograms.is_empty()
    }

    /// Iterates in name order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, Histogram> {
        self.histograms.iter()
    }

    /// Adds `other` into `self` bin by bin. Histograms only present in `other` are copied.
    ///
    /// If any shared name has different binning nothing is merged and
    /// [`TransportError::HistogramMismatch`] is returned.
    pub fn merge(&mut self, other: &HistogramSet) -> Result<(), TransportError> {
        for (name, theirs) in &other.histograms {
            if let Some(ours) = self.histograms.get(name) {
                if !ours.is_compatible(theirs) {
                    return Err(TransportError::HistogramMismatch(name.clone()));
                }
            }
        }
        for (name, theirs) in &other.histograms {
            match self.histograms.get_mut(name) {
                Some(ours) => ours.add(theirs),
                None => {
                    self.histograms.insert(name.clone(), theirs.clone());
                }
            }
        }
        Ok(())
    }

    /// Merges every set in `sets` into a new one.
    pub fn merged<'a>(
        sets: impl IntoIterator<Item = &'a HistogramSet>,
    ) -> Result<HistogramSet, TransportError> {
        let mut total = HistogramSet::new();
        for set in sets {
            total.merge(set)?;
        }
        Ok(total)
    }
}

impl FromIterator<(String, Histogram)> for HistogramSet {
    fn from_iter<T: IntoIterator<Item = (String, Histogram)>>(iter: T) -> Self {
        HistogramSet {
            histograms: iter.into_iter().collect(),
        }
    }
}

/// Encodes a set as MessagePack compressed with zlib at `level` (0 stores, 9 compresses hardest).
pub async fn encode_set(set: &HistogramSet, level: u32) -> Result<Bytes, CodecError> {
    let packed = rmp_serde::to_vec_named(set).map_err(|err| CodecError::Encode(err.to_string()))?;
    let mut encoder = ZlibEncoder::with_quality(
        Vec::with_capacity(packed.len() / 2 + 16),
        Level::Precise(level.min(9) as i32),
    );
    encoder.write_all(&packed).await?;
    encoder.shutdown().await?;
    Ok(Bytes::from(encoder.into_inner()))
}

/// Decodes a set produced by [`encode_set`].
///
/// At most `limit` bytes are inflated. A payload that would decompress to more is rejected.
pub async fn decode_set(blob: &[u8], limit: usize) -> Result<HistogramSet, CodecError> {
    let mut decoder = ZlibDecoder::new(blob).take(limit as u64 + 1);
    let mut packed = Vec::new();
    decoder
        .read_to_end(&mut packed)
        .await
        .map_err(|err| CodecError::Decode(err.to_string()))?;
    if packed.len() > limit {
        return Err(CodecError::Decode(format!(
            "histogram payload inflates beyond {limit} bytes"
        )));
    }
    rmp_serde::from_slice(&packed).map_err(|err| CodecError::Decode(err.to_string()))
}

/// Builds the EVENT carrying `set` from `source`.
pub async fn encode_message(
    source: &str,
    set: &HistogramSet,
    level: u32,
) -> Result<Message, CodecError> {
    let blob = encode_set(set, level).await?;
    Ok(Message::event(vec![
        Bytes::copy_from_slice(source.as_bytes()),
        blob,
    ]))
}

/// Splits a histogram EVENT into its source name and set, inflating at most `limit` bytes.
pub async fn decode_message(
    message: &Message,
    limit: usize,
) -> Result<(String, HistogramSet), CodecError> {
    let frames = message.frames();
    let source = frames.first().ok_or(CodecError::MissingFrame("source"))?;
    let blob = frames.get(1).ok_or(CodecError::MissingFrame("histograms"))?;
    let source = std::str::from_utf8(source)
        .map_err(|err| CodecError::Decode(format!("source name: {err}")))?
        .to_string();
    Ok((source, decode_set(blob, limit).await?))
}

/// Where a terminal histogram server puts its merged set.
pub trait HistogramStore: Send {
    /// Replaces the stored set with `set`.
    fn store(&mut self, set: &HistogramSet) -> Result<(), TransportError>;
}

/// Keeps the merged set as pretty-printed JSON in a file, replaced atomically on every store.
#[derive(Debug)]
pub struct FileHistogramStore {
    path: PathBuf,
}

impl FileHistogramStore {
    /// Stores into `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileHistogramStore { path: path.into() }
    }

    /// Reads back the last stored set.
    pub fn load(&self) -> Result<HistogramSet, TransportError> {
        let contents = std::fs::read(&self.path)?;
        serde_json::from_slice(&contents)
            .map_err(|err| CodecError::Decode(err.to_string()).into())
    }
}

impl HistogramStore for FileHistogramStore {
    fn store(&mut self, set: &HistogramSet) -> Result<(), TransportError> {
        let json =
            serde_json::to_vec_pretty(set).map_err(|err| CodecError::Encode(err.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Keeps every stored set in memory. Clones share the same history.
#[derive(Clone, Debug, Default)]
pub struct MemoryHistogramStore {
    history: Arc<Mutex<Vec<HistogramSet>>>,
}

impl MemoryHistogramStore {
    /// An empty store.
    pub fn new() -> Self {
        MemoryHistogramStore::default()
    }

    /// The most recently stored set.
    pub fn latest(&self) -> Option<HistogramSet> {
        self.lock().last().cloned()
    }

    /// How many times a set was stored.
    pub fn stores(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<HistogramSet>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HistogramStore for MemoryHistogramStore {
    fn store(&mut self, set: &HistogramSet) -> Result<(), TransportError> {
        self.lock().push(set.clone());
        Ok(())
    }
}
