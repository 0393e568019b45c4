//! Clustering strategy interface
//!
//! The store talks to its clustering model through the [`ClusteringStrategy`]
//! trait: assignment, membership bookkeeping, cluster routing for search,
//! a single-step rebalance, and full model (de)serialization so the model
//! survives in the on-device cluster-map region.
//!
//! [`ClusterInfo`] is the per-cluster record embedded in serialized models.
//! Its centroid is stored 16-bit quantized (a shared scale factor plus `i16`
//! values), trading `scale/2` of absolute precision per component for a 2×
//! size cut on what is by far the largest part of the record.

use std::path::Path;

use crate::error::{Result, StoreError};
use crate::kmeans::KMeansStrategy;

/// Quantization range for centroid components (`i16` positive max)
const QUANT_RANGE: f32 = 32767.0;

/// Per-cluster record: identity, centroid, and occupancy
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterInfo {
    pub cluster_id: u32,
    pub centroid: Vec<f32>,
    /// Reserved for physically-grouped storage; 0 until a layout uses it
    pub start_offset: u64,
    pub vector_count: u32,
    pub capacity: u32,
}

impl ClusterInfo {
    /// Serialize with a 16-bit quantized centroid.
    ///
    /// ```text
    /// [cluster_id: u32] [vector_count: u32] [capacity: u32]
    /// [start_offset: u64] [centroid_dim: u32]
    /// [scale: f32] [quantized: i16 × centroid_dim]
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        let dim = self.centroid.len();
        let mut buf = Vec::with_capacity(28 + dim * 2);

        buf.extend_from_slice(&self.cluster_id.to_le_bytes());
        buf.extend_from_slice(&self.vector_count.to_le_bytes());
        buf.extend_from_slice(&self.capacity.to_le_bytes());
        buf.extend_from_slice(&self.start_offset.to_le_bytes());
        buf.extend_from_slice(&(dim as u32).to_le_bytes());

        let scale = quantization_scale(&self.centroid);
        buf.extend_from_slice(&scale.to_le_bytes());

        for &value in &self.centroid {
            let q = (value / scale).round() as i16;
            buf.extend_from_slice(&q.to_le_bytes());
        }

        buf
    }

    /// Parse a quantized record, dequantizing the centroid
    pub fn decode(data: &[u8]) -> Result<Self> {
        const FIXED: usize = 28; // through the scale field

        if data.len() < FIXED {
            return Err(StoreError::Format(format!(
                "cluster record too small: {} < {FIXED} bytes",
                data.len()
            )));
        }

        let cluster_id = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let vector_count = u32::from_le_bytes(data[4..8].try_into().unwrap());
        let capacity = u32::from_le_bytes(data[8..12].try_into().unwrap());
        let start_offset = u64::from_le_bytes(data[12..20].try_into().unwrap());
        let dim = u32::from_le_bytes(data[20..24].try_into().unwrap()) as usize;
        let scale = f32::from_le_bytes(data[24..28].try_into().unwrap());

        if data.len() < FIXED + dim * 2 {
            return Err(StoreError::Format(format!(
                "cluster {} record truncated: centroid needs {} bytes, have {}",
                cluster_id,
                dim * 2,
                data.len() - FIXED
            )));
        }

        let mut centroid = Vec::with_capacity(dim);
        for i in 0..dim {
            let at = FIXED + i * 2;
            let q = i16::from_le_bytes(data[at..at + 2].try_into().unwrap());
            centroid.push(q as f32 * scale);
        }

        Ok(Self {
            cluster_id,
            centroid,
            start_offset,
            vector_count,
            capacity,
        })
    }

    /// Encoded size for a given dimension
    pub fn encoded_len(dim: usize) -> usize {
        28 + dim * 2
    }
}

/// Scale factor mapping the centroid's largest magnitude onto the i16 range
fn quantization_scale(centroid: &[f32]) -> f32 {
    let max_abs = centroid.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
    if max_abs < 1e-10 {
        1.0
    } else {
        max_abs / QUANT_RANGE
    }
}

/// Behavior the store requires from a clustering model.
///
/// Implementations own their full model state (centroids, memberships, the
/// vectors themselves) and must be able to serialize all of it: the store
/// persists the byte stream verbatim in the cluster-map region and restores
/// it with `deserialize` on reopen.
pub trait ClusteringStrategy: Send + std::fmt::Debug {
    /// Reset the model for `vector_dim`-dimensional vectors
    fn initialize(&mut self, vector_dim: u32, max_clusters: u32) -> Result<()>;

    /// Cluster whose centroid is closest to `vector` (lazily initializing
    /// centroids on first use)
    fn assign(&mut self, vector: &[f32]) -> u32;

    /// Register `vector` under `vector_id`, replacing any previous vector
    /// with that id, and fold it into its cluster's centroid
    fn add(&mut self, vector: &[f32], vector_id: u32);

    /// Forget `vector_id`; returns false when the id was never added
    fn remove(&mut self, vector_id: u32) -> bool;

    /// Up to `n` cluster ids by ascending distance from `query`
    fn closest_clusters(&self, query: &[f32], n: usize) -> Vec<u32>;

    /// Centroid of `cluster_id`, if the cluster exists
    fn centroid(&self, cluster_id: u32) -> Option<Vec<f32>>;

    /// Number of vectors currently assigned to `cluster_id`
    fn cluster_size(&self, cluster_id: u32) -> u32;

    /// Snapshot of every cluster, ascending by id
    fn all_clusters(&self) -> Vec<ClusterInfo>;

    /// One reassignment pass over the stored vectors; true iff any vector
    /// moved to a different cluster
    fn rebalance(&mut self) -> bool;

    /// Full model state as bytes
    fn serialize(&self) -> Vec<u8>;

    /// Replace the model state from bytes produced by `serialize`
    fn deserialize(&mut self, data: &[u8]) -> Result<()>;

    /// Write the serialized model to a file
    fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.serialize())?;
        Ok(())
    }

    /// Load the model from a file written by `save`
    fn load(&mut self, path: &Path) -> Result<()> {
        let data = std::fs::read(path)?;
        self.deserialize(&data)
    }

    /// Registry name of the strategy (stored in the header)
    fn name(&self) -> &'static str;
}

/// Construct a strategy by registry name.
///
/// Unknown names are an error, not a silent default.
pub fn create_strategy(name: &str) -> Result<Box<dyn ClusteringStrategy>> {
    match name {
        "kmeans" => Ok(Box::new(KMeansStrategy::new())),
        other => Err(StoreError::InvalidArgument(format!(
            "unknown clustering strategy \"{other}\""
        ))),
    }
}
