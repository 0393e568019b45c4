//! K-means clustering strategy
//!
//! Centroid-based assignment with Euclidean distance and lowest-id
//! tie-breaking. Centroids are initialized lazily on first use: stored
//! vectors (shuffled) seed as many clusters as they can, and any remaining
//! slots get uniform random centroids in [−1, 1]^D.
//!
//! `rebalance` runs exactly one Lloyd step — reassign every stored vector,
//! then recompute every centroid — and reports whether anything moved. The
//! store calls it repeatedly across maintenance cycles instead of looping to
//! convergence in one sitting.
//!
//! # Model serialization (little-endian)
//!
//! ```text
//! [vector_dim: u32] [max_clusters: u32]
//! [num_vectors: u32]
//! repeated: [vector_id: u32] [cluster_id: u32] [f32 × vector_dim]
//! [num_clusters: u32]
//! repeated: [cluster_id: u32] [record_len: u32] [ClusterInfo record]
//! ```
//!
//! The per-cluster record is the quantized [`ClusterInfo`] codec; exact
//! centroids of non-empty clusters are recomputed from their members on
//! load, so only empty clusters pay the quantization rounding.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::cluster::{ClusterInfo, ClusteringStrategy};
use crate::error::{Result, StoreError};
use crate::simd;

/// Default per-cluster capacity recorded in new cluster records
pub const DEFAULT_CLUSTER_CAPACITY: u32 = 1000;

/// K-means implementation of [`ClusteringStrategy`]
#[derive(Debug)]
pub struct KMeansStrategy {
    vector_dim: u32,
    max_clusters: u32,
    /// Ordered so that equal-distance scans resolve to the lowest id
    centroids: BTreeMap<u32, Vec<f32>>,
    members: HashMap<u32, BTreeSet<u32>>,
    assignments: HashMap<u32, u32>,
    vectors: HashMap<u32, Vec<f32>>,
    /// Capacity / start_offset carriers; centroid and count are refreshed
    /// from the live maps when snapshotting
    info: BTreeMap<u32, ClusterInfo>,
    rng: StdRng,
}

impl KMeansStrategy {
    /// Time-seeded strategy (production path)
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self::with_seed(seed)
    }

    /// Deterministically seeded strategy (tests and reproducible runs)
    pub fn with_seed(seed: u64) -> Self {
        Self {
            vector_dim: 0,
            max_clusters: 0,
            centroids: BTreeMap::new(),
            members: HashMap::new(),
            assignments: HashMap::new(),
            vectors: HashMap::new(),
            info: BTreeMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Seed centroids from stored vectors, topping up with random ones
    fn lazy_init(&mut self) {
        debug!(
            "lazily initializing {} centroids from {} stored vectors (dim {})",
            self.max_clusters,
            self.vectors.len(),
            self.vector_dim
        );

        let mut seed_ids: Vec<u32> = self.vectors.keys().copied().collect();
        seed_ids.sort_unstable();
        seed_ids.shuffle(&mut self.rng);

        for slot in 0..self.max_clusters {
            let centroid = match seed_ids.get(slot as usize) {
                Some(vid) => self.vectors[vid].clone(),
                None => (0..self.vector_dim)
                    .map(|_| self.rng.gen_range(-1.0f32..=1.0))
                    .collect(),
            };
            self.centroids.insert(slot, centroid.clone());
            self.members.insert(slot, BTreeSet::new());
            self.info.insert(
                slot,
                ClusterInfo {
                    cluster_id: slot,
                    centroid,
                    start_offset: 0,
                    vector_count: 0,
                    capacity: DEFAULT_CLUSTER_CAPACITY,
                },
            );
        }
    }

    /// Closest centroid by squared Euclidean distance, ties to lowest id
    fn nearest_centroid(&self, vector: &[f32]) -> Option<u32> {
        let mut best: Option<(u32, f32)> = None;
        for (&cid, centroid) in &self.centroids {
            let dist = simd::l2_distance_squared(vector, centroid);
            match best {
                // Strict less keeps the lowest id on ties (ascending scan)
                Some((_, best_dist)) if dist >= best_dist => {}
                _ => best = Some((cid, dist)),
            }
        }
        best.map(|(cid, _)| cid)
    }

    /// Recompute a centroid as the mean of its members.
    ///
    /// An empty cluster keeps its previous centroid so it can still attract
    /// vectors later.
    fn update_centroid(&mut self, cluster_id: u32) {
        let Some(member_ids) = self.members.get(&cluster_id) else {
            return;
        };
        if member_ids.is_empty() {
            return;
        }

        let mut mean = vec![0.0f32; self.vector_dim as usize];
        for vid in member_ids {
            for (acc, component) in mean.iter_mut().zip(&self.vectors[vid]) {
                *acc += component;
            }
        }
        let count = member_ids.len() as f32;
        for component in &mut mean {
            *component /= count;
        }

        self.centroids.insert(cluster_id, mean);
    }

    /// Cluster record with live centroid and occupancy filled in
    fn snapshot_info(&self, cluster_id: u32) -> ClusterInfo {
        let base = self.info.get(&cluster_id);
        ClusterInfo {
            cluster_id,
            centroid: self.centroids.get(&cluster_id).cloned().unwrap_or_default(),
            start_offset: base.map_or(0, |i| i.start_offset),
            vector_count: self.members.get(&cluster_id).map_or(0, |m| m.len() as u32),
            capacity: base.map_or(DEFAULT_CLUSTER_CAPACITY, |i| i.capacity),
        }
    }
}

impl Default for KMeansStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusteringStrategy for KMeansStrategy {
    fn initialize(&mut self, vector_dim: u32, max_clusters: u32) -> Result<()> {
        if vector_dim == 0 {
            return Err(StoreError::InvalidArgument(
                "vector dimension must be non-zero".into(),
            ));
        }
        if max_clusters == 0 {
            return Err(StoreError::InvalidArgument(
                "max_clusters must be non-zero".into(),
            ));
        }

        self.vector_dim = vector_dim;
        self.max_clusters = max_clusters;
        self.centroids.clear();
        self.members.clear();
        self.assignments.clear();
        self.vectors.clear();
        self.info.clear();
        Ok(())
    }

    fn assign(&mut self, vector: &[f32]) -> u32 {
        if self.centroids.is_empty() {
            self.lazy_init();
        }
        self.nearest_centroid(vector)
            .expect("initialized strategy has at least one centroid")
    }

    fn add(&mut self, vector: &[f32], vector_id: u32) {
        if self.centroids.is_empty() {
            self.lazy_init();
        }

        // Replacing an id first detaches it from its old cluster
        let old_cluster = self.assignments.remove(&vector_id);
        if let Some(old_cid) = old_cluster {
            if let Some(members) = self.members.get_mut(&old_cid) {
                members.remove(&vector_id);
            }
        }

        self.vectors.insert(vector_id, vector.to_vec());

        let cluster_id = self
            .nearest_centroid(vector)
            .expect("initialized strategy has at least one centroid");
        self.assignments.insert(vector_id, cluster_id);
        self.members.entry(cluster_id).or_default().insert(vector_id);

        self.update_centroid(cluster_id);
        if let Some(old_cid) = old_cluster {
            if old_cid != cluster_id {
                self.update_centroid(old_cid);
            }
        }
    }

    fn remove(&mut self, vector_id: u32) -> bool {
        let Some(cluster_id) = self.assignments.remove(&vector_id) else {
            return false;
        };
        if let Some(members) = self.members.get_mut(&cluster_id) {
            members.remove(&vector_id);
        }
        self.vectors.remove(&vector_id);
        self.update_centroid(cluster_id);
        true
    }

    fn closest_clusters(&self, query: &[f32], n: usize) -> Vec<u32> {
        let mut ranked: Vec<(u32, f32)> = self
            .centroids
            .iter()
            .map(|(&cid, centroid)| (cid, simd::l2_distance_squared(query, centroid)))
            .collect();

        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked.into_iter().map(|(cid, _)| cid).collect()
    }

    fn centroid(&self, cluster_id: u32) -> Option<Vec<f32>> {
        self.centroids.get(&cluster_id).cloned()
    }

    fn cluster_size(&self, cluster_id: u32) -> u32 {
        self.members.get(&cluster_id).map_or(0, |m| m.len() as u32)
    }

    fn all_clusters(&self) -> Vec<ClusterInfo> {
        self.centroids
            .keys()
            .map(|&cid| self.snapshot_info(cid))
            .collect()
    }

    fn rebalance(&mut self) -> bool {
        let mut moves: Vec<(u32, u32)> = Vec::new();
        for (&vid, vector) in &self.vectors {
            let new_cid = self
                .nearest_centroid(vector)
                .expect("stored vectors imply initialized centroids");
            if self.assignments.get(&vid) != Some(&new_cid) {
                moves.push((vid, new_cid));
            }
        }

        if moves.is_empty() {
            return false;
        }

        debug!("rebalance moved {} of {} vectors", moves.len(), self.vectors.len());

        for (vid, new_cid) in moves {
            if let Some(old_cid) = self.assignments.insert(vid, new_cid) {
                if let Some(members) = self.members.get_mut(&old_cid) {
                    members.remove(&vid);
                }
            }
            self.members.entry(new_cid).or_default().insert(vid);
        }

        let cluster_ids: Vec<u32> = self.centroids.keys().copied().collect();
        for cid in cluster_ids {
            self.update_centroid(cid);
        }

        true
    }

    fn serialize(&self) -> Vec<u8> {
        let dim = self.vector_dim as usize;
        let mut buf =
            Vec::with_capacity(12 + self.vectors.len() * (8 + dim * 4) + self.centroids.len() * 64);

        buf.extend_from_slice(&self.vector_dim.to_le_bytes());
        buf.extend_from_slice(&self.max_clusters.to_le_bytes());

        buf.extend_from_slice(&(self.vectors.len() as u32).to_le_bytes());
        let mut vector_ids: Vec<u32> = self.vectors.keys().copied().collect();
        vector_ids.sort_unstable();
        for vid in vector_ids {
            buf.extend_from_slice(&vid.to_le_bytes());
            buf.extend_from_slice(&self.assignments.get(&vid).copied().unwrap_or(0).to_le_bytes());
            for component in &self.vectors[&vid] {
                buf.extend_from_slice(&component.to_le_bytes());
            }
        }

        buf.extend_from_slice(&(self.centroids.len() as u32).to_le_bytes());
        for &cid in self.centroids.keys() {
            let record = self.snapshot_info(cid).encode();
            buf.extend_from_slice(&cid.to_le_bytes());
            buf.extend_from_slice(&(record.len() as u32).to_le_bytes());
            buf.extend_from_slice(&record);
        }

        buf
    }

    fn deserialize(&mut self, data: &[u8]) -> Result<()> {
        let mut pos = 0usize;

        self.vector_dim = read_u32(data, &mut pos)?;
        self.max_clusters = read_u32(data, &mut pos)?;
        self.centroids.clear();
        self.members.clear();
        self.assignments.clear();
        self.vectors.clear();
        self.info.clear();

        let dim = self.vector_dim as usize;
        let num_vectors = read_u32(data, &mut pos)? as usize;
        for _ in 0..num_vectors {
            let vid = read_u32(data, &mut pos)?;
            let cid = read_u32(data, &mut pos)?;
            let raw = read_slice(data, &mut pos, dim * 4)?;
            let vector: Vec<f32> = raw
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                .collect();

            self.vectors.insert(vid, vector);
            self.assignments.insert(vid, cid);
            self.members.entry(cid).or_default().insert(vid);
        }

        let num_clusters = read_u32(data, &mut pos)? as usize;
        for _ in 0..num_clusters {
            let cid = read_u32(data, &mut pos)?;
            let record_len = read_u32(data, &mut pos)? as usize;
            let record = read_slice(data, &mut pos, record_len)?;
            let info = ClusterInfo::decode(record)?;

            // Dequantized centroid first; exact mean below where members exist
            self.centroids.insert(cid, info.centroid.clone());
            self.members.entry(cid).or_default();
            self.info.insert(cid, info);
        }

        let cluster_ids: Vec<u32> = self.centroids.keys().copied().collect();
        for cid in cluster_ids {
            self.update_centroid(cid);
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "kmeans"
    }
}

fn read_u32(data: &[u8], pos: &mut usize) -> Result<u32> {
    let raw = read_slice(data, pos, 4)?;
    Ok(u32::from_le_bytes(raw.try_into().unwrap()))
}

fn read_slice<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| {
            StoreError::Format(format!(
                "clustering model truncated: need {} bytes at position {}, have {}",
                len,
                pos,
                data.len()
            ))
        })?;
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-build a serialized model with exact (unquantized-irrelevant) state
    fn model_bytes(
        dim: u32,
        max_clusters: u32,
        vectors: &[(u32, u32, Vec<f32>)],
        centroids: &[(u32, Vec<f32>)],
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&dim.to_le_bytes());
        buf.extend_from_slice(&max_clusters.to_le_bytes());
        buf.extend_from_slice(&(vectors.len() as u32).to_le_bytes());
        for (vid, cid, data) in vectors {
            buf.extend_from_slice(&vid.to_le_bytes());
            buf.extend_from_slice(&cid.to_le_bytes());
            for component in data {
                buf.extend_from_slice(&component.to_le_bytes());
            }
        }
        buf.extend_from_slice(&(centroids.len() as u32).to_le_bytes());
        for (cid, centroid) in centroids {
            let record = ClusterInfo {
                cluster_id: *cid,
                centroid: centroid.clone(),
                start_offset: 0,
                vector_count: 0,
                capacity: DEFAULT_CLUSTER_CAPACITY,
            }
            .encode();
            buf.extend_from_slice(&cid.to_le_bytes());
            buf.extend_from_slice(&(record.len() as u32).to_le_bytes());
            buf.extend_from_slice(&record);
        }
        buf
    }

    fn strategy_with_centroids(dim: u32, centroids: &[(u32, Vec<f32>)]) -> KMeansStrategy {
        let mut strategy = KMeansStrategy::with_seed(42);
        strategy.initialize(dim, centroids.len() as u32).unwrap();
        strategy
            .deserialize(&model_bytes(dim, centroids.len() as u32, &[], centroids))
            .unwrap();
        strategy
    }

    #[test]
    fn test_initialize_rejects_zero_params() {
        let mut strategy = KMeansStrategy::with_seed(1);
        assert!(strategy.initialize(0, 10).is_err());
        assert!(strategy.initialize(4, 0).is_err());
        assert!(strategy.initialize(4, 10).is_ok());
    }

    #[test]
    fn test_lazy_init_seeds_from_stored_vectors() {
        let mut strategy = KMeansStrategy::with_seed(7);
        strategy.initialize(3, 2).unwrap();

        // Plant vectors before any assignment so both slots take seeds
        strategy.vectors.insert(10, vec![1.0, 0.0, 0.0]);
        strategy.vectors.insert(20, vec![0.0, 1.0, 0.0]);

        let _ = strategy.assign(&[1.0, 0.0, 0.0]);

        let mut seeded: Vec<Vec<f32>> = strategy
            .centroids
            .values()
            .cloned()
            .collect();
        seeded.sort_by(|a, b| a[0].total_cmp(&b[0]));
        assert_eq!(seeded, vec![vec![0.0, 1.0, 0.0], vec![1.0, 0.0, 0.0]]);
    }

    #[test]
    fn test_lazy_init_fills_remaining_slots_in_unit_range() {
        let mut strategy = KMeansStrategy::with_seed(99);
        strategy.initialize(4, 8).unwrap();
        let _ = strategy.assign(&[0.0; 4]);

        assert_eq!(strategy.centroids.len(), 8);
        for centroid in strategy.centroids.values() {
            assert_eq!(centroid.len(), 4);
            assert!(centroid.iter().all(|v| (-1.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_assign_ties_break_to_lowest_id() {
        // Two identical centroids: ties must resolve to cluster 0
        let mut strategy =
            strategy_with_centroids(2, &[(0, vec![1.0, 0.0]), (1, vec![1.0, 0.0])]);
        assert_eq!(strategy.assign(&[1.0, 0.0]), 0);
        assert_eq!(strategy.assign(&[5.0, -3.0]), 0);
    }

    #[test]
    fn test_assign_picks_nearest() {
        let mut strategy =
            strategy_with_centroids(2, &[(0, vec![0.0, 0.0]), (1, vec![10.0, 0.0])]);
        assert_eq!(strategy.assign(&[1.0, 0.0]), 0);
        assert_eq!(strategy.assign(&[9.0, 0.0]), 1);
    }

    #[test]
    fn test_add_updates_centroid_to_member_mean() {
        let mut strategy =
            strategy_with_centroids(2, &[(0, vec![0.0, 0.0]), (1, vec![100.0, 100.0])]);

        strategy.add(&[2.0, 0.0], 1);
        strategy.add(&[4.0, 2.0], 2);

        let centroid = strategy.centroid(0).unwrap();
        assert_eq!(centroid, vec![3.0, 1.0]);
        assert_eq!(strategy.cluster_size(0), 2);
        assert_eq!(strategy.cluster_size(1), 0);
    }

    #[test]
    fn test_add_overwrites_existing_id() {
        let mut strategy =
            strategy_with_centroids(2, &[(0, vec![0.0, 0.0]), (1, vec![100.0, 100.0])]);

        strategy.add(&[1.0, 1.0], 7);
        assert_eq!(strategy.cluster_size(0), 1);

        // Same id moves to the other cluster; the old membership must vanish
        strategy.add(&[99.0, 99.0], 7);
        assert_eq!(strategy.cluster_size(0), 0);
        assert_eq!(strategy.cluster_size(1), 1);
    }

    #[test]
    fn test_remove_recomputes_centroid() {
        let mut strategy =
            strategy_with_centroids(2, &[(0, vec![0.0, 0.0]), (1, vec![100.0, 100.0])]);

        strategy.add(&[2.0, 0.0], 1);
        strategy.add(&[4.0, 0.0], 2);
        assert!(strategy.remove(2));

        assert_eq!(strategy.centroid(0).unwrap(), vec![2.0, 0.0]);
        assert!(!strategy.remove(2), "double remove reports missing id");
    }

    #[test]
    fn test_remove_last_member_keeps_centroid() {
        let mut strategy =
            strategy_with_centroids(2, &[(0, vec![0.0, 0.0]), (1, vec![100.0, 100.0])]);

        strategy.add(&[2.0, 2.0], 1);
        let before = strategy.centroid(0).unwrap();
        strategy.remove(1);

        assert_eq!(strategy.centroid(0).unwrap(), before);
    }

    #[test]
    fn test_closest_clusters_sorted_and_truncated() {
        let strategy = strategy_with_centroids(
            1,
            &[(0, vec![0.0]), (1, vec![5.0]), (2, vec![1.0])],
        );

        assert_eq!(strategy.closest_clusters(&[0.4], 3), vec![0, 2, 1]);
        assert_eq!(strategy.closest_clusters(&[0.4], 2), vec![0, 2]);
        assert_eq!(strategy.closest_clusters(&[0.4], 10).len(), 3);
    }

    #[test]
    fn test_rebalance_moves_misassigned_vector() {
        // Vector 5 sits at [1.0] but the model claims it belongs to cluster 1
        let bytes = model_bytes(
            1,
            2,
            &[(5, 1, vec![1.0])],
            &[(0, vec![0.0]), (1, vec![50.0])],
        );
        let mut strategy = KMeansStrategy::with_seed(3);
        strategy.deserialize(&bytes).unwrap();

        // Loading recomputes cluster 1's centroid as the mean of {[1.0]}, so
        // re-pin it away before the step
        strategy.centroids.insert(1, vec![50.0]);

        assert!(strategy.rebalance());
        assert_eq!(strategy.assignments[&5], 0);
        assert_eq!(strategy.centroid(0).unwrap(), vec![1.0]);

        // Second step has nothing left to move
        assert!(!strategy.rebalance());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut strategy =
            strategy_with_centroids(2, &[(0, vec![0.0, 0.0]), (1, vec![10.0, 10.0])]);
        strategy.add(&[1.0, 2.0], 3);
        strategy.add(&[9.0, 11.0], 4);
        strategy.add(&[0.5, 0.25], 8);

        let bytes = strategy.serialize();

        let mut restored = KMeansStrategy::with_seed(0);
        restored.deserialize(&bytes).unwrap();

        assert_eq!(restored.vectors, strategy.vectors);
        assert_eq!(restored.assignments, strategy.assignments);
        // Non-empty clusters recompute exact means from identical members
        assert_eq!(restored.centroid(0), strategy.centroid(0));
        assert_eq!(restored.centroid(1), strategy.centroid(1));
    }

    #[test]
    fn test_deserialize_empty_cluster_centroid_within_quantization() {
        let original = vec![0.123f32, -0.456, 0.789];
        let bytes = model_bytes(3, 1, &[], &[(0, original.clone())]);

        let mut strategy = KMeansStrategy::with_seed(0);
        strategy.deserialize(&bytes).unwrap();

        let restored = strategy.centroid(0).unwrap();
        let scale = 0.789f32 / 32767.0;
        for (orig, back) in original.iter().zip(&restored) {
            assert!((orig - back).abs() <= scale / 2.0 + f32::EPSILON);
        }
    }

    #[test]
    fn test_deserialize_truncated_model_fails() {
        let strategy = strategy_with_centroids(2, &[(0, vec![1.0, 2.0])]);
        let bytes = strategy.serialize();

        let mut fresh = KMeansStrategy::with_seed(0);
        assert!(fresh.deserialize(&bytes[..bytes.len() - 2]).is_err());
        assert!(fresh.deserialize(&bytes[..6]).is_err());
    }

    #[test]
    fn test_all_clusters_reports_live_state() {
        let mut strategy =
            strategy_with_centroids(2, &[(0, vec![0.0, 0.0]), (1, vec![10.0, 10.0])]);
        strategy.add(&[0.5, 0.5], 1);

        let clusters = strategy.all_clusters();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].cluster_id, 0);
        assert_eq!(clusters[0].vector_count, 1);
        assert_eq!(clusters[0].centroid, vec![0.5, 0.5]);
        assert_eq!(clusters[1].vector_count, 0);
    }
}
