//! Vector cluster store orchestrator
//!
//! Owns the device handle, the region layout, the vector-map index, and the
//! clustering strategy, and composes them into the public API: store,
//! retrieve, cluster-routed similarity search, delete, maintenance, and
//! index save/load.
//!
//! # Concurrency
//!
//! One `parking_lot::Mutex` guards the whole store; every public operation
//! holds it for its full duration, so operations are totally ordered. The
//! workload is I/O bound and a finer scheme has not been worth its
//! complexity.
//!
//! # Durability
//!
//! Within an operation, region writes go out in a fixed order: vector data,
//! header, vector map, cluster map. There is no journal — a crash between
//! writes can leave the regions out of step, and persistence failures do not
//! roll back the in-memory state (a later successful persist repairs the
//! device copy).
//!
//! # Space
//!
//! The data region only grows: the allocator hands out block-aligned,
//! monotonically increasing offsets and never reuses freed space. Deleting a
//! vector drops its index row but leaves its payload bytes in place, and
//! re-storing an existing id abandons the old payload at its old offset.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::cluster::{create_strategy, ClusterInfo, ClusteringStrategy};
use crate::device::{align_up, BlockDevice, IoMode};
use crate::error::{Result, StoreError};
use crate::layout::{RegionLayout, StoreHeader, HEADER_SIZE, VERSION};
use crate::simd;
use crate::vmap::{VectorEntry, VectorMap, MAX_METADATA_LEN};

/// Tunables for [`VectorClusterStore::initialize`]
#[derive(Debug, Clone)]
pub struct StoreOptions {
    max_clusters: u32,
    direct_io: bool,
    search_fanout: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_clusters: 100,
            direct_io: false,
            search_fanout: 3,
        }
    }
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cluster budget handed to the strategy (default 100)
    pub fn with_max_clusters(mut self, max_clusters: u32) -> Self {
        self.max_clusters = max_clusters;
        self
    }

    /// Ask for O_DIRECT; the open falls back to buffered I/O when refused
    pub fn with_direct_io(mut self, direct_io: bool) -> Self {
        self.direct_io = direct_io;
        self
    }

    /// How many clusters a similarity query fans out to (default 3)
    pub fn with_search_fanout(mut self, search_fanout: usize) -> Self {
        self.search_fanout = search_fanout;
        self
    }
}

/// Point-in-time store summary
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub path: PathBuf,
    pub device_size: u64,
    pub block_size: u32,
    pub mode: IoMode,
    pub vector_dim: u32,
    pub max_clusters: u32,
    pub vector_count: usize,
    pub next_vector_id: u32,
    pub strategy: &'static str,
    /// (cluster id, member count) for every cluster referenced by the index
    pub cluster_counts: Vec<(u32, usize)>,
}

struct StoreInner {
    device: BlockDevice,
    path: PathBuf,
    layout: RegionLayout,
    vector_dim: u32,
    max_clusters: u32,
    next_vector_id: u32,
    /// Monotonic data-region cursor; per store, never process-global
    alloc_cursor: u64,
    search_fanout: usize,
    vmap: VectorMap,
    strategy: Box<dyn ClusteringStrategy>,
}

/// Durable vector store with cluster-routed approximate search.
///
/// Create one with [`VectorClusterStore::open`], or [`new`](Self::new) +
/// [`initialize`](Self::initialize) when re-targeting a store object between
/// devices. Dropping the store closes the device fd.
pub struct VectorClusterStore {
    inner: Mutex<Option<StoreInner>>,
}

impl std::fmt::Debug for VectorClusterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorClusterStore").finish_non_exhaustive()
    }
}

impl VectorClusterStore {
    /// A closed store; every operation except `initialize` fails until the
    /// device is opened
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Open (or format) the store at `path` in one call
    pub fn open(
        path: impl AsRef<Path>,
        strategy_name: &str,
        vector_dim: u32,
        options: StoreOptions,
    ) -> Result<Self> {
        let store = Self::new();
        store.initialize(path, strategy_name, vector_dim, options)?;
        Ok(store)
    }

    /// Open the device and either load the existing store or format a fresh
    /// one.
    ///
    /// Fails when the path cannot be opened, the strategy name is unknown,
    /// the device cannot fit the metadata regions, or an existing store was
    /// formatted with a different vector dimension. Re-initializing an open
    /// store closes the previous device first.
    pub fn initialize(
        &self,
        path: impl AsRef<Path>,
        strategy_name: &str,
        vector_dim: u32,
        options: StoreOptions,
    ) -> Result<()> {
        let path = path.as_ref();
        let mut guard = self.inner.lock();

        if options.search_fanout == 0 {
            return Err(StoreError::InvalidArgument(
                "search fanout must be non-zero".into(),
            ));
        }

        let mut strategy = create_strategy(strategy_name)?;
        strategy.initialize(vector_dim, options.max_clusters)?;

        // The previous fd (if any) must be closed before the next open
        drop(guard.take());

        let device = BlockDevice::open(path, options.direct_io)?;

        let mut header_block = vec![0u8; HEADER_SIZE];
        device.read_at(&mut header_block, 0)?;

        let inner = match StoreHeader::decode(&header_block)? {
            Some(header) => {
                if header.vector_dim != vector_dim {
                    return Err(StoreError::Format(format!(
                        "store at {} holds {}-dimensional vectors, requested {}",
                        path.display(),
                        header.vector_dim,
                        vector_dim
                    )));
                }
                if header.strategy_name != strategy.name() {
                    warn!(
                        "store was written by strategy \"{}\", opening with \"{}\"",
                        header.strategy_name,
                        strategy.name()
                    );
                }

                let layout = RegionLayout::from_header(&header, device.size())?;
                let mut inner = StoreInner {
                    device,
                    path: path.to_path_buf(),
                    layout,
                    vector_dim,
                    max_clusters: header.max_clusters,
                    next_vector_id: header.next_id,
                    alloc_cursor: layout.data_offset,
                    search_fanout: options.search_fanout,
                    vmap: VectorMap::new(),
                    strategy,
                };
                inner.read_cluster_map()?;
                inner.read_vector_map()?;
                info!(
                    "loaded store at {}: {} vectors, dim {}, next id {}",
                    path.display(),
                    inner.vmap.len(),
                    vector_dim,
                    inner.next_vector_id
                );
                inner
            }
            None => {
                let layout = RegionLayout::compute(device.size())?;
                let mut inner = StoreInner {
                    device,
                    path: path.to_path_buf(),
                    layout,
                    vector_dim,
                    max_clusters: options.max_clusters,
                    next_vector_id: 0,
                    alloc_cursor: layout.data_offset,
                    search_fanout: options.search_fanout,
                    vmap: VectorMap::new(),
                    strategy,
                };
                inner.persist_metadata()?;
                info!(
                    "formatted new store at {}: dim {}, {} max clusters",
                    path.display(),
                    vector_dim,
                    options.max_clusters
                );
                inner
            }
        };

        *guard = Some(inner);
        Ok(())
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut StoreInner) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or(StoreError::Closed)?;
        f(inner)
    }

    /// Whether `initialize` has opened a device
    pub fn is_open(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Persist `vector` under `vector_id` with optional metadata.
    ///
    /// An id that already exists is replaced; the replaced payload's device
    /// bytes are abandoned in place.
    pub fn store_vector(&self, vector_id: u32, vector: &[f32], metadata: &str) -> Result<()> {
        self.with_inner(|inner| {
            if vector.len() != inner.vector_dim as usize {
                return Err(StoreError::InvalidArgument(format!(
                    "vector has {} components, store dimension is {}",
                    vector.len(),
                    inner.vector_dim
                )));
            }
            if metadata.len() > MAX_METADATA_LEN {
                return Err(StoreError::InvalidArgument(format!(
                    "metadata is {} bytes, maximum is {}",
                    metadata.len(),
                    MAX_METADATA_LEN
                )));
            }

            let cluster_id = inner.strategy.assign(vector);
            let offset = inner.allocate(vector.len() as u64 * 4)?;
            inner.device.write_at(bytemuck::cast_slice(vector), offset)?;

            let previous = inner.vmap.insert(VectorEntry {
                vector_id,
                cluster_id,
                offset,
                metadata: metadata.to_string(),
            });
            if let Some(prev) = previous {
                debug!(
                    "vector {} replaced; {} bytes abandoned at offset {}",
                    vector_id,
                    inner.vector_dim as u64 * 4,
                    prev.offset
                );
            }

            inner.strategy.add(vector, vector_id);
            if vector_id >= inner.next_vector_id {
                inner.next_vector_id = vector_id + 1;
            }

            inner.persist_metadata()?;
            debug!("stored vector {vector_id} in cluster {cluster_id} at offset {offset}");
            Ok(())
        })
    }

    /// Read a vector's payload back from the device; `None` when the id is
    /// not indexed
    pub fn retrieve_vector(&self, vector_id: u32) -> Result<Option<Vec<f32>>> {
        self.with_inner(|inner| {
            let Some(entry) = inner.vmap.get(vector_id) else {
                return Ok(None);
            };
            let offset = entry.offset;
            Ok(Some(inner.read_vector(offset)?))
        })
    }

    /// Metadata stored alongside a vector; `None` when the id is not indexed
    pub fn get_metadata(&self, vector_id: u32) -> Result<Option<String>> {
        self.with_inner(|inner| Ok(inner.vmap.get(vector_id).map(|e| e.metadata.clone())))
    }

    /// Approximate nearest neighbors of `query` by cosine similarity.
    ///
    /// Routes to the `search_fanout` closest clusters, scans only their
    /// members, and returns at most `k` results sorted by descending
    /// similarity (ties to the lowest id).
    pub fn find_similar(&self, query: &[f32], k: usize) -> Result<Vec<(u32, f32)>> {
        self.with_inner(|inner| {
            if query.len() != inner.vector_dim as usize {
                return Err(StoreError::InvalidArgument(format!(
                    "query has {} components, store dimension is {}",
                    query.len(),
                    inner.vector_dim
                )));
            }

            let clusters = inner.strategy.closest_clusters(query, inner.search_fanout);

            let mut candidates: Vec<(u32, f32)> = Vec::new();
            for id in inner.vmap.sorted_ids() {
                let entry = inner.vmap.get(id).expect("id from live index");
                if !clusters.contains(&entry.cluster_id) {
                    continue;
                }
                match inner.read_vector(entry.offset) {
                    Ok(vector) => {
                        candidates.push((id, simd::cosine_similarity(query, &vector)));
                    }
                    Err(err) => warn!("search skipping unreadable vector {id}: {err}"),
                }
            }

            debug!(
                "search scanned {} candidates across {} clusters",
                candidates.len(),
                clusters.len()
            );

            candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
            candidates.truncate(k);
            Ok(candidates)
        })
    }

    /// Remove a vector from the index and the clustering model.
    ///
    /// The payload bytes stay on the device; only the index row goes away.
    pub fn delete_vector(&self, vector_id: u32) -> Result<()> {
        self.with_inner(|inner| {
            if inner.vmap.remove(vector_id).is_none() {
                return Err(StoreError::NotFound { vector_id });
            }
            inner.strategy.remove(vector_id);
            inner.persist_metadata()?;
            debug!("deleted vector {vector_id}");
            Ok(())
        })
    }

    /// Rebalance the clustering model and migrate any vectors whose cluster
    /// changed to fresh offsets.
    ///
    /// Individual vectors that cannot be read or re-written are logged and
    /// skipped; the operation only fails when a region write fails.
    pub fn perform_maintenance(&self) -> Result<()> {
        self.with_inner(|inner| {
            info!("running maintenance on {}", inner.path.display());

            if inner.strategy.rebalance() {
                let vector_bytes = inner.vector_dim as u64 * 4;
                let mut moved = 0usize;

                for id in inner.vmap.sorted_ids() {
                    let entry = inner.vmap.get(id).expect("id from live index");
                    let (old_offset, old_cluster) = (entry.offset, entry.cluster_id);

                    let vector = match inner.read_vector(old_offset) {
                        Ok(v) => v,
                        Err(err) => {
                            warn!("maintenance skipping unreadable vector {id}: {err}");
                            continue;
                        }
                    };

                    let new_cluster = inner.strategy.assign(&vector);
                    if new_cluster == old_cluster {
                        continue;
                    }

                    let new_offset = match inner.allocate(vector_bytes) {
                        Ok(o) => o,
                        Err(err) => {
                            warn!("maintenance cannot relocate vector {id}: {err}");
                            continue;
                        }
                    };
                    if let Err(err) = inner
                        .device
                        .write_at(bytemuck::cast_slice(&vector), new_offset)
                    {
                        warn!("maintenance failed to rewrite vector {id}: {err}");
                        continue;
                    }

                    let entry = inner.vmap.get_mut(id).expect("id from live index");
                    entry.cluster_id = new_cluster;
                    entry.offset = new_offset;
                    moved += 1;
                }

                info!("maintenance relocated {moved} vectors");
                inner.write_vector_map()?;
            }

            inner.write_cluster_map()?;
            Ok(())
        })
    }

    /// Write the clustering model to `path` and the vector map to a
    /// `<path>.vmap` sidecar
    pub fn save_index(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.with_inner(|inner| {
            inner.strategy.save(path)?;
            let sidecar = sidecar_path(path);
            std::fs::write(&sidecar, inner.vmap.encode_sidecar()?)?;
            info!(
                "saved index to {} with sidecar {}",
                path.display(),
                sidecar.display()
            );
            Ok(())
        })
    }

    /// Replace the in-memory model and index from files written by
    /// [`save_index`](Self::save_index), then re-persist the device metadata
    /// to match
    pub fn load_index(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.with_inner(|inner| {
            inner.strategy.load(path)?;

            let sidecar = sidecar_path(path);
            let data = std::fs::read(&sidecar)?;
            inner.vmap = VectorMap::decode_sidecar(&data)?;

            if let Some(max_id) = inner.vmap.max_id() {
                if max_id >= inner.next_vector_id {
                    inner.next_vector_id = max_id + 1;
                }
            }
            if let Some(end) = inner.vmap.max_data_end(inner.vector_dim as u64 * 4) {
                inner.alloc_cursor = inner.alloc_cursor.max(end);
            }

            inner.persist_metadata()?;
            info!(
                "loaded index from {}: {} vectors",
                path.display(),
                inner.vmap.len()
            );
            Ok(())
        })
    }

    /// Summary of the open store
    pub fn stats(&self) -> Result<StoreStats> {
        self.with_inner(|inner| {
            let mut counts: std::collections::BTreeMap<u32, usize> = std::collections::BTreeMap::new();
            for entry in inner.vmap.iter() {
                *counts.entry(entry.cluster_id).or_default() += 1;
            }

            Ok(StoreStats {
                path: inner.path.clone(),
                device_size: inner.device.size(),
                block_size: inner.device.block_size(),
                mode: inner.device.mode(),
                vector_dim: inner.vector_dim,
                max_clusters: inner.max_clusters,
                vector_count: inner.vmap.len(),
                next_vector_id: inner.next_vector_id,
                strategy: inner.strategy.name(),
                cluster_counts: counts.into_iter().collect(),
            })
        })
    }

    /// Snapshot of a single cluster from the strategy, if it exists
    pub fn cluster_stats(&self, cluster_id: u32) -> Result<Option<ClusterInfo>> {
        self.with_inner(|inner| {
            Ok(inner
                .strategy
                .all_clusters()
                .into_iter()
                .find(|c| c.cluster_id == cluster_id))
        })
    }
}

impl Default for VectorClusterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreInner {
    /// Next block-aligned data offset; the cursor never moves backwards
    fn allocate(&mut self, len: u64) -> Result<u64> {
        let block = self.device.block_size() as u64;
        let offset = align_up(self.alloc_cursor, block);
        let end = offset + len;
        if end > self.device.size() {
            return Err(StoreError::Capacity {
                offset,
                needed: len,
                device_size: self.device.size(),
            });
        }
        self.alloc_cursor = end;
        Ok(offset)
    }

    fn read_vector(&self, offset: u64) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.vector_dim as usize];
        self.device
            .read_at(bytemuck::cast_slice_mut(&mut vector), offset)?;
        Ok(vector)
    }

    /// Header, vector map, cluster map — in that order
    fn persist_metadata(&mut self) -> Result<()> {
        let result = self
            .write_header()
            .and_then(|_| self.write_vector_map())
            .and_then(|_| self.write_cluster_map());
        if let Err(err) = &result {
            error!("failed to persist store metadata: {err}");
        }
        result
    }

    fn write_header(&mut self) -> Result<()> {
        let header = StoreHeader {
            version: VERSION,
            vector_dim: self.vector_dim,
            max_clusters: self.max_clusters,
            vector_count: self.vmap.len() as u32,
            next_id: self.next_vector_id,
            cluster_map_offset: self.layout.cluster_map_offset,
            vector_map_offset: self.layout.vector_map_offset,
            data_offset: self.layout.data_offset,
            strategy_name: self.strategy.name().to_string(),
        };
        self.device.write_at(&header.encode(), 0)
    }

    fn write_vector_map(&mut self) -> Result<()> {
        let encoded = self.vmap.encode_region()?;
        if encoded.len() as u64 > self.layout.vector_map_size() {
            return Err(StoreError::Format(format!(
                "vector map needs {} bytes, region holds {}",
                encoded.len(),
                self.layout.vector_map_size()
            )));
        }
        self.device.write_at(&encoded, self.layout.vector_map_offset)
    }

    fn read_vector_map(&mut self) -> Result<()> {
        let mut region = vec![0u8; self.layout.vector_map_size() as usize];
        self.device
            .read_at(&mut region, self.layout.vector_map_offset)?;
        self.vmap = VectorMap::decode_region(&region)?;

        if let Some(max_id) = self.vmap.max_id() {
            if max_id >= self.next_vector_id {
                self.next_vector_id = max_id + 1;
            }
        }
        // Resume appending after the furthest persisted payload
        if let Some(end) = self.vmap.max_data_end(self.vector_dim as u64 * 4) {
            self.alloc_cursor = self.alloc_cursor.max(end);
        }

        debug!("read vector map: {} entries", self.vmap.len());
        Ok(())
    }

    fn write_cluster_map(&mut self) -> Result<()> {
        let model = self.strategy.serialize();
        let needed = 4 + model.len() as u64;
        if needed > self.layout.cluster_map_size() {
            return Err(StoreError::Format(format!(
                "cluster map needs {} bytes, region holds {}",
                needed,
                self.layout.cluster_map_size()
            )));
        }

        let mut buf = Vec::with_capacity(needed as usize);
        buf.extend_from_slice(&(model.len() as u32).to_le_bytes());
        buf.extend_from_slice(&model);
        self.device.write_at(&buf, self.layout.cluster_map_offset)
    }

    fn read_cluster_map(&mut self) -> Result<()> {
        let mut len_buf = [0u8; 4];
        self.device
            .read_at(&mut len_buf, self.layout.cluster_map_offset)?;
        let len = u32::from_le_bytes(len_buf) as u64;

        if len == 0 {
            debug!("cluster map is empty (new store)");
            return Ok(());
        }
        let available = self.layout.cluster_map_size().saturating_sub(4);
        if len > available {
            return Err(StoreError::Format(format!(
                "cluster map claims {len} bytes, region holds {available}"
            )));
        }

        let mut model = vec![0u8; len as usize];
        self.device
            .read_at(&mut model, self.layout.cluster_map_offset + 4)?;
        self.strategy.deserialize(&model)?;

        debug!("read cluster map: {len} bytes");
        Ok(())
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".vmap");
    PathBuf::from(os)
}
