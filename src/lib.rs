//! vcstore – Embedded vector storage engine with cluster-routed ANN search
//!
//! Persists fixed-dimension f32 vectors on a raw block device (or a regular
//! file standing in for one) and answers approximate nearest-neighbor queries
//! by routing each query to the most promising clusters and scanning only
//! their members.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │             VectorClusterStore (orchestrator)               │
//! │    store · retrieve · find_similar · delete · maintain      │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  ClusteringStrategy (k-means)│     VectorMap (id → disk)    │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │        StoreHeader + fixed region layout (512 B hdr)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │    BlockDevice (buffered / O_DIRECT aligned pread/pwrite)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All public operations serialize on a per-store mutex; region writes are
//! best-effort (no journal) and deleted vectors leave holes on the device.

pub mod cluster;
pub mod device;
pub mod error;
pub mod kmeans;
pub mod layout;
pub mod simd;
pub mod store;
pub mod vmap;

pub use cluster::{create_strategy, ClusterInfo, ClusteringStrategy};
pub use device::{BlockDevice, IoMode};
pub use error::{Result, StoreError};
pub use kmeans::KMeansStrategy;
pub use layout::StoreHeader;
pub use store::{StoreOptions, StoreStats, VectorClusterStore};
pub use vmap::{VectorEntry, VectorMap};
