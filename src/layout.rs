//! On-disk layout: store header and fixed region map
//!
//! # Device layout
//!
//! ```text
//! Offset            Size      Description
//! ─────────────────────────────────────────────────────
//! 0                 512 B     StoreHeader
//! 512               50 MiB    cluster map (serialized clustering model)
//! 512 + 50 MiB      10 MiB    vector map (id → cluster, offset, metadata)
//! 512 + 60 MiB      …end      vector data, block-aligned payloads
//! ```
//!
//! # Header (512 bytes, little-endian)
//!
//! ```text
//! Offset   Size   Type      Description
//! ─────────────────────────────────────────────
//! 0x00     8      [u8; 8]   Signature: "VCSTORE1"
//! 0x08     4      u32 LE    Version (1)
//! 0x0C     4      u32 LE    Vector dimension
//! 0x10     4      u32 LE    Max clusters
//! 0x14     4      u32 LE    Vector count
//! 0x18     4      u32 LE    Next vector id
//! 0x1C     8      u64 LE    Cluster map offset
//! 0x24     8      u64 LE    Vector map offset
//! 0x2C     8      u64 LE    Data region offset
//! 0x34     32     [u8; 32]  Strategy name (NUL-padded ASCII)
//! 0x54     432    [u8]      Reserved (zero)
//! ```
//!
//! On load the header's offsets are authoritative; the fixed defaults apply
//! only when formatting a fresh device.

use tracing::warn;

use crate::error::{Result, StoreError};

/// Signature identifying a formatted store: "VCSTORE1"
pub const SIGNATURE: [u8; 8] = *b"VCSTORE1";

/// Current format version
pub const VERSION: u32 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 512;

/// Fixed size of the cluster-map region
pub const CLUSTER_MAP_REGION_SIZE: u64 = 50 * 1024 * 1024;

/// Fixed size of the vector-map region
pub const VECTOR_MAP_REGION_SIZE: u64 = 10 * 1024 * 1024;

/// Bytes reserved for the strategy name field
pub const STRATEGY_NAME_LEN: usize = 32;

/// Parsed store header
#[derive(Debug, Clone, PartialEq)]
pub struct StoreHeader {
    pub version: u32,
    pub vector_dim: u32,
    pub max_clusters: u32,
    pub vector_count: u32,
    pub next_id: u32,
    pub cluster_map_offset: u64,
    pub vector_map_offset: u64,
    pub data_offset: u64,
    pub strategy_name: String,
}

impl StoreHeader {
    /// Parse a header from the first 512 bytes of the device.
    ///
    /// Returns `Ok(None)` when the signature or version does not match: the
    /// device is treated as uninitialized rather than corrupt, so a fresh
    /// store can be formatted over it.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>> {
        if bytes.len() < HEADER_SIZE {
            return Err(StoreError::Format(format!(
                "header too small: {} < {} bytes",
                bytes.len(),
                HEADER_SIZE
            )));
        }

        if bytes[0..8] != SIGNATURE {
            return Ok(None);
        }

        let version = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        if version != VERSION {
            warn!("unsupported store version {version}, treating device as uninitialized");
            return Ok(None);
        }

        let vector_dim = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        let max_clusters = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        let vector_count = u32::from_le_bytes(bytes[20..24].try_into().unwrap());
        let next_id = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
        let cluster_map_offset = u64::from_le_bytes(bytes[28..36].try_into().unwrap());
        let vector_map_offset = u64::from_le_bytes(bytes[36..44].try_into().unwrap());
        let data_offset = u64::from_le_bytes(bytes[44..52].try_into().unwrap());

        let name_field = &bytes[52..52 + STRATEGY_NAME_LEN];
        let name_len = name_field.iter().position(|&b| b == 0).unwrap_or(STRATEGY_NAME_LEN);
        let strategy_name = std::str::from_utf8(&name_field[..name_len])
            .map_err(|_| StoreError::Format("strategy name is not valid ASCII".into()))?
            .to_string();

        Ok(Some(Self {
            version,
            vector_dim,
            max_clusters,
            vector_count,
            next_id,
            cluster_map_offset,
            vector_map_offset,
            data_offset,
            strategy_name,
        }))
    }

    /// Encode to the 512-byte on-disk representation
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&SIGNATURE);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.vector_dim.to_le_bytes());
        buf[16..20].copy_from_slice(&self.max_clusters.to_le_bytes());
        buf[20..24].copy_from_slice(&self.vector_count.to_le_bytes());
        buf[24..28].copy_from_slice(&self.next_id.to_le_bytes());
        buf[28..36].copy_from_slice(&self.cluster_map_offset.to_le_bytes());
        buf[36..44].copy_from_slice(&self.vector_map_offset.to_le_bytes());
        buf[44..52].copy_from_slice(&self.data_offset.to_le_bytes());

        let name = self.strategy_name.as_bytes();
        let n = name.len().min(STRATEGY_NAME_LEN - 1); // always NUL-terminated
        buf[52..52 + n].copy_from_slice(&name[..n]);
        // bytes 52+n..512 stay zero (NUL padding + reserved)
        buf
    }

    /// Check the header's offsets against the device.
    ///
    /// Same checks the external diagnostic tool applies: region ordering,
    /// everything inside the device, and the declared vector payload fitting
    /// the data region.
    pub fn validate(&self, device_size: u64) -> Result<()> {
        if !(0 < self.cluster_map_offset
            && self.cluster_map_offset < self.vector_map_offset
            && self.vector_map_offset < self.data_offset
            && self.data_offset <= device_size)
        {
            return Err(StoreError::Format(format!(
                "region offsets out of order: cluster_map={}, vector_map={}, data={}, device={}",
                self.cluster_map_offset, self.vector_map_offset, self.data_offset, device_size
            )));
        }

        let payload = self.vector_count as u64 * self.vector_dim as u64 * 4;
        if payload > device_size - self.data_offset {
            return Err(StoreError::Format(format!(
                "declared payload of {} bytes exceeds data region of {} bytes",
                payload,
                device_size - self.data_offset
            )));
        }

        Ok(())
    }
}

/// Resolved region boundaries for one open store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub cluster_map_offset: u64,
    pub vector_map_offset: u64,
    pub data_offset: u64,
    pub device_size: u64,
}

impl RegionLayout {
    /// Fixed layout for formatting a fresh device
    pub fn compute(device_size: u64) -> Result<Self> {
        let cluster_map_offset = HEADER_SIZE as u64;
        let vector_map_offset = cluster_map_offset + CLUSTER_MAP_REGION_SIZE;
        let data_offset = vector_map_offset + VECTOR_MAP_REGION_SIZE;

        if data_offset >= device_size {
            return Err(StoreError::Format(format!(
                "device of {device_size} bytes cannot fit the {data_offset}-byte metadata regions"
            )));
        }

        Ok(Self {
            cluster_map_offset,
            vector_map_offset,
            data_offset,
            device_size,
        })
    }

    /// Layout of an existing store, taken from its header
    pub fn from_header(header: &StoreHeader, device_size: u64) -> Result<Self> {
        header.validate(device_size)?;
        Ok(Self {
            cluster_map_offset: header.cluster_map_offset,
            vector_map_offset: header.vector_map_offset,
            data_offset: header.data_offset,
            device_size,
        })
    }

    pub fn cluster_map_size(&self) -> u64 {
        self.vector_map_offset - self.cluster_map_offset
    }

    pub fn vector_map_size(&self) -> u64 {
        self.data_offset - self.vector_map_offset
    }

    pub fn data_size(&self) -> u64 {
        self.device_size - self.data_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> StoreHeader {
        StoreHeader {
            version: VERSION,
            vector_dim: 128,
            max_clusters: 100,
            vector_count: 42,
            next_id: 43,
            cluster_map_offset: 512,
            vector_map_offset: 512 + CLUSTER_MAP_REGION_SIZE,
            data_offset: 512 + CLUSTER_MAP_REGION_SIZE + VECTOR_MAP_REGION_SIZE,
            strategy_name: "kmeans".into(),
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let bytes = header.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..8], b"VCSTORE1");

        let parsed = StoreHeader::decode(&bytes).unwrap().unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_reserved_bytes_are_zero() {
        let bytes = sample_header().encode();
        assert!(bytes[52 + 6..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_bad_signature_is_uninitialized() {
        let mut bytes = sample_header().encode();
        bytes[0] = b'X';
        assert!(StoreHeader::decode(&bytes).unwrap().is_none());

        // All-zero device (fresh file) is also uninitialized
        let zeros = [0u8; HEADER_SIZE];
        assert!(StoreHeader::decode(&zeros).unwrap().is_none());
    }

    #[test]
    fn test_unsupported_version_is_uninitialized() {
        let mut bytes = sample_header().encode();
        bytes[8..12].copy_from_slice(&2u32.to_le_bytes());
        assert!(StoreHeader::decode(&bytes).unwrap().is_none());
    }

    #[test]
    fn test_truncated_header_is_error() {
        let bytes = [0u8; 100];
        assert!(matches!(
            StoreHeader::decode(&bytes),
            Err(StoreError::Format(_))
        ));
    }

    #[test]
    fn test_validate_rejects_disordered_offsets() {
        let mut header = sample_header();
        header.vector_map_offset = header.data_offset + 1;
        assert!(header.validate(u64::MAX).is_err());

        let mut header = sample_header();
        header.data_offset = 1 << 40;
        assert!(header.validate(100 * 1024 * 1024).is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_payload() {
        let mut header = sample_header();
        header.vector_count = u32::MAX;
        assert!(header.validate(100 * 1024 * 1024).is_err());
    }

    #[test]
    fn test_layout_compute() {
        let layout = RegionLayout::compute(100 * 1024 * 1024).unwrap();
        assert_eq!(layout.cluster_map_offset, 512);
        assert_eq!(layout.cluster_map_size(), CLUSTER_MAP_REGION_SIZE);
        assert_eq!(layout.vector_map_size(), VECTOR_MAP_REGION_SIZE);
        assert!(layout.data_size() > 0);
    }

    #[test]
    fn test_layout_compute_rejects_tiny_device() {
        assert!(RegionLayout::compute(1024 * 1024).is_err());
    }

    #[test]
    fn test_long_strategy_name_is_truncated_with_nul() {
        let mut header = sample_header();
        header.strategy_name = "x".repeat(64);
        let bytes = header.encode();
        let parsed = StoreHeader::decode(&bytes).unwrap().unwrap();
        assert_eq!(parsed.strategy_name.len(), STRATEGY_NAME_LEN - 1);
    }
}
