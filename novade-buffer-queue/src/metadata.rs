//! Per-buffer side metadata.
//!
//! Metadata is keyed by [`SequenceNumber`], not by slot position: slot positions are
//! reused for unrelated buffers, sequence numbers never are. An entry is created on the
//! first write for a buffer and dropped when the buffer is retired from the queue.
//!
//! The store itself does not know which buffers exist. The queue checks that a
//! sequence number is bound before it touches the store, so "unknown buffer" is
//! reported there and "known buffer, field never written" is reported here.

use std::collections::{BTreeMap, HashMap};

use bitflags::bitflags;
use novade_buffer_manager::SequenceNumber;
use serde::{Deserialize, Serialize};

use crate::error::{BufferQueueError, Result};

/// How the consumer should fit the buffer into its target area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMode {
    /// Keep showing the previous content.
    Freeze,
    /// Scale the buffer to fill the window.
    #[default]
    ScaleToWindow,
    /// Scale uniformly and crop the overflow.
    ScaleCrop,
    /// Do not scale; crop to the window.
    NoScaleCrop,
}

/// Keys of static HDR metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HdrMetadataKey {
    RedPrimaryX,
    RedPrimaryY,
    GreenPrimaryX,
    GreenPrimaryY,
    BluePrimaryX,
    BluePrimaryY,
    WhitePrimaryX,
    WhitePrimaryY,
    MaxLuminance,
    MinLuminance,
    MaxContentLightLevel,
    MaxFrameAverageLightLevel,
    Hdr10Plus,
    HdrVivid,
}

/// One typed HDR value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HdrMetadata {
    pub key: HdrMetadataKey,
    pub value: f32,
}

impl HdrMetadata {
    pub fn new(key: HdrMetadataKey, value: f32) -> Self {
        Self { key, value }
    }
}

/// Which HDR metadata form, if any, is active for a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HdrMetadataType {
    None,
    /// A list of typed records, see [`MetadataStore::set_metadata`].
    Single,
    /// Opaque byte vectors per key, see [`MetadataStore::set_metadata_set`].
    Set,
}

/// Opaque side-channel descriptor for tunnelled playback.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelHandle {
    pub fd: i32,
    pub reserve: Vec<u32>,
}

impl TunnelHandle {
    pub fn new(fd: i32, reserve: Vec<u32>) -> Self {
        Self { fd, reserve }
    }

    /// A handle needs a non-negative descriptor.
    pub fn is_valid(&self) -> bool {
        self.fd >= 0
    }
}

/// Kind of present timestamp reported by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentTimestampType {
    /// Delay between flush and presentation, stored as-is.
    Delay,
    /// Absolute presentation time; reported relative to the flush timestamp.
    Timestamp,
}

impl PresentTimestampType {
    pub fn as_flag(self) -> PresentTimestampTypes {
        match self {
            PresentTimestampType::Delay => PresentTimestampTypes::DELAY,
            PresentTimestampType::Timestamp => PresentTimestampTypes::TIMESTAMP,
        }
    }
}

bitflags! {
    /// Present timestamp kinds a consumer is able to report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PresentTimestampTypes: u32 {
        const DELAY = 1 << 0;
        const TIMESTAMP = 1 << 1;
    }
}

/// A present timestamp as reported by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PresentTimestamp {
    pub kind: PresentTimestampType,
    pub time: i64,
}

#[derive(Debug, Clone, Default)]
enum HdrPayload {
    #[default]
    None,
    Single(Vec<HdrMetadata>),
    Set(BTreeMap<HdrMetadataKey, Vec<u8>>),
}

#[derive(Debug, Clone, Default)]
struct BufferMetadata {
    scaling_mode: ScalingMode,
    hdr: HdrPayload,
    tunnel_handle: Option<TunnelHandle>,
    present: HashMap<PresentTimestampType, i64>,
}

/// Metadata of all buffers bound to one queue.
#[derive(Debug, Default)]
pub struct MetadataStore {
    entries: HashMap<SequenceNumber, BufferMetadata>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers that currently carry metadata.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `true` if any metadata was written for `sequence`.
    pub fn contains(&self, sequence: SequenceNumber) -> bool {
        self.entries.contains_key(&sequence)
    }

    /// Drops everything stored for a retired buffer.
    pub fn remove(&mut self, sequence: SequenceNumber) {
        if self.entries.remove(&sequence).is_some() {
            tracing::trace!(%sequence, "Dropped buffer metadata");
        }
    }

    pub fn set_scaling_mode(&mut self, sequence: SequenceNumber, mode: ScalingMode) {
        self.entries.entry(sequence).or_default().scaling_mode = mode;
    }

    /// Scaling mode of `sequence`, [`ScalingMode::ScaleToWindow`] until set.
    pub fn scaling_mode(&self, sequence: SequenceNumber) -> ScalingMode {
        self.entries.get(&sequence).map(|m| m.scaling_mode).unwrap_or_default()
    }

    /// Replaces the HDR metadata of `sequence` with a list of typed records.
    ///
    /// Clears any keyed set stored for the buffer.
    ///
    /// # Errors
    /// [`BufferQueueError::InvalidArguments`] if `metadata` is empty.
    pub fn set_metadata(&mut self, sequence: SequenceNumber, metadata: Vec<HdrMetadata>) -> Result<()> {
        if metadata.is_empty() {
            return Err(BufferQueueError::InvalidArguments(format!(
                "empty HDR metadata for buffer {}",
                sequence
            )));
        }
        self.entries.entry(sequence).or_default().hdr = HdrPayload::Single(metadata);
        Ok(())
    }

    /// Typed HDR records of `sequence`.
    ///
    /// # Errors
    /// [`BufferQueueError::MetadataUnset`] if the single-record form is not active.
    pub fn metadata(&self, sequence: SequenceNumber) -> Result<Vec<HdrMetadata>> {
        match self.entries.get(&sequence).map(|m| &m.hdr) {
            Some(HdrPayload::Single(records)) => Ok(records.clone()),
            _ => Err(BufferQueueError::MetadataUnset { sequence, field: "hdr metadata" }),
        }
    }

    /// Stores `value` under `key` in the keyed HDR set of `sequence`.
    ///
    /// Writing to a buffer whose active form is the single-record list discards that
    /// list. Within the set, the last write to a key wins.
    ///
    /// # Errors
    /// [`BufferQueueError::InvalidArguments`] if `value` is empty.
    pub fn set_metadata_set(&mut self, sequence: SequenceNumber, key: HdrMetadataKey, value: Vec<u8>) -> Result<()> {
        if value.is_empty() {
            return Err(BufferQueueError::InvalidArguments(format!(
                "empty HDR metadata set value for buffer {}",
                sequence
            )));
        }
        let entry = self.entries.entry(sequence).or_default();
        match &mut entry.hdr {
            HdrPayload::Set(set) => {
                set.insert(key, value);
            }
            other => {
                *other = HdrPayload::Set(BTreeMap::from([(key, value)]));
            }
        }
        Ok(())
    }

    /// Value stored under `key` in the keyed HDR set of `sequence`.
    ///
    /// # Errors
    /// [`BufferQueueError::MetadataUnset`] if the set form is not active or `key` is
    /// absent from it.
    pub fn metadata_set(&self, sequence: SequenceNumber, key: HdrMetadataKey) -> Result<Vec<u8>> {
        match self.entries.get(&sequence).map(|m| &m.hdr) {
            Some(HdrPayload::Set(set)) => set
                .get(&key)
                .cloned()
                .ok_or(BufferQueueError::MetadataUnset { sequence, field: "hdr metadata set key" }),
            _ => Err(BufferQueueError::MetadataUnset { sequence, field: "hdr metadata set" }),
        }
    }

    pub fn query_metadata_type(&self, sequence: SequenceNumber) -> HdrMetadataType {
        match self.entries.get(&sequence).map(|m| &m.hdr) {
            Some(HdrPayload::Single(_)) => HdrMetadataType::Single,
            Some(HdrPayload::Set(_)) => HdrMetadataType::Set,
            Some(HdrPayload::None) | None => HdrMetadataType::None,
        }
    }

    /// Sets the tunnel handle of `sequence`. A handle can be set only once per buffer.
    ///
    /// # Errors
    /// - [`BufferQueueError::InvalidArguments`] for a handle with a negative descriptor.
    /// - [`BufferQueueError::TunnelHandleAlreadySet`] if the buffer already has one.
    pub fn set_tunnel_handle(&mut self, sequence: SequenceNumber, handle: TunnelHandle) -> Result<()> {
        if !handle.is_valid() {
            return Err(BufferQueueError::InvalidArguments(format!(
                "invalid tunnel handle fd {} for buffer {}",
                handle.fd, sequence
            )));
        }
        let entry = self.entries.entry(sequence).or_default();
        if entry.tunnel_handle.is_some() {
            return Err(BufferQueueError::TunnelHandleAlreadySet(sequence));
        }
        entry.tunnel_handle = Some(handle);
        Ok(())
    }

    pub fn tunnel_handle(&self, sequence: SequenceNumber) -> Result<TunnelHandle> {
        self.entries
            .get(&sequence)
            .and_then(|m| m.tunnel_handle.clone())
            .ok_or(BufferQueueError::MetadataUnset { sequence, field: "tunnel handle" })
    }

    pub fn set_present_timestamp(&mut self, sequence: SequenceNumber, timestamp: PresentTimestamp) {
        self.entries
            .entry(sequence)
            .or_default()
            .present
            .insert(timestamp.kind, timestamp.time);
    }

    /// Raw stored present time of `kind` for `sequence`.
    pub fn present_timestamp(&self, sequence: SequenceNumber, kind: PresentTimestampType) -> Result<i64> {
        self.entries
            .get(&sequence)
            .and_then(|m| m.present.get(&kind).copied())
            .ok_or(BufferQueueError::MetadataUnset { sequence, field: "present timestamp" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use pretty_assertions::assert_eq;

    fn seq(raw: u64) -> SequenceNumber {
        SequenceNumber::new(raw)
    }

    #[test]
    fn test_scaling_mode_defaults_to_scale_to_window() {
        let mut store = MetadataStore::new();
        assert_eq!(store.scaling_mode(seq(1)), ScalingMode::ScaleToWindow);
        store.set_scaling_mode(seq(1), ScalingMode::ScaleCrop);
        assert_eq!(store.scaling_mode(seq(1)), ScalingMode::ScaleCrop);
        assert_eq!(store.scaling_mode(seq(2)), ScalingMode::ScaleToWindow);
    }

    #[test]
    fn test_empty_metadata_rejected() {
        let mut store = MetadataStore::new();
        let err = store.set_metadata(seq(1), Vec::new()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArguments);
        assert_eq!(store.query_metadata_type(seq(1)), HdrMetadataType::None);
        assert!(!store.contains(seq(1)), "A rejected write must not create an entry.");

        let err = store.set_metadata_set(seq(1), HdrMetadataKey::HdrVivid, Vec::new()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArguments);
    }

    #[test]
    fn test_single_and_set_are_mutually_exclusive() {
        let mut store = MetadataStore::new();
        let records = vec![
            HdrMetadata::new(HdrMetadataKey::MaxLuminance, 1000.0),
            HdrMetadata::new(HdrMetadataKey::MinLuminance, 0.05),
        ];

        store.set_metadata(seq(3), records.clone()).unwrap();
        assert_eq!(store.query_metadata_type(seq(3)), HdrMetadataType::Single);
        assert_eq!(store.metadata(seq(3)).unwrap(), records);
        assert_eq!(
            store.metadata_set(seq(3), HdrMetadataKey::Hdr10Plus).unwrap_err().code(),
            ErrorCode::NoEntry
        );

        store.set_metadata_set(seq(3), HdrMetadataKey::Hdr10Plus, vec![1, 2, 3]).unwrap();
        assert_eq!(store.query_metadata_type(seq(3)), HdrMetadataType::Set);
        assert_eq!(store.metadata(seq(3)).unwrap_err().code(), ErrorCode::NoEntry);

        store.set_metadata(seq(3), records).unwrap();
        assert_eq!(store.query_metadata_type(seq(3)), HdrMetadataType::Single);
    }

    #[test]
    fn test_metadata_set_last_writer_wins_per_key() {
        let mut store = MetadataStore::new();
        store.set_metadata_set(seq(4), HdrMetadataKey::Hdr10Plus, vec![1]).unwrap();
        store.set_metadata_set(seq(4), HdrMetadataKey::HdrVivid, vec![2]).unwrap();
        store.set_metadata_set(seq(4), HdrMetadataKey::Hdr10Plus, vec![9, 9]).unwrap();

        assert_eq!(store.metadata_set(seq(4), HdrMetadataKey::Hdr10Plus).unwrap(), vec![9, 9]);
        assert_eq!(store.metadata_set(seq(4), HdrMetadataKey::HdrVivid).unwrap(), vec![2]);
        assert_eq!(
            store.metadata_set(seq(4), HdrMetadataKey::RedPrimaryX).unwrap_err().code(),
            ErrorCode::NoEntry
        );
    }

    #[test]
    fn test_tunnel_handle_is_set_once() {
        let mut store = MetadataStore::new();
        assert_eq!(store.tunnel_handle(seq(5)).unwrap_err().code(), ErrorCode::NoEntry);

        let err = store.set_tunnel_handle(seq(5), TunnelHandle::new(-1, vec![])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArguments);

        store.set_tunnel_handle(seq(5), TunnelHandle::new(10, vec![1, 2])).unwrap();
        let err = store.set_tunnel_handle(seq(5), TunnelHandle::new(11, vec![])).unwrap_err();
        assert!(matches!(err, BufferQueueError::TunnelHandleAlreadySet(s) if s == seq(5)));
        assert_eq!(err.code(), ErrorCode::NoEntry);
        assert_eq!(store.tunnel_handle(seq(5)).unwrap(), TunnelHandle::new(10, vec![1, 2]));
    }

    #[test]
    fn test_present_timestamps_per_type() {
        let mut store = MetadataStore::new();
        store.set_present_timestamp(seq(6), PresentTimestamp { kind: PresentTimestampType::Delay, time: 16 });
        assert_eq!(store.present_timestamp(seq(6), PresentTimestampType::Delay).unwrap(), 16);
        assert_eq!(
            store.present_timestamp(seq(6), PresentTimestampType::Timestamp).unwrap_err().code(),
            ErrorCode::NoEntry
        );
        assert_eq!(PresentTimestampType::Timestamp.as_flag(), PresentTimestampTypes::TIMESTAMP);
    }

    #[test]
    fn test_remove_drops_everything() {
        let mut store = MetadataStore::new();
        store.set_scaling_mode(seq(7), ScalingMode::Freeze);
        store.set_tunnel_handle(seq(7), TunnelHandle::new(3, vec![])).unwrap();
        assert_eq!(store.len(), 1);

        store.remove(seq(7));
        assert!(store.is_empty());
        assert_eq!(store.scaling_mode(seq(7)), ScalingMode::ScaleToWindow);
        assert!(store.tunnel_handle(seq(7)).is_err());
    }
}
