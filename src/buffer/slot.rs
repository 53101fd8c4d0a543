//! Buffer slot records
//!
//! A [`BufferSlot`] is the data-only view of one hardware-backed buffer: its
//! planes, batch packing, memory kind and ownership status. Managers hand out
//! copies of these records; the backing memory stays with the manager.

use std::fmt;
use std::os::fd::RawFd;

use serde::{Deserialize, Serialize};

use super::allocator::{Heap, MemoryFlags};

/// Maximum planes per slot: every packed image plane plus the meta plane
pub const MAX_PLANES: usize = 17;

/// Upper bound on slots per manager, mirroring the V4L2 queue depth
pub const VIDEO_MAX_FRAME: usize = 32;

/// Size of the implicit metadata plane appended when requested
pub const META_PLANE_SIZE: usize = 32 * 1024;

/// Where a buffer currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferPosition {
    None,
    InHal,
    InService,
}

/// Who may touch a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferPermission {
    /// Not handed out, memory may be absent
    None,
    /// Sitting in the availability queue
    Available,
    /// Held by exactly one stage
    InProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferStatus {
    pub position: BufferPosition,
    pub permission: BufferPermission,
}

impl Default for BufferStatus {
    fn default() -> Self {
        Self {
            position: BufferPosition::None,
            permission: BufferPermission::None,
        }
    }
}

impl BufferStatus {
    pub fn is_held(&self) -> bool {
        self.permission == BufferPermission::InProcess
    }
}

/// Memory kind of a buffer's image planes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferKind {
    NonCached,
    Cached,
    Reserved,
    CachedReserved,
    CachedSyncForce,
    ReservedSecure,
    CachedReservedSecure,
}

impl BufferKind {
    /// Whether allocations draw from the constrained reserved heap
    pub fn is_reserved(&self) -> bool {
        matches!(
            self,
            Self::Reserved | Self::CachedReserved | Self::ReservedSecure | Self::CachedReservedSecure
        )
    }

    pub fn is_cached(&self) -> bool {
        matches!(
            self,
            Self::Cached | Self::CachedReserved | Self::CachedSyncForce | Self::CachedReservedSecure
        )
    }

    /// Kind used once the reserved heap cannot satisfy a request
    pub fn fallback(&self) -> BufferKind {
        if self.is_cached() {
            Self::Cached
        } else {
            Self::NonCached
        }
    }

    pub fn flags(&self) -> MemoryFlags {
        let heap = match self {
            Self::NonCached | Self::Cached | Self::CachedSyncForce => Heap::System,
            Self::Reserved | Self::CachedReserved => Heap::Reserved,
            Self::ReservedSecure | Self::CachedReservedSecure => Heap::Secure,
        };
        MemoryFlags {
            heap,
            cached: self.is_cached(),
            sync_force: matches!(self, Self::CachedSyncForce),
        }
    }
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NonCached => "non-cached",
            Self::Cached => "cached",
            Self::Reserved => "reserved",
            Self::CachedReserved => "cached-reserved",
            Self::CachedSyncForce => "cached-sync-force",
            Self::ReservedSecure => "reserved-secure",
            Self::CachedReservedSecure => "cached-reserved-secure",
        };
        f.write_str(name)
    }
}

/// One plane of a slot as seen by consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneInfo {
    /// Backing file descriptor, `None` while unbacked
    pub fd: Option<RawFd>,
    /// Mapped address when CPU mapping was requested
    pub addr: Option<usize>,
    pub size: usize,
    pub stride: usize,
}

impl PlaneInfo {
    pub(crate) fn unbacked(size: usize, stride: usize) -> Self {
        Self {
            fd: None,
            addr: None,
            size,
            stride,
        }
    }
}

/// Data-only record of one buffer
///
/// `planes` holds `image_planes * batch_size` image planes followed by the
/// meta plane when one is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSlot {
    pub index: usize,
    pub planes: Vec<PlaneInfo>,
    /// Planes per packed image, meta plane included
    pub plane_count: usize,
    pub batch_size: usize,
    pub kind: BufferKind,
    pub status: BufferStatus,
    /// Container fds aliasing the packed sub-images, one per image plane
    pub containers: Vec<RawFd>,
    pub has_meta_plane: bool,
}

impl BufferSlot {
    pub(crate) fn new(index: usize, kind: BufferKind, batch_size: usize) -> Self {
        Self {
            index,
            planes: Vec::new(),
            plane_count: 0,
            batch_size,
            kind,
            status: BufferStatus::default(),
            containers: Vec::new(),
            has_meta_plane: false,
        }
    }

    /// Image planes of one packed sub-image
    pub fn image_planes(&self, batch: usize) -> &[PlaneInfo] {
        let per_image = self.image_plane_count();
        let start = batch * per_image;
        let end = (start + per_image).min(self.image_plane_end());
        if start >= end {
            return &[];
        }
        &self.planes[start..end]
    }

    pub fn meta_plane(&self) -> Option<&PlaneInfo> {
        if self.has_meta_plane {
            self.planes.last()
        } else {
            None
        }
    }

    pub fn image_plane_count(&self) -> usize {
        if self.has_meta_plane {
            self.plane_count.saturating_sub(1)
        } else {
            self.plane_count
        }
    }

    fn image_plane_end(&self) -> usize {
        if self.has_meta_plane {
            self.planes.len().saturating_sub(1)
        } else {
            self.planes.len()
        }
    }

    /// First plane fd; identifies the buffer to the hardware
    pub fn primary_fd(&self) -> Option<RawFd> {
        self.planes.first().and_then(|p| p.fd)
    }

    pub fn is_backed(&self) -> bool {
        !self.planes.is_empty() && self.planes.iter().all(|p| p.fd.is_some())
    }

    pub fn total_size(&self) -> usize {
        self.planes.iter().map(|p| p.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane(fd: i32, size: usize) -> PlaneInfo {
        PlaneInfo {
            fd: Some(fd),
            addr: None,
            size,
            stride: 64,
        }
    }

    #[test]
    fn test_kind_fallback() {
        assert_eq!(BufferKind::Reserved.fallback(), BufferKind::NonCached);
        assert_eq!(BufferKind::CachedReserved.fallback(), BufferKind::Cached);
        assert_eq!(BufferKind::CachedReservedSecure.fallback(), BufferKind::Cached);
        assert!(!BufferKind::CachedSyncForce.is_reserved());
        assert_eq!(BufferKind::ReservedSecure.flags().heap, Heap::Secure);
        assert!(BufferKind::CachedSyncForce.flags().sync_force);
    }

    #[test]
    fn test_batch_plane_views() {
        let mut slot = BufferSlot::new(0, BufferKind::NonCached, 2);
        slot.plane_count = 3;
        slot.has_meta_plane = true;
        slot.planes = vec![plane(10, 100), plane(11, 50), plane(12, 100), plane(13, 50), plane(14, 8)];

        assert_eq!(slot.image_plane_count(), 2);
        assert_eq!(slot.image_planes(0)[0].fd, Some(10));
        assert_eq!(slot.image_planes(1)[1].fd, Some(13));
        assert!(slot.image_planes(2).is_empty());
        assert_eq!(slot.meta_plane().and_then(|p| p.fd), Some(14));
        assert_eq!(slot.total_size(), 308);
        assert!(slot.is_backed());
    }
}
