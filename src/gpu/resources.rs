//! Device-side scratch buffers shared by every scan dispatch.

use bytemuck::{Pod, Zeroable};

use crate::geometry::{self, MAX_LEVELS};
use crate::{ScanError, ScanResult};

/// Per-level record written by the planner kernel and read by the scan
/// kernels. Field order matches the `LevelInfo` struct in `scan.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct LevelInfo {
    /// Number of live elements at this level.
    pub count: u32,
    /// Element offset of this level's input (0 for level 0, which reads the
    /// caller's buffer; the sub-array start in `prefix_b` otherwise).
    pub input_offset: u32,
    /// Element offset of this level's sub-array in `prefix_a`.
    pub output_offset: u32,
    /// Element offset of the next level's sub-array, where group totals are
    /// staged during the up-sweep and parents are read during the down-sweep.
    pub parent_offset: u32,
}

/// One indirect dispatch slot per level: 3 u32s, 12 bytes.
const INDIRECT_ARGS_STRIDE: u64 = 12;

/// Byte offset of a level's slot in the indirect-args table.
///
/// The planner kernel writes slots with the same stride; keep this as the
/// only place the slot arithmetic lives.
pub fn indirect_args_offset(level: u32) -> u64 {
    u64::from(level) * INDIRECT_ARGS_STRIDE
}

/// Borrowed view of the five live buffers, handed to the recording code.
pub(crate) struct LiveBuffers<'a> {
    pub prefix_a: &'a wgpu::Buffer,
    pub prefix_b: &'a wgpu::Buffer,
    pub level_count: &'a wgpu::Buffer,
    pub level_offsets: &'a wgpu::Buffer,
    pub indirect_args: &'a wgpu::Buffer,
}

/// Scratch buffers for the hierarchical scan.
///
/// Owns five device buffers sized for a maximum element count; the sixth
/// buffer involved in a scan — the input — stays with the caller and is only
/// borrowed while recording. Capacity grows monotonically: resizing to a
/// count that already fits keeps the existing allocation, so the buffers can
/// be reused across frames without churn.
///
/// Every buffer field is independently optional so that disposal is
/// idempotent and a partially-built value is still safe to drop.
#[derive(Default)]
pub struct SupportResources {
    prefix_a: Option<wgpu::Buffer>,
    prefix_b: Option<wgpu::Buffer>,
    level_count: Option<wgpu::Buffer>,
    level_offsets: Option<wgpu::Buffer>,
    indirect_args: Option<wgpu::Buffer>,
    aligned_element_count: u32,
    buffer_len: u32,
    max_level_count: u32,
}

impl SupportResources {
    /// Allocates resources able to scan up to `n_max` elements.
    pub fn new(device: &wgpu::Device, n_max: u32) -> ScanResult<Self> {
        let mut resources = Self::default();
        resources.resize(device, n_max)?;
        Ok(resources)
    }

    /// Ensures capacity for `n_max` elements.
    ///
    /// A no-op when the current allocation already covers `max(n_max, 1)`.
    /// Otherwise all buffers are released before the larger set is created.
    /// Fails with [`ScanError::CapacityExceeded`] when the packed prefix
    /// buffer would exceed the device's storage-binding limit, leaving the
    /// resources disposed.
    pub fn resize(&mut self, device: &wgpu::Device, n_max: u32) -> ScanResult<()> {
        let needed = n_max.max(1);
        if self.prefix_a.is_some() && self.aligned_element_count >= needed {
            return Ok(());
        }

        self.dispose();

        let plan = geometry::plan(n_max);
        let prefix_bytes = plan.buffer_len * 4;
        if prefix_bytes > u64::from(device.limits().max_storage_buffer_binding_size) {
            return Err(ScanError::CapacityExceeded);
        }
        debug_assert!(plan.level_count <= MAX_LEVELS);

        let raw = |label, size| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        };

        self.prefix_a = Some(raw("scan_prefix_a", prefix_bytes));
        self.prefix_b = Some(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("scan_prefix_b"),
            size: prefix_bytes,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        }));
        self.level_count = Some(raw("scan_level_count", 4));
        self.level_offsets = Some(raw(
            "scan_level_offsets",
            u64::from(plan.level_count) * std::mem::size_of::<LevelInfo>() as u64,
        ));
        self.indirect_args = Some(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("scan_indirect_args"),
            size: indirect_args_offset(plan.level_count),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::INDIRECT,
            mapped_at_creation: false,
        }));

        self.aligned_element_count = geometry::align_up_group(needed);
        self.buffer_len = plan.buffer_len as u32;
        self.max_level_count = plan.level_count;
        Ok(())
    }

    /// Releases every buffer. Safe to call repeatedly or on a
    /// partially-constructed value.
    pub fn dispose(&mut self) {
        self.prefix_a = None;
        self.prefix_b = None;
        self.level_count = None;
        self.level_offsets = None;
        self.indirect_args = None;
        self.aligned_element_count = 0;
        self.buffer_len = 0;
        self.max_level_count = 0;
    }

    /// Capacity in elements, rounded up to a whole number of groups.
    pub fn aligned_element_count(&self) -> u32 {
        self.aligned_element_count
    }

    /// Total length of the packed prefix buffers, in elements.
    pub fn buffer_len(&self) -> u32 {
        self.buffer_len
    }

    /// Number of hierarchy levels the allocation covers.
    pub fn max_level_count(&self) -> u32 {
        self.max_level_count
    }

    /// The packed output surface; level 0 holds the scan result.
    /// `None` when disposed.
    pub fn prefix_a(&self) -> Option<&wgpu::Buffer> {
        self.prefix_a.as_ref()
    }

    pub(crate) fn live(&self) -> Option<LiveBuffers<'_>> {
        Some(LiveBuffers {
            prefix_a: self.prefix_a.as_ref()?,
            prefix_b: self.prefix_b.as_ref()?,
            level_count: self.level_count.as_ref()?,
            level_offsets: self.level_offsets.as_ref()?,
            indirect_args: self.indirect_args.as_ref()?,
        })
    }
}
