//! wgpu engine for the hierarchical prefix sum.
//!
//! The engine owns the device, queue, and compiled compute pipelines; the
//! scratch buffers live in a separate [`SupportResources`] value so several
//! resource sets can share one engine. Recording appends to a caller-owned
//! [`wgpu::CommandEncoder`] — nothing runs until the caller submits.
//!
//! # Usage
//!
//! ```rust,no_run
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use upsweep::gpu::{ScanEngine, ScanKind, SupportResources};
//!
//! let mut engine = ScanEngine::new()?;
//! engine.init();
//!
//! let mut resources = SupportResources::new(engine.device(), 1 << 20)?;
//! let sums = engine.prefix_sum(&mut resources, &[1, 2, 3, 4], ScanKind::Inclusive)?;
//! assert_eq!(sums, vec![1, 3, 6, 10]);
//! # Ok(())
//! # }
//! ```

use crate::geometry::MAX_LEVELS;
use crate::{ScanError, ScanResult};

pub mod resources;
mod scan;

pub use self::resources::{indirect_args_offset, LevelInfo, SupportResources};
pub use self::scan::{DirectScan, IndirectScan, ScanKind};


/// Embedded WGSL kernel source: planner, group scan, carry staging, and
/// parent resolution entry points.
const SCAN_KERNEL_SOURCE: &str = include_str!("../../kernels/scan.wgsl");

/// Information about a discovered compute device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Human-readable device name.
    pub name: String,
    /// Device vendor string.
    pub vendor: String,
    /// Whether this is a discrete or integrated GPU device.
    pub is_gpu: bool,
}

/// Probe all available compute devices without creating an engine.
pub fn probe_devices() -> Vec<DeviceInfo> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });

    let adapters = instance.enumerate_adapters(wgpu::Backends::all());
    adapters
        .into_iter()
        .map(|adapter| {
            let info = adapter.get_info();
            DeviceInfo {
                name: info.name.clone(),
                vendor: format!("{:?}", info.vendor),
                is_gpu: matches!(
                    info.device_type,
                    wgpu::DeviceType::DiscreteGpu | wgpu::DeviceType::IntegratedGpu
                ),
            }
        })
        .collect()
}

/// Return the number of available compute devices.
pub fn device_count() -> usize {
    probe_devices().len()
}

/// Compiled pipelines and the layouts needed to bind against them.
///
/// Built by [`ScanEngine::init`], dropped by [`ScanEngine::dispose`].
struct ScanPipelines {
    plan_from_constant: wgpu::ComputePipeline,
    plan_from_buffer: wgpu::ComputePipeline,
    group_scan_inclusive: wgpu::ComputePipeline,
    group_scan_exclusive: wgpu::ComputePipeline,
    next_input: wgpu::ComputePipeline,
    resolve_parent_inclusive: wgpu::ComputePipeline,
    resolve_parent_exclusive: wgpu::ComputePipeline,
    plan_const_bgl: wgpu::BindGroupLayout,
    plan_buffer_bgl: wgpu::BindGroupLayout,
    scan_bgl: wgpu::BindGroupLayout,
    args_bgl: wgpu::BindGroupLayout,
    /// One pre-built args bind group per level index; the level of a scan
    /// kernel is the only per-dispatch scalar, so these never change.
    level_args: Vec<wgpu::BindGroup>,
}

impl ScanPipelines {
    /// Resolve the inclusive/exclusive choice into the pipeline pair used by
    /// the sweep loops.
    fn kind_pair(&self, kind: ScanKind) -> (&wgpu::ComputePipeline, &wgpu::ComputePipeline) {
        match kind {
            ScanKind::Inclusive => (&self.group_scan_inclusive, &self.resolve_parent_inclusive),
            ScanKind::Exclusive => (&self.group_scan_exclusive, &self.resolve_parent_exclusive),
        }
    }
}

/// GPU prefix-sum engine.
///
/// Create one engine per device and reuse it across scans; the compiled
/// kernels and per-level argument tables are shared by every dispatch.
pub struct ScanEngine {
    device: wgpu::Device,
    queue: wgpu::Queue,
    /// Device name for diagnostics.
    device_name: String,
    /// Whether the selected device is a CPU (not GPU).
    is_cpu: bool,
    /// Maximum storage buffer binding size in bytes (device limit).
    max_buffer_size: u32,
    /// Whether profiling is enabled (timestamp queries).
    profiling: bool,
    /// GPU profiler for timestamp queries (None when profiling disabled or
    /// unsupported). Wrapped in Mutex because resolve/end_frame require
    /// `&mut self`, but engine methods take `&self`.
    profiler: Option<std::sync::Mutex<wgpu_profiler::GpuProfiler>>,
    /// Compiled kernels; None before `init()` and after `dispose()`.
    pipelines: Option<ScanPipelines>,
}

impl std::fmt::Debug for ScanEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanEngine")
            .field("device_name", &self.device_name)
            .field("kernels_loaded", &self.pipelines.is_some())
            .finish_non_exhaustive()
    }
}

impl ScanEngine {
    /// Create a new engine, selecting the best available GPU device.
    pub fn new() -> ScanResult<Self> {
        Self::create(true, false)
    }

    /// Create a new engine with explicit GPU preference.
    pub fn with_device_preference(prefer_gpu: bool) -> ScanResult<Self> {
        Self::create(prefer_gpu, false)
    }

    /// Create a new engine with profiling enabled.
    ///
    /// When profiling is on, `TIMESTAMP_QUERY` is requested on the device
    /// and recorded passes are timed via `wgpu-profiler`. Call
    /// [`profiler_end_frame()`](Self::profiler_end_frame) after submitting a
    /// batch of work to collect results, and
    /// [`profiler_write_trace()`](Self::profiler_write_trace) to export a
    /// Chrome trace file.
    pub fn with_profiling(profiling: bool) -> ScanResult<Self> {
        Self::create(true, profiling)
    }

    fn create(prefer_gpu: bool, profiling: bool) -> ScanResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let power_pref = if prefer_gpu {
            wgpu::PowerPreference::HighPerformance
        } else {
            wgpu::PowerPreference::None
        };

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: power_pref,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .map_err(|_| ScanError::Unsupported)?;

        let info = adapter.get_info();
        let device_name = info.name.clone();
        let is_cpu = matches!(info.device_type, wgpu::DeviceType::Cpu);

        // Reject software/CPU adapters (e.g. WARP on Windows) when a real GPU
        // was requested — they're too slow for compute workloads and can hang.
        if prefer_gpu && is_cpu {
            return Err(ScanError::Unsupported);
        }

        // Request TIMESTAMP_QUERY when profiling is desired; fall back if
        // unsupported. profiling stays true regardless -- wall-clock timing
        // takes over in that case.
        let supports_timestamps = adapter.features().contains(wgpu::Features::TIMESTAMP_QUERY);
        let use_timestamps = profiling && supports_timestamps;
        let required_features = if use_timestamps {
            wgpu::Features::TIMESTAMP_QUERY
        } else {
            wgpu::Features::empty()
        };

        // Default limits, not downlevel ones: the sweep kernels bind five
        // storage buffers per stage and every dispatch is indirect, neither
        // of which downlevel devices guarantee.
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("upsweep"),
            required_features,
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
        }))
        .map_err(|_| ScanError::Unsupported)?;

        let max_buffer_size = device.limits().max_storage_buffer_binding_size;

        let profiler = if use_timestamps {
            match wgpu_profiler::GpuProfiler::new(
                &device,
                wgpu_profiler::GpuProfilerSettings::default(),
            ) {
                Ok(p) => Some(std::sync::Mutex::new(p)),
                Err(_) => None,
            }
        } else {
            None
        };

        Ok(ScanEngine {
            device,
            queue,
            device_name,
            is_cpu,
            max_buffer_size,
            profiling,
            profiler,
            pipelines: None,
        })
    }

    /// Wrap an existing device and queue, for embedding the engine into a
    /// larger renderer that manages its own adapter.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let max_buffer_size = device.limits().max_storage_buffer_binding_size;
        ScanEngine {
            device,
            queue,
            device_name: String::from("external device"),
            is_cpu: false,
            max_buffer_size,
            profiling: false,
            profiler: None,
            pipelines: None,
        }
    }

    /// Return the name of the selected compute device.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Check if the selected device is a CPU (not a GPU or accelerator).
    pub fn is_cpu_device(&self) -> bool {
        self.is_cpu
    }

    /// Whether profiling is enabled on this engine.
    pub fn profiling(&self) -> bool {
        self.profiling
    }

    /// The wgpu device backing this engine.
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// The submission queue backing this engine.
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Whether `init()` has compiled the kernels.
    pub fn kernels_loaded(&self) -> bool {
        self.pipelines.is_some()
    }

    /// Conservative upper bound on the element count a single resource set
    /// can reserve on this device.
    ///
    /// Derived from the storage-binding limit minus the carry-level overhead
    /// (a 1/128 geometric tail plus per-level alignment slack).
    pub fn max_scan_elements(&self) -> u32 {
        let budget = (u64::from(self.max_buffer_size) / 4)
            .saturating_sub(u64::from(MAX_LEVELS) * 256);
        ((budget * 127) / 128).min(u64::from(u32::MAX)) as u32
    }

    /// Block the host until all submitted GPU work completes.
    pub(crate) fn poll_wait(&self) {
        let _ = self.device.poll(wgpu::PollType::wait());
    }

    /// Compile the kernel module and build the pipelines.
    ///
    /// Must be called once before recording; repeated calls are no-ops.
    pub fn init(&mut self) {
        if self.pipelines.is_some() {
            return;
        }

        let t0 = std::time::Instant::now();
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("scan"),
                source: wgpu::ShaderSource::Wgsl(SCAN_KERNEL_SOURCE.into()),
            });

        let storage = |binding, read_only| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        // Binding indices follow the declarations in scan.wgsl. The planner
        // layouts expose the level tables; the scan layout exposes the data
        // buffers. Keeping `indirect_args` out of the scan layout lets the
        // sweep pass consume it as an indirect buffer.
        let plan_const_bgl = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("scan_plan_const_bgl"),
                entries: &[storage(3, false), storage(4, false), storage(5, false)],
            });
        let plan_buffer_bgl = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("scan_plan_buffer_bgl"),
                entries: &[
                    storage(3, false),
                    storage(4, false),
                    storage(5, false),
                    storage(6, true),
                ],
            });
        let scan_bgl = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("scan_sweep_bgl"),
                entries: &[
                    storage(0, true),
                    storage(1, false),
                    storage(2, false),
                    storage(3, false),
                    storage(4, false),
                ],
            });
        let args_bgl = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("scan_args_bgl"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });

        let make = |label: &str, entry: &str, bgl: &wgpu::BindGroupLayout| {
            let layout = self
                .device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(label),
                    bind_group_layouts: &[bgl, &args_bgl],
                    push_constant_ranges: &[],
                });
            self.device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(label),
                    layout: Some(&layout),
                    module: &module,
                    entry_point: Some(entry),
                    compilation_options: Default::default(),
                    cache: None,
                })
        };

        let pipelines = ScanPipelines {
            plan_from_constant: make("plan_from_constant", "plan_from_constant", &plan_const_bgl),
            plan_from_buffer: make("plan_from_buffer", "plan_from_buffer", &plan_buffer_bgl),
            group_scan_inclusive: make("group_scan_inclusive", "group_scan_inclusive", &scan_bgl),
            group_scan_exclusive: make("group_scan_exclusive", "group_scan_exclusive", &scan_bgl),
            next_input: make("next_input", "next_input", &scan_bgl),
            resolve_parent_inclusive: make(
                "resolve_parent_inclusive",
                "resolve_parent_inclusive",
                &scan_bgl,
            ),
            resolve_parent_exclusive: make(
                "resolve_parent_exclusive",
                "resolve_parent_exclusive",
                &scan_bgl,
            ),
            level_args: (0..MAX_LEVELS)
                .map(|level| scan::level_args_bind_group(&self.device, &args_bgl, level))
                .collect(),
            plan_const_bgl,
            plan_buffer_bgl,
            scan_bgl,
            args_bgl,
        };
        self.pipelines = Some(pipelines);

        if self.profiling {
            let ms = t0.elapsed().as_secs_f64() * 1000.0;
            eprintln!("[upsweep] compile scan.wgsl: {ms:.3} ms");
        }
    }

    /// Drop the compiled kernels. Recording afterwards fails with
    /// [`ScanError::KernelNotLoaded`]; idempotent.
    pub fn dispose(&mut self) {
        self.pipelines = None;
    }

    fn loaded(&self) -> ScanResult<&ScanPipelines> {
        self.pipelines.as_ref().ok_or(ScanError::KernelNotLoaded)
    }

    // --- Helper: create buffer with data ---

    pub(crate) fn create_buffer_init(
        &self,
        label: &str,
        data: &[u8],
        usage: wgpu::BufferUsages,
    ) -> wgpu::Buffer {
        use wgpu::util::DeviceExt;
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: data,
                usage,
            })
    }

    pub(crate) fn create_buffer(
        &self,
        label: &str,
        size: u64,
        usage: wgpu::BufferUsages,
    ) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        })
    }

    /// Read a buffer back to the CPU.
    pub(crate) fn read_buffer(&self, buffer: &wgpu::Buffer, size: u64) -> Vec<u8> {
        let staging = self.create_buffer(
            "staging",
            size,
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        );

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("read_buffer"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            tx.send(result).unwrap();
        });
        self.poll_wait();
        rx.recv().unwrap().unwrap();

        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        data
    }

    // --- Profiler plumbing ---

    /// Resolve profiler queries into the command encoder.
    /// Call before `encoder.finish()` when manually managing encoders.
    pub fn profiler_resolve(&self, encoder: &mut wgpu::CommandEncoder) {
        if let Some(p) = &self.profiler {
            p.lock().unwrap().resolve_queries(encoder);
        }
    }

    /// End the current profiler frame and collect timing results.
    ///
    /// Call after all GPU work for the frame has been submitted.
    /// Returns `None` if profiling is disabled or no results are ready.
    pub fn profiler_end_frame(&self) -> Option<Vec<wgpu_profiler::GpuTimerQueryResult>> {
        let p = self.profiler.as_ref()?;
        {
            p.lock().unwrap().end_frame().ok()?;
        }
        self.poll_wait();
        p.lock()
            .unwrap()
            .process_finished_frame(self.queue.get_timestamp_period())
    }

    /// Write collected profiler results to a Chrome trace file.
    ///
    /// The resulting JSON file can be viewed at `chrome://tracing` or
    /// <https://ui.perfetto.dev/>.
    pub fn profiler_write_trace(
        path: &std::path::Path,
        results: &[wgpu_profiler::GpuTimerQueryResult],
    ) -> std::io::Result<()> {
        wgpu_profiler::chrometrace::write_chrometrace(path, results)
    }

    pub(crate) fn begin_profiler_query(
        &self,
        label: &str,
        encoder: &mut wgpu::CommandEncoder,
    ) -> Option<wgpu_profiler::GpuProfilerQuery> {
        self.profiler
            .as_ref()
            .map(|p| p.lock().unwrap().begin_pass_query(label, encoder))
    }

    pub(crate) fn end_profiler_query(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        query: Option<wgpu_profiler::GpuProfilerQuery>,
    ) {
        if let (Some(query), Some(p)) = (query, &self.profiler) {
            p.lock().unwrap().end_query(encoder, query);
        }
    }
}
