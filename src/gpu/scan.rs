//! Scan recording: dispatch planning, up-sweep, and down-sweep.

use super::*;

use super::resources::LiveBuffers;

/// Whether position i includes element i in its sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    /// `out[i] = in[0] + ... + in[i]`.
    Inclusive,
    /// `out[0] = 0`, `out[i] = in[0] + ... + in[i-1]`.
    Exclusive,
}

/// A scan whose element count is known on the host.
pub struct DirectScan<'a> {
    pub kind: ScanKind,
    /// Number of elements to scan; must fit the resources' capacity.
    pub count: u32,
    /// Caller-owned buffer of `count` u32 values, `STORAGE` usage.
    pub input: &'a wgpu::Buffer,
}

/// A scan whose element count lives in a device buffer the host has not
/// read. The planner kernel picks the count up on-device, so no round trip
/// is needed between producing the count and scanning.
pub struct IndirectScan<'a> {
    pub kind: ScanKind,
    /// Caller-owned buffer of u32 values, `STORAGE` usage.
    pub input: &'a wgpu::Buffer,
    /// Buffer holding the element count, `STORAGE` usage.
    pub count_buffer: &'a wgpu::Buffer,
    /// Byte offset of the u32 count inside `count_buffer`; 4-aligned.
    pub count_offset: u64,
}

/// The 4-lane scalar-argument vector handed to every kernel as a 16-byte
/// uniform. Lane meaning depends on the entry point; see `scan.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ScalarArgs([u32; 4]);

impl ScalarArgs {
    fn plan_direct(count: u32, max_levels: u32) -> Self {
        Self([count, max_levels, 0, 0])
    }

    fn plan_indirect(capacity: u32, max_levels: u32, count_offset: u32) -> Self {
        Self([capacity, max_levels, count_offset, 0])
    }

    fn level(level: u32) -> Self {
        Self([0, 0, 0, level])
    }
}

/// Builds the immutable per-level args bind group cached at init time.
pub(super) fn level_args_bind_group(
    device: &wgpu::Device,
    args_bgl: &wgpu::BindGroupLayout,
    level: u32,
) -> wgpu::BindGroup {
    use wgpu::util::DeviceExt;
    let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("scan_level_args"),
        contents: bytemuck::bytes_of(&ScalarArgs::level(level)),
        usage: wgpu::BufferUsages::UNIFORM,
    });
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("scan_level_args_bg"),
        layout: args_bgl,
        entries: &[wgpu::BindGroupEntry {
            binding: 0,
            resource: buffer.as_entire_binding(),
        }],
    })
}

impl ScanEngine {
    /// Record a scan whose element count is known on the host.
    ///
    /// Appends a planner dispatch and the sweep dispatches to `encoder`;
    /// once the encoder is submitted, level 0 of `resources.prefix_a()`
    /// holds the first `count` prefix sums. Elements of the packed buffer
    /// past `count` are unspecified. Validation failures leave the encoder
    /// untouched.
    pub fn dispatch_direct(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        resources: &SupportResources,
        req: &DirectScan<'_>,
    ) -> ScanResult<()> {
        let pipelines = self.loaded()?;
        let buffers = resources.live().ok_or(ScanError::InvalidResources)?;
        if !req.input.usage().contains(wgpu::BufferUsages::STORAGE)
            || req.input.size() < u64::from(req.count) * 4
        {
            return Err(ScanError::InvalidInput);
        }
        if req.count > resources.aligned_element_count() {
            return Err(ScanError::CapacityExceeded);
        }

        let args = ScalarArgs::plan_direct(req.count, resources.max_level_count());
        self.record_scan(
            encoder,
            pipelines,
            &buffers,
            req.input,
            req.kind,
            resources.max_level_count(),
            args,
            None,
        );
        Ok(())
    }

    /// Record a scan whose element count lives in `count_buffer`.
    ///
    /// The count is read on-device by the planner and clamped to the
    /// resources' capacity. Everything else matches
    /// [`dispatch_direct()`](Self::dispatch_direct).
    pub fn dispatch_indirect(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        resources: &SupportResources,
        req: &IndirectScan<'_>,
    ) -> ScanResult<()> {
        let pipelines = self.loaded()?;
        let buffers = resources.live().ok_or(ScanError::InvalidResources)?;
        if !req.input.usage().contains(wgpu::BufferUsages::STORAGE) {
            return Err(ScanError::InvalidInput);
        }
        let end = req.count_offset.checked_add(4);
        if !req.count_buffer.usage().contains(wgpu::BufferUsages::STORAGE)
            || req.count_offset % 4 != 0
            || req.count_offset > u64::from(u32::MAX)
            || end.is_none_or(|end| end > req.count_buffer.size())
        {
            return Err(ScanError::InvalidInput);
        }

        let args = ScalarArgs::plan_indirect(
            resources.aligned_element_count(),
            resources.max_level_count(),
            req.count_offset as u32,
        );
        self.record_scan(
            encoder,
            pipelines,
            &buffers,
            req.input,
            req.kind,
            resources.max_level_count(),
            args,
            Some(req.count_buffer),
        );
        Ok(())
    }

    /// Append the planner pass and the sweep pass.
    ///
    /// Two passes, not one: the planner writes `indirect_args` through a
    /// storage binding, and the sweep consumes the same buffer as an
    /// indirect-dispatch source, which may not share a pass with a writable
    /// binding of it.
    #[allow(clippy::too_many_arguments)]
    fn record_scan(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        pipelines: &ScanPipelines,
        buffers: &LiveBuffers<'_>,
        input: &wgpu::Buffer,
        kind: ScanKind,
        levels: u32,
        plan_args: ScalarArgs,
        count_buffer: Option<&wgpu::Buffer>,
    ) {
        let args_buf = self.create_buffer_init(
            "scan_plan_args",
            bytemuck::bytes_of(&plan_args),
            wgpu::BufferUsages::UNIFORM,
        );
        let args_bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("scan_plan_args_bg"),
            layout: &pipelines.args_bgl,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: args_buf.as_entire_binding(),
            }],
        });

        let mut plan_entries = vec![
            wgpu::BindGroupEntry {
                binding: 3,
                resource: buffers.level_offsets.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 4,
                resource: buffers.level_count.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 5,
                resource: buffers.indirect_args.as_entire_binding(),
            },
        ];
        let (plan_pipeline, plan_layout) = match count_buffer {
            None => (&pipelines.plan_from_constant, &pipelines.plan_const_bgl),
            Some(count) => {
                plan_entries.push(wgpu::BindGroupEntry {
                    binding: 6,
                    resource: count.as_entire_binding(),
                });
                (&pipelines.plan_from_buffer, &pipelines.plan_buffer_bgl)
            }
        };
        let plan_bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("scan_plan_bg"),
            layout: plan_layout,
            entries: &plan_entries,
        });

        let sweep_bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("scan_sweep_bg"),
            layout: &pipelines.scan_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: input.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: buffers.prefix_a.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: buffers.prefix_b.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: buffers.level_offsets.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: buffers.level_count.as_entire_binding(),
                },
            ],
        });

        // Pass 1: one planner thread fills the level table, the active level
        // count, and every indirect dispatch slot.
        let query = self.begin_profiler_query("scan_plan", encoder);
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("scan_plan"),
                timestamp_writes: query.as_ref().and_then(|q| q.compute_pass_timestamp_writes()),
            });
            pass.set_pipeline(plan_pipeline);
            pass.set_bind_group(0, &plan_bg, &[]);
            pass.set_bind_group(1, &args_bg, &[]);
            pass.dispatch_workgroups(1, 1, 1);
        }
        self.end_profiler_query(encoder, query);

        // Pass 2: every sweep dispatch is indirect, so levels the planner
        // marked empty cost a zero-workgroup no-op and nothing else.
        let query = self.begin_profiler_query("scan_sweep", encoder);
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("scan_sweep"),
                timestamp_writes: query.as_ref().and_then(|q| q.compute_pass_timestamp_writes()),
            });
            let (group_scan, resolve_parent) = pipelines.kind_pair(kind);
            pass.set_bind_group(0, &sweep_bg, &[]);

            for level in 0..levels {
                pass.set_pipeline(group_scan);
                pass.set_bind_group(1, &pipelines.level_args[level as usize], &[]);
                pass.dispatch_workgroups_indirect(
                    buffers.indirect_args,
                    indirect_args_offset(level),
                );
                if level + 1 < levels {
                    pass.set_pipeline(&pipelines.next_input);
                    pass.set_bind_group(1, &pipelines.level_args[(level + 1) as usize], &[]);
                    pass.dispatch_workgroups_indirect(
                        buffers.indirect_args,
                        indirect_args_offset(level + 1),
                    );
                }
            }

            for level in (1..levels).rev() {
                pass.set_pipeline(resolve_parent);
                pass.set_bind_group(1, &pipelines.level_args[(level - 1) as usize], &[]);
                pass.dispatch_workgroups_indirect(
                    buffers.indirect_args,
                    indirect_args_offset(level - 1),
                );
            }
        }
        self.end_profiler_query(encoder, query);
    }

    /// One-shot scan of a host slice: upload, record, submit, read back.
    ///
    /// Grows `resources` as needed and reuses them across calls. Intended
    /// for host-resident data and tests; pipelines feeding device-resident
    /// data should record through
    /// [`dispatch_direct()`](Self::dispatch_direct) /
    /// [`dispatch_indirect()`](Self::dispatch_indirect) instead and skip the
    /// round trip.
    pub fn prefix_sum(
        &self,
        resources: &mut SupportResources,
        values: &[u32],
        kind: ScanKind,
    ) -> ScanResult<Vec<u32>> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        if values.len() > u32::MAX as usize {
            return Err(ScanError::CapacityExceeded);
        }
        let count = values.len() as u32;
        resources.resize(&self.device, count)?;

        let input = self.create_buffer_init(
            "scan_input",
            bytemuck::cast_slice(values),
            wgpu::BufferUsages::STORAGE,
        );
        let out_bytes = u64::from(count) * 4;
        let staging = self.create_buffer(
            "scan_staging",
            out_bytes,
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        );

        let t0 = if self.profiling {
            Some(std::time::Instant::now())
        } else {
            None
        };
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("prefix_sum"),
            });
        self.dispatch_direct(
            &mut encoder,
            resources,
            &DirectScan {
                kind,
                count,
                input: &input,
            },
        )?;
        let prefix_a = resources.prefix_a().ok_or(ScanError::InvalidResources)?;
        encoder.copy_buffer_to_buffer(prefix_a, 0, &staging, 0, out_bytes);
        self.profiler_resolve(&mut encoder);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            tx.send(result).unwrap();
        });
        self.poll_wait();
        rx.recv().unwrap().map_err(|_| ScanError::Unsupported)?;

        let raw = slice.get_mapped_range().to_vec();
        staging.unmap();

        if let Some(t0) = t0 {
            if self.profiler.is_none() {
                let ms = t0.elapsed().as_secs_f64() * 1000.0;
                eprintln!("[upsweep] prefix_sum ({count} elements): {ms:.3} ms");
            }
        }

        Ok(bytemuck::cast_slice(&raw).to_vec())
    }
}
