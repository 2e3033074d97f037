// context.rs — GPU context: device acquisition + the three compute pipelines.
//
// RESPONSIBILITIES
// ─────────────────
// 1. Acquire a compute-capable adapter/device/queue through wgpu. Adapter
//    selection is deterministic: prefer the first discrete GPU, fall back
//    to the first enumerated adapter. Every candidate is logged so the
//    choice is visible at startup.
//
// 2. Compile the three fixed compute pipelines — update, metric, reduce —
//    once, at context creation. Workgroup sizes are specialization-time
//    constants: they are substituted into the WGSL source before
//    compilation ({{WG_X}}-style tokens), never chosen at dispatch time.
//    The update pipeline is specialized per `ndim` from the group-size
//    table in spectrum.rs.
//
// 3. Own the descriptor budget — a fixed pool of logical descriptor sets
//    shared by all images and metrics. The capacity is deliberately small
//    and never grows; exhaustion is an explicit error the caller must
//    handle by destroying something first.
//
// ALL-OR-NOTHING CONSTRUCTION
// ────────────────────────────
// Every step of `GpuContext::new` either succeeds or early-returns with an
// error. Rust's ownership model does the cleanup bookkeeping: resources
// acquired before the failing step are locals that drop on the return path,
// exactly once. Pipeline compilation errors are caught with wgpu error
// scopes (wgpu otherwise reports validation failures asynchronously).
//
// FIELD DROP ORDER
// ─────────────────
// Struct fields drop in declaration order. `_instance` is declared last so
// the wgpu::Instance outlives the device and queue — device-level objects
// hold back-references into the instance on some drivers.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::AnnealError;
use crate::spectrum::{update_group_sizes, METRIC_GROUP_SIZE};

/// Logical descriptor sets available per context. Images take one each,
/// metrics take two. The pool never grows.
pub(crate) const DESCRIPTORS_IN_POOL: u32 = 10;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

/// A compiled compute pipeline plus the bind group layout its dispatches
/// use. One per kernel; all three live as long as the context.
pub(crate) struct Pipeline {
    pub(crate) pipeline: wgpu::ComputePipeline,
    pub(crate) bgl: wgpu::BindGroupLayout,
}

/// Build one compute pipeline with `storage_read_only.len()` storage-buffer
/// bindings (flag = read-only) at bindings 0.., followed by `uniforms`
/// uniform-buffer bindings. Entry point is always `main`.
///
/// The whole compilation runs under a validation error scope so a bad
/// shader or layout surfaces here, synchronously, instead of in a later
/// uncaptured-error callback.
fn build_pipeline(
    device: &wgpu::Device,
    name: &'static str,
    source: String,
    storage_read_only: &[bool],
    uniforms: u32,
) -> Result<Pipeline, AnnealError> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(name),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });

    let mut entries = Vec::with_capacity(storage_read_only.len() + uniforms as usize);
    for (i, &read_only) in storage_read_only.iter().enumerate() {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: i as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });
    }
    for i in 0..uniforms {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: storage_read_only.len() as u32 + i,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });
    }

    let bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(name),
        entries: &entries,
    });

    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(name),
        bind_group_layouts: &[&bgl],
        push_constant_ranges: &[],
    });

    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(name),
        layout: Some(&layout),
        module: &shader,
        entry_point: "main",
        compilation_options: wgpu::PipelineCompilationOptions::default(),
        cache: None,
    });

    if let Some(e) = pollster::block_on(device.pop_error_scope()) {
        return Err(AnnealError::PipelineCreation {
            pipeline: name,
            message: e.to_string(),
        });
    }

    Ok(Pipeline { pipeline, bgl })
}

// ---------------------------------------------------------------------------
// Descriptor budget
// ---------------------------------------------------------------------------

/// Counted pool of logical descriptor sets. Interior mutability because the
/// context is shared immutably among its images and metrics; host-side
/// orchestration is single-threaded by design, so a `Cell` suffices.
pub(crate) struct DescriptorBudget {
    capacity: u32,
    used: Cell<u32>,
}

impl DescriptorBudget {
    fn new(capacity: u32) -> Self {
        DescriptorBudget { capacity, used: Cell::new(0) }
    }

    /// Reserve `n` sets, failing without side effects when the pool cannot
    /// hold them.
    pub(crate) fn acquire(&self, n: u32) -> Result<(), AnnealError> {
        let used = self.used.get();
        if used + n > self.capacity {
            return Err(AnnealError::DescriptorPoolExhausted { capacity: self.capacity });
        }
        self.used.set(used + n);
        Ok(())
    }

    /// Return `n` sets to the pool.
    pub(crate) fn release(&self, n: u32) {
        let used = self.used.get();
        debug_assert!(used >= n, "descriptor budget release underflow");
        self.used.set(used.saturating_sub(n));
    }

    #[cfg(test)]
    fn used(&self) -> u32 {
        self.used.get()
    }
}

// ---------------------------------------------------------------------------
// Adapter selection
// ---------------------------------------------------------------------------

/// Deterministic adapter choice: the first discrete GPU when one exists,
/// otherwise the first enumerated adapter. Pure so the policy is testable
/// without a GPU.
fn select_adapter_index(device_types: &[wgpu::DeviceType]) -> Option<usize> {
    if device_types.is_empty() {
        return None;
    }
    device_types
        .iter()
        .position(|t| *t == wgpu::DeviceType::DiscreteGpu)
        .or(Some(0))
}

// ---------------------------------------------------------------------------
// GpuContext
// ---------------------------------------------------------------------------

/// The process-lifetime GPU context: device, queue, and the three compiled
/// compute pipelines.
///
/// `ndim` is fixed at creation; every [`crate::image::SpectrumImage`] and
/// [`crate::corrfn::CorrelationFunction`] created from this context must
/// match it. Dependent objects borrow the context, so the borrow checker
/// enforces that they are dropped before the context is.
pub struct GpuContext {
    id: u64,
    ndim: u32,
    pub(crate) update: Pipeline,
    pub(crate) metric: Pipeline,
    pub(crate) reduce: Pipeline,
    pub(crate) desc_budget: DescriptorBudget,
    next_resource_id: Cell<u64>,
    adapter_name: String,
    pub(crate) device: wgpu::Device,
    pub(crate) queue: wgpu::Queue,
    /// Keeps the wgpu::Instance alive until `device` and `queue` have
    /// dropped. Never accessed directly.
    _instance: wgpu::Instance,
}

impl GpuContext {
    /// Create a context for `ndim`-dimensional images (1–3 axes).
    ///
    /// `enable_validation` turns on the backend validation layer — useful
    /// while developing shaders, measurable overhead otherwise.
    ///
    /// # Errors
    /// [`AnnealError::BadDimensions`] for an out-of-range `ndim`;
    /// [`AnnealError::NoSuitableAdapter`] when no compute-capable adapter
    /// exists; [`AnnealError::DeviceRequest`] / [`AnnealError::PipelineCreation`]
    /// when device or pipeline setup fails. Nothing leaks on failure.
    pub fn new(ndim: u32, enable_validation: bool) -> Result<Self, AnnealError> {
        if !(1..=crate::spectrum::MAX_DIMENSIONS as u32).contains(&ndim) {
            return Err(AnnealError::BadDimensions);
        }
        pollster::block_on(Self::init_async(ndim, enable_validation))
    }

    async fn init_async(ndim: u32, enable_validation: bool) -> Result<Self, AnnealError> {
        let mut flags = wgpu::InstanceFlags::default();
        if enable_validation {
            log::info!("enabling GPU validation layer");
            flags |= wgpu::InstanceFlags::VALIDATION;
        }

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            flags,
            ..Default::default()
        });

        let adapters: Vec<wgpu::Adapter> = instance
            .enumerate_adapters(wgpu::Backends::PRIMARY)
            .into_iter()
            .collect();
        for (i, a) in adapters.iter().enumerate() {
            let info = a.get_info();
            log::info!(
                "adapter {i}: {} ({:?}, {:?})",
                info.name,
                info.backend,
                info.device_type
            );
        }

        let types: Vec<wgpu::DeviceType> =
            adapters.iter().map(|a| a.get_info().device_type).collect();
        let index = select_adapter_index(&types).ok_or(AnnealError::NoSuitableAdapter)?;
        let adapter = &adapters[index];
        let adapter_name = adapter.get_info().name;
        log::info!("selected adapter {index}: {adapter_name}");

        // Downlevel adapters may lack compute entirely (e.g. GLES 3.0).
        let caps = adapter.get_downlevel_capabilities();
        if !caps.flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
            return Err(AnnealError::NoSuitableAdapter);
        }

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("anneal-gpu"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(AnnealError::DeviceRequest)?;

        // Bake workgroup sizes into the shader sources. The update kernel
        // is specialized per ndim; metric and reduce always run 64-wide.
        let group = update_group_sizes(ndim);
        let update_src = include_str!("shaders/update.wgsl")
            .replace("{{WG_X}}", &group[0].to_string())
            .replace("{{WG_Y}}", &group[1].to_string())
            .replace("{{WG_Z}}", &group[2].to_string());
        let metric_src = include_str!("shaders/metric.wgsl")
            .replace("{{GROUP_SIZE}}", &METRIC_GROUP_SIZE.to_string());
        let reduce_src = include_str!("shaders/reduce.wgsl")
            .replace("{{GROUP_SIZE}}", &METRIC_GROUP_SIZE.to_string());

        // Bindings (storage first, then uniforms) mirror each shader's
        // @group(0) declarations:
        //   update: spectrum (rw)                              + params
        //   metric: target (r), spectrum (r), difference (rw)  + params
        //   reduce: difference (rw)                            + params
        let update = build_pipeline(&device, "update", update_src, &[false], 1)?;
        let metric = build_pipeline(&device, "metric", metric_src, &[true, true, false], 1)?;
        let reduce = build_pipeline(&device, "reduce", reduce_src, &[false], 1)?;

        Ok(GpuContext {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            ndim,
            update,
            metric,
            reduce,
            desc_budget: DescriptorBudget::new(DESCRIPTORS_IN_POOL),
            next_resource_id: Cell::new(1),
            adapter_name,
            device,
            queue,
            _instance: instance,
        })
    }

    /// Dimensionality this context was created for.
    pub fn ndim(&self) -> u32 {
        self.ndim
    }

    /// Name of the selected adapter, for diagnostics.
    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// Context identity, used to reject cross-context object pairings.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Hand out a fresh id for an image or correlation function.
    pub(crate) fn next_resource_id(&self) -> u64 {
        let id = self.next_resource_id.get();
        self.next_resource_id.set(id + 1);
        id
    }

    /// Block until the given submission has completed on the queue.
    pub(crate) fn wait_for(&self, index: wgpu::SubmissionIndex) {
        self.device
            .poll(wgpu::Maintain::WaitForSubmissionIndex(index));
    }
}
