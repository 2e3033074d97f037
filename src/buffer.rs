// buffer.rs — device-local storage primitive + staged host transfer.
//
// A `DeviceBuffer` is the unit of GPU-resident storage: one device-local
// wgpu buffer of fixed size and usage. Contents are opaque bytes; owners
// interpret them (interleaved complex pairs for spectra, scalar floats for
// correlation data and reduction scratch).
//
// HOST TRANSFER
// ──────────────
// Working buffers are device-local, so host reads and writes stage through
// an ephemeral host-visible buffer:
//
//   write: fill staging (COPY_SRC) → GPU copy → wait → drop staging
//   read:  GPU copy → staging (MAP_READ) → map + wait → memcpy → drop
//
// The staging buffer lives for exactly one call and is never dropped
// before its copy has completed — the wait sits between the submit and the
// end of the function, where Rust drops the staging local.
//
// Allocation failure is detected synchronously with an OutOfMemory error
// scope and reported as a hard error; there is no fallback to a different
// memory class.

use wgpu::util::DeviceExt;

use crate::context::GpuContext;
use crate::error::AnnealError;

/// An owned device-local buffer of fixed size and usage.
pub struct DeviceBuffer {
    buffer: wgpu::Buffer,
    size: u64,
    label: &'static str,
}

impl DeviceBuffer {
    /// Allocate a device-local buffer.
    ///
    /// `usage` must include the transfer bits the owner intends to use
    /// (`COPY_DST` for [`DeviceBuffer::write`], `COPY_SRC` for
    /// [`DeviceBuffer::read`]); size and usage are fixed afterwards.
    pub fn new(
        ctx: &GpuContext,
        usage: wgpu::BufferUsages,
        size: u64,
        label: &'static str,
    ) -> Result<Self, AnnealError> {
        ctx.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        });
        if let Some(e) = pollster::block_on(ctx.device.pop_error_scope()) {
            return Err(AnnealError::BufferAllocation { label, message: e.to_string() });
        }
        log::debug!("allocated buffer '{label}': {size} bytes");
        Ok(DeviceBuffer { buffer, size, label })
    }

    /// The underlying wgpu buffer, for bind group entries and copies.
    pub(crate) fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// Buffer size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Upload `data` through a staging buffer and wait for the copy.
    ///
    /// `data.len()` must equal the buffer size.
    pub fn write(&self, ctx: &GpuContext, data: &[u8]) -> Result<(), AnnealError> {
        if data.len() as u64 != self.size {
            return Err(AnnealError::Transfer(format!(
                "write of {} bytes into '{}' ({} bytes)",
                data.len(),
                self.label,
                self.size
            )));
        }

        ctx.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let staging = ctx.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("staging upload"),
            contents: data,
            usage: wgpu::BufferUsages::COPY_SRC,
        });
        if let Some(e) = pollster::block_on(ctx.device.pop_error_scope()) {
            return Err(AnnealError::Transfer(format!("staging allocation: {e}")));
        }

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("DeviceBuffer::write"),
            });
        encoder.copy_buffer_to_buffer(&staging, 0, &self.buffer, 0, self.size);
        let index = ctx.queue.submit(std::iter::once(encoder.finish()));

        // The staging buffer must outlive the copy; wait before it drops.
        ctx.wait_for(index);
        Ok(())
    }

    /// Read the whole buffer back to host memory.
    pub fn read(&self, ctx: &GpuContext) -> Result<Vec<u8>, AnnealError> {
        self.read_at(ctx, 0, self.size)
    }

    /// Read `len` bytes starting at `offset` back to host memory.
    pub fn read_at(&self, ctx: &GpuContext, offset: u64, len: u64) -> Result<Vec<u8>, AnnealError> {
        if offset + len > self.size {
            return Err(AnnealError::Transfer(format!(
                "read of {len} bytes at {offset} from '{}' ({} bytes)",
                self.label, self.size
            )));
        }

        ctx.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging readback"),
            size: len,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(e) = pollster::block_on(ctx.device.pop_error_scope()) {
            return Err(AnnealError::Transfer(format!("staging allocation: {e}")));
        }

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("DeviceBuffer::read"),
            });
        encoder.copy_buffer_to_buffer(&self.buffer, offset, &staging, 0, len);
        ctx.queue.submit(std::iter::once(encoder.finish()));

        // map_async completes during poll(Wait); the channel carries the
        // result back to this thread.
        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        ctx.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| AnnealError::DeviceLost)?
            .map_err(|e| AnnealError::Transfer(format!("map failed: {e}")))?;

        let mapped = slice.get_mapped_range();
        let out = mapped.to_vec();
        drop(mapped);
        staging.unmap();
        Ok(out)
    }
}
