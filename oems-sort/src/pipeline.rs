//! Moving float arrays between host memory and device buffers.
//!
//! Staging buffers only live inside a single call. Ordering against compute
//! work comes from the backend's submission queue: a download issued after a
//! dispatch observes that dispatch's writes.

use crate::backend::{BufferDesc, CpuAccess, ElementFormat, GpuBackend, ViewAccess};
use crate::config::UploadMode;
use crate::error::BackendError;

/// Device-resident float array owned by one sort call.
pub struct DeviceBuffer<B: GpuBackend> {
    buffer: B::Buffer,
    element_count: u32,
}

impl<B: GpuBackend> DeviceBuffer<B> {
    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    pub fn byte_length(&self) -> usize {
        self.element_count as usize * std::mem::size_of::<f32>()
    }

    pub fn raw(&self) -> &B::Buffer {
        &self.buffer
    }
}

fn element_count(len: usize) -> Result<u32, BackendError> {
    u32::try_from(len)
        .ok()
        .filter(|&n| n > 0)
        .ok_or_else(|| BackendError::InvalidUsage(format!("cannot upload {len} elements")))
}

/// Allocate a device buffer holding a copy of `data`.
pub fn upload<B: GpuBackend>(
    backend: &B,
    data: &[f32],
    mode: UploadMode,
) -> Result<DeviceBuffer<B>, BackendError> {
    let element_count = element_count(data.len())?;
    let bytes: &[u8] = bytemuck::cast_slice(data);

    let buffer = match mode {
        UploadMode::InitialData => {
            backend.allocate_buffer(BufferDesc::device(bytes.len()), Some(bytes))?
        }
        UploadMode::Staging => {
            let staging =
                backend.allocate_buffer(BufferDesc::staging(bytes.len(), CpuAccess::WRITE), None)?;
            backend.map_for_write(&staging, &mut |mapped: &mut [u8]| {
                mapped.copy_from_slice(bytes)
            })?;
            let buffer = backend.allocate_buffer(BufferDesc::device(bytes.len()), None)?;
            backend.copy_buffer(&buffer, &staging)?;
            buffer
        }
    };

    Ok(DeviceBuffer {
        buffer,
        element_count,
    })
}

/// Compute-writable f32 view over the whole buffer.
pub fn create_view<B: GpuBackend>(
    backend: &B,
    buffer: &DeviceBuffer<B>,
) -> Result<B::View, BackendError> {
    backend.create_view(
        &buffer.buffer,
        ElementFormat::F32,
        buffer.element_count,
        ViewAccess::ReadWrite,
    )
}

/// Copy the device contents into `out`.
///
/// Goes device -> staging -> host; the staging copy is released before
/// returning.
pub fn download<B: GpuBackend>(
    backend: &B,
    buffer: &DeviceBuffer<B>,
    out: &mut [f32],
) -> Result<(), BackendError> {
    if out.len() != buffer.element_count as usize {
        return Err(BackendError::InvalidUsage(format!(
            "downloading {} elements into a slice of {}",
            buffer.element_count,
            out.len()
        )));
    }

    let staging = backend.allocate_buffer(
        BufferDesc::staging(buffer.byte_length(), CpuAccess::READ),
        None,
    )?;
    backend.copy_buffer(&staging, &buffer.buffer)?;

    let out_bytes: &mut [u8] = bytemuck::cast_slice_mut(out);
    backend.map_for_read(&staging, &mut |mapped: &[u8]| out_bytes.copy_from_slice(mapped))
}
