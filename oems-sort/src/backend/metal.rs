//! Metal device for Apple GPUs.
//!
//! Dispatches and copies are encoded into one open command buffer and only
//! committed when the host maps a buffer. Consecutive dispatches share a
//! serial compute encoder, so each column observes the writes of the one
//! before it.
//!
//! Slot mapping in the shader argument table:
//!
//! | Bind point      | Metal buffer index |
//! |-----------------|--------------------|
//! | `View(i)`       | `i`                |
//! | `Resource(i)`   | `8 + i`            |
//! | `Constants(i)`  | `16 + i`           |

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::ptr::NonNull;

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_foundation::NSString;
use objc2_metal::{
    MTLBlitCommandEncoder, MTLBuffer, MTLCommandBuffer, MTLCommandBufferStatus, MTLCommandEncoder,
    MTLCommandQueue, MTLComputeCommandEncoder, MTLComputePipelineState,
    MTLCreateSystemDefaultDevice, MTLDevice, MTLLibrary, MTLResourceOptions, MTLSize,
};

use super::{BindPoint, BufferDesc, ElementFormat, GpuBackend, KernelLayout, ViewAccess};
use crate::error::BackendError;

const RESOURCE_BASE: usize = 8;
const CONSTANTS_BASE: usize = 16;

type Buffer = Retained<ProtocolObject<dyn MTLBuffer>>;

pub struct MetalKernel {
    pso: Retained<ProtocolObject<dyn MTLComputePipelineState>>,
    layout: KernelLayout,
}

pub struct MetalBuffer {
    raw: Buffer,
    desc: BufferDesc,
}

impl MetalBuffer {
    fn bytes(&self) -> &[u8] {
        // SAFETY: shared storage; the command buffer is flushed before the
        // host touches the contents.
        unsafe {
            std::slice::from_raw_parts(self.raw.contents().as_ptr() as *const u8, self.desc.byte_length)
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn bytes_mut(&self) -> &mut [u8] {
        // SAFETY: as above; the caller holds the device borrow while mapped.
        unsafe {
            std::slice::from_raw_parts_mut(self.raw.contents().as_ptr() as *mut u8, self.desc.byte_length)
        }
    }
}

pub struct MetalView {
    raw: Buffer,
    access: ViewAccess,
}

#[derive(Default)]
struct EncoderState {
    cmd: Option<Retained<ProtocolObject<dyn MTLCommandBuffer>>>,
    compute: Option<Retained<ProtocolObject<dyn MTLComputeCommandEncoder>>>,
    kernel: Option<(Retained<ProtocolObject<dyn MTLComputePipelineState>>, KernelLayout)>,
    views: BTreeMap<u32, (Buffer, ViewAccess)>,
    resources: BTreeMap<u32, (Buffer, ViewAccess)>,
    constants: BTreeMap<u32, Vec<u8>>,
    failure: Option<String>,
}

pub struct MetalBackend {
    device: Retained<ProtocolObject<dyn MTLDevice>>,
    queue: Retained<ProtocolObject<dyn MTLCommandQueue>>,
    state: RefCell<EncoderState>,
}

impl MetalBackend {
    /// Open the system default Metal device.
    pub fn new() -> Result<Self, BackendError> {
        let device = MTLCreateSystemDefaultDevice()
            .ok_or_else(|| BackendError::DeviceNotFound("no Metal device".into()))?;
        let queue = device
            .newCommandQueue()
            .ok_or_else(|| BackendError::DeviceNotFound("failed to create command queue".into()))?;
        tracing::info!(device = %device.name(), "opened Metal device");
        Ok(Self {
            device,
            queue,
            state: RefCell::new(EncoderState::default()),
        })
    }

    fn command_buffer(
        &self,
        state: &mut EncoderState,
    ) -> Result<Retained<ProtocolObject<dyn MTLCommandBuffer>>, BackendError> {
        if state.failure.is_some() {
            return Err(BackendError::DeviceRemoved);
        }
        if let Some(cmd) = &state.cmd {
            return Ok(cmd.clone());
        }
        let cmd = self
            .queue
            .commandBuffer()
            .ok_or_else(|| BackendError::Execution("failed to create command buffer".into()))?;
        state.cmd = Some(cmd.clone());
        Ok(cmd)
    }

    fn end_compute(state: &mut EncoderState) {
        if let Some(encoder) = state.compute.take() {
            encoder.endEncoding();
        }
    }

    /// Commit the open command buffer and wait for it.
    fn flush(&self, state: &mut EncoderState) -> Result<(), BackendError> {
        if state.failure.is_some() {
            return Err(BackendError::DeviceRemoved);
        }
        Self::end_compute(state);
        let Some(cmd) = state.cmd.take() else {
            return Ok(());
        };
        cmd.commit();
        cmd.waitUntilCompleted();

        if cmd.status() == MTLCommandBufferStatus::Error {
            let failure = format!("command buffer error: {:?}", cmd.error());
            tracing::error!(%failure, "Metal command buffer failed");
            state.failure = Some(failure.clone());
            return Err(BackendError::Execution(failure));
        }
        Ok(())
    }
}

impl Drop for MetalBackend {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.cmd.is_some() && state.failure.is_none() {
            Self::end_compute(state);
            if let Some(cmd) = state.cmd.take() {
                cmd.commit();
                cmd.waitUntilCompleted();
            }
        }
    }
}

fn check_slots(
    slots: &BTreeMap<u32, (Buffer, ViewAccess)>,
    wanted: &[u32],
    kind: &str,
    access: ViewAccess,
) -> Result<(), BackendError> {
    for slot in wanted {
        match slots.get(slot) {
            None => {
                return Err(BackendError::Validation(format!(
                    "{kind} slot {slot} is unbound"
                )))
            }
            Some((_, bound)) if *bound != access => {
                return Err(BackendError::Validation(format!(
                    "{kind} slot {slot} holds a {bound:?} view"
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

impl GpuBackend for MetalBackend {
    type Kernel = MetalKernel;
    type Buffer = MetalBuffer;
    type View = MetalView;

    fn name(&self) -> &'static str {
        "metal"
    }

    fn compile_kernel(
        &self,
        source: &str,
        entry_point: &str,
        layout: KernelLayout,
    ) -> Result<MetalKernel, BackendError> {
        let compile_error = |diagnostic: String| BackendError::Compile { diagnostic };
        if source.trim().is_empty() {
            return Err(compile_error("kernel source is empty".into()));
        }
        let ns_source = NSString::from_str(source);
        let library = self
            .device
            .newLibraryWithSource_options_error(&ns_source, None)
            .map_err(|e| compile_error(e.localizedDescription().to_string()))?;

        let fn_name = NSString::from_str(entry_point);
        let function = library.newFunctionWithName(&fn_name).ok_or_else(|| {
            compile_error(format!("entry point '{entry_point}' not found in library"))
        })?;
        let pso = self
            .device
            .newComputePipelineStateWithFunction_error(&function)
            .map_err(|e| compile_error(e.localizedDescription().to_string()))?;

        let max = pso.maxTotalThreadsPerThreadgroup();
        if layout.threads_per_group == 0 || layout.threads_per_group as usize > max {
            return Err(compile_error(format!(
                "entry point '{entry_point}' supports 1..={max} threads per group, layout asks for {}",
                layout.threads_per_group
            )));
        }
        tracing::debug!(entry_point, max_threads = max, "compiled Metal kernel");
        Ok(MetalKernel { pso, layout })
    }

    fn allocate_buffer(
        &self,
        desc: BufferDesc,
        initial_data: Option<&[u8]>,
    ) -> Result<MetalBuffer, BackendError> {
        if self.state.borrow().failure.is_some() {
            return Err(BackendError::DeviceRemoved);
        }
        desc.check_allocation(initial_data)?;

        let options = MTLResourceOptions::StorageModeShared;
        let raw = match initial_data {
            Some(data) => {
                let ptr = NonNull::from(data).cast::<c_void>();
                // SAFETY: `data` is non-empty and exactly `byte_length` bytes.
                unsafe {
                    self.device
                        .newBufferWithBytes_length_options(ptr, desc.byte_length, options)
                }
            }
            None => self.device.newBufferWithLength_options(desc.byte_length, options),
        }
        .ok_or(BackendError::Allocation {
            byte_length: desc.byte_length,
        })?;
        Ok(MetalBuffer { raw, desc })
    }

    fn create_view(
        &self,
        buffer: &MetalBuffer,
        format: ElementFormat,
        element_count: u32,
        access: ViewAccess,
    ) -> Result<MetalView, BackendError> {
        buffer.desc.check_view(format, element_count, access)?;
        Ok(MetalView {
            raw: buffer.raw.clone(),
            access,
        })
    }

    fn copy_buffer(&self, dst: &MetalBuffer, src: &MetalBuffer) -> Result<(), BackendError> {
        if dst.desc.byte_length != src.desc.byte_length {
            return Err(BackendError::InvalidUsage(format!(
                "copy between {} and {} byte buffers",
                src.desc.byte_length, dst.desc.byte_length
            )));
        }
        let mut state = self.state.borrow_mut();
        let cmd = self.command_buffer(&mut state)?;
        Self::end_compute(&mut state);

        let blit = cmd
            .blitCommandEncoder()
            .ok_or_else(|| BackendError::Execution("failed to create blit encoder".into()))?;
        // SAFETY: both buffers are live and exactly `byte_length` bytes long.
        unsafe {
            blit.copyFromBuffer_sourceOffset_toBuffer_destinationOffset_size(
                &src.raw,
                0,
                &dst.raw,
                0,
                src.desc.byte_length,
            );
        }
        blit.endEncoding();
        Ok(())
    }

    fn map_for_write(
        &self,
        buffer: &MetalBuffer,
        write: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), BackendError> {
        buffer.desc.check_map_write()?;
        let mut state = self.state.borrow_mut();
        self.flush(&mut state)?;
        write(buffer.bytes_mut());
        Ok(())
    }

    fn map_for_read(
        &self,
        buffer: &MetalBuffer,
        read: &mut dyn FnMut(&[u8]),
    ) -> Result<(), BackendError> {
        buffer.desc.check_map_read()?;
        let mut state = self.state.borrow_mut();
        self.flush(&mut state)?;
        read(buffer.bytes());
        Ok(())
    }

    fn bind_kernel(&self, kernel: &MetalKernel) {
        self.state.borrow_mut().kernel = Some((kernel.pso.clone(), kernel.layout));
    }

    fn bind_view(&self, slot: u32, view: &MetalView) {
        self.state
            .borrow_mut()
            .views
            .insert(slot, (view.raw.clone(), view.access));
    }

    fn bind_resource(&self, slot: u32, resource: &MetalView) {
        self.state
            .borrow_mut()
            .resources
            .insert(slot, (resource.raw.clone(), resource.access));
    }

    fn set_constants(&self, slot: u32, data: &[u8]) {
        self.state.borrow_mut().constants.insert(slot, data.to_vec());
    }

    fn unbind(&self, point: BindPoint) {
        let mut state = self.state.borrow_mut();
        match point {
            BindPoint::View(slot) => {
                state.views.remove(&slot);
            }
            BindPoint::Resource(slot) => {
                state.resources.remove(&slot);
            }
            BindPoint::Constants(slot) => {
                state.constants.remove(&slot);
            }
        }
    }

    fn dispatch(&self, x: u32, y: u32, z: u32) -> Result<(), BackendError> {
        let mut state = self.state.borrow_mut();
        let cmd = self.command_buffer(&mut state)?;
        let (pso, layout) = state
            .kernel
            .clone()
            .ok_or_else(|| BackendError::Execution("dispatch without a bound kernel".into()))?;

        if state.compute.is_none() {
            let encoder = cmd.computeCommandEncoder().ok_or_else(|| {
                BackendError::Execution("failed to create compute encoder".into())
            })?;
            state.compute = Some(encoder);
        }
        let Some(encoder) = state.compute.as_ref() else {
            return Err(BackendError::Execution("compute encoder missing".into()));
        };

        encoder.setComputePipelineState(&pso);
        // SAFETY: bound buffers are retained by the binding table until the
        // command buffer completes; constants are copied by setBytes.
        unsafe {
            for (slot, (buffer, _)) in &state.views {
                encoder.setBuffer_offset_atIndex(Some(&**buffer), 0, *slot as usize);
            }
            for (slot, (buffer, _)) in &state.resources {
                encoder.setBuffer_offset_atIndex(Some(&**buffer), 0, RESOURCE_BASE + *slot as usize);
            }
            for (slot, data) in &state.constants {
                encoder.setBytes_length_atIndex(
                    NonNull::from(data.as_slice()).cast::<c_void>(),
                    data.len(),
                    CONSTANTS_BASE + *slot as usize,
                );
            }
        }
        let grid = MTLSize {
            width: x as usize,
            height: y as usize,
            depth: z as usize,
        };
        let group = MTLSize {
            width: layout.threads_per_group as usize,
            height: 1,
            depth: 1,
        };
        encoder.dispatchThreadgroups_threadsPerThreadgroup(grid, group);
        Ok(())
    }

    fn validate_dispatch(&self) -> Result<(), BackendError> {
        let state = self.state.borrow();
        let (_, layout) = state
            .kernel
            .as_ref()
            .ok_or_else(|| BackendError::Validation("no kernel bound".into()))?;
        check_slots(&state.views, layout.views, "view", ViewAccess::ReadWrite)?;
        check_slots(&state.resources, layout.resources, "resource", ViewAccess::ReadOnly)?;
        for slot in layout.views {
            let (written, _) = &state.views[slot];
            let aliased = state
                .resources
                .values()
                .any(|(buffer, _)| Retained::as_ptr(buffer) == Retained::as_ptr(written));
            if aliased {
                return Err(BackendError::Validation(format!(
                    "view slot {slot} is also bound as a read-only resource"
                )));
            }
        }
        for slot in layout.constants {
            if state.constants.get(slot).map_or(true, |data| data.is_empty()) {
                return Err(BackendError::Validation(format!(
                    "constant slot {slot} is unbound"
                )));
            }
        }
        Ok(())
    }

    fn device_removed_reason(&self) -> Option<String> {
        self.state.borrow().failure.clone()
    }
}
