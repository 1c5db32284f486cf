//! GPU backend abstraction.
//!
//! The sorter drives the device through [`GpuBackend`], a D3D11-shaped
//! immediate-context surface: compile kernels, allocate buffers, create views,
//! map, bind, dispatch. Commands are queued in submission order; the host only
//! blocks when it maps a buffer for reading.
//!
//! Handles ([`GpuBackend::Kernel`], [`GpuBackend::Buffer`],
//! [`GpuBackend::View`]) are move-only owners. Dropping a handle releases the
//! device resource exactly once.
//!
//! Two implementations ship with the crate:
//! - [`HostBackend`]: software device executing the sort kernels on the CPU.
//! - `MetalBackend` (macOS): Apple GPUs through `objc2-metal`.

pub mod host;
#[cfg(target_os = "macos")]
pub mod metal;

pub use host::{HostBackend, HostStats};
#[cfg(target_os = "macos")]
pub use metal::MetalBackend;

use crate::error::BackendError;

/// How a buffer is used by the GPU and the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    /// GPU read/write. Host data only enters through initial data or a copy.
    Default,
    /// GPU read-only, rewritten by the host through `map_for_write`.
    Dynamic,
    /// Host-visible copy source/target. Never bound to a kernel.
    Staging,
}

/// Host access flags of a buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuAccess {
    pub read: bool,
    pub write: bool,
}

impl CpuAccess {
    pub const NONE: Self = Self {
        read: false,
        write: false,
    };
    pub const READ: Self = Self {
        read: true,
        write: false,
    };
    pub const WRITE: Self = Self {
        read: false,
        write: true,
    };
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub byte_length: usize,
    pub usage: BufferUsage,
    pub cpu_access: CpuAccess,
}

impl BufferDesc {
    /// GPU-resident read/write buffer.
    pub fn device(byte_length: usize) -> Self {
        Self {
            byte_length,
            usage: BufferUsage::Default,
            cpu_access: CpuAccess::NONE,
        }
    }

    /// GPU read-only buffer the host fills by mapping.
    pub fn dynamic(byte_length: usize) -> Self {
        Self {
            byte_length,
            usage: BufferUsage::Dynamic,
            cpu_access: CpuAccess::WRITE,
        }
    }

    pub fn staging(byte_length: usize, cpu_access: CpuAccess) -> Self {
        Self {
            byte_length,
            usage: BufferUsage::Staging,
            cpu_access,
        }
    }

    /// Usage rules shared by every backend's `allocate_buffer`.
    pub(crate) fn check_allocation(&self, initial_data: Option<&[u8]>) -> Result<(), BackendError> {
        if self.byte_length == 0 {
            return Err(BackendError::InvalidUsage("zero-length buffer".into()));
        }
        match self.usage {
            BufferUsage::Default if self.cpu_access != CpuAccess::NONE => {
                return Err(BackendError::InvalidUsage(
                    "default buffers are not host accessible".into(),
                ));
            }
            BufferUsage::Staging if self.cpu_access == CpuAccess::NONE => {
                return Err(BackendError::InvalidUsage(
                    "staging buffers need host access".into(),
                ));
            }
            _ => {}
        }
        match initial_data {
            Some(data) if data.len() != self.byte_length => Err(BackendError::InvalidUsage(
                format!(
                    "initial data is {} bytes, buffer is {}",
                    data.len(),
                    self.byte_length
                ),
            )),
            _ => Ok(()),
        }
    }

    pub(crate) fn check_view(
        &self,
        format: ElementFormat,
        element_count: u32,
        access: ViewAccess,
    ) -> Result<(), BackendError> {
        match (access, self.usage) {
            (_, BufferUsage::Staging) => {
                return Err(BackendError::InvalidUsage(
                    "staging buffers cannot be viewed".into(),
                ))
            }
            (ViewAccess::ReadWrite, BufferUsage::Dynamic) => {
                return Err(BackendError::InvalidUsage(
                    "dynamic buffers are read-only on the GPU".into(),
                ))
            }
            _ => {}
        }
        let needed = element_count as usize * format.stride();
        if element_count == 0 || needed > self.byte_length {
            return Err(BackendError::InvalidUsage(format!(
                "{element_count} elements of {} bytes do not fit a {} byte buffer",
                format.stride(),
                self.byte_length
            )));
        }
        Ok(())
    }

    pub(crate) fn check_map_write(&self) -> Result<(), BackendError> {
        if self.usage == BufferUsage::Default || !self.cpu_access.write {
            return Err(BackendError::InvalidUsage(
                "buffer is not mappable for writing".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn check_map_read(&self) -> Result<(), BackendError> {
        if self.usage != BufferUsage::Staging || !self.cpu_access.read {
            return Err(BackendError::InvalidUsage(
                "only staging buffers with read access can be mapped for reading".into(),
            ));
        }
        Ok(())
    }
}

/// Element interpretation of a view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementFormat {
    F32,
    Structured { stride: u32 },
}

impl ElementFormat {
    /// Bytes per element.
    pub fn stride(self) -> usize {
        match self {
            ElementFormat::F32 => 4,
            ElementFormat::Structured { stride } => stride as usize,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewAccess {
    /// Compute-writable view (bound with [`GpuBackend::bind_view`]).
    ReadWrite,
    /// Read-only resource (bound with [`GpuBackend::bind_resource`]).
    ReadOnly,
}

/// A binding slot of the compute stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindPoint {
    View(u32),
    Resource(u32),
    Constants(u32),
}

/// Slots an entry point consumes and the threads per group it is written for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelLayout {
    pub views: &'static [u32],
    pub resources: &'static [u32],
    pub constants: &'static [u32],
    pub threads_per_group: u32,
}

/// Device capability the sorter is written against.
///
/// All methods take `&self`; implementations keep the bound pipeline state
/// behind interior mutability, the way an immediate device context does.
pub trait GpuBackend {
    type Kernel;
    type Buffer;
    type View;

    /// Short backend name for reports.
    fn name(&self) -> &'static str;

    /// Compile `entry_point` from `source`. Diagnostics come back in
    /// [`BackendError::Compile`].
    fn compile_kernel(
        &self,
        source: &str,
        entry_point: &str,
        layout: KernelLayout,
    ) -> Result<Self::Kernel, BackendError>;

    fn allocate_buffer(
        &self,
        desc: BufferDesc,
        initial_data: Option<&[u8]>,
    ) -> Result<Self::Buffer, BackendError>;

    fn create_view(
        &self,
        buffer: &Self::Buffer,
        format: ElementFormat,
        element_count: u32,
        access: ViewAccess,
    ) -> Result<Self::View, BackendError>;

    /// Queue a whole-resource copy from `src` into `dst`.
    fn copy_buffer(&self, dst: &Self::Buffer, src: &Self::Buffer) -> Result<(), BackendError>;

    /// Map `buffer` for writing for the duration of `write`.
    fn map_for_write(
        &self,
        buffer: &Self::Buffer,
        write: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), BackendError>;

    /// Map `buffer` for reading for the duration of `read`. Waits for all
    /// queued work that writes the buffer.
    fn map_for_read(
        &self,
        buffer: &Self::Buffer,
        read: &mut dyn FnMut(&[u8]),
    ) -> Result<(), BackendError>;

    fn bind_kernel(&self, kernel: &Self::Kernel);

    fn bind_view(&self, slot: u32, view: &Self::View);

    fn bind_resource(&self, slot: u32, resource: &Self::View);

    fn set_constants(&self, slot: u32, data: &[u8]);

    fn unbind(&self, point: BindPoint);

    /// Queue `x * y * z` thread groups of the bound kernel.
    fn dispatch(&self, x: u32, y: u32, z: u32) -> Result<(), BackendError>;

    /// Check that the bound state satisfies the bound kernel's layout.
    fn validate_dispatch(&self) -> Result<(), BackendError>;

    /// Why the device stopped working, if it did. Only meaningful after an
    /// operation failed.
    fn device_removed_reason(&self) -> Option<String>;
}
