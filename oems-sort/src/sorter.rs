//! Sort controller.
//!
//! One `sort` call walks
//! `Idle -> Uploading -> BaseDispatched -> NetworkPlanned -> NetworkDispatched -> Downloading -> Idle`:
//!
//! 1. upload the array and create a writable view over it,
//! 2. one base dispatch sorting every group of four,
//! 3. fill a column buffer with the merge network for `n`,
//! 4. one network dispatch per column, the column index passed as a constant,
//! 5. unbind everything, then download.
//!
//! Columns of one tip depend on each other, and a dispatch cannot barrier
//! across thread groups, so stage ordering comes from submission order.

use std::fmt;
use std::path::Path;

use bytemuck::{Pod, Zeroable};

use crate::backend::{BindPoint, BufferDesc, ElementFormat, GpuBackend, KernelLayout, ViewAccess};
use crate::config::SorterConfig;
use crate::error::{BackendError, SortError};
use crate::network::{self, Column, BASE_GROUP};
use crate::pipeline;

/// Entry point of the base pass.
pub const BASE_KERNEL: &str = "oems_base_4";
/// Entry point executing one network column.
pub const NETWORK_KERNEL: &str = "oems_network";

/// Smallest array `sort` accepts.
pub const MIN_ELEMENTS: usize = network::FIRST_TIP as usize;
/// Largest array whose byte offsets fit the kernels' 32-bit indexing.
pub const MAX_ELEMENTS: usize = (u32::MAX / 4) as usize;

const DATA_SLOT: u32 = 0;
const COLUMN_SLOT: u32 = 0;
const CONSTANT_SLOT: u32 = 0;
const MAX_THREADS_PER_GROUP: u32 = 1024;

/// Constant block shared by both kernels.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct SortConstants {
    element_count: u32,
    column_index: u32,
    reserved: [u32; 2],
}

/// Where a sort call currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortPhase {
    Idle,
    Uploading,
    BaseDispatched,
    NetworkPlanned,
    NetworkDispatched,
    Downloading,
}

impl fmt::Display for SortPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SortPhase::Idle => "idle",
            SortPhase::Uploading => "uploading",
            SortPhase::BaseDispatched => "dispatching the base pass",
            SortPhase::NetworkPlanned => "planning the network",
            SortPhase::NetworkDispatched => "dispatching the network",
            SortPhase::Downloading => "downloading",
        };
        f.write_str(text)
    }
}

fn base_layout(threads_per_group: u32) -> KernelLayout {
    KernelLayout {
        views: &[DATA_SLOT],
        resources: &[],
        constants: &[CONSTANT_SLOT],
        threads_per_group,
    }
}

fn network_layout(threads_per_group: u32) -> KernelLayout {
    KernelLayout {
        views: &[DATA_SLOT],
        resources: &[COLUMN_SLOT],
        constants: &[CONSTANT_SLOT],
        threads_per_group,
    }
}

/// Bound pipeline slots, cleared on drop.
///
/// Lives shorter than every buffer and view it binds, so nothing is released
/// while still bound, on the error path included.
struct BindingScope<'a, B: GpuBackend> {
    backend: &'a B,
    bound: Vec<BindPoint>,
}

impl<'a, B: GpuBackend> BindingScope<'a, B> {
    fn new(backend: &'a B) -> Self {
        Self {
            backend,
            bound: Vec::new(),
        }
    }

    fn track(&mut self, point: BindPoint) {
        if !self.bound.contains(&point) {
            self.bound.push(point);
        }
    }

    fn view(&mut self, slot: u32, view: &B::View) {
        self.backend.bind_view(slot, view);
        self.track(BindPoint::View(slot));
    }

    fn resource(&mut self, slot: u32, resource: &B::View) {
        self.backend.bind_resource(slot, resource);
        self.track(BindPoint::Resource(slot));
    }

    fn constants(&mut self, slot: u32, constants: &SortConstants) {
        self.backend.set_constants(slot, bytemuck::bytes_of(constants));
        self.track(BindPoint::Constants(slot));
    }
}

impl<B: GpuBackend> Drop for BindingScope<'_, B> {
    fn drop(&mut self) {
        for point in self.bound.drain(..).rev() {
            self.backend.unbind(point);
        }
    }
}

/// Column descriptors uploaded for one call, exposed read-only to the
/// network kernel.
struct ColumnBuffer<B: GpuBackend> {
    // Field order releases the view before its buffer.
    view: B::View,
    _buffer: B::Buffer,
    /// Comparisons, and so threads, of each column in dispatch order.
    threads: Vec<usize>,
}

/// GPU odd-even merge sorter.
///
/// Kernels are compiled once in [`OemsSorter::new`]; every [`sort`] call
/// allocates and releases its own buffers.
///
/// [`sort`]: OemsSorter::sort
pub struct OemsSorter<B: GpuBackend> {
    backend: B,
    config: SorterConfig,
    base_kernel: B::Kernel,
    network_kernel: B::Kernel,
    phase: SortPhase,
}

impl<B: GpuBackend> OemsSorter<B> {
    /// Read the kernel source named by `config` and compile both entry points.
    pub fn new(backend: B, config: SorterConfig) -> Result<Self, SortError> {
        let tpg = config.threads_per_group;
        if !tpg.is_power_of_two() || tpg > MAX_THREADS_PER_GROUP {
            return Err(SortError::config(format!(
                "threads_per_group must be a power of two up to {MAX_THREADS_PER_GROUP}, got {tpg}"
            )));
        }

        let path = config.kernel_path.as_path();
        let source = std::fs::read_to_string(path).map_err(|e| SortError::Config {
            reason: format!("cannot read kernel source {}", path.display()),
            source: Some(e),
        })?;
        if source.trim().is_empty() {
            return Err(SortError::config(format!(
                "kernel source {} is empty",
                path.display()
            )));
        }

        let base_kernel = compile(&backend, &source, path, BASE_KERNEL, base_layout(tpg))?;
        let network_kernel =
            compile(&backend, &source, path, NETWORK_KERNEL, network_layout(tpg))?;

        Ok(Self {
            backend,
            config,
            base_kernel,
            network_kernel,
            phase: SortPhase::Idle,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &SorterConfig {
        &self.config
    }

    /// Current phase. Always [`SortPhase::Idle`] between calls.
    pub fn phase(&self) -> SortPhase {
        self.phase
    }

    /// Sort `data` ascending in place.
    ///
    /// The result is ordered when `data.len()` is a power of two. Other
    /// lengths from [`MIN_ELEMENTS`] up are accepted and come back as a
    /// permutation of the input, but the network does not cover the partial
    /// tail blocks, so they are generally not fully ordered.
    ///
    /// The length is checked before the device is touched. On error the
    /// contents of `data` are unspecified.
    pub fn sort(&mut self, data: &mut [f32]) -> Result<(), SortError> {
        let n = checked_len(data.len())?;
        let result = self.run(data, n);
        self.phase = SortPhase::Idle;
        result
    }

    fn run(&mut self, data: &mut [f32], n: u32) -> Result<(), SortError> {
        let backend = &self.backend;
        let fault = move |phase: SortPhase| {
            move |source: BackendError| SortError::DeviceFault {
                phase,
                reason: backend.device_removed_reason(),
                source,
            }
        };

        self.phase = SortPhase::Uploading;
        let buffer = pipeline::upload(backend, data, self.config.upload_mode)
            .map_err(fault(SortPhase::Uploading))?;
        let view = pipeline::create_view(backend, &buffer).map_err(fault(SortPhase::Uploading))?;

        let mut constants = SortConstants {
            element_count: n,
            ..SortConstants::default()
        };

        self.phase = SortPhase::BaseDispatched;
        {
            let mut scope = BindingScope::new(backend);
            backend.bind_kernel(&self.base_kernel);
            scope.view(DATA_SLOT, &view);
            scope.constants(CONSTANT_SLOT, &constants);
            self.dispatch(BASE_KERNEL, n as usize / BASE_GROUP)
                .map_err(|e| e.into_sort_error(fault(SortPhase::BaseDispatched)))?;
        }

        self.phase = SortPhase::NetworkPlanned;
        let columns = plan_columns(backend, n).map_err(|e| match e {
            PlanError::Device(source) => fault(SortPhase::NetworkPlanned)(source),
            PlanError::Sort(err) => err,
        })?;

        self.phase = SortPhase::NetworkDispatched;
        {
            let mut scope = BindingScope::new(backend);
            backend.bind_kernel(&self.network_kernel);
            scope.view(DATA_SLOT, &view);
            scope.resource(COLUMN_SLOT, &columns.view);
            for (index, &threads) in columns.threads.iter().enumerate() {
                // Column count was checked against u32 when planning.
                constants.column_index = index as u32;
                scope.constants(CONSTANT_SLOT, &constants);
                self.dispatch(NETWORK_KERNEL, threads)
                    .map_err(|e| e.into_sort_error(fault(SortPhase::NetworkDispatched)))?;
            }
        }

        self.phase = SortPhase::Downloading;
        pipeline::download(backend, &buffer, data).map_err(fault(SortPhase::Downloading))
    }

    /// Validate if configured, then dispatch enough groups for `threads`.
    fn dispatch(&self, kernel: &'static str, threads: usize) -> Result<(), DispatchError> {
        if self.config.validate_dispatch {
            self.backend
                .validate_dispatch()
                .map_err(|source| DispatchError::Validation { kernel, source })?;
        }
        let tpg = self.config.threads_per_group as usize;
        let groups = u32::try_from(threads.div_ceil(tpg)).map_err(|_| {
            DispatchError::Device(BackendError::InvalidUsage(format!(
                "{threads} threads exceed the dispatch limit"
            )))
        })?;
        if groups == 0 {
            return Ok(());
        }
        self.backend
            .dispatch(groups, 1, 1)
            .map_err(DispatchError::Device)
    }
}

enum DispatchError {
    Validation {
        kernel: &'static str,
        source: BackendError,
    },
    Device(BackendError),
}

impl DispatchError {
    fn into_sort_error(self, fault: impl FnOnce(BackendError) -> SortError) -> SortError {
        match self {
            DispatchError::Validation { kernel, source } => SortError::Validation { kernel, source },
            DispatchError::Device(source) => fault(source),
        }
    }
}

enum PlanError {
    Device(BackendError),
    Sort(SortError),
}

impl From<BackendError> for PlanError {
    fn from(err: BackendError) -> Self {
        PlanError::Device(err)
    }
}

fn compile<B: GpuBackend>(
    backend: &B,
    source: &str,
    path: &Path,
    entry_point: &str,
    layout: KernelLayout,
) -> Result<B::Kernel, SortError> {
    backend
        .compile_kernel(source, entry_point, layout)
        .map_err(|source| SortError::Compile {
            entry_point: entry_point.to_string(),
            path: path.to_path_buf(),
            source,
        })
}

fn checked_len(len: usize) -> Result<u32, SortError> {
    if len < MIN_ELEMENTS {
        return Err(SortError::config(format!(
            "sorting needs at least {MIN_ELEMENTS} elements, got {len}"
        )));
    }
    if len > MAX_ELEMENTS {
        return Err(SortError::config(format!(
            "{len} elements exceed the {MAX_ELEMENTS} element limit of 32-bit indexing"
        )));
    }
    // MAX_ELEMENTS < u32::MAX
    Ok(len as u32)
}

/// Generate the network for `n` straight into a fresh column buffer.
fn plan_columns<B: GpuBackend>(backend: &B, n: u32) -> Result<ColumnBuffer<B>, PlanError> {
    let count = network::column_count(n);
    if let Some(estimate) = network::estimated_column_count(n) {
        if estimate != count {
            return Err(PlanError::Sort(SortError::config(format!(
                "closed-form column count {estimate} disagrees with the {count} columns for n = {n}"
            ))));
        }
    }
    let element_count = u32::try_from(count).map_err(|_| {
        PlanError::Sort(SortError::config(format!(
            "{count} columns do not fit a column buffer"
        )))
    })?;

    let buffer = backend.allocate_buffer(BufferDesc::dynamic(count * Column::SIZE), None)?;
    let mut written = 0;
    let mut threads = Vec::new();
    let mut cast_error = None;
    backend.map_for_write(&buffer, &mut |bytes: &mut [u8]| {
        match bytemuck::try_cast_slice_mut::<u8, Column>(bytes) {
            Ok(dest) => {
                written = network::write_columns(n, dest);
                threads = dest.iter().map(Column::comparison_count).collect();
            }
            Err(e) => cast_error = Some(e),
        }
    })?;
    if let Some(e) = cast_error {
        return Err(PlanError::Device(BackendError::InvalidUsage(format!(
            "mapped column buffer is not a column array: {e}"
        ))));
    }
    if written != count {
        return Err(PlanError::Sort(SortError::config(format!(
            "network emitted {written} columns into a buffer sized for {count}"
        ))));
    }

    let view = backend.create_view(
        &buffer,
        ElementFormat::Structured {
            stride: Column::SIZE as u32,
        },
        element_count,
        ViewAccess::ReadOnly,
    )?;
    Ok(ColumnBuffer {
        view,
        _buffer: buffer,
        threads,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_wire_size() {
        assert_eq!(std::mem::size_of::<SortConstants>(), 16);
        let constants = SortConstants {
            element_count: 1024,
            column_index: 7,
            ..SortConstants::default()
        };
        let words: &[u32] = bytemuck::cast_slice(bytemuck::bytes_of(&constants));
        assert_eq!(words, &[1024, 7, 0, 0]);
    }

    #[test]
    fn test_length_limits() {
        assert!(checked_len(7).unwrap_err().is_config());
        assert!(checked_len(0).unwrap_err().is_config());
        assert_eq!(checked_len(8).unwrap(), 8);
        assert_eq!(checked_len(MAX_ELEMENTS).unwrap() as usize, MAX_ELEMENTS);
        assert!(checked_len(MAX_ELEMENTS + 1).unwrap_err().is_config());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(SortPhase::Downloading.to_string(), "downloading");
        assert_eq!(SortPhase::NetworkDispatched.to_string(), "dispatching the network");
    }

    #[test]
    fn test_layouts_share_data_and_constant_slots() {
        let base = base_layout(64);
        let net = network_layout(64);
        assert_eq!(base.views, net.views);
        assert_eq!(base.constants, net.constants);
        assert!(base.resources.is_empty());
        assert_eq!(net.resources, &[COLUMN_SLOT]);
    }
}
