//! Software GPU device.
//!
//! Resources live in generation-checked arenas owned by the device; handles
//! carry an index plus generation, so a handle that outlives its resource is
//! reported as [`BackendError::StaleHandle`] instead of aliasing a recycled
//! slot. Dropping a handle releases its slot exactly once; a handle dropped
//! while the device is mid-map queues its release for the next operation.
//!
//! Kernels resolve by entry point to host implementations of the two sort
//! kernels and run thread by thread with the same indexing as the Metal
//! shaders, so every dispatch observes the bindings exactly as a GPU would.

use std::cell::{RefCell, RefMut};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use super::{BindPoint, BufferDesc, ElementFormat, GpuBackend, KernelLayout, ViewAccess};
use crate::error::BackendError;
use crate::network::{self, Column, BASE_GROUP};
use crate::sorter::{BASE_KERNEL, NETWORK_KERNEL};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ResourceId {
    index: u32,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    fn insert(&mut self, value: T) -> ResourceId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return ResourceId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        ResourceId {
            index,
            generation: 0,
        }
    }

    fn get(&self, id: ResourceId) -> Option<&T> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    fn get_mut(&mut self, id: ResourceId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    fn remove(&mut self, id: ResourceId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let value = slot.value.take()?;
        // Bumped on release so outstanding handles to this slot go stale.
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(value)
    }
}

struct BufferRecord {
    desc: BufferDesc,
    // Word storage keeps every buffer 4-byte aligned for the typed casts.
    words: Vec<u32>,
}

impl BufferRecord {
    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.desc.byte_length]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.desc.byte_length]
    }
}

#[derive(Clone, Copy)]
struct ViewRecord {
    buffer: ResourceId,
    format: ElementFormat,
    element_count: u32,
    access: ViewAccess,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HostProgram {
    /// Sorts each group of four elements.
    Base4,
    /// Executes one column of the merge network.
    Network,
}

#[derive(Clone, Copy)]
struct BoundKernel {
    program: HostProgram,
    layout: KernelLayout,
}

#[derive(Default)]
struct Bindings {
    kernel: Option<BoundKernel>,
    views: BTreeMap<u32, ResourceId>,
    resources: BTreeMap<u32, ResourceId>,
    constants: BTreeMap<u32, Vec<u8>>,
}

/// Counters exposed for lifecycle checks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostStats {
    pub buffers_allocated: u64,
    pub views_created: u64,
    pub live_buffers: usize,
    pub live_views: usize,
    pub dispatches: u64,
    pub copies: u64,
    pub maps: u64,
    /// Buffers or views released while still bound to a pipeline slot.
    pub released_while_bound: u64,
    /// Handles dropped while the device was busy (inside a map callback),
    /// released on the next device operation.
    pub deferred_releases: u64,
}

struct DeviceState {
    buffers: Arena<BufferRecord>,
    views: Arena<ViewRecord>,
    bindings: Bindings,
    stats: HostStats,
    removed: Option<String>,
    lose_device_at: Option<u64>,
}

impl DeviceState {
    fn check_alive(&self) -> Result<(), BackendError> {
        match self.removed {
            Some(_) => Err(BackendError::DeviceRemoved),
            None => Ok(()),
        }
    }

    fn is_buffer_bound(&self, buffer: ResourceId) -> bool {
        self.bindings
            .views
            .values()
            .chain(self.bindings.resources.values())
            .filter_map(|&view| self.views.get(view))
            .any(|view| view.buffer == buffer)
    }

    fn is_view_bound(&self, view: ResourceId) -> bool {
        self.bindings.views.values().any(|&id| id == view)
            || self.bindings.resources.values().any(|&id| id == view)
    }

    fn release_buffer(&mut self, id: ResourceId) {
        if self.is_buffer_bound(id) {
            self.stats.released_while_bound += 1;
        }
        self.buffers.remove(id);
    }

    fn release_view(&mut self, id: ResourceId) {
        if self.is_view_bound(id) {
            self.stats.released_while_bound += 1;
        }
        self.views.remove(id);
    }

    fn release(&mut self, release: Release) {
        match release {
            Release::Buffer(id) => self.release_buffer(id),
            Release::View(id) => self.release_view(id),
        }
    }

    fn constant_word(&self, slot: u32, word: usize) -> Result<u32, BackendError> {
        let data = self.bindings.constants.get(&slot).ok_or_else(|| {
            BackendError::Execution(format!("constant slot {slot} is unbound"))
        })?;
        let bytes: [u8; 4] = data
            .get(word * 4..word * 4 + 4)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| {
                BackendError::Execution(format!("constant slot {slot} has no word {word}"))
            })?;
        Ok(u32::from_ne_bytes(bytes))
    }

    fn bound_floats_mut(&mut self, slot: u32) -> Result<&mut [f32], BackendError> {
        let id = *self
            .bindings
            .views
            .get(&slot)
            .ok_or_else(|| BackendError::Execution(format!("view slot {slot} is unbound")))?;
        let view = *self.views.get(id).ok_or(BackendError::StaleHandle)?;
        if view.access != ViewAccess::ReadWrite || view.format != ElementFormat::F32 {
            return Err(BackendError::Execution(format!(
                "view slot {slot} is not a writable f32 view"
            )));
        }
        let record = self
            .buffers
            .get_mut(view.buffer)
            .ok_or(BackendError::StaleHandle)?;
        Ok(bytemuck::cast_slice_mut(
            &mut record.words[..view.element_count as usize],
        ))
    }

    fn bound_column(&self, slot: u32, index: u32) -> Result<Column, BackendError> {
        let id = *self
            .bindings
            .resources
            .get(&slot)
            .ok_or_else(|| BackendError::Execution(format!("resource slot {slot} is unbound")))?;
        let view = self.views.get(id).ok_or(BackendError::StaleHandle)?;
        if view.format.stride() != Column::SIZE {
            return Err(BackendError::Execution(format!(
                "resource slot {slot} stride {} is not a column buffer",
                view.format.stride()
            )));
        }
        let record = self
            .buffers
            .get(view.buffer)
            .ok_or(BackendError::StaleHandle)?;
        let bytes = &record.bytes()[..view.element_count as usize * Column::SIZE];
        let columns: &[Column] = bytemuck::try_cast_slice(bytes)
            .map_err(|e| BackendError::Execution(format!("column buffer: {e}")))?;
        columns.get(index as usize).copied().ok_or_else(|| {
            BackendError::Execution(format!(
                "column {index} out of range ({} columns)",
                columns.len()
            ))
        })
    }

    fn run_base(&mut self, layout: KernelLayout, threads: usize) -> Result<(), BackendError> {
        let constants = first_slot(layout.constants, "constant")?;
        let view = first_slot(layout.views, "view")?;
        let element_count = self.constant_word(constants, 0)? as usize;
        let data = self.bound_floats_mut(view)?;
        let limit = element_count
            .min(data.len())
            .min(threads.saturating_mul(BASE_GROUP));
        network::sort_groups_of_four(&mut data[..limit]);
        Ok(())
    }

    fn run_network(&mut self, layout: KernelLayout, threads: usize) -> Result<(), BackendError> {
        let constants = first_slot(layout.constants, "constant")?;
        let view = first_slot(layout.views, "view")?;
        let resource = first_slot(layout.resources, "resource")?;
        let element_count = self.constant_word(constants, 0)? as usize;
        let column_index = self.constant_word(constants, 1)?;
        let column = self.bound_column(resource, column_index)?;

        let data = self.bound_floats_mut(view)?;
        let len = element_count.min(data.len());
        let data = &mut data[..len];
        for thread in 0..threads.min(column.comparison_count()) {
            let (left, right) = column.pair(thread);
            network::compare_and_swap(data, left, right);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), BackendError> {
        let bound = self
            .bindings
            .kernel
            .ok_or_else(|| BackendError::Validation("no kernel bound".into()))?;

        let mut written = Vec::new();
        for &slot in bound.layout.views {
            let view = self.validate_slot(&self.bindings.views, slot, "view", ViewAccess::ReadWrite)?;
            written.push(view.buffer);
        }
        for &slot in bound.layout.resources {
            let view = self.validate_slot(
                &self.bindings.resources,
                slot,
                "resource",
                ViewAccess::ReadOnly,
            )?;
            if written.contains(&view.buffer) {
                return Err(BackendError::Validation(format!(
                    "resource slot {slot} aliases a buffer bound for writing"
                )));
            }
        }
        for &slot in bound.layout.constants {
            match self.bindings.constants.get(&slot) {
                Some(data) if !data.is_empty() => {}
                _ => {
                    return Err(BackendError::Validation(format!(
                        "constant slot {slot} is unbound"
                    )))
                }
            }
        }
        Ok(())
    }

    fn validate_slot(
        &self,
        slots: &BTreeMap<u32, ResourceId>,
        slot: u32,
        kind: &str,
        access: ViewAccess,
    ) -> Result<ViewRecord, BackendError> {
        let id = slots
            .get(&slot)
            .ok_or_else(|| BackendError::Validation(format!("{kind} slot {slot} is unbound")))?;
        let view = self.views.get(*id).ok_or_else(|| {
            BackendError::Validation(format!("{kind} slot {slot} holds a released view"))
        })?;
        if view.access != access {
            return Err(BackendError::Validation(format!(
                "{kind} slot {slot} holds a {:?} view",
                view.access
            )));
        }
        if self.buffers.get(view.buffer).is_none() {
            return Err(BackendError::Validation(format!(
                "{kind} slot {slot} views a released buffer"
            )));
        }
        Ok(*view)
    }
}

fn first_slot(slots: &[u32], kind: &str) -> Result<u32, BackendError> {
    slots
        .first()
        .copied()
        .ok_or_else(|| BackendError::Execution(format!("kernel layout has no {kind} slot")))
}

/// Whether `source` declares `kernel void <entry_point>(`.
fn declares_kernel(source: &str, entry_point: &str) -> bool {
    let tokens: Vec<&str> = source.split_whitespace().collect();
    tokens.windows(3).any(|window| {
        window[0] == "kernel"
            && window[1] == "void"
            && (window[2] == entry_point
                || window[2]
                    .strip_prefix(entry_point)
                    .is_some_and(|rest| rest.starts_with('(')))
    })
}

pub struct HostKernel {
    program: HostProgram,
    layout: KernelLayout,
    entry_point: String,
}

impl HostKernel {
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }
}

#[derive(Clone, Copy, Debug)]
enum Release {
    Buffer(ResourceId),
    View(ResourceId),
}

/// Back-reference from a handle to the device that owns its slot.
struct Releaser {
    state: Weak<RefCell<DeviceState>>,
    deferred: Weak<RefCell<Vec<Release>>>,
}

impl Releaser {
    /// Release now, or queue the release when the device is borrowed.
    fn release(&self, release: Release) {
        let Some(device) = self.state.upgrade() else {
            return;
        };
        match device.try_borrow_mut() {
            Ok(mut state) => state.release(release),
            Err(_) => {
                if let Some(deferred) = self.deferred.upgrade() {
                    deferred.borrow_mut().push(release);
                }
            }
        };
    }
}

pub struct HostBuffer {
    id: ResourceId,
    desc: BufferDesc,
    releaser: Releaser,
}

impl HostBuffer {
    pub fn desc(&self) -> BufferDesc {
        self.desc
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        self.releaser.release(Release::Buffer(self.id));
    }
}

pub struct HostView {
    id: ResourceId,
    element_count: u32,
    releaser: Releaser,
}

impl HostView {
    pub fn element_count(&self) -> u32 {
        self.element_count
    }
}

impl Drop for HostView {
    fn drop(&mut self) {
        self.releaser.release(Release::View(self.id));
    }
}

/// CPU implementation of [`GpuBackend`].
///
/// Not `Send`: each sorter owns its own device, and independent devices
/// share nothing.
pub struct HostBackend {
    state: Rc<RefCell<DeviceState>>,
    deferred: Rc<RefCell<Vec<Release>>>,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    pub fn new() -> Self {
        tracing::debug!("creating host backend");
        Self {
            state: Rc::new(RefCell::new(DeviceState {
                buffers: Arena::new(),
                views: Arena::new(),
                bindings: Bindings::default(),
                stats: HostStats::default(),
                removed: None,
                lose_device_at: None,
            })),
            deferred: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Borrow the device, first applying releases queued while it was busy.
    fn state_mut(&self) -> RefMut<'_, DeviceState> {
        let mut state = self.state.borrow_mut();
        let pending = std::mem::take(&mut *self.deferred.borrow_mut());
        for release in pending {
            state.stats.deferred_releases += 1;
            state.release(release);
        }
        state
    }

    fn releaser(&self) -> Releaser {
        Releaser {
            state: Rc::downgrade(&self.state),
            deferred: Rc::downgrade(&self.deferred),
        }
    }

    /// Snapshot of the device counters.
    pub fn stats(&self) -> HostStats {
        let state = self.state_mut();
        HostStats {
            live_buffers: state.buffers.live,
            live_views: state.views.live,
            ..state.stats
        }
    }

    /// Remove the device once `dispatches` more dispatches have been queued.
    ///
    /// Like a hung GPU, the loss is only observed by the operations that
    /// follow it; `0` removes the device immediately.
    pub fn inject_device_loss_after(&self, dispatches: u64) {
        let mut state = self.state_mut();
        let at = state.stats.dispatches + dispatches;
        if dispatches == 0 {
            state.removed = Some(format!("device lost after {at} dispatches"));
        } else {
            state.lose_device_at = Some(at);
        }
    }
}

impl GpuBackend for HostBackend {
    type Kernel = HostKernel;
    type Buffer = HostBuffer;
    type View = HostView;

    fn name(&self) -> &'static str {
        "host"
    }

    fn compile_kernel(
        &self,
        source: &str,
        entry_point: &str,
        layout: KernelLayout,
    ) -> Result<HostKernel, BackendError> {
        let compile_error = |diagnostic: String| BackendError::Compile { diagnostic };
        if source.trim().is_empty() {
            return Err(compile_error("kernel source is empty".into()));
        }
        if !declares_kernel(source, entry_point) {
            return Err(compile_error(format!(
                "entry point '{entry_point}' is not declared as a kernel"
            )));
        }
        if layout.threads_per_group == 0 {
            return Err(compile_error(format!(
                "entry point '{entry_point}' needs a non-zero thread group size"
            )));
        }
        let program = match entry_point {
            BASE_KERNEL => HostProgram::Base4,
            NETWORK_KERNEL => HostProgram::Network,
            other => {
                return Err(compile_error(format!(
                    "no host implementation for entry point '{other}'"
                )))
            }
        };
        Ok(HostKernel {
            program,
            layout,
            entry_point: entry_point.to_string(),
        })
    }

    fn allocate_buffer(
        &self,
        desc: BufferDesc,
        initial_data: Option<&[u8]>,
    ) -> Result<HostBuffer, BackendError> {
        let mut state = self.state_mut();
        state.check_alive()?;

        desc.check_allocation(initial_data)?;

        let mut words = vec![0u32; desc.byte_length.div_ceil(4)];
        if let Some(data) = initial_data {
            bytemuck::cast_slice_mut::<u32, u8>(&mut words)[..data.len()].copy_from_slice(data);
        }
        let id = state.buffers.insert(BufferRecord { desc, words });
        state.stats.buffers_allocated += 1;

        Ok(HostBuffer {
            id,
            desc,
            releaser: self.releaser(),
        })
    }

    fn create_view(
        &self,
        buffer: &HostBuffer,
        format: ElementFormat,
        element_count: u32,
        access: ViewAccess,
    ) -> Result<HostView, BackendError> {
        let mut state = self.state_mut();
        state.check_alive()?;

        state
            .buffers
            .get(buffer.id)
            .ok_or(BackendError::StaleHandle)?
            .desc
            .check_view(format, element_count, access)?;

        let id = state.views.insert(ViewRecord {
            buffer: buffer.id,
            format,
            element_count,
            access,
        });
        state.stats.views_created += 1;

        Ok(HostView {
            id,
            element_count,
            releaser: self.releaser(),
        })
    }

    fn copy_buffer(&self, dst: &HostBuffer, src: &HostBuffer) -> Result<(), BackendError> {
        let mut state = self.state_mut();
        state.check_alive()?;
        if dst.id == src.id {
            return Err(BackendError::InvalidUsage("copy onto itself".into()));
        }

        let source = state
            .buffers
            .get(src.id)
            .ok_or(BackendError::StaleHandle)?
            .words
            .clone();
        let target = state
            .buffers
            .get_mut(dst.id)
            .ok_or(BackendError::StaleHandle)?;
        if target.words.len() != source.len() || target.desc.byte_length != src.desc.byte_length {
            return Err(BackendError::InvalidUsage(format!(
                "copy between {} and {} byte buffers",
                src.desc.byte_length, target.desc.byte_length
            )));
        }
        target.words.copy_from_slice(&source);
        state.stats.copies += 1;
        Ok(())
    }

    fn map_for_write(
        &self,
        buffer: &HostBuffer,
        write: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), BackendError> {
        let mut state = self.state_mut();
        state.check_alive()?;
        let record = state
            .buffers
            .get_mut(buffer.id)
            .ok_or(BackendError::StaleHandle)?;
        record.desc.check_map_write()?;
        write(record.bytes_mut());
        state.stats.maps += 1;
        Ok(())
    }

    fn map_for_read(
        &self,
        buffer: &HostBuffer,
        read: &mut dyn FnMut(&[u8]),
    ) -> Result<(), BackendError> {
        let mut state = self.state_mut();
        state.check_alive()?;
        let record = state.buffers.get(buffer.id).ok_or(BackendError::StaleHandle)?;
        record.desc.check_map_read()?;
        read(record.bytes());
        state.stats.maps += 1;
        Ok(())
    }

    fn bind_kernel(&self, kernel: &HostKernel) {
        self.state_mut().bindings.kernel = Some(BoundKernel {
            program: kernel.program,
            layout: kernel.layout,
        });
    }

    fn bind_view(&self, slot: u32, view: &HostView) {
        self.state_mut().bindings.views.insert(slot, view.id);
    }

    fn bind_resource(&self, slot: u32, resource: &HostView) {
        self.state_mut().bindings.resources.insert(slot, resource.id);
    }

    fn set_constants(&self, slot: u32, data: &[u8]) {
        self.state_mut().bindings.constants.insert(slot, data.to_vec());
    }

    fn unbind(&self, point: BindPoint) {
        let mut state = self.state_mut();
        match point {
            BindPoint::View(slot) => {
                state.bindings.views.remove(&slot);
            }
            BindPoint::Resource(slot) => {
                state.bindings.resources.remove(&slot);
            }
            BindPoint::Constants(slot) => {
                state.bindings.constants.remove(&slot);
            }
        }
    }

    fn dispatch(&self, x: u32, y: u32, z: u32) -> Result<(), BackendError> {
        let mut state = self.state_mut();
        state.check_alive()?;
        let bound = state
            .bindings
            .kernel
            .ok_or_else(|| BackendError::Execution("dispatch without a bound kernel".into()))?;

        let groups = u64::from(x) * u64::from(y) * u64::from(z);
        let threads = groups.saturating_mul(u64::from(bound.layout.threads_per_group));
        let threads = usize::try_from(threads).unwrap_or(usize::MAX);
        match bound.program {
            HostProgram::Base4 => state.run_base(bound.layout, threads)?,
            HostProgram::Network => state.run_network(bound.layout, threads)?,
        }

        state.stats.dispatches += 1;
        if state.lose_device_at == Some(state.stats.dispatches) {
            let reason = format!("device lost after {} dispatches", state.stats.dispatches);
            tracing::warn!(%reason, "host backend removing device");
            state.removed = Some(reason);
        }
        Ok(())
    }

    fn validate_dispatch(&self) -> Result<(), BackendError> {
        self.state.borrow().validate()
    }

    fn device_removed_reason(&self) -> Option<String> {
        self.state.borrow().removed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuAccess;

    const SOURCE: &str = "kernel void oems_base_4(device float* data [[buffer(0)]])\n\
                          kernel void oems_network (device float* data [[buffer(0)]])";

    const BASE_LAYOUT: KernelLayout = KernelLayout {
        views: &[0],
        resources: &[],
        constants: &[0],
        threads_per_group: 4,
    };

    fn floats_to_bytes(data: &[f32]) -> Vec<u8> {
        bytemuck::cast_slice(data).to_vec()
    }

    fn read_back(backend: &HostBackend, buffer: &HostBuffer) -> Vec<f32> {
        let staging = backend
            .allocate_buffer(
                BufferDesc::staging(buffer.desc().byte_length, CpuAccess::READ),
                None,
            )
            .unwrap();
        backend.copy_buffer(&staging, buffer).unwrap();
        let mut out = Vec::new();
        backend
            .map_for_read(&staging, &mut |bytes: &[u8]| {
                out = bytes
                    .chunks_exact(4)
                    .map(|word| f32::from_ne_bytes([word[0], word[1], word[2], word[3]]))
                    .collect();
            })
            .unwrap();
        out
    }

    #[test]
    fn test_arena_generation_invalidates_old_ids() {
        let mut arena = Arena::new();
        let first = arena.insert(1);
        assert_eq!(arena.remove(first), Some(1));
        let second = arena.insert(2);
        assert_eq!(first.index, second.index);
        assert_ne!(first.generation, second.generation);
        assert_eq!(arena.get(first), None);
        assert_eq!(arena.get(second), Some(&2));
        assert_eq!(arena.remove(first), None);
        assert_eq!(arena.live, 1);
    }

    #[test]
    fn test_compile_diagnostics() {
        let backend = HostBackend::new();
        assert!(backend.compile_kernel(SOURCE, BASE_KERNEL, BASE_LAYOUT).is_ok());
        assert!(backend.compile_kernel(SOURCE, NETWORK_KERNEL, BASE_LAYOUT).is_ok());

        match backend.compile_kernel("   \n", BASE_KERNEL, BASE_LAYOUT) {
            Err(BackendError::Compile { diagnostic }) => assert!(diagnostic.contains("empty")),
            other => panic!("expected compile error, got {:?}", other.err()),
        }
        match backend.compile_kernel(SOURCE, "oems_base", BASE_LAYOUT) {
            Err(BackendError::Compile { diagnostic }) => {
                assert!(diagnostic.contains("oems_base"))
            }
            other => panic!("expected compile error, got {:?}", other.err()),
        }
        let unknown = "kernel void mystery(device float* data)";
        assert!(matches!(
            backend.compile_kernel(unknown, "mystery", BASE_LAYOUT),
            Err(BackendError::Compile { .. })
        ));
    }

    #[test]
    fn test_default_buffers_reject_mapping() {
        let backend = HostBackend::new();
        let buffer = backend
            .allocate_buffer(BufferDesc::device(16), Some(&[0u8; 16]))
            .unwrap();
        assert!(matches!(
            backend.map_for_write(&buffer, &mut |_: &mut [u8]| {}),
            Err(BackendError::InvalidUsage(_))
        ));
        assert!(matches!(
            backend.map_for_read(&buffer, &mut |_: &[u8]| {}),
            Err(BackendError::InvalidUsage(_))
        ));
        assert!(matches!(
            backend.allocate_buffer(BufferDesc::device(16), Some(&[0u8; 8])),
            Err(BackendError::InvalidUsage(_))
        ));
    }

    #[test]
    fn test_view_of_released_buffer_is_stale() {
        let backend = HostBackend::new();
        let buffer = backend.allocate_buffer(BufferDesc::device(32), None).unwrap();
        let view = backend
            .create_view(&buffer, ElementFormat::F32, 8, ViewAccess::ReadWrite)
            .unwrap();
        drop(buffer);
        let kernel = backend.compile_kernel(SOURCE, BASE_KERNEL, BASE_LAYOUT).unwrap();
        backend.bind_kernel(&kernel);
        backend.bind_view(0, &view);
        backend.set_constants(0, bytemuck::bytes_of(&[8u32, 0, 0, 0]));
        assert!(matches!(
            backend.validate_dispatch(),
            Err(BackendError::Validation(_))
        ));
        assert!(matches!(
            backend.dispatch(1, 1, 1),
            Err(BackendError::StaleHandle)
        ));
        backend.unbind(BindPoint::View(0));
        drop(view);
        assert_eq!(backend.stats().live_views, 0);
        assert_eq!(backend.stats().released_while_bound, 0);
    }

    #[test]
    fn test_release_while_bound_is_counted() {
        let backend = HostBackend::new();
        let buffer = backend.allocate_buffer(BufferDesc::device(32), None).unwrap();
        let view = backend
            .create_view(&buffer, ElementFormat::F32, 8, ViewAccess::ReadWrite)
            .unwrap();
        backend.bind_view(0, &view);
        drop(view);
        assert_eq!(backend.stats().released_while_bound, 1);
    }

    #[test]
    fn test_handles_dropped_during_map_are_released_later() {
        let backend = HostBackend::new();
        let staging = backend
            .allocate_buffer(BufferDesc::staging(16, CpuAccess::WRITE), None)
            .unwrap();
        let device = backend.allocate_buffer(BufferDesc::device(16), None).unwrap();
        let view = backend
            .create_view(&device, ElementFormat::F32, 4, ViewAccess::ReadWrite)
            .unwrap();

        let mut held = Some((view, device));
        backend
            .map_for_write(&staging, &mut |bytes: &mut [u8]| {
                bytes.fill(0);
                held.take();
            })
            .unwrap();
        assert!(held.is_none());

        let stats = backend.stats();
        assert_eq!(stats.deferred_releases, 2);
        assert_eq!(stats.live_views, 0);
        assert_eq!(stats.live_buffers, 1);

        drop(staging);
        let stats = backend.stats();
        assert_eq!(stats.live_buffers, 0);
        assert_eq!(stats.deferred_releases, 2);
    }

    #[test]
    fn test_base_kernel_sorts_dispatched_groups_only() {
        let backend = HostBackend::new();
        let data = [4.0f32, 3.0, 2.0, 1.0, 8.0, 7.0, 6.0, 5.0, 12.0, 11.0, 10.0, 9.0];
        let buffer = backend
            .allocate_buffer(BufferDesc::device(48), Some(&floats_to_bytes(&data)))
            .unwrap();
        let view = backend
            .create_view(&buffer, ElementFormat::F32, 12, ViewAccess::ReadWrite)
            .unwrap();
        let layout = KernelLayout {
            threads_per_group: 2,
            ..BASE_LAYOUT
        };
        let kernel = backend.compile_kernel(SOURCE, BASE_KERNEL, layout).unwrap();
        backend.bind_kernel(&kernel);
        backend.bind_view(0, &view);
        backend.set_constants(0, bytemuck::bytes_of(&[12u32, 0, 0, 0]));
        backend.validate_dispatch().unwrap();
        // One group of two threads covers the first eight elements.
        backend.dispatch(1, 1, 1).unwrap();
        backend.unbind(BindPoint::View(0));

        assert_eq!(
            read_back(&backend, &buffer),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 12.0, 11.0, 10.0, 9.0]
        );
    }

    #[test]
    fn test_validation_rejects_aliased_resource() {
        let backend = HostBackend::new();
        let layout = KernelLayout {
            views: &[0],
            resources: &[0],
            constants: &[0],
            threads_per_group: 4,
        };
        let kernel = backend.compile_kernel(SOURCE, NETWORK_KERNEL, layout).unwrap();
        let buffer = backend.allocate_buffer(BufferDesc::device(40), None).unwrap();
        let rw = backend
            .create_view(&buffer, ElementFormat::F32, 10, ViewAccess::ReadWrite)
            .unwrap();
        let ro = backend
            .create_view(
                &buffer,
                ElementFormat::Structured { stride: 20 },
                2,
                ViewAccess::ReadOnly,
            )
            .unwrap();
        backend.bind_kernel(&kernel);
        backend.set_constants(0, &[0u8; 16]);
        backend.bind_view(0, &rw);
        match backend.validate_dispatch() {
            Err(BackendError::Validation(msg)) => assert!(msg.contains("resource slot 0")),
            other => panic!("expected validation error, got {other:?}"),
        }
        backend.bind_resource(0, &ro);
        match backend.validate_dispatch() {
            Err(BackendError::Validation(msg)) => assert!(msg.contains("aliases")),
            other => panic!("expected validation error, got {other:?}"),
        }
        backend.unbind(BindPoint::View(0));
        backend.unbind(BindPoint::Resource(0));
    }

    #[test]
    fn test_injected_loss_surfaces_after_dispatch() {
        let backend = HostBackend::new();
        let kernel = backend.compile_kernel(SOURCE, BASE_KERNEL, BASE_LAYOUT).unwrap();
        let buffer = backend.allocate_buffer(BufferDesc::device(32), None).unwrap();
        let view = backend
            .create_view(&buffer, ElementFormat::F32, 8, ViewAccess::ReadWrite)
            .unwrap();
        backend.bind_kernel(&kernel);
        backend.bind_view(0, &view);
        backend.set_constants(0, bytemuck::bytes_of(&[8u32, 0, 0, 0]));

        backend.inject_device_loss_after(2);
        assert!(backend.dispatch(1, 1, 1).is_ok());
        assert_eq!(backend.device_removed_reason(), None);
        assert!(backend.dispatch(1, 1, 1).is_ok());
        assert!(backend.device_removed_reason().is_some());
        assert!(matches!(
            backend.dispatch(1, 1, 1),
            Err(BackendError::DeviceRemoved)
        ));
        assert!(matches!(
            backend.allocate_buffer(BufferDesc::device(4), None),
            Err(BackendError::DeviceRemoved)
        ));
        backend.unbind(BindPoint::View(0));
    }

    #[test]
    fn test_backends_are_isolated() {
        let a = HostBackend::new();
        let b = HostBackend::new();
        let _buffer = a.allocate_buffer(BufferDesc::device(8), None).unwrap();
        assert_eq!(a.stats().live_buffers, 1);
        assert_eq!(b.stats().live_buffers, 0);
    }
}
