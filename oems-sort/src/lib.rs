//! GPU odd-even merge sort for `f32` arrays.
//!
//! ```no_run
//! use oems_sort::{HostBackend, OemsSorter, SorterConfig};
//!
//! let mut sorter = OemsSorter::new(HostBackend::new(), SorterConfig::default())?;
//! let mut data = vec![5.0, 3.0, 8.0, 1.0, 9.0, 2.0, 7.0, 4.0];
//! sorter.sort(&mut data)?;
//! assert_eq!(data, [1.0, 2.0, 3.0, 4.0, 5.0, 7.0, 8.0, 9.0]);
//! # Ok::<(), oems_sort::SortError>(())
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod network;
pub mod pipeline;
pub mod sorter;

pub use backend::{GpuBackend, HostBackend, HostStats};
#[cfg(target_os = "macos")]
pub use backend::MetalBackend;
pub use config::{SorterConfig, UploadMode};
pub use error::{BackendError, SortError};
pub use network::{Column, NetworkPlan};
pub use sorter::{OemsSorter, SortPhase, MAX_ELEMENTS, MIN_ELEMENTS};
