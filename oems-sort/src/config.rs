use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Kernel source shipped with the crate.
pub const DEFAULT_KERNEL_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/oems.metal");

/// Threads per group both kernels are written for.
pub const DEFAULT_THREADS_PER_GROUP: u32 = 64;

/// How the input array reaches device memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    /// Pass the array as the buffer's initial contents.
    #[default]
    InitialData,
    /// Write a host-visible staging buffer, then copy it on the GPU.
    Staging,
}

/// Construction-time settings of an [`OemsSorter`](crate::OemsSorter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SorterConfig {
    pub kernel_path: PathBuf,
    pub upload_mode: UploadMode,
    /// Check pipeline bindings before every dispatch.
    pub validate_dispatch: bool,
    pub threads_per_group: u32,
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            kernel_path: PathBuf::from(DEFAULT_KERNEL_PATH),
            upload_mode: UploadMode::default(),
            validate_dispatch: cfg!(debug_assertions),
            threads_per_group: DEFAULT_THREADS_PER_GROUP,
        }
    }
}

impl SorterConfig {
    pub fn new(kernel_path: impl AsRef<Path>) -> Self {
        Self {
            kernel_path: kernel_path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn with_upload_mode(mut self, mode: UploadMode) -> Self {
        self.upload_mode = mode;
        self
    }

    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validate_dispatch = enabled;
        self
    }

    pub fn with_threads_per_group(mut self, threads: u32) -> Self {
        self.threads_per_group = threads;
        self
    }
}
