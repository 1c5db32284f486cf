mod common;

use common::assert_bits_eq;
use oems_sort::backend::GpuBackend;
use oems_sort::pipeline;
use oems_sort::{BackendError, HostBackend, UploadMode};

fn mixed_values(seed: u64, n: usize) -> Vec<f32> {
    let mut rng = common::seeded_rng(seed);
    let mut data = common::uniform_floats(&mut rng, n, -100.0, 100.0);
    // Duplicates, negative zero and non-finite values must survive untouched.
    for i in (0..n).step_by(7) {
        data[i] = -3.5;
    }
    data[1] = -0.0;
    data[2] = f32::NAN;
    data[3] = f32::NEG_INFINITY;
    data
}

#[test]
fn test_roundtrip_both_upload_modes() {
    for mode in [UploadMode::InitialData, UploadMode::Staging] {
        for n in [8usize, 13, 1000, 4096] {
            let backend = HostBackend::new();
            let data = mixed_values(n as u64, n);
            let buffer = pipeline::upload(&backend, &data, mode).unwrap();
            assert_eq!(buffer.element_count() as usize, n);
            assert_eq!(buffer.byte_length(), n * 4);

            let mut out = vec![0.0f32; n];
            pipeline::download(&backend, &buffer, &mut out).unwrap();
            assert_bits_eq(&out, &data);
        }
    }
}

#[test]
fn test_staging_released_within_call() {
    let backend = HostBackend::new();
    let data = mixed_values(1, 64);
    let buffer = pipeline::upload(&backend, &data, UploadMode::Staging).unwrap();
    assert_eq!(backend.stats().live_buffers, 1);

    let mut out = vec![0.0f32; 64];
    pipeline::download(&backend, &buffer, &mut out).unwrap();
    let stats = backend.stats();
    assert_eq!(stats.live_buffers, 1);
    // staging + device on upload, staging on download
    assert_eq!(stats.buffers_allocated, 3);
    assert_eq!(stats.copies, 2);
    drop(buffer);
    assert_eq!(backend.stats().live_buffers, 0);
}

#[test]
fn test_download_length_mismatch() {
    let backend = HostBackend::new();
    let buffer = pipeline::upload(&backend, &[1.0f32; 16], UploadMode::InitialData).unwrap();
    let mut out = vec![0.0f32; 15];
    assert!(matches!(
        pipeline::download(&backend, &buffer, &mut out),
        Err(BackendError::InvalidUsage(_))
    ));
}

#[test]
fn test_empty_upload_rejected() {
    let backend = HostBackend::new();
    assert!(matches!(
        pipeline::upload(&backend, &[], UploadMode::InitialData),
        Err(BackendError::InvalidUsage(_))
    ));
    assert_eq!(backend.stats().buffers_allocated, 0);
}

#[test]
fn test_view_covers_whole_buffer() {
    let backend = HostBackend::new();
    let buffer = pipeline::upload(&backend, &[2.0f32; 32], UploadMode::InitialData).unwrap();
    let view = pipeline::create_view(&backend, &buffer).unwrap();
    assert_eq!(view.element_count(), 32);
    assert_eq!(backend.name(), "host");
}

#[test]
fn test_download_after_device_loss() {
    let backend = HostBackend::new();
    let buffer = pipeline::upload(&backend, &[1.0f32; 8], UploadMode::InitialData).unwrap();
    backend.inject_device_loss_after(0);
    let mut out = vec![0.0f32; 8];
    assert!(matches!(
        pipeline::download(&backend, &buffer, &mut out),
        Err(BackendError::DeviceRemoved)
    ));
    assert!(backend.device_removed_reason().is_some());
}
