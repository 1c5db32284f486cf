//! Sorts random floats in [-100, 100] and checks the result.
//!
//! Usage: `oems-demo [--count 1Mi] [--backend host|metal] [--upload initial|staging]`

mod cli;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use cli::{BackendKind, DemoArgs};
use oems_sort::error::report;
use oems_sort::{
    BackendError, GpuBackend, HostBackend, OemsSorter, SortError, SorterConfig, MAX_ELEMENTS,
};

#[derive(Debug, thiserror::Error)]
enum DemoError {
    #[error("cannot read sorter config {}", .path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid sorter config {}", .path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot open the {backend} device")]
    Device {
        backend: &'static str,
        #[source]
        source: BackendError,
    },
    #[error("sort failed")]
    Sort(#[from] SortError),
    #[error("{count} elements exceed the {max} element limit")]
    TooMany { count: usize, max: usize },
    #[error("result out of order at index {index}: {left} > {right}")]
    Unsorted { index: usize, left: f32, right: f32 },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,oems_sort=debug"));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn load_config(args: &DemoArgs) -> Result<SorterConfig, DemoError> {
    let mut config = match &args.config {
        Some(path) => read_config(path)?,
        None => SorterConfig::default(),
    };
    if let Some(kernel) = &args.kernel {
        config.kernel_path = kernel.clone();
    }
    if let Some(upload) = args.upload {
        config.upload_mode = upload.into();
    }
    if let Some(threads) = args.threads_per_group {
        config.threads_per_group = threads;
    }
    if args.no_validate {
        config.validate_dispatch = false;
    }
    Ok(config)
}

fn read_config(path: &Path) -> Result<SorterConfig, DemoError> {
    let text = std::fs::read_to_string(path).map_err(|source| DemoError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| DemoError::ConfigParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Reject counts the sorter can never accept before allocating the input.
fn check_count(count: usize) -> Result<(), DemoError> {
    if count > MAX_ELEMENTS {
        return Err(DemoError::TooMany {
            count,
            max: MAX_ELEMENTS,
        });
    }
    Ok(())
}

fn random_data(count: usize, seed: u64) -> Vec<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..count).map(|_| rng.gen_range(-100.0f32..=100.0)).collect()
}

fn sort_on<B: GpuBackend>(
    backend: B,
    config: SorterConfig,
    data: &mut [f32],
) -> Result<Duration, SortError> {
    let backend_name = backend.name();
    let mut sorter = OemsSorter::new(backend, config)?;
    let start = Instant::now();
    sorter.sort(data)?;
    let elapsed = start.elapsed();
    info!(backend = backend_name, ?elapsed, "sort finished");
    Ok(elapsed)
}

fn check_sorted(data: &[f32]) -> Result<(), DemoError> {
    match data.windows(2).position(|w| w[0] > w[1]) {
        Some(index) => Err(DemoError::Unsorted {
            index,
            left: data[index],
            right: data[index + 1],
        }),
        None => Ok(()),
    }
}

fn run(args: &DemoArgs) -> Result<(), DemoError> {
    check_count(args.count)?;
    let config = load_config(args)?;
    let seed = args.seed.unwrap_or_else(|| rand::thread_rng().gen());
    if !args.count.is_power_of_two() {
        warn!(count = args.count, "only power-of-two sizes are guaranteed to sort");
    }

    let mut data = random_data(args.count, seed);
    info!(count = args.count, seed, kernel = %config.kernel_path.display(), "generated input");

    let elapsed = match args.backend {
        BackendKind::Host => sort_on(HostBackend::new(), config, &mut data)?,
        #[cfg(target_os = "macos")]
        BackendKind::Metal => {
            let backend = oems_sort::MetalBackend::new().map_err(|source| DemoError::Device {
                backend: "metal",
                source,
            })?;
            sort_on(backend, config, &mut data)?
        }
        #[cfg(not(target_os = "macos"))]
        BackendKind::Metal => {
            return Err(DemoError::Device {
                backend: "metal",
                source: BackendError::DeviceNotFound("Metal is only available on macOS".into()),
            })
        }
    };

    check_sorted(&data)?;
    let rate = args.count as f64 / elapsed.as_secs_f64().max(f64::EPSILON) / 1.0e6;
    println!(
        "sorted {} floats in {:.3} ms ({:.1} Melem/s)",
        args.count,
        elapsed.as_secs_f64() * 1.0e3,
        rate
    );
    if let (Some(first), Some(last)) = (data.first(), data.last()) {
        println!("min {first:.4}  max {last:.4}");
    }
    Ok(())
}

fn main() -> ExitCode {
    init_logging();
    let args = DemoArgs::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("----- Exception -----");
            eprint!("{}", report(&err));
            ExitCode::FAILURE
        }
    }
}
