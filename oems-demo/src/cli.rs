use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use oems_sort::UploadMode;

/// Sort uniformly distributed random floats with the odd-even merge network
#[derive(Parser, Debug)]
#[command(name = "oems-demo", version, about)]
pub struct DemoArgs {
    /// Number of elements (e.g. 1Mi, 64Ki, 1M, 100K, 4096)
    #[arg(long, short = 'n', default_value = "1Mi", value_parser = parse_size)]
    pub count: usize,

    /// Device executing the kernels
    #[arg(long, value_enum, default_value_t = BackendKind::default())]
    pub backend: BackendKind,

    /// Kernel source file (defaults to the shaders shipped with oems-sort)
    #[arg(long)]
    pub kernel: Option<PathBuf>,

    /// JSON file with sorter settings; command-line flags override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// How the array reaches device memory
    #[arg(long, value_enum)]
    pub upload: Option<UploadArg>,

    /// Threads per thread group (power of two)
    #[arg(long)]
    pub threads_per_group: Option<u32>,

    /// Skip the binding checks before each dispatch
    #[arg(long)]
    pub no_validate: bool,

    /// Seed for the input data; random when omitted
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// CPU execution of the same kernels
    Host,
    /// Apple GPU (macOS only)
    Metal,
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            BackendKind::Metal
        } else {
            BackendKind::Host
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum UploadArg {
    /// Initial contents of the device buffer
    Initial,
    /// Staging buffer plus GPU copy
    Staging,
}

impl From<UploadArg> for UploadMode {
    fn from(arg: UploadArg) -> Self {
        match arg {
            UploadArg::Initial => UploadMode::InitialData,
            UploadArg::Staging => UploadMode::Staging,
        }
    }
}

/// Parse a human-readable element count.
///
/// - "1M" or "1m" -> 1_000_000, "100K" or "100k" -> 100_000
/// - "1Mi" -> 1_048_576, "64Ki" -> 65_536
/// - "1_000_000" -> 1_000_000
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let suffixes: [(&str, f64); 6] = [
        ("Mi", (1u64 << 20) as f64),
        ("Ki", (1u64 << 10) as f64),
        ("M", 1_000_000.0),
        ("m", 1_000_000.0),
        ("K", 1_000.0),
        ("k", 1_000.0),
    ];

    for (suffix, multiplier) in suffixes {
        if let Some(prefix) = s.strip_suffix(suffix) {
            let num: f64 = prefix
                .replace('_', "")
                .parse()
                .map_err(|e| format!("Invalid size '{}': {}", s, e))?;
            if !num.is_finite() || num < 0.0 {
                return Err(format!("Invalid size '{}': must be a non-negative number", s));
            }
            let size = num * multiplier;
            if size >= usize::MAX as f64 {
                return Err(format!("Invalid size '{}': too large", s));
            }
            return Ok(size as usize);
        }
    }

    s.replace('_', "")
        .parse::<usize>()
        .map_err(|e| format!("Invalid size '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_decimal_suffixes() {
        assert_eq!(parse_size("1M").unwrap(), 1_000_000);
        assert_eq!(parse_size("1m").unwrap(), 1_000_000);
        assert_eq!(parse_size("100K").unwrap(), 100_000);
        assert_eq!(parse_size("100k").unwrap(), 100_000);
        assert_eq!(parse_size("1.5K").unwrap(), 1_500);
    }

    #[test]
    fn test_parse_size_binary_suffixes() {
        assert_eq!(parse_size("1Mi").unwrap(), 1 << 20);
        assert_eq!(parse_size("64Ki").unwrap(), 1 << 16);
        assert_eq!(parse_size(" 16Mi ").unwrap(), 1 << 24);
    }

    #[test]
    fn test_parse_size_raw() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("1_048_576").unwrap(), 1 << 20);
    }

    #[test]
    fn test_parse_size_invalid() {
        assert!(parse_size("abc").is_err());
        assert!(parse_size("").is_err());
        assert!(parse_size("Mi").is_err());
        assert!(parse_size("-1K").is_err());
        assert!(parse_size("1e30M").is_err());
    }

    #[test]
    fn test_args_defaults() {
        let args = DemoArgs::try_parse_from(["oems-demo"]).unwrap();
        assert_eq!(args.count, 1 << 20);
        assert_eq!(args.backend, BackendKind::default());
        assert!(args.upload.is_none());
        assert!(!args.no_validate);
    }

    #[test]
    fn test_args_flags() {
        let args = DemoArgs::try_parse_from([
            "oems-demo",
            "--count",
            "64Ki",
            "--backend",
            "host",
            "--upload",
            "staging",
            "--no-validate",
            "--seed",
            "7",
        ])
        .unwrap();
        assert_eq!(args.count, 65_536);
        assert_eq!(args.backend, BackendKind::Host);
        assert_eq!(args.upload.map(UploadMode::from), Some(UploadMode::Staging));
        assert!(args.no_validate);
        assert_eq!(args.seed, Some(7));
    }
}
