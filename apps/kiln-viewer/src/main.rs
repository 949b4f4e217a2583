//! Kiln Engine Demo Viewer
//!
//! Uploads a cube through the transfer queue and draws it with a push-constant
//! MVP and per-frame uniform buffers bound through a descriptor aggregator.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p kiln-viewer -- [OPTIONS]
//! ```
//!
//! Shaders are compiled by `kiln-shaders` at build time, which needs the
//! Vulkan SDK (or cmake + ninja) for shaderc.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod viewer;

use std::path::PathBuf;

use anyhow::Context;
use kiln_app::{run_app, AppConfig};

use crate::viewer::Viewer;

/// Config file read from the working directory when `--config` is absent.
const DEFAULT_CONFIG: &str = "kiln.toml";

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let mut config = load_config(&args)?;
    if let Some(index) = flag_value(&args, "--device") {
        config.device_index = Some(
            index
                .parse()
                .with_context(|| format!("--device expects a number, got '{index}'"))?,
        );
    }

    run_app::<Viewer>(config)
}

fn load_config(args: &[String]) -> anyhow::Result<AppConfig> {
    if let Some(path) = flag_value(args, "--config") {
        return AppConfig::load(path).with_context(|| format!("loading {path}"));
    }

    let path = PathBuf::from(DEFAULT_CONFIG);
    if path.exists() {
        return AppConfig::load(&path).with_context(|| format!("loading {}", path.display()));
    }
    Ok(AppConfig::new("Kiln Viewer"))
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn print_help() {
    eprintln!(
        "Kiln Engine Demo Viewer

USAGE:
    cargo run -p kiln-viewer -- [OPTIONS]

OPTIONS:
    --config <PATH>     TOML config file (default: ./kiln.toml if present)
    --device <INDEX>    Use this GPU instead of asking when several qualify
    -h, --help          Print this help message

CONTROLS:
    W/A/S/D             Move
    Space / Shift       Up / down
    Escape              Toggle mouse look

ENVIRONMENT VARIABLES:
    RUST_LOG            Set log level (e.g., info, debug, trace)"
    );
}
