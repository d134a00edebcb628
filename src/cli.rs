use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::ffi::{CStr, c_int};
use std::path::PathBuf;

use crate::config::BridgeConfig;
use crate::error::InteropError;
use crate::ffi;
use crate::geometry::{self, Point};
use crate::header::HeaderGenerator;
use crate::layout::BoundaryContract;
use crate::manifest::ManifestGenerator;
use crate::ownership::{self, CellRegistry, Origin, OwnedCell};
use crate::telemetry::{self, LogFormat, TelemetryConfig};

const CRATE_NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Parser)]
#[command(name = "ffibridge")]
#[command(about = "Geometry and ownership-handoff bridge across the C ABI")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args)]
pub struct GlobalArgs {
    /// Path to a JSON config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the distance between two points, computed through the C ABI
    Dist {
        #[arg(long, allow_negative_numbers = true)]
        x1: Option<c_int>,
        #[arg(long, allow_negative_numbers = true)]
        y1: Option<c_int>,
        #[arg(long, allow_negative_numbers = true)]
        x2: Option<c_int>,
        #[arg(long, allow_negative_numbers = true)]
        y2: Option<c_int>,

        /// Fractional digits in the output
        #[arg(long)]
        precision: Option<usize>,
    },

    /// Allocate a cell, hand it over and release it through its destructor
    Ownership {
        /// Value stored in the cell
        #[arg(long, allow_negative_numbers = true)]
        value: Option<c_int>,

        /// Heap the cell is allocated from
        #[arg(long, value_enum)]
        origin: Option<Origin>,

        /// Release the same cell twice through the C ABI
        #[arg(long, conflicts_with = "simulate_mismatch")]
        simulate_double_free: bool,

        /// Release the cell through the other heap's destructor first
        #[arg(long)]
        simulate_mismatch: bool,
    },

    /// Write the JSON boundary manifest, or validate an existing one
    Manifest {
        /// Output path (defaults to .ffibridge/<target>/ffibridge-manifest.json)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Target triple recorded in the manifest
        #[arg(long)]
        target: Option<String>,

        /// Headers to list in the manifest
        #[arg(long)]
        header: Vec<PathBuf>,

        /// Validate this manifest against the current build instead of writing one
        #[arg(long, conflicts_with_all = ["output", "target", "header"])]
        validate: Option<PathBuf>,
    },

    /// Write the C header for the exported ABI
    Header {
        #[arg(long, default_value = "include/ffibridge.h")]
        output: PathBuf,
    },

    /// Check the toolchain and print the boundary contract
    Doctor,
}

pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    let config = BridgeConfig::load_or_default(cli.global.config.as_deref())?;
    init_logging(&cli.global, &config)?;

    match cli.command {
        Commands::Dist {
            x1,
            y1,
            x2,
            y2,
            precision,
        } => {
            let [p1, p2] = config.points;
            let p1 = Point::new(x1.unwrap_or(p1.x), y1.unwrap_or(p1.y));
            let p2 = Point::new(x2.unwrap_or(p2.x), y2.unwrap_or(p2.y));
            dist_command(p1, p2, precision.unwrap_or(config.precision))
        }
        Commands::Ownership {
            value,
            origin,
            simulate_double_free,
            simulate_mismatch,
        } => {
            let value = value.unwrap_or(config.cell_value);
            let origin = origin.unwrap_or(config.cell_origin);
            if simulate_double_free {
                double_free_command(origin, value)
            } else {
                ownership_command(origin, value, simulate_mismatch)
            }
        }
        Commands::Manifest {
            output,
            target,
            header,
            validate,
        } => match validate {
            Some(path) => validate_manifest_command(path),
            None => manifest_command(output, target, header),
        },
        Commands::Header { output } => header_command(output),
        Commands::Doctor => doctor_command(),
    }
}

fn init_logging(global: &GlobalArgs, config: &BridgeConfig) -> Result<()> {
    let mut telemetry_config = TelemetryConfig::default()
        .with_verbosity(global.verbose)
        .with_format(global.log_format.unwrap_or(config.log_format));
    telemetry_config.directives = config.log_directives.clone();

    telemetry::init(&telemetry_config).context("Failed to initialise logging")
}

fn dist_command(p1: Point, p2: Point, precision: usize) -> Result<()> {
    tracing::debug!(?p1, ?p2, "computing distance");

    let distance = geometry::dist(Some(&p1), Some(&p2));
    println!("{}", geometry::format_distance(distance, precision));

    Ok(())
}

fn ownership_command(origin: Origin, value: c_int, simulate_mismatch: bool) -> Result<()> {
    let cell = match origin {
        Origin::C if value == ownership::DEFAULT_CELL_VALUE => ownership::make_memory(),
        _ => OwnedCell::allocate(origin, value),
    }
    .context("Failed to allocate cell")?;

    let cell = if simulate_mismatch {
        let wrong = other_origin(origin).destructor();
        let err = match ownership::take_ownership(cell, &wrong) {
            Ok(_) => anyhow::bail!("{} cell was released by a {} destructor", origin, other_origin(origin)),
            Err(err) => err,
        };
        println!("rejected: {}", err);

        match err {
            InteropError::MismatchedDeallocator { cell: Some(cell), .. } => *cell,
            err => return Err(err).context("Unexpected failure while releasing the cell"),
        }
    } else {
        cell
    };

    let value = ownership::take_ownership(cell, &origin.destructor())
        .context("Failed to release cell")?;
    println!("got {}", value);

    Ok(())
}

fn double_free_command(origin: Origin, value: c_int) -> Result<()> {
    let raw = match origin {
        Origin::C => ffi::make_memory(),
        Origin::Rust => ffi::make_boxed_memory(value),
    };
    if raw.is_null() {
        return Err(InteropError::AllocationFailure { origin }).context("Failed to allocate cell");
    }
    if origin == Origin::C {
        unsafe { raw.write(value) };
    }
    let dtor = Some(origin.raw_destructor());

    for attempt in 1..=2 {
        let status = unsafe { ffi::take_ownership(raw, dtor) };
        let message = unsafe { CStr::from_ptr(crate::error::ffibridge_status_message(status)) };
        println!("release {attempt}: {} ({status})", message.to_string_lossy());
    }

    if CellRegistry::global().is_live(raw as usize) {
        anyhow::bail!("cell at {:#x} is still registered after release", raw as usize);
    }

    Ok(())
}

fn other_origin(origin: Origin) -> Origin {
    match origin {
        Origin::Rust => Origin::C,
        Origin::C => Origin::Rust,
    }
}

fn manifest_command(output: Option<PathBuf>, target: Option<String>, headers: Vec<PathBuf>) -> Result<()> {
    let rustc_target = match target {
        Some(target) => target,
        None => get_host_target()?,
    };

    let headers = headers
        .into_iter()
        .map(|header_path| crate::header::GeneratedHeader {
            crate_name: CRATE_NAME.to_string(),
            header_path,
        })
        .collect::<Vec<_>>();

    let manifest_generator = ManifestGenerator::new();
    let manifest = manifest_generator.generate_manifest(CRATE_NAME, &headers, &rustc_target);

    let manifest_path = manifest_generator
        .write_manifest(&manifest, output.as_deref())
        .context("Failed to write manifest")?;

    // Output the manifest path for tooling
    println!("{}", manifest_path.display());

    Ok(())
}

fn validate_manifest_command(path: PathBuf) -> Result<()> {
    let manifest_generator = ManifestGenerator::new();
    let manifest = manifest_generator.read_manifest(&path)?;
    manifest_generator.validate_manifest(&manifest)?;

    println!("{}: boundary contract matches this build", path.display());

    Ok(())
}

fn header_command(output: PathBuf) -> Result<()> {
    let header = HeaderGenerator::new(CRATE_NAME)
        .write_header(&BoundaryContract::current(), &output)
        .context("Failed to generate header")?;

    println!("{}", header.header_path.display());

    Ok(())
}

fn doctor_command() -> Result<()> {
    println!("ffibridge doctor\n");

    // A C compiler is only needed to build C hosts against the header
    match ["cc", "gcc", "clang"].into_iter().find_map(|c| which::which(c).ok()) {
        Some(path) => println!("✓ C compiler found at: {}", path.display()),
        None => println!("✗ no C compiler found (cc, gcc, clang); C hosts cannot be built"),
    }

    println!("✓ host target: {}", get_host_target()?);

    let contract = BoundaryContract::current();
    contract
        .verify(&contract.clone())
        .context("Compiled boundary contract is inconsistent")?;

    println!("\nBoundary contract:");
    for layout in &contract.structs {
        println!("  struct {}: {} bytes, align {}", layout.name, layout.size, layout.align);
        for field in &layout.fields {
            println!("    {} {} @ {}", field.c_type, field.name, field.offset);
        }
    }
    println!("  {} exported functions:", contract.functions.len());
    for function in &contract.functions {
        println!("    {};", function.prototype());
    }

    println!("\n✓ ffibridge doctor check complete");

    Ok(())
}

fn get_host_target() -> Result<String> {
    if cfg!(target_os = "linux") && cfg!(target_arch = "x86_64") {
        Ok("x86_64-unknown-linux-gnu".to_string())
    } else if cfg!(target_os = "linux") && cfg!(target_arch = "aarch64") {
        Ok("aarch64-unknown-linux-gnu".to_string())
    } else if cfg!(target_os = "macos") && cfg!(target_arch = "x86_64") {
        Ok("x86_64-apple-darwin".to_string())
    } else if cfg!(target_os = "macos") && cfg!(target_arch = "aarch64") {
        Ok("aarch64-apple-darwin".to_string())
    } else if cfg!(target_os = "windows") && cfg!(target_arch = "x86_64") {
        Ok("x86_64-pc-windows-msvc".to_string())
    } else {
        // Fall back to asking rustc
        let output = std::process::Command::new("rustc")
            .args(["--version", "--verbose"])
            .output()
            .context("Failed to run rustc to detect host target")?;

        let output_str = String::from_utf8_lossy(&output.stdout);
        output_str
            .lines()
            .find_map(|line| line.strip_prefix("host: "))
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Could not detect host target"))
    }
}
