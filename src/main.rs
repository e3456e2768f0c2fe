//! Entry point for the fridare tool.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Install the `tracing` subscriber at the requested level.
//! 3. Dispatch to the patcher, the package pipeline, the package builder or the
//!    describer, printing progress as it goes.
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use fridare::config::{Command, Config, CreateArgs, DebArgs, DescribeArgs, PatchArgs};
use fridare::create::DebCreator;
use fridare::format::{self, printable_strings, SectionTable};
use fridare::patch;
use fridare::pipeline::DebPatcher;
use fridare::progress::Progress;

fn main() -> Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match config.command {
        Command::Patch(args) => run_patch(args),
        Command::Deb(args) => run_deb(args),
        Command::Create(args) => run_create(args),
        Command::Describe(args) => run_describe(args),
    }
}

fn print_progress(p: Progress) {
    println!("[{:>3.0}%] {}", p.fraction * 100.0, p.message);
}

fn run_patch(args: PatchArgs) -> Result<()> {
    let report = patch::patch_copy(&args.input, &args.output, args.alias.as_str(), &mut print_progress)
        .with_context(|| format!("failed to patch {}", args.input.display()))?;
    println!(
        "Patched {} -> {}: {} substitution(s) in {} section(s)",
        args.input.display(),
        args.output.display(),
        report.substitutions,
        report.sections
    );
    Ok(())
}

fn run_deb(args: DebArgs) -> Result<()> {
    let outcome = DebPatcher::new(&args.input, &args.output, args.alias)
        .port(args.port)
        .validate(args.validate)
        .compression(args.compression.into())
        .run(&mut print_progress)
        .with_context(|| format!("failed to repackage {}", args.input.display()))?;

    println!("Package: {}", outcome.metadata.name);
    for path in outcome.binaries.iter().chain(&outcome.libraries).chain(&outcome.descriptors) {
        println!("  patched {}", path.display());
    }
    if let Some(warning) = &outcome.validation_warning {
        println!("Warning: {warning}");
    }
    println!("Wrote {} ({} bytes)", outcome.output.display(), outcome.bytes_written);
    Ok(())
}

fn run_create(args: CreateArgs) -> Result<()> {
    let topology = args.topology();
    let size = DebCreator::new(&args.binary, &args.output, args.alias)
        .agent(args.agent)
        .port(args.port)
        .topology(topology)
        .version(args.package_version)
        .maintainer(args.maintainer)
        .compression(args.compression.into())
        .run(&mut print_progress)
        .with_context(|| format!("failed to build a package from {}", args.binary.display()))?;
    println!("Wrote {} ({} bytes)", args.output.display(), size);
    Ok(())
}

fn run_describe(args: DescribeArgs) -> Result<()> {
    let handle = format::detect(&args.input)
        .with_context(|| format!("failed to inspect {}", args.input.display()))?;
    print!("{handle}");

    let Some(name) = args.strings else {
        return Ok(());
    };
    let data = std::fs::read(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let mut found_section = false;
    for image in handle.images() {
        let Some(section) = image.section(&name) else {
            continue;
        };
        found_section = true;
        let bytes = image.section_data(&data, section)?;
        for s in printable_strings(bytes, image.absolute_offset(section), 4) {
            println!("{:#010x} {}", s.offset, s.text);
        }
    }
    if !found_section {
        anyhow::bail!("no section named {name} in {}", args.input.display());
    }
    Ok(())
}
