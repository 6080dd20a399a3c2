//! Command line front end: equalize a single-channel image file.
//!
//! Usage: `histeq <input> <output>`.  The input is decoded and
//! converted to 8-bit luma, equalized on the GPU (or on the CPU with
//! `--cpu`), and written back out in the format implied by the output
//! extension.  Load, save and device failures are reported to stderr
//! and exit non-zero.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;

use histeq::{cpu, GpuContext, GpuEqualizer};

#[derive(Parser)]
#[command(name = "histeq")]
#[command(version, about = "Histogram equalization for single-channel images", long_about = None)]
struct Cli {
    /// Input image file
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output image file
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Run the sequential CPU path instead of the GPU pipeline
    #[arg(long)]
    cpu: bool,

    /// Also run the CPU path and report the largest per-pixel
    /// difference against the GPU result
    #[arg(long, conflicts_with = "cpu")]
    verify: bool,

    /// Enable debug logging (equivalent to RUST_LOG=debug)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Report progress at info level by default; RUST_LOG overrides.
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    let image = image::open(&cli.input)
        .with_context(|| format!("failed to load image {}", cli.input.display()))?
        .into_luma8();
    let (width, height) = image.dimensions();
    log::info!("input: {} ({width}x{height})", cli.input.display());
    let mut pixels = image.into_raw();

    let start = Instant::now();
    if cli.cpu {
        cpu::equalize(&mut pixels);
    } else {
        let context = GpuContext::new_blocking().context("failed to initialise GPU")?;
        let equalizer = GpuEqualizer::new(&context);
        equalizer
            .equalize(&context, &mut pixels)
            .context("GPU equalization failed")?;
        if cli.verify {
            let gpu_result = pixels.clone();
            // Re-derive the CPU result from the original image; the
            // buffer was rewritten in place, so decode again.
            let mut reference = image::open(&cli.input)?.into_luma8().into_raw();
            cpu::equalize(&mut reference);
            let max_diff = gpu_result
                .iter()
                .zip(reference.iter())
                .map(|(&g, &c)| (g as i16 - c as i16).unsigned_abs())
                .max()
                .unwrap_or(0);
            log::info!("verify: max per-pixel difference vs CPU = {max_diff}");
            anyhow::ensure!(
                max_diff <= 1,
                "GPU and CPU outputs diverge by {max_diff} levels"
            );
        }
    }
    let elapsed = start.elapsed();
    log::info!(
        "equalized {} pixels in {elapsed:?} ({})",
        pixels.len(),
        if cli.cpu { "cpu" } else { "gpu" }
    );

    let output = image::GrayImage::from_raw(width, height, pixels)
        .context("remapped buffer has the wrong size")?;
    output
        .save(&cli.output)
        .with_context(|| format!("failed to save image {}", cli.output.display()))?;
    log::info!("wrote {}", cli.output.display());
    Ok(())
}
