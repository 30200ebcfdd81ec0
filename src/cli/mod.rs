//! Command-line parsing for the grism redshift fitter.
//!
//! Argument parsing and command dispatch stay separate from the fitting code.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::domain::FitMode;

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "zfit", version, about = "Redshift fits of stacked 2D grism spectra")]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit a stack file and write the output record.
    Fit(FitArgs),
    /// Simulate two G141 position angles and fit them.
    Demo(DemoArgs),
    /// Print optimal 1D extractions of a stack file (and a fitted model).
    Extract(ExtractArgs),
}

/// Fit options shared by `fit` and `demo`.
#[derive(Debug, Args, Clone)]
pub struct FitOptions {
    /// Fractional systematic error added to the variance.
    #[arg(long, default_value_t = 0.02)]
    pub sys_err: f64,

    /// Fit pixels where the flat model exceeds this fraction of its maximum.
    #[arg(long, default_value_t = 0.1)]
    pub mask_min: f64,

    /// Contamination down-weighting strength.
    #[arg(long, default_value_t = 1.0)]
    pub fcontam: f64,

    /// Inverse-variance floor, as a fraction of the maximum.
    #[arg(long, default_value_t = 0.01)]
    pub min_ivar: f64,

    /// Overlap masking threshold (sigma) for position-angle fits.
    #[arg(long, default_value_t = 3.0)]
    pub overlap_threshold: f64,

    /// Coarse redshift step in ln(1+z).
    #[arg(long, default_value_t = 0.005)]
    pub dz: f64,

    #[arg(long, default_value_t = 0.4)]
    pub zmin: f64,

    #[arg(long, default_value_t = 3.4)]
    pub zmax: f64,

    /// Mask pixels with residual above this many sigma after the fit.
    #[arg(long)]
    pub outlier_threshold: Option<f64>,

    /// Chi-squared prior JSON `{z: [...], chi2: [...]}`.
    #[arg(long, value_name = "JSON")]
    pub prior: Option<PathBuf>,

    /// Write the output record here.
    #[arg(short, long, value_name = "JSON")]
    pub output: Option<PathBuf>,
}

/// Options for fitting a stack file.
#[derive(Debug, Args, Clone)]
pub struct FitArgs {
    /// Stack file (JSON).
    #[arg(value_name = "STACK")]
    pub stack: PathBuf,

    /// Template file; generated for the first grism when omitted.
    #[arg(long, value_name = "JSON")]
    pub templates: Option<PathBuf>,

    /// Photometric catalog (JSON).
    #[arg(long, value_name = "JSON")]
    pub photometry: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = FitMode::Spectra)]
    pub mode: FitMode,

    /// Order of the spectra/photometry scale polynomial.
    #[arg(long, default_value_t = 0)]
    pub scale_order: usize,

    /// Fit each position angle separately instead of the grism stacks.
    #[arg(long)]
    pub pa_fit: bool,

    /// Restrict position-angle fits to these angles.
    #[arg(long = "pa", value_name = "PA")]
    pub position_angles: Vec<String>,

    /// Fit only these `GRISM[,PA]` versions from the header enumeration.
    #[arg(long = "ext", value_name = "VERSION")]
    pub extensions: Vec<String>,

    #[command(flatten)]
    pub options: FitOptions,
}

/// Options for the synthetic demo.
#[derive(Debug, Args, Clone)]
pub struct DemoArgs {
    /// Injected redshift.
    #[arg(long, default_value_t = 1.0)]
    pub redshift: f64,

    /// Injected Hα flux (continuum has unit coefficient).
    #[arg(long, default_value_t = 40.0)]
    pub ha_flux: f64,

    /// Per-pixel noise sigma.
    #[arg(long, default_value_t = 0.01)]
    pub noise: f64,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Also write the simulated stack file.
    #[arg(long, value_name = "JSON")]
    pub write_stack: Option<PathBuf>,

    #[command(flatten)]
    pub options: FitOptions,
}

/// Options for 1D extraction.
#[derive(Debug, Args, Clone)]
pub struct ExtractArgs {
    /// Stack file (JSON).
    #[arg(value_name = "STACK")]
    pub stack: PathBuf,

    /// Versions to extract; every position angle when omitted.
    #[arg(long = "ext", value_name = "VERSION")]
    pub extensions: Vec<String>,

    /// Output record whose MODEL/BACKGROUND images are extracted alongside.
    #[arg(long, value_name = "JSON")]
    pub record: Option<PathBuf>,

    /// Bin this many columns together.
    #[arg(long, default_value_t = 1)]
    pub bin: usize,

    #[arg(long, default_value_t = 0.02)]
    pub sys_err: f64,
}
