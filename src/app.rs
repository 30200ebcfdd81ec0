//! Top-level application orchestration.
//!
//! `src/main.rs` is tiny; this module is the real entry point:
//! - parses CLI arguments and sets up logging
//! - maps arguments into a `FitConfig`
//! - runs the pipeline and prints reports

use clap::Parser;
use log::info;

use crate::cli::{Cli, Command, DemoArgs, ExtractArgs, FitArgs, FitOptions};
use crate::data::{SyntheticConfig, simulate_exposures};
use crate::domain::{ExtractedSpectrum, FitConfig, ObjectInfo};
use crate::error::AppError;
use crate::exposure::{ExposureOptions, ExposureUnit};
use crate::io::{ExtensionSelection, StackFile, read_record, read_stack, write_stack};
use crate::spectrum::make_templates;

pub mod pipeline;

/// Entry point for the `zfit` binary.
pub fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Fit(args) => handle_fit(args),
        Command::Demo(args) => handle_demo(args),
        Command::Extract(args) => handle_extract(args),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).try_init();
}

fn handle_fit(args: FitArgs) -> Result<(), AppError> {
    let config = fit_config_from_args(&args);
    let run = pipeline::run_fit(&config)?;
    println!("{}", crate::report::format_run_summary(&run.record));
    Ok(())
}

fn handle_demo(args: DemoArgs) -> Result<(), AppError> {
    let lib = make_templates("G141")?;
    let mut sim = SyntheticConfig::g141_two_pa(
        args.redshift,
        vec![
            ("continuum flat".to_string(), 1.0),
            ("line Ha".to_string(), args.ha_flux),
        ],
    );
    sim.noise_sigma = args.noise;
    sim.seed = args.seed;
    let data = simulate_exposures(&lib.lines, &sim)?;

    let object = ObjectInfo {
        id: "demo".to_string(),
        ra: 0.0,
        dec: 0.0,
    };
    if let Some(path) = &args.write_stack {
        write_stack(path, &StackFile::from_exposures(&object, &data)?)?;
        info!("Wrote simulated stack to {}", path.display());
    }

    let config = FitConfig {
        fit_stacks: false,
        ..apply_fit_options(FitConfig::default(), &args.options)
    };
    let run = pipeline::fit_exposures(&config, &object, data)?;
    println!("{}", crate::report::format_run_summary(&run.record));
    println!(
        "Injected z={:.4}, recovered z={:.5} (dz/(1+z)={:.2e})",
        args.redshift,
        run.record.meta.z,
        (run.record.meta.z - args.redshift) / (1.0 + args.redshift)
    );
    Ok(())
}

fn handle_extract(args: ExtractArgs) -> Result<(), AppError> {
    let stack = read_stack(&args.stack)?;
    let versions = stack.select_versions(&ExtensionSelection {
        fit_stacks: false,
        position_angles: None,
        extensions: non_empty(&args.extensions),
    })?;
    let record = args.record.as_deref().map(read_record).transpose()?;
    let opts = ExposureOptions {
        sys_err: args.sys_err,
        ..Default::default()
    };

    for version in versions {
        let unit = ExposureUnit::new(stack.load_exposure(&version)?, &opts)?;
        let image = |name: &str| record.as_ref().and_then(|r| r.image(name, &version)).map(|i| i.data.clone());

        let mut cleaned = unit.sci().to_vec();
        if let Some(bg) = image("BACKGROUND") {
            for (s, b) in cleaned.iter_mut().zip(bg.iter()) {
                *s -= b;
            }
        }
        let data = unit.optimal_extract(&cleaned, args.bin)?;
        let model = match image("MODEL") {
            Some(m) => unit.optimal_extract(&m, args.bin)?.flux,
            None => vec![0.0; data.wave.len()],
        };
        let extracted = ExtractedSpectrum {
            version: version.clone(),
            wave: data.wave,
            flux: data.flux,
            rms: data.rms,
            model,
        };
        println!("{}", crate::report::format_extraction(&extracted));
    }
    Ok(())
}

pub fn fit_config_from_args(args: &FitArgs) -> FitConfig {
    let base = FitConfig {
        stack_path: args.stack.clone(),
        templates_path: args.templates.clone(),
        photometry_path: args.photometry.clone(),
        fit_stacks: !args.pa_fit,
        position_angles: non_empty(&args.position_angles),
        extensions: non_empty(&args.extensions),
        mode: args.mode,
        scale_order: args.scale_order,
        ..FitConfig::default()
    };
    apply_fit_options(base, &args.options)
}

fn apply_fit_options(config: FitConfig, opts: &FitOptions) -> FitConfig {
    FitConfig {
        prior_path: opts.prior.clone(),
        output: opts.output.clone(),
        sys_err: opts.sys_err,
        mask_min: opts.mask_min,
        fcontam: opts.fcontam,
        min_ivar: opts.min_ivar,
        overlap_threshold: opts.overlap_threshold,
        dz0: opts.dz,
        z_min: opts.zmin,
        z_max: opts.zmax,
        outlier_threshold: opts.outlier_threshold,
        ..config
    }
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() { None } else { Some(values.to_vec()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_arguments_map_onto_config() {
        let cli = Cli::parse_from([
            "zfit", "fit", "stack.json", "--pa-fit", "--pa", "111", "--zmin", "0.8", "--zmax", "1.2",
        ]);
        let Command::Fit(args) = cli.command else {
            panic!("expected fit subcommand");
        };
        let config = fit_config_from_args(&args);
        assert!(!config.fit_stacks);
        assert_eq!(config.position_angles, Some(vec!["111".to_string()]));
        assert_eq!(config.extensions, None);
        assert_eq!(config.z_min, 0.8);
        assert_eq!(config.z_max, 1.2);
        assert_eq!(config.sys_err, 0.02);
        assert_eq!(config.min_ivar, 0.01);
        assert_eq!(config.dz0, 0.005);
    }

    #[test]
    fn verbose_is_accepted_after_the_subcommand() {
        let cli = Cli::parse_from(["zfit", "demo", "--verbose", "--redshift", "1.5"]);
        assert!(cli.verbose);
        let Command::Demo(args) = cli.command else {
            panic!("expected demo subcommand");
        };
        assert_eq!(args.redshift, 1.5);
        assert_eq!(args.options.outlier_threshold, None);
    }
}
