//! Shared fit pipeline used by `zfit fit` and `zfit demo`.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! exposures -> joint system -> redshift scan -> output record.

use std::sync::Arc;

use log::info;

use crate::domain::{FitConfig, ObjectInfo, Prior, ZFitRecord};
use crate::error::AppError;
use crate::exposure::{ExposureData, ExposureOptions, ExposureUnit};
use crate::fit::{
    JointFitter, JointOptions, NelderMeadMinimizer, PhotometricCatalog, ScanOptions, ScanResult, fit_zgrid,
};
use crate::io::{ExtensionSelection, read_catalog, read_prior, read_stack, read_templates, write_record};
use crate::report::assemble_record;
use crate::spectrum::{MadauForest, TemplateStore, make_templates};

/// All computed outputs of a single fit.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub record: ZFitRecord,
    pub scan: ScanResult,
}

pub fn exposure_options(config: &FitConfig) -> ExposureOptions {
    ExposureOptions {
        sys_err: config.sys_err,
        mask_min: config.mask_min,
        fcontam: config.fcontam,
        min_ivar: config.min_ivar,
    }
}

pub fn joint_options(config: &FitConfig) -> JointOptions {
    JointOptions {
        fit_stacks: config.fit_stacks,
        overlap_threshold: config.overlap_threshold,
        min_ivar: config.min_ivar,
    }
}

pub fn scan_options(config: &FitConfig, prior: Option<Prior>) -> ScanOptions {
    ScanOptions {
        dz0: config.dz0,
        z_min: config.z_min,
        z_max: config.z_max,
        prior,
        outlier_threshold: config.outlier_threshold,
        mode: config.mode,
        scale_order: config.scale_order,
    }
}

/// Load the stack file named by `config` and fit it.
pub fn run_fit(config: &FitConfig) -> Result<RunOutput, AppError> {
    let stack = read_stack(&config.stack_path)?;
    let object = stack.object_info()?;
    let selection = ExtensionSelection {
        fit_stacks: config.fit_stacks,
        position_angles: config.position_angles.clone(),
        extensions: config.extensions.clone(),
    };
    let data = stack.load_exposures(&selection)?;
    info!(
        "Loaded {} exposures of object {} from {}",
        data.len(),
        object.id,
        config.stack_path.display()
    );
    fit_exposures(config, &object, data)
}

/// Fit already-loaded exposures.
pub fn fit_exposures(config: &FitConfig, object: &ObjectInfo, data: Vec<ExposureData>) -> Result<RunOutput, AppError> {
    let first = data
        .first()
        .ok_or_else(|| AppError::insufficient("No exposures to fit."))?;
    let templates = match &config.templates_path {
        Some(path) => read_templates(path)?,
        None => make_templates(&first.tag.grism)?,
    };
    let catalog: Option<Arc<dyn PhotometricCatalog>> = match &config.photometry_path {
        Some(path) => Some(Arc::new(read_catalog(path)?)),
        None => None,
    };
    let prior = config.prior_path.as_deref().map(read_prior).transpose()?;

    let opts = exposure_options(config);
    let units = data
        .into_iter()
        .map(|d| ExposureUnit::new(d, &opts))
        .collect::<Result<Vec<_>, _>>()?;
    let mut fitter = JointFitter::new(units, &joint_options(config), catalog, Some(Arc::new(MadauForest)))?;

    let scan = fit_zgrid(
        &mut fitter,
        &templates,
        &scan_options(config, prior),
        &NelderMeadMinimizer::default(),
    )?;
    let record = assemble_record(object, &fitter, &scan, templates.lines(), config.mode)?;

    if let Some(path) = &config.output {
        write_record(path, &record)?;
        info!("Wrote output record to {}", path.display());
    }

    Ok(RunOutput { record, scan })
}
