//! Packaging of a finished scan into the output record.

use chrono::Utc;

use crate::domain::{
    Coefficient, ExtractedSpectrum, FitMode, ImageExtension, LineMeasurement, ObjectInfo, RecordMeta, ZFitRecord,
    ZGridTable,
};
use crate::error::AppError;
use crate::fit::{JointFitter, ScanResult};
use crate::math::trapz;
use crate::spectrum::Template;

/// Reported in place of an equivalent width that is not finite.
pub const EW_SENTINEL: f64 = -1000.0;

/// Best-fit rest-frame spectra: continuum only, and continuum plus lines.
pub fn generate_1d_templates(templates: &[Template], coeffs: &[f64]) -> Result<(Template, Template), AppError> {
    if templates.is_empty() || templates.len() != coeffs.len() {
        return Err(AppError::input(format!(
            "Need one coefficient per template (got {} templates, {} coefficients).",
            templates.len(),
            coeffs.len()
        )));
    }
    let continuum_coeff = |t: &Template, c: f64| if t.is_line() { 0.0 } else { c };

    let mut continuum = templates[0].scaled(continuum_coeff(&templates[0], coeffs[0]));
    let mut full = templates[0].scaled(coeffs[0]);
    for (t, &c) in templates.iter().zip(coeffs.iter()).skip(1) {
        continuum = continuum.plus(&t.scaled(continuum_coeff(t, c)));
        full = full.plus(&t.scaled(c));
    }
    continuum.name = "continuum".to_string();
    full.name = "full".to_string();
    Ok((continuum, full))
}

/// Rest-frame equivalent width of `line` scaled by `coeff` over `continuum`,
/// integrated over the line template's own support.
pub fn equivalent_width(line: &Template, coeff: f64, continuum: &Template) -> f64 {
    if coeff == 0.0 {
        return 0.0;
    }
    let with_line = line.scaled(coeff).plus(continuum);
    let without = line.scaled(0.0).plus(continuum);
    let (lo, hi) = (line.wave_min(), line.wave_max());

    let mut wave = Vec::new();
    let mut ratio = Vec::new();
    for ((w, fl), fc) in without.wave.iter().zip(with_line.flux.iter()).zip(without.flux.iter()) {
        if *w >= lo && *w <= hi {
            wave.push(*w);
            ratio.push(fl / fc - 1.0);
        }
    }
    let ew = trapz(&ratio, &wave);
    if ew.is_finite() { ew } else { EW_SENTINEL }
}

/// Flux, error and equivalent width of every line template.
pub fn line_measurements(templates: &[Template], coeffs: &[f64], errors: &[f64], continuum: &Template) -> Vec<LineMeasurement> {
    templates
        .iter()
        .enumerate()
        .filter(|(_, t)| t.is_line())
        .map(|(i, t)| LineMeasurement {
            index: i,
            name: t.line_label().to_string(),
            flux: coeffs[i],
            error: errors[i],
            ew: equivalent_width(t, coeffs[i], continuum),
        })
        .collect()
}

/// Build the full output record from a completed scan.
///
/// `line_templates` must be the set used for the final fit at `z_best`.
pub fn assemble_record(
    object: &ObjectInfo,
    fitter: &JointFitter,
    scan: &ScanResult,
    line_templates: &[Template],
    mode: FitMode,
) -> Result<ZFitRecord, AppError> {
    let best = &scan.best;
    let (continuum, full) = generate_1d_templates(line_templates, &best.coeffs)?;
    let lines = line_measurements(line_templates, &best.coeffs, &best.errors, &continuum);
    let coeffs = line_templates
        .iter()
        .zip(best.coeffs.iter().zip(best.errors.iter()))
        .map(|(t, (&value, &error))| Coefficient {
            name: t.name.clone(),
            value,
            error,
        })
        .collect();

    let mut images = Vec::with_capacity(2 * fitter.exposures().len());
    let mut spectra = Vec::with_capacity(fitter.exposures().len());
    for (unit, range) in fitter.exposures().iter().zip(fitter.slices().iter()) {
        let (ny, nx) = unit.shape();
        let version = unit.tag().to_string();
        let model = finite_or_zero(&best.model[range.clone()]);
        let background = finite_or_zero(&best.background[range.clone()]);

        let cleaned: Vec<f64> = unit.sci().iter().zip(background.iter()).map(|(s, b)| s - b).collect();
        let data_1d = unit.optimal_extract(&cleaned, 1)?;
        let model_1d = unit.optimal_extract(&model, 1)?;
        spectra.push(ExtractedSpectrum {
            version: version.clone(),
            wave: data_1d.wave,
            flux: data_1d.flux,
            rms: data_1d.rms,
            model: model_1d.flux,
        });

        images.push(ImageExtension {
            name: "MODEL".to_string(),
            version: version.clone(),
            shape: [ny, nx],
            data: model,
        });
        images.push(ImageExtension {
            name: "BACKGROUND".to_string(),
            version,
            shape: [ny, nx],
            data: background,
        });
    }

    let meta = RecordMeta {
        id: object.id.clone(),
        ra: object.ra,
        dec: object.dec,
        z: scan.z_best,
        chimin: scan.chi2_min(),
        chimax: scan.chi2_max(),
        dof: scan.dof,
        area25: scan.area25,
        fitter: "nnls".to_string(),
        has_prior: scan.prior.is_some(),
        mode,
        outliers_masked: scan.outliers_masked,
        created: Utc::now(),
    };

    Ok(ZFitRecord {
        tool: "zfit".to_string(),
        meta,
        zfit: ZGridTable {
            z: scan.z.clone(),
            chi2: scan.chi2.clone(),
            prior: scan.prior.clone(),
        },
        lines,
        coeffs,
        background_coeffs: best.background_coeffs.clone(),
        scale: scan.scale.clone(),
        templates_1d: vec![continuum, full],
        images,
        spectra,
    })
}

fn finite_or_zero(values: &[f64]) -> Vec<f64> {
    values.iter().map(|v| if v.is_finite() { *v } else { 0.0 }).collect()
}
