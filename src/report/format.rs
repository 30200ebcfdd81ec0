//! Formatted terminal output.
//!
//! Formatting lives here so the fitting code stays clean and output changes
//! stay localized.

use crate::domain::{ExtractedSpectrum, ZFitRecord};

/// Run summary: object, best redshift, fit diagnostics and line table.
pub fn format_run_summary(record: &ZFitRecord) -> String {
    let m = &record.meta;
    let mut out = String::new();

    out.push_str("=== zfit - grism redshift fit ===\n");
    out.push_str(&format!("Object: {} | RA={:.6} DEC={:.6}\n", m.id, m.ra, m.dec));
    out.push_str(&format!(
        "Mode: {} | prior={} | fitter={}\n",
        m.mode.display_name(),
        if m.has_prior { "yes" } else { "no" },
        m.fitter
    ));
    out.push_str(&format!(
        "Grid: n={} | z=[{:.4}, {:.4}]\n",
        record.zfit.z.len(),
        record.zfit.z.first().copied().unwrap_or(f64::NAN),
        record.zfit.z.last().copied().unwrap_or(f64::NAN),
    ));

    out.push_str("\nBest fit:\n");
    out.push_str(&format!("- z       : {:.5}\n", m.z));
    out.push_str(&format!("- chi2    : min={:.2} max={:.2}\n", m.chimin, m.chimax));
    out.push_str(&format!("- dof     : {} (outliers masked: {})\n", m.dof, m.outliers_masked));
    if m.dof > 0 {
        out.push_str(&format!("- chi2/dof: {:.3}\n", m.chimin / m.dof as f64));
    }
    out.push_str(&format!("- area25  : {:.3}\n", m.area25));
    if let Some(scale) = &record.scale {
        out.push_str(&format!("- scale   : {}\n", fmt_vec(scale)));
    }

    out.push_str("\nLines:\n");
    out.push_str(&format_line_table(record));
    out
}

/// Line fluxes, signal-to-noise and equivalent widths.
pub fn format_line_table(record: &ZFitRecord) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<4} {:<12} {:>12} {:>12} {:>7} {:>10}\n",
        "#", "line", "flux", "err", "S/N", "EW"
    ));
    for l in &record.lines {
        let snr = if l.error > 0.0 { l.flux / l.error } else { 0.0 };
        out.push_str(&format!(
            "{:<4} {:<12} {:>12.4e} {:>12.4e} {:>7.1} {:>10.2}\n",
            l.index, l.name, l.flux, l.error, snr, l.ew
        ));
    }
    out
}

/// Column table of a 1D extraction.
pub fn format_extraction(extracted: &ExtractedSpectrum) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {}\n", extracted.version));
    out.push_str(&format!("{:>12} {:>14} {:>14} {:>14}\n", "wave", "flux", "rms", "model"));
    for i in 0..extracted.wave.len() {
        out.push_str(&format!(
            "{:>12.2} {:>14.6e} {:>14.6e} {:>14.6e}\n",
            extracted.wave[i], extracted.flux[i], extracted.rms[i], extracted.model[i]
        ));
    }
    out
}

fn fmt_vec(v: &[f64]) -> String {
    let parts: Vec<String> = v.iter().map(|x| format!("{x:.4}")).collect();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FitMode, LineMeasurement, RecordMeta, ZGridTable};
    use chrono::{DateTime, Utc};

    fn record() -> ZFitRecord {
        ZFitRecord {
            tool: "zfit".to_string(),
            meta: RecordMeta {
                id: "7".to_string(),
                ra: 53.1,
                dec: -27.8,
                z: 1.00012,
                chimin: 950.0,
                chimax: 2000.0,
                dof: 1000,
                area25: 0.9,
                fitter: "nnls".to_string(),
                has_prior: false,
                mode: FitMode::Spectra,
                outliers_masked: 3,
                created: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
            },
            zfit: ZGridTable {
                z: vec![0.9, 1.0, 1.1],
                chi2: vec![2000.0, 950.0, 1800.0],
                prior: None,
            },
            lines: vec![LineMeasurement {
                index: 4,
                name: "Ha".to_string(),
                flux: 40.0,
                error: 2.0,
                ew: 120.0,
            }],
            coeffs: Vec::new(),
            background_coeffs: Vec::new(),
            scale: None,
            templates_1d: Vec::new(),
            images: Vec::new(),
            spectra: Vec::new(),
        }
    }

    #[test]
    fn summary_reports_best_redshift_and_lines() {
        let s = format_run_summary(&record());
        assert!(s.contains("z       : 1.00012"));
        assert!(s.contains("chi2/dof: 0.950"));
        assert!(s.contains("Ha"));
        assert!(s.contains("20.0"));
    }
}
