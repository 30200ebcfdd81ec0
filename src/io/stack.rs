//! Stack file: the multi-extension container of stacked 2D spectra.
//!
//! JSON layout:
//!
//! ```text
//! {
//!   "header":      { "NGRISM": 1, "GRISM001": "G141", "NG141": 2,
//!                    "G14101": "111", "G14102": "203", "ID": 42, "RA": .., "DEC": .. },
//!   "extensions":  [ { "name": "SCI", "version": "G141,111", "header": {..}, "data": [..] }, .. ],
//!   "sensitivity": { "<CONF>": { "wavelength": [..], "sensitivity": [..] } }
//! }
//! ```
//!
//! Each exposure version carries `SCI`, `WHT` and `KERNEL` extensions and an
//! optional `CONTAM`. Image headers give `NAXIS1`/`NAXIS2`; the `SCI` header
//! also gives the linear wavelength solution (`CRPIX1`, `CRVAL1`, `CD1_1`),
//! `ISFLAM` and, for non-flux-calibrated exposures, the `CONF` key of its
//! sensitivity curve. Missing required keywords are fatal.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::ObjectInfo;
use crate::error::AppError;
use crate::exposure::{ExposureData, ExposureTag, LinearWavelength};
use crate::io::json::{read_json, write_json};
use crate::spectrum::{Calibration, Kernel, SensitivityCurve};

pub type Header = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extension {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub header: Header,
    pub data: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFile {
    pub header: Header,
    pub extensions: Vec<Extension>,
    #[serde(default)]
    pub sensitivity: BTreeMap<String, SensitivityCurve>,
}

/// Which versions to load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtensionSelection {
    /// One exposure per grism (`true`) or per grism + position angle.
    pub fit_stacks: bool,
    /// Keep only these position angles.
    pub position_angles: Option<Vec<String>>,
    /// Keep only these enumerated versions.
    pub extensions: Option<Vec<String>>,
}

pub fn read_stack(path: &Path) -> Result<StackFile, AppError> {
    read_json(path, "stack file")
}

pub fn write_stack(path: &Path, stack: &StackFile) -> Result<(), AppError> {
    write_json(path, stack, "stack file")
}

fn keyword<'a>(header: &'a Header, key: &str, context: &str) -> Result<&'a Value, AppError> {
    header
        .get(key)
        .ok_or_else(|| AppError::input(format!("Missing required keyword {key} in {context}.")))
}

fn keyword_f64(header: &Header, key: &str, context: &str) -> Result<f64, AppError> {
    keyword(header, key, context)?
        .as_f64()
        .ok_or_else(|| AppError::input(format!("Keyword {key} in {context} is not a number.")))
}

fn keyword_usize(header: &Header, key: &str, context: &str) -> Result<usize, AppError> {
    keyword(header, key, context)?
        .as_u64()
        .map(|v| v as usize)
        .ok_or_else(|| AppError::input(format!("Keyword {key} in {context} is not a count.")))
}

/// Strings as-is; numbers in their JSON form (`111`, `42`).
fn keyword_str(header: &Header, key: &str, context: &str) -> Result<String, AppError> {
    match keyword(header, key, context)? {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(AppError::input(format!("Keyword {key} in {context} has unexpected value {other}."))),
    }
}

fn keyword_bool(header: &Header, key: &str, context: &str) -> Result<bool, AppError> {
    match keyword(header, key, context)? {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|v| v != 0.0)),
        other => Err(AppError::input(format!("Keyword {key} in {context} is not a flag: {other}."))),
    }
}

impl StackFile {
    pub fn extension(&self, name: &str, version: &str) -> Option<&Extension> {
        self.extensions.iter().find(|e| e.name == name && e.version == version)
    }

    fn require(&self, name: &str, version: &str) -> Result<&Extension, AppError> {
        self.extension(name, version)
            .ok_or_else(|| AppError::input(format!("Stack file has no {name} extension for version {version}.")))
    }

    pub fn object_info(&self) -> Result<ObjectInfo, AppError> {
        Ok(ObjectInfo {
            id: keyword_str(&self.header, "ID", "primary header")?,
            ra: keyword_f64(&self.header, "RA", "primary header")?,
            dec: keyword_f64(&self.header, "DEC", "primary header")?,
        })
    }

    /// Versions to fit, from the primary header enumeration. The position
    /// angle filter and an explicit extension list only narrow it.
    pub fn select_versions(&self, sel: &ExtensionSelection) -> Result<Vec<String>, AppError> {
        let listed = |version: &str| sel.extensions.as_ref().is_none_or(|list| list.iter().any(|e| e == version));
        let ctx = "primary header";
        let ngrism = keyword_usize(&self.header, "NGRISM", ctx)?;
        let mut out = Vec::new();
        for i in 1..=ngrism {
            let grism = keyword_str(&self.header, &format!("GRISM{i:03}"), ctx)?;
            if sel.fit_stacks {
                if listed(&grism) {
                    out.push(grism);
                }
                continue;
            }
            let npa = keyword_usize(&self.header, &format!("N{grism}"), ctx)?;
            for j in 1..=npa {
                let pa = keyword_str(&self.header, &format!("{grism}{j:02}"), ctx)?;
                if sel.position_angles.as_ref().is_some_and(|pas| !pas.contains(&pa)) {
                    continue;
                }
                let version = ExposureTag::with_pa(grism.clone(), pa).to_string();
                if listed(&version) {
                    out.push(version);
                }
            }
        }
        if out.is_empty() {
            return Err(AppError::insufficient("No extensions selected from the stack file."));
        }
        Ok(out)
    }

    /// Raw exposure inputs for one version.
    pub fn load_exposure(&self, version: &str) -> Result<ExposureData, AppError> {
        let sci = self.require("SCI", version)?;
        let wht = self.require("WHT", version)?;
        let kernel = self.require("KERNEL", version)?;
        let contam = self.extension("CONTAM", version);

        let ctx = format!("SCI,{version}");
        let nx = keyword_usize(&sci.header, "NAXIS1", &ctx)?;
        let ny = keyword_usize(&sci.header, "NAXIS2", &ctx)?;
        let size = nx * ny;
        for ext in [Some(sci), Some(wht), contam].into_iter().flatten() {
            if ext.data.len() != size {
                return Err(AppError::input(format!(
                    "{} extension for {version} has {} pixels, expected {size}.",
                    ext.name,
                    ext.data.len()
                )));
            }
        }

        let wcs = LinearWavelength {
            crpix1: keyword_f64(&sci.header, "CRPIX1", &ctx)?,
            crval1: keyword_f64(&sci.header, "CRVAL1", &ctx)?,
            cd1_1: keyword_f64(&sci.header, "CD1_1", &ctx)?,
        };
        let calibration = if keyword_bool(&sci.header, "ISFLAM", &ctx)? {
            Calibration::Flambda
        } else {
            let conf = keyword_str(&sci.header, "CONF", &ctx)?;
            let curve = self
                .sensitivity
                .get(&conf)
                .ok_or_else(|| AppError::input(format!("No sensitivity curve for CONF '{conf}'.")))?;
            Calibration::Sensitivity(curve.clone())
        };

        let kctx = format!("KERNEL,{version}");
        let kernel = Kernel::new(
            keyword_usize(&kernel.header, "NAXIS2", &kctx)?,
            keyword_usize(&kernel.header, "NAXIS1", &kctx)?,
            kernel.data.clone(),
        )?;

        Ok(ExposureData {
            tag: ExposureTag::parse(version),
            shape: (ny, nx),
            sci: sci.data.clone(),
            wht: wht.data.clone(),
            contam: contam.map(|c| c.data.clone()),
            kernel,
            wave: wcs.wavelengths(nx),
            calibration,
        })
    }

    pub fn load_exposures(&self, sel: &ExtensionSelection) -> Result<Vec<ExposureData>, AppError> {
        self.select_versions(sel)?
            .iter()
            .map(|v| self.load_exposure(v))
            .collect()
    }

    /// Pack exposures into a stack file. Wavelength grids are written as a
    /// linear solution from their first two samples.
    pub fn from_exposures(object: &ObjectInfo, exposures: &[ExposureData]) -> Result<Self, AppError> {
        let mut header = Header::new();
        header.insert("ID".into(), Value::from(object.id.clone()));
        header.insert("RA".into(), Value::from(object.ra));
        header.insert("DEC".into(), Value::from(object.dec));

        let mut grisms: Vec<String> = Vec::new();
        for e in exposures {
            if !grisms.contains(&e.tag.grism) {
                grisms.push(e.tag.grism.clone());
            }
        }
        header.insert("NGRISM".into(), Value::from(grisms.len()));
        for (i, g) in grisms.iter().enumerate() {
            header.insert(format!("GRISM{:03}", i + 1), Value::from(g.clone()));
            let pas: Vec<&String> = exposures
                .iter()
                .filter(|e| &e.tag.grism == g)
                .filter_map(|e| e.tag.position_angle.as_ref())
                .collect();
            header.insert(format!("N{g}"), Value::from(pas.len()));
            for (j, pa) in pas.iter().enumerate() {
                header.insert(format!("{g}{:02}", j + 1), Value::from((*pa).clone()));
            }
        }

        let mut extensions = Vec::with_capacity(4 * exposures.len());
        let mut sensitivity = BTreeMap::new();
        for e in exposures {
            let version = e.tag.to_string();
            let (ny, nx) = e.shape;
            if e.wave.len() < 2 {
                return Err(AppError::input(format!("Exposure {version} needs at least two columns.")));
            }

            let mut sci_header = image_header(nx, ny);
            sci_header.insert("CRPIX1".into(), Value::from(1.0));
            sci_header.insert("CRVAL1".into(), Value::from(e.wave[0]));
            sci_header.insert("CD1_1".into(), Value::from(e.wave[1] - e.wave[0]));
            match &e.calibration {
                Calibration::Flambda => {
                    sci_header.insert("ISFLAM".into(), Value::from(true));
                }
                Calibration::Sensitivity(curve) => {
                    let conf = format!("{}.conf", e.tag.grism);
                    sci_header.insert("ISFLAM".into(), Value::from(false));
                    sci_header.insert("CONF".into(), Value::from(conf.clone()));
                    sensitivity.insert(conf, curve.clone());
                }
            }

            extensions.push(Extension {
                name: "SCI".into(),
                version: version.clone(),
                header: sci_header,
                data: e.sci.clone(),
            });
            extensions.push(Extension {
                name: "WHT".into(),
                version: version.clone(),
                header: image_header(nx, ny),
                data: e.wht.clone(),
            });
            if let Some(c) = &e.contam {
                extensions.push(Extension {
                    name: "CONTAM".into(),
                    version: version.clone(),
                    header: image_header(nx, ny),
                    data: c.clone(),
                });
            }
            let kernel_data = (0..e.kernel.rows())
                .flat_map(|r| (0..e.kernel.cols()).map(move |c| (r, c)))
                .map(|(r, c)| e.kernel.at(r, c))
                .collect();
            extensions.push(Extension {
                name: "KERNEL".into(),
                version,
                header: image_header(e.kernel.cols(), e.kernel.rows()),
                data: kernel_data,
            });
        }

        Ok(Self {
            header,
            extensions,
            sensitivity,
        })
    }
}

fn image_header(naxis1: usize, naxis2: usize) -> Header {
    let mut h = Header::new();
    h.insert("NAXIS1".into(), Value::from(naxis1));
    h.insert("NAXIS2".into(), Value::from(naxis2));
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic::{SyntheticConfig, simulate_exposures};
    use crate::spectrum::make_templates;

    fn object() -> ObjectInfo {
        ObjectInfo {
            id: "1234".to_string(),
            ra: 150.1,
            dec: 2.3,
        }
    }

    fn demo_stack() -> (StackFile, Vec<ExposureData>) {
        let lib = make_templates("G141").unwrap();
        let cfg = SyntheticConfig::g141_two_pa(1.0, vec![("continuum flat".to_string(), 1.0)]);
        let exposures = simulate_exposures(&lib.lines, &cfg).unwrap();
        (StackFile::from_exposures(&object(), &exposures).unwrap(), exposures)
    }

    #[test]
    fn header_enumerates_position_angles() {
        let (stack, _) = demo_stack();
        let pa = ExtensionSelection {
            fit_stacks: false,
            ..Default::default()
        };
        assert_eq!(stack.select_versions(&pa).unwrap(), vec!["G141,111", "G141,203"]);

        let only = ExtensionSelection {
            fit_stacks: false,
            position_angles: Some(vec!["203".to_string()]),
            extensions: None,
        };
        assert_eq!(stack.select_versions(&only).unwrap(), vec!["G141,203"]);

        let stacked = ExtensionSelection {
            fit_stacks: true,
            ..Default::default()
        };
        assert_eq!(stack.select_versions(&stacked).unwrap(), vec!["G141"]);
    }

    #[test]
    fn explicit_extensions_only_narrow_the_enumeration() {
        let (stack, _) = demo_stack();
        let listed = ExtensionSelection {
            fit_stacks: false,
            position_angles: None,
            extensions: Some(vec!["G141,203".to_string(), "G102,90".to_string()]),
        };
        assert_eq!(stack.select_versions(&listed).unwrap(), vec!["G141,203"]);

        let filtered_out = ExtensionSelection {
            fit_stacks: false,
            position_angles: Some(vec!["111".to_string()]),
            extensions: Some(vec!["G141,203".to_string()]),
        };
        assert_eq!(stack.select_versions(&filtered_out).unwrap_err().exit_code(), 3);
    }

    #[test]
    fn exposures_load_back_from_the_container() {
        let (stack, original) = demo_stack();
        let sel = ExtensionSelection {
            fit_stacks: false,
            ..Default::default()
        };
        let loaded = stack.load_exposures(&sel).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].tag, original[1].tag);
        assert_eq!(loaded[0].sci, original[0].sci);
        assert_eq!(loaded[0].kernel, original[0].kernel);
        for (a, b) in loaded[0].wave.iter().zip(original[0].wave.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
        assert_eq!(stack.object_info().unwrap(), object());
    }

    #[test]
    fn missing_keyword_is_fatal() {
        let (mut stack, _) = demo_stack();
        stack.header.remove("NGRISM");
        let err = stack.select_versions(&ExtensionSelection::default()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("NGRISM"));

        let (mut stack, _) = demo_stack();
        for ext in stack.extensions.iter_mut().filter(|e| e.name == "SCI") {
            ext.header.remove("CD1_1");
        }
        assert!(stack.load_exposure("G141,111").is_err());
    }

    #[test]
    fn sensitivity_curves_are_resolved_by_conf() {
        let (mut stack, _) = demo_stack();
        for ext in stack.extensions.iter_mut().filter(|e| e.name == "SCI") {
            ext.header.insert("ISFLAM".into(), Value::from(0));
            ext.header.insert("CONF".into(), Value::from("G141.conf"));
        }
        assert!(stack.load_exposure("G141,111").is_err());

        stack.sensitivity.insert(
            "G141.conf".to_string(),
            SensitivityCurve {
                wavelength: vec![1.0e4, 1.8e4],
                sensitivity: vec![1.0, 1.0],
            },
        );
        let e = stack.load_exposure("G141,111").unwrap();
        assert!(!e.calibration.is_flambda());
    }
}
