//! Template file: `{complexes: [...], lines: [...]}` of `{name, wave, flux}`.

use std::path::Path;

use crate::error::AppError;
use crate::io::json::{read_json, write_json};
use crate::spectrum::TemplateLibrary;

pub fn read_templates(path: &Path) -> Result<TemplateLibrary, AppError> {
    let lib: TemplateLibrary = read_json(path, "template file")?;
    if lib.complexes.is_empty() || lib.lines.is_empty() {
        return Err(AppError::input(format!(
            "Template file '{}' needs both complexes and lines.",
            path.display()
        )));
    }
    TemplateLibrary::new(lib.complexes, lib.lines)
}

pub fn write_templates(path: &Path, lib: &TemplateLibrary) -> Result<(), AppError> {
    write_json(path, lib, "template file")
}
