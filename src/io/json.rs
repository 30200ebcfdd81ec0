//! Shared JSON plumbing plus the small auxiliary inputs (prior, photometry).

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::Prior;
use crate::error::AppError;
use crate::fit::TabulatedCatalog;

/// Read a JSON document; `what` names it in error messages.
pub fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::input(format!("Failed to open {what} '{}': {e}", path.display())))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| AppError::input(format!("Invalid {what} '{}': {e}", path.display())))
}

/// Write a pretty-printed JSON document.
pub fn write_json<T: Serialize>(path: &Path, value: &T, what: &str) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::input(format!("Failed to create {what} '{}': {e}", path.display())))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .map_err(|e| AppError::input(format!("Failed to write {what}: {e}")))?;
    writer
        .flush()
        .map_err(|e| AppError::input(format!("Failed to write {what}: {e}")))
}

/// Chi-squared prior `{z: [...], chi2: [...]}`.
pub fn read_prior(path: &Path) -> Result<Prior, AppError> {
    let prior: Prior = read_json(path, "prior")?;
    prior.validate()?;
    Ok(prior)
}

pub fn read_catalog(path: &Path) -> Result<TabulatedCatalog, AppError> {
    let catalog: TabulatedCatalog = read_json(path, "photometric catalog")?;
    catalog.validate()?;
    Ok(catalog)
}
