//! Read/write the output record.
//!
//! The record is the portable result of one fit: the chi-squared curve, header
//! keywords, line measurements, coefficients, best-fit 1D templates and one
//! `MODEL` / `BACKGROUND` image per exposure version. The schema is defined by
//! `domain::ZFitRecord`.

use std::path::Path;

use crate::domain::ZFitRecord;
use crate::error::AppError;
use crate::io::json::{read_json, write_json};

pub fn write_record(path: &Path, record: &ZFitRecord) -> Result<(), AppError> {
    write_json(path, record, "output record")
}

pub fn read_record(path: &Path) -> Result<ZFitRecord, AppError> {
    read_json(path, "output record")
}
