//! Vendor file recognition and acquisition-time extraction.

use crate::error::Error;
use crate::storage::models::{AcquisitionSoftware, RawFile};
use chrono::{DateTime, Local, NaiveDateTime};
use std::fs;
use std::path::Path;

const INTAN_EXTENSIONS: [&str; 2] = ["rhd", "rhs"];
const SPIKEGLX_SUFFIX: &str = ".ap.bin";
const OPEN_EPHYS_STRUCTURE: &str = "structure.oebin";
const OPEN_EPHYS_LEGACY_EXTENSION: &str = "continuous";

/// Which acquisition system wrote `path`, judged by name alone.
pub fn classify(path: &Path) -> Option<AcquisitionSoftware> {
    let name = path.file_name()?.to_str()?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    if extension
        .as_deref()
        .is_some_and(|e| INTAN_EXTENSIONS.contains(&e))
    {
        Some(AcquisitionSoftware::Intan)
    } else if name.ends_with(SPIKEGLX_SUFFIX) {
        Some(AcquisitionSoftware::SpikeGlx)
    } else if name == OPEN_EPHYS_STRUCTURE
        || extension.as_deref() == Some(OPEN_EPHYS_LEGACY_EXTENSION)
    {
        Some(AcquisitionSoftware::OpenEphys)
    } else {
        None
    }
}

/// Split an Intan file stem `{prefix}_{yymmdd}_{hhmmss}` into prefix and timestamp.
pub fn parse_intan_stem(stem: &str) -> Option<(String, NaiveDateTime)> {
    let mut parts = stem.rsplitn(3, '_');
    let time = parts.next()?;
    let date = parts.next()?;
    let prefix = parts.next().unwrap_or("");
    let stamp = NaiveDateTime::parse_from_str(&format!("{}_{}", date, time), "%y%m%d_%H%M%S").ok()?;
    Some((prefix.to_string(), stamp))
}

/// Open Ephys names each recording folder `YYYY-MM-DD_HH-MM-SS`; the nearest such
/// ancestor dates the file.
pub fn open_ephys_folder_time(path: &Path) -> Option<NaiveDateTime> {
    path.ancestors().skip(1).find_map(|dir| {
        let name = dir.file_name()?.to_str()?;
        NaiveDateTime::parse_from_str(name, "%Y-%m-%d_%H-%M-%S").ok()
    })
}

/// `fileCreateTime` from the SpikeGLX `.meta` sidecar of an `.ap.bin` file.
pub fn spikeglx_create_time(bin_path: &Path) -> Option<NaiveDateTime> {
    let name = bin_path.file_name()?.to_str()?;
    let meta = bin_path.with_file_name(format!("{}.meta", name.strip_suffix(".bin")?));
    let text = fs::read_to_string(meta).ok()?;
    text.lines().find_map(|line| {
        let value = line.strip_prefix("fileCreateTime=")?;
        NaiveDateTime::parse_from_str(value.trim(), "%Y-%m-%dT%H:%M:%S").ok()
    })
}

fn modified_time(path: &Path) -> Result<NaiveDateTime, Error> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(DateTime::<Local>::from(modified).naive_local())
}

/// Build the catalog row for `path`, found under `root`.
pub fn describe_file(
    root: &Path,
    path: &Path,
    software: AcquisitionSoftware,
) -> Result<RawFile, Error> {
    let relative = path.strip_prefix(root).map_err(|_| {
        Error::Consistency(format!(
            "{} is not under root {}",
            path.display(),
            root.display()
        ))
    })?;
    let file_name = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent_folder = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    let (filename_prefix, file_time) = match software {
        AcquisitionSoftware::Intan => {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            match parse_intan_stem(&stem) {
                Some(parsed) => parsed,
                None => (stem, modified_time(path)?),
            }
        }
        AcquisitionSoftware::SpikeGlx => {
            let prefix = file_name
                .strip_suffix(SPIKEGLX_SUFFIX)
                .unwrap_or(&file_name)
                .to_string();
            let time = match spikeglx_create_time(path) {
                Some(time) => time,
                None => modified_time(path)?,
            };
            (prefix, time)
        }
        AcquisitionSoftware::OpenEphys => {
            let time = match open_ephys_folder_time(path) {
                Some(time) => time,
                None => modified_time(path)?,
            };
            (String::new(), time)
        }
    };

    Ok(RawFile {
        id: 0,
        file_path: relative.to_string_lossy().into_owned(),
        acq_software: software,
        file_time,
        parent_folder,
        filename_prefix,
    })
}
