//! Locating subjects and their files in a BIDS-style layout.
//!
//! Expected layout per subject:
//!
//! ```text
//! sub-<label>/<session>/func/*.nii.gz                                   moving series
//! sub-<label>/<session>/func/*.json                                     scan sidecar
//! sub-<label>/<session>/func/_scan_info_subject_id<label>*/*.nii.gz     reference image
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;

/// Errors that can occur while locating input files.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("No subject folders (sub-*) found in {0}")]
    NoSubjects(PathBuf),

    #[error("Failed to find the {kind} in {dir}")]
    MissingFile { kind: &'static str, dir: PathBuf },

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Result type for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// A subject folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    /// Folder name, e.g. `sub-003`
    pub name: String,
    /// Label after `sub-`, e.g. `003`
    pub label: String,
    /// Path of the folder
    pub dir: PathBuf,
}

impl Subject {
    /// Functional data folder of `session`.
    pub fn func_dir(&self, session: &str) -> PathBuf {
        self.dir.join(session).join("func")
    }
}

/// Input files of one subject's functional scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectFiles {
    /// 4D series to be corrected
    pub moving: PathBuf,
    /// JSON sidecar with scan timing
    pub scan_info: PathBuf,
}

impl SubjectFiles {
    /// Find the moving series and the sidecar of `subject`.
    pub fn locate(subject: &Subject, session: &str) -> Result<Self> {
        let func = subject.func_dir(session);
        if !func.is_dir() {
            return Err(DiscoveryError::DirectoryNotFound(func));
        }

        let moving = list_files(&func, |name| name.ends_with(".nii.gz"))
            .into_iter()
            .next()
            .ok_or_else(|| DiscoveryError::MissingFile {
                kind: "moving images nifti file",
                dir: func.clone(),
            })?;

        let scan_info = list_files(&func, |name| name.ends_with(".json"))
            .into_iter()
            .next()
            .ok_or_else(|| DiscoveryError::MissingFile {
                kind: "scan info json file",
                dir: func.clone(),
            })?;

        Ok(Self { moving, scan_info })
    }
}

/// Sorted regular files of `dir` whose name satisfies `accept`.
fn list_files<F>(dir: &Path, accept: F) -> Vec<PathBuf>
where
    F: Fn(&str) -> bool,
{
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(&accept)
                .unwrap_or(false)
        })
        .collect();

    files.sort();
    files
}

/// Find every `sub-*` folder directly inside `input_dir`, sorted by name.
pub fn find_subjects(input_dir: &Path) -> Result<Vec<Subject>> {
    if !input_dir.is_dir() {
        return Err(DiscoveryError::DirectoryNotFound(input_dir.to_path_buf()));
    }

    let pattern = Regex::new(r"^sub-([A-Za-z0-9_-]+)$")?;

    let mut subjects: Vec<Subject> = fs::read_dir(input_dir)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter_map(|dir| {
            let name = dir.file_name()?.to_str()?.to_string();
            pattern.captures(&name)?;
            let label = name.rsplit('-').next()?.to_string();
            Some(Subject { name, label, dir })
        })
        .collect();

    if subjects.is_empty() {
        return Err(DiscoveryError::NoSubjects(input_dir.to_path_buf()));
    }

    subjects.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(subjects)
}

/// Find the reference image prepared for `subject`.
///
/// Looks inside `_scan_info_subject_id<label>*` folders of the session's
/// functional directory.
pub fn find_reference_image(subject: &Subject, session: &str) -> Result<PathBuf> {
    let func = subject.func_dir(session);
    let prefix = format!("_scan_info_subject_id{}", subject.label);

    let mut candidates: Vec<PathBuf> = fs::read_dir(&func)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&prefix))
                .unwrap_or(false)
        })
        .collect();
    candidates.sort();

    candidates
        .iter()
        .flat_map(|dir| list_files(dir, |name| name.ends_with(".nii.gz")))
        .next()
        .ok_or(DiscoveryError::MissingFile {
            kind: "reference nifti file",
            dir: func,
        })
}

/// Recursively find every file called `file_name` below `root`, sorted.
///
/// Symlinked directories are not descended into.
pub fn find_files_named(root: &Path, file_name: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).into_iter().flatten().filter_map(|e| e.ok()) {
            // symlinks are not followed, so links back up the tree cannot loop
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if path.file_name().and_then(|n| n.to_str()) == Some(file_name) {
                found.push(path);
            }
        }
    }

    found.sort();
    found
}

/// Path component `depth` positions from the end (1 = the file name).
///
/// With the default depth of 4, `.../<dataset>/<run>/<subject>/analysis_data.csv`
/// yields `<dataset>`.
pub fn dataset_label(path: &Path, depth: usize) -> Option<String> {
    if depth == 0 {
        return None;
    }
    let parts: Vec<&str> = path
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();
    if parts.len() < depth {
        return None;
    }
    Some(parts[parts.len() - depth].to_string())
}
