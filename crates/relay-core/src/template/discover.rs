//! Locate the ICF template inside an export output.
//!
//! The configured template file at the output root wins. Otherwise every text
//! file with a properties-like extension is a candidate, including files
//! inside zip archives (nested archives too). `.properties` beats `.txt` and
//! `.cfg`, which beat the rest; ties go to the shorter file name, then to
//! `customization-template/` and `customization/` over the rest of the tree.
//! With no candidate the configured fallback template is used, and with no
//! fallback the artifact has no template at all.

use std::fmt;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ExportError;

use super::{IcfTemplate, TemplateFormat, has_properties_suffix};

const MAX_ARCHIVE_DEPTH: usize = 3;
const MAX_CANDIDATE_BYTES: u64 = 1024 * 1024;
const MAX_NESTED_ARCHIVE_BYTES: u64 = 64 * 1024 * 1024;
const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";

/// Directories searched ahead of the rest of the output.
const PREFERRED_DIRS: &[&str] = &["customization-template", "customization"];

/// How the template of an artifact was obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateStatus {
    /// Found in the export output, with at least one key.
    #[default]
    Ready,
    /// Found in the export output, without keys.
    Empty,
    /// Taken from the configured fallback template.
    Fallback,
    /// No template anywhere; nothing to merge.
    Missing,
}

impl fmt::Display for TemplateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TemplateStatus::Ready => "ready",
            TemplateStatus::Empty => "empty",
            TemplateStatus::Fallback => "fallback",
            TemplateStatus::Missing => "missing",
        };
        f.write_str(label)
    }
}

/// Where template text came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateOrigin {
    /// A file in the output, relative to its root.
    Output(PathBuf),
    /// An entry of an archive in the output. Nested archives are listed outermost first.
    Archive {
        archive: PathBuf,
        entries: Vec<String>,
    },
    Fallback(PathBuf),
}

impl fmt::Display for TemplateOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateOrigin::Output(path) | TemplateOrigin::Fallback(path) => {
                write!(f, "{}", path.display())
            }
            TemplateOrigin::Archive { archive, entries } => {
                write!(f, "{}", archive.display())?;
                for entry in entries {
                    write!(f, "!/{entry}")?;
                }
                Ok(())
            }
        }
    }
}

/// What to look for.
#[derive(Debug, Clone, Copy)]
pub struct TemplateSearch<'a> {
    /// Template file name at the output root.
    pub template_file: &'a str,
    pub fallback: Option<&'a Path>,
}

#[derive(Debug, Clone)]
pub struct DiscoveredTemplate {
    pub status: TemplateStatus,
    pub origin: Option<TemplateOrigin>,
    pub template: IcfTemplate,
}

/// Find and parse the template of the export output at `output`.
///
/// Only an unreadable configured template file or fallback is an error; an
/// output without any template yields [`TemplateStatus::Missing`].
pub fn discover(
    output: &Path,
    search: TemplateSearch<'_>,
) -> Result<DiscoveredTemplate, ExportError> {
    let configured = output.join(search.template_file);
    if configured.is_file() {
        let raw = read_text(&configured)?;
        let template = IcfTemplate::parse(&raw, TemplateFormat::detect(&configured, &raw));
        return Ok(found(
            template,
            TemplateOrigin::Output(PathBuf::from(search.template_file)),
        ));
    }

    let mut candidates = Vec::new();
    collect_dir(output, output, &mut candidates);
    candidates.sort_by(|a, b| a.rank().cmp(&b.rank()));

    if let Some(chosen) = candidates.into_iter().next() {
        debug!(template = %chosen.origin, "Selected ICF template");
        let format = TemplateFormat::detect(Path::new(&chosen.name), &chosen.text);
        let template = IcfTemplate::parse(&chosen.text, format);
        return Ok(found(template, chosen.origin));
    }

    if let Some(fallback) = search.fallback {
        if fallback.is_file() {
            let raw = read_text(fallback)?;
            let template = IcfTemplate::parse(&raw, TemplateFormat::detect(fallback, &raw));
            return Ok(DiscoveredTemplate {
                status: TemplateStatus::Fallback,
                origin: Some(TemplateOrigin::Fallback(fallback.to_path_buf())),
                template,
            });
        }
        warn!(fallback = %fallback.display(), "Fallback ICF template does not exist");
    }

    warn!(output = %output.display(), "No ICF template in export output");
    Ok(DiscoveredTemplate {
        status: TemplateStatus::Missing,
        origin: None,
        template: IcfTemplate::empty(),
    })
}

fn found(template: IcfTemplate, origin: TemplateOrigin) -> DiscoveredTemplate {
    let status = if template.requires_overrides() {
        TemplateStatus::Ready
    } else {
        warn!(template = %origin, "ICF template has no keys");
        TemplateStatus::Empty
    };
    DiscoveredTemplate {
        status,
        origin: Some(origin),
        template,
    }
}

fn read_text(path: &Path) -> Result<String, ExportError> {
    fs::read_to_string(path).map_err(|e| ExportError::TemplateUnreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

struct Candidate {
    origin: TemplateOrigin,
    /// File name, without directories.
    name: String,
    /// Path of the file relative to the output; for archive entries, the archive's.
    location: PathBuf,
    text: String,
}

impl Candidate {
    fn rank(&self) -> (u8, usize, &str, usize, String) {
        let extension = Path::new(&self.name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let priority = match extension.as_deref() {
            Some("properties") => 0,
            Some("txt" | "cfg") => 1,
            _ => 2,
        };
        let dir = match self.location.components().next() {
            Some(Component::Normal(first)) => PREFERRED_DIRS
                .iter()
                .position(|dir| first == *dir)
                .unwrap_or(PREFERRED_DIRS.len()),
            _ => PREFERRED_DIRS.len(),
        };
        (
            priority,
            self.name.chars().count(),
            &self.name,
            dir,
            self.origin.to_string(),
        )
    }
}

fn collect_dir(root: &Path, dir: &Path, candidates: &mut Vec<Candidate>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "Skipping unreadable directory");
            return;
        }
    };
    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    paths.sort();

    for path in paths {
        let Ok(file_type) = fs::symlink_metadata(&path).map(|m| m.file_type()) else {
            continue;
        };
        if file_type.is_dir() {
            collect_dir(root, &path, candidates);
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let location = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let name = file_name(&path);
        if has_properties_suffix(&path) {
            let text = fs::read(&path)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok());
            if let Some(text) = text {
                candidates.push(Candidate {
                    origin: TemplateOrigin::Output(location.clone()),
                    name,
                    location,
                    text,
                });
            }
            continue;
        }

        if is_zip_file(&path) {
            match fs::read(&path) {
                Ok(data) => collect_archive(&data, &location, &[], candidates),
                Err(err) => {
                    warn!(archive = %path.display(), error = %err, "Skipping unreadable archive")
                }
            }
        }
    }
}

fn is_zip_file(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    fs::File::open(path)
        .and_then(|mut file| file.read_exact(&mut magic))
        .is_ok_and(|()| &magic == ZIP_MAGIC)
}

/// Collect candidates from an in-memory archive. `nesting` names the archive
/// entries leading to this one.
fn collect_archive(
    data: &[u8],
    location: &Path,
    nesting: &[String],
    candidates: &mut Vec<Candidate>,
) {
    if nesting.len() >= MAX_ARCHIVE_DEPTH {
        warn!(archive = %location.display(), "Archives nested too deeply; skipping");
        return;
    }
    let mut archive = match zip::ZipArchive::new(Cursor::new(data)) {
        Ok(archive) => archive,
        Err(err) => {
            warn!(archive = %location.display(), error = %err, "Skipping unreadable archive");
            return;
        }
    };

    for i in 0..archive.len() {
        let Ok(mut file) = archive.by_index(i) else {
            continue;
        };
        if file.is_dir() {
            continue;
        }
        // Entries that would escape the archive are skipped
        let Some(entry_path) = file.enclosed_name() else {
            continue;
        };
        let entry = entry_path.to_string_lossy().replace('\\', "/");

        let limit = if has_properties_suffix(&entry_path) {
            MAX_CANDIDATE_BYTES
        } else if is_zip_name(&entry_path) {
            MAX_NESTED_ARCHIVE_BYTES
        } else {
            continue;
        };
        if file.size() > limit {
            warn!(archive = %location.display(), entry = %entry, "Skipping oversized archive entry");
            continue;
        }

        let mut bytes = Vec::new();
        if let Err(err) = file.read_to_end(&mut bytes) {
            warn!(archive = %location.display(), entry = %entry, error = %err, "Skipping unreadable archive entry");
            continue;
        }

        let mut entries = nesting.to_vec();
        entries.push(entry);
        if is_zip_name(&entry_path) {
            collect_archive(&bytes, location, &entries, candidates);
        } else if let Ok(text) = String::from_utf8(bytes) {
            candidates.push(Candidate {
                origin: TemplateOrigin::Archive {
                    archive: location.to_path_buf(),
                    entries,
                },
                name: file_name(&entry_path),
                location: location.to_path_buf(),
                text,
            });
        }
    }
}

fn is_zip_name(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
