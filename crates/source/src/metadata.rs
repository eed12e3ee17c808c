//! Filesystem metadata extraction.
//!
//! # Symlink policy
//! `is_symlink` describes the path itself (`lstat`, links are not followed).
//! Every other field describes what the path resolves to (`stat`, links are
//! followed), so a link to a regular file reports `is_symlink: true` *and*
//! `is_file: true` with the target's size and timestamps. A dangling link has
//! nothing to follow; it falls back to the link's own metadata rather than
//! failing, since the path does exist.

use crate::error::{ErrorKind, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::Metadata as FsMetadata;
use std::path::Path;
use time::OffsetDateTime;
use tokio::fs;
use tracing::instrument;

pub const OCTET_STREAM: &str = "application/octet-stream";
pub const DIRECTORY_MIME: &str = "inode/directory";

/// Normalized metadata for one source.
///
/// Produced fresh on every call; nothing here is cached.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Metadata {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    /// Text after the last `.` of the name, without the dot; empty if none.
    pub extension: String,
    pub is_directory: bool,
    pub is_file: bool,
    pub is_symlink: bool,
    /// Permission bits (`0o7777` mask on Unix).
    pub permissions: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    /// Scheme-specific fields, serialized alongside the common ones.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Extract metadata for a local path.
///
/// # Errors
/// Returns [`Io`](ErrorKind::Io) with the path and the OS error when the path
/// does not exist or cannot be inspected.
#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub async fn extract(path: impl AsRef<Path>) -> Result<Metadata> {
    let path = path.as_ref();
    let link = fs::symlink_metadata(path).await.map_err(|e| ErrorKind::io(path, e))?;
    let is_symlink = link.file_type().is_symlink();
    let stat = match is_symlink {
        false => link,
        true => match fs::metadata(path).await {
            Ok(target) => target,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Dangling symlink; reporting the link itself");
                link
            },
            Err(e) => exn::bail!(ErrorKind::io(path, e)),
        },
    };

    let modified_at: OffsetDateTime = stat.modified().map_err(|e| ErrorKind::io(path, e))?.into();
    // Not every filesystem records a birth time.
    let created_at = stat.created().map(OffsetDateTime::from).unwrap_or(modified_at);
    let extension = extension_of(path);
    let mime_type = match stat.is_dir() {
        true => DIRECTORY_MIME.to_string(),
        false => mime_for(&extension),
    };

    Ok(Metadata {
        name: name_of(path),
        size: stat.len(),
        mime_type,
        extension,
        is_directory: stat.is_dir(),
        is_file: stat.is_file(),
        is_symlink,
        permissions: permissions_of(&stat),
        created_at,
        modified_at,
        uid: owner_of(&stat).map(|(uid, _)| uid),
        gid: owner_of(&stat).map(|(_, gid)| gid),
        extra: extra_of(&stat),
    })
}

fn name_of(path: &Path) -> String {
    match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        // `/` and friends have no final component.
        None => path.to_string_lossy().into_owned(),
    }
}

pub(crate) fn extension_of(path: &Path) -> String {
    path.extension().map(|ext| ext.to_string_lossy().into_owned()).unwrap_or_default()
}

/// Registered MIME type for an extension, [`OCTET_STREAM`] when unknown.
pub fn mime_for(extension: &str) -> String {
    mime_guess::from_ext(extension).first_or_octet_stream().essence_str().to_string()
}

#[cfg(unix)]
fn permissions_of(stat: &FsMetadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    stat.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permissions_of(stat: &FsMetadata) -> u32 {
    match stat.permissions().readonly() {
        true => 0o444,
        false => 0o644,
    }
}

#[cfg(unix)]
fn owner_of(stat: &FsMetadata) -> Option<(u32, u32)> {
    use std::os::unix::fs::MetadataExt;
    Some((stat.uid(), stat.gid()))
}

#[cfg(not(unix))]
fn owner_of(_stat: &FsMetadata) -> Option<(u32, u32)> {
    None
}

#[cfg(unix)]
fn extra_of(stat: &FsMetadata) -> BTreeMap<String, Value> {
    use std::os::unix::fs::MetadataExt;
    use time::format_description::well_known::Rfc3339;
    let mut extra = BTreeMap::new();
    extra.insert("inode".to_string(), Value::from(stat.ino()));
    extra.insert("device".to_string(), Value::from(stat.dev()));
    extra.insert("nlink".to_string(), Value::from(stat.nlink()));
    let accessed = stat.accessed().ok().and_then(|at| OffsetDateTime::from(at).format(&Rfc3339).ok());
    if let Some(accessed) = accessed {
        extra.insert("accessed_at".to_string(), Value::from(accessed));
    }
    extra
}

#[cfg(not(unix))]
fn extra_of(_stat: &FsMetadata) -> BTreeMap<String, Value> {
    BTreeMap::new()
}
