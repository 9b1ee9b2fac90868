//! Virtual-to-physical path resolution.

use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use sharevault_protocol::{AuditEventType, SecurityAuditEvent};
use tracing::{error, warn};

use crate::audit::AuditSink;
use crate::error::SandboxError;

/// Maps user-facing virtual paths onto a user's sandbox root.
pub struct PathVirtualizer {
    audit: Arc<dyn AuditSink>,
}

enum Rejection {
    Security(AuditEventType),
    Base(io::Error),
}

impl PathVirtualizer {
    /// Creates a virtualizer that reports rejections to `audit`.
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self { audit }
    }

    /// Resolves `virtual_path` against `base_path`.
    ///
    /// The result is canonical (symlinks resolved for every component that
    /// exists) and is either `base_path` itself, for the virtual root, or a
    /// strict descendant of it. Anything else fails with
    /// [`SandboxError::PathTraversal`] after exactly one audit event has
    /// been appended.
    pub fn resolve(
        &self,
        username: &str,
        base_path: &Path,
        virtual_path: &str,
    ) -> Result<PathBuf, SandboxError> {
        match resolve_inner(base_path, virtual_path) {
            Ok(physical) => Ok(physical),
            Err(Rejection::Security(kind)) => Err(self.reject(kind, username, virtual_path)),
            Err(Rejection::Base(e)) => {
                error!(user = %username, error = %e, "sandbox root unavailable");
                Err(SandboxError::Io(e))
            }
        }
    }

    fn reject(&self, kind: AuditEventType, username: &str, virtual_path: &str) -> SandboxError {
        warn!(
            user = %username,
            path = %virtual_path,
            kind = ?kind,
            "rejected path outside sandbox"
        );
        let event = SecurityAuditEvent::new(kind, username, virtual_path);
        if let Err(e) = self.audit.append(&event) {
            error!(user = %username, error = %e, "failed to append security audit event");
        }
        SandboxError::PathTraversal {
            virtual_path: virtual_path.to_string(),
        }
    }
}

/// Normalizes a virtual path to its canonical `/a/b` form.
///
/// Collapses `.` and `..`, treats `\` as a separator, and rejects null
/// bytes, drive letters, UNC prefixes and any `..` that climbs above `/`.
/// This is purely lexical and does not audit.
pub fn normalize_virtual_path(virtual_path: &str) -> Result<String, SandboxError> {
    let segments = split_virtual(virtual_path).map_err(|_| SandboxError::PathTraversal {
        virtual_path: virtual_path.to_string(),
    })?;
    Ok(join_virtual(&segments))
}

/// Maps a physical path under `base_path` back to its virtual form.
///
/// Purely lexical: `physical_path` must be spelled with the same prefix as
/// `base_path` (e.g. both canonical).
pub fn to_virtual(base_path: &Path, physical_path: &Path) -> Result<String, SandboxError> {
    let rel = physical_path
        .strip_prefix(base_path)
        .map_err(|_| SandboxError::Validation("path is outside the sandbox".into()))?;

    let mut segments = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(name) => segments.push(name.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(SandboxError::Validation(
                    "path is outside the sandbox".into(),
                ));
            }
        }
    }
    Ok(join_virtual(&segments))
}

fn resolve_inner(base_path: &Path, virtual_path: &str) -> Result<PathBuf, Rejection> {
    let segments = split_virtual(virtual_path).map_err(Rejection::Security)?;

    let base = std::fs::canonicalize(base_path).map_err(Rejection::Base)?;
    let mut candidate = base.clone();
    for segment in &segments {
        candidate.push(segment);
    }

    let resolved = canonicalize_existing(&candidate, &base)?;

    if !resolved.starts_with(&base) {
        return Err(Rejection::Security(AuditEventType::SymlinkEscape));
    }
    // Only the virtual root may map onto the sandbox root itself.
    if resolved == base && !segments.is_empty() {
        return Err(Rejection::Security(AuditEventType::SymlinkEscape));
    }
    Ok(resolved)
}

/// Canonicalizes the longest existing prefix of `path` and re-appends the
/// missing tail. `base` is known to exist, so the walk always terminates.
fn canonicalize_existing(path: &Path, base: &Path) -> Result<PathBuf, Rejection> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<OsString> = Vec::new();

    loop {
        match std::fs::canonicalize(&existing) {
            Ok(mut canonical) => {
                for name in tail.iter().rev() {
                    canonical.push(name);
                }
                return Ok(canonical);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // A dangling symlink reports NotFound too; its target is
                // unknown, so it cannot be trusted to stay inside.
                if std::fs::symlink_metadata(&existing).is_ok() {
                    return Err(Rejection::Security(AuditEventType::SymlinkEscape));
                }
                if existing == base {
                    return Err(Rejection::Base(e));
                }
                match (existing.file_name(), existing.parent()) {
                    (Some(name), Some(parent)) => {
                        tail.push(name.to_os_string());
                        existing = parent.to_path_buf();
                    }
                    _ => return Err(Rejection::Base(e)),
                }
            }
            Err(e) => return Err(Rejection::Base(e)),
        }
    }
}

fn split_virtual(virtual_path: &str) -> Result<Vec<String>, AuditEventType> {
    if virtual_path.contains('\0') {
        return Err(AuditEventType::MalformedPath);
    }

    let unified = virtual_path.replace('\\', "/");
    if unified.starts_with("//") {
        return Err(AuditEventType::MalformedPath);
    }

    let mut segments: Vec<String> = Vec::new();
    for (i, segment) in unified.split('/').enumerate() {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(AuditEventType::PathTraversal);
                }
            }
            s => {
                if i <= 1 && is_drive_prefix(s) {
                    return Err(AuditEventType::MalformedPath);
                }
                segments.push(s.to_string());
            }
        }
    }
    Ok(segments)
}

fn is_drive_prefix(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn join_virtual(segments: &[String]) -> String {
    if segments.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(segment);
    }
    out
}
