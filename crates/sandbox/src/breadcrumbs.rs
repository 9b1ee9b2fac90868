//! Breadcrumb trail for virtual paths.

use serde::{Deserialize, Serialize};

/// Label used for the virtual root.
pub const ROOT_LABEL: &str = "/";

/// One step of a breadcrumb trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breadcrumb {
    /// Display label (the last segment of `path`).
    pub label: String,
    /// Virtual path up to and including this step.
    pub path: String,
}

/// Builds the breadcrumb trail for `virtual_path`, root first.
///
/// Pure and infallible: `.` and empty segments are skipped and `..` steps
/// back without ever leaving the root.
pub fn breadcrumbs(virtual_path: &str) -> Vec<Breadcrumb> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in virtual_path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut trail = Vec::with_capacity(segments.len() + 1);
    trail.push(Breadcrumb {
        label: ROOT_LABEL.to_string(),
        path: "/".to_string(),
    });

    let mut prefix = String::new();
    for segment in segments {
        prefix.push('/');
        prefix.push_str(segment);
        trail.push(Breadcrumb {
            label: segment.to_string(),
            path: prefix.clone(),
        });
    }
    trail
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(trail: &[Breadcrumb]) -> Vec<&str> {
        trail.iter().map(|b| b.path.as_str()).collect()
    }

    #[test]
    fn root_only() {
        let trail = breadcrumbs("/");
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].label, ROOT_LABEL);
        assert_eq!(trail[0].path, "/");
    }

    #[test]
    fn accumulates_prefixes() {
        let trail = breadcrumbs("/docs/reports/q1.pdf");
        assert_eq!(paths(&trail), vec!["/", "/docs", "/docs/reports", "/docs/reports/q1.pdf"]);
        assert_eq!(trail[3].label, "q1.pdf");
    }

    #[test]
    fn skips_dots_and_duplicate_slashes() {
        let trail = breadcrumbs("docs//./reports/");
        assert_eq!(paths(&trail), vec!["/", "/docs", "/docs/reports"]);
    }

    #[test]
    fn parent_never_leaves_root() {
        let trail = breadcrumbs("/../../docs/../music");
        assert_eq!(paths(&trail), vec!["/", "/music"]);
    }
}
