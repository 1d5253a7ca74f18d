//! Plugin package format: zip extraction and manifest validation.
//!
//! A plugin package is a zip containing exactly `rootfs.ext4` and
//! `plugin.json`; grounded in the teacher's `storage/memory.rs` approach of
//! strict, fail-closed validation before anything is registered.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const SLUG_PATTERN: &str = r"^[a-z0-9]([a-z0-9-]{1,48}[a-z0-9])?$";
const SEMVER_PATTERN: &str = r"^\d+\.\d+\.\d+(-[A-Za-z0-9.\-]+)?$";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Python,
    Node,
    Php,
    Go,
    Rust,
    Java,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Hooks this action answers; an action may subscribe to more than one.
    pub hooks: Vec<String>,
    pub method: String,
    /// Path on the guest's hook server, e.g. `/hooks/on-commit`.
    pub endpoint: String,
    /// Dispatch ordering; higher runs first (design §4.5/§5).
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub slug: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    /// Optional per spec.md §6, alongside `description`/`author`.
    #[serde(default)]
    pub runtime: Option<Runtime>,
    /// Keyed by action name, per spec.md §6. Optional: a manifest may
    /// declare no actions at all (e.g. a plugin with no hooks yet).
    #[serde(default)]
    pub actions: HashMap<String, Action>,
}

impl Manifest {
    pub fn validate(&self) -> Result<()> {
        let slug_re = regex::Regex::new(SLUG_PATTERN).expect("static pattern");
        if !slug_re.is_match(&self.slug) {
            return Err(Error::Validation(format!(
                "invalid plugin slug: {}",
                self.slug
            )));
        }

        if self.name.trim().is_empty() {
            return Err(Error::Validation("plugin name must not be empty".to_string()));
        }

        let semver_re = regex::Regex::new(SEMVER_PATTERN).expect("static pattern");
        if !semver_re.is_match(&self.version) {
            return Err(Error::Validation(format!(
                "invalid plugin version: {}",
                self.version
            )));
        }

        for (name, action) in &self.actions {
            if action.hooks.is_empty() {
                return Err(Error::Validation(format!(
                    "action {name} declares no hooks"
                )));
            }
            if !action.endpoint.starts_with('/') {
                return Err(Error::Validation(format!(
                    "action {name} endpoint must be absolute: {}",
                    action.endpoint
                )));
            }
        }

        Ok(())
    }

    /// Every `(action, hook)` pair the dispatcher can route to, descending
    /// by declared priority (design §4.5).
    pub fn actions_for_hook(&self, hook: &str) -> Vec<&Action> {
        let mut matches: Vec<&Action> = self
            .actions
            .values()
            .filter(|a| a.hooks.iter().any(|h| h == hook))
            .collect();
        matches.sort_by(|a, b| b.priority.cmp(&a.priority));
        matches
    }
}

/// Extracts `rootfs.ext4` and `plugin.json` from a plugin package zip into
/// `dest_rootfs`/`dest_manifest`, rejecting anything else (missing entries,
/// path traversal). Extra entries in the archive are ignored.
pub fn extract_package(
    zip_path: &Path,
    dest_rootfs: &Path,
    dest_manifest: &Path,
) -> Result<Manifest> {
    let file = std::fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut rootfs_found = false;
    let mut manifest_found = false;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();

        let sanitized = sanitize_entry_name(&name)?;
        match sanitized.as_str() {
            "rootfs.ext4" => {
                let mut out = std::fs::File::create(dest_rootfs)?;
                std::io::copy(&mut entry, &mut out)?;
                rootfs_found = true;
            }
            "plugin.json" => {
                let mut buf = String::new();
                entry.read_to_string(&mut buf)?;
                std::fs::write(dest_manifest, &buf)?;
                manifest_found = true;
            }
            _ => {}
        }
    }

    if !rootfs_found {
        return Err(Error::Validation(
            "plugin package is missing rootfs.ext4".to_string(),
        ));
    }
    if !manifest_found {
        return Err(Error::Validation(
            "plugin package is missing plugin.json".to_string(),
        ));
    }

    let manifest_content = std::fs::read_to_string(dest_manifest)?;
    let manifest: Manifest = serde_json::from_str(&manifest_content)?;
    manifest.validate()?;
    Ok(manifest)
}

fn sanitize_entry_name(name: &str) -> Result<String> {
    let path = PathBuf::from(name);
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir | std::path::Component::RootDir))
    {
        return Err(Error::Validation(format!(
            "plugin package entry escapes the package root: {name}"
        )));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Manifest {
        let mut actions = HashMap::new();
        actions.insert(
            "greet".to_string(),
            Action {
                name: "greet".to_string(),
                description: String::new(),
                hooks: vec!["on-commit".to_string()],
                method: "POST".to_string(),
                endpoint: "/hooks/on-commit".to_string(),
                priority: 0,
            },
        );
        Manifest {
            slug: "my-plugin".to_string(),
            name: "My Plugin".to_string(),
            version: "1.2.3".to_string(),
            description: None,
            author: None,
            runtime: Some(Runtime::Node),
            actions,
        }
    }

    #[test]
    fn test_valid_manifest_passes() {
        assert!(sample_manifest().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_slug() {
        let mut manifest = sample_manifest();
        manifest.slug = "Invalid_Slug!".to_string();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_name() {
        let mut manifest = sample_manifest();
        manifest.name = "   ".to_string();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_accepts_prerelease_version() {
        let mut manifest = sample_manifest();
        manifest.version = "1.2.3-beta.1".to_string();
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_version() {
        let mut manifest = sample_manifest();
        manifest.version = "v1.2".to_string();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_empty_actions_is_valid() {
        let mut manifest = sample_manifest();
        manifest.actions.clear();
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_missing_runtime_deserializes_and_validates() {
        let json = r#"{
            "slug": "hello",
            "name": "Hello",
            "version": "1.0.0",
            "actions": {
                "greet": {
                    "name": "greet",
                    "hooks": ["on_greet"],
                    "method": "POST",
                    "endpoint": "/greet",
                    "priority": 10
                }
            }
        }"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert!(manifest.runtime.is_none());
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_rejects_action_with_no_hooks() {
        let mut manifest = sample_manifest();
        manifest.actions.get_mut("greet").unwrap().hooks.clear();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_rejects_relative_endpoint() {
        let mut manifest = sample_manifest();
        manifest.actions.get_mut("greet").unwrap().endpoint = "hooks/on-commit".to_string();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_actions_for_hook_sorted_descending_by_priority() {
        let mut manifest = sample_manifest();
        manifest.actions.insert(
            "greet-urgent".to_string(),
            Action {
                name: "greet-urgent".to_string(),
                description: String::new(),
                hooks: vec!["on-commit".to_string()],
                method: "POST".to_string(),
                endpoint: "/hooks/on-commit-urgent".to_string(),
                priority: 50,
            },
        );

        let matches = manifest.actions_for_hook("on-commit");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].name, "greet-urgent");
    }

    #[test]
    fn test_sanitize_rejects_path_traversal() {
        assert!(sanitize_entry_name("../../etc/passwd").is_err());
        assert!(sanitize_entry_name("/etc/passwd").is_err());
        assert!(sanitize_entry_name("plugin.json").is_ok());
    }
}
