//! Commessa bundle import (spec §6 `.mmcomm` format, external interface).
//!
//! The tarball's manifest parsing and SQLite dump replay are external
//! collaborators (same boundary as Excel/SIX parsing); this module only
//! carries the core's own decision — code-collision detection and the
//! `overwrite` contract — that `import_bundle` is specified to enforce
//! before handing off to the replay step.

use crate::error::AppError;
use crate::models::Commessa;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleManifest {
    pub commessa_code: String,
    pub commessa_name: String,
    pub business_unit: Option<String>,
}

/// What the caller should do once a bundle's manifest has been read:
/// create fresh, or replace an existing commessa matching `commessa_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleImportAction {
    Create,
    Replace,
}

/// `import_bundle`'s collision check (spec §6/§7): a matching existing
/// commessa without `overwrite=true` is a `Conflict`; with it, the caller
/// replaces the existing commessa's scoped rows before replaying the dump.
pub fn resolve_bundle_import(
    manifest: &BundleManifest,
    existing: Option<&Commessa>,
    overwrite: bool,
) -> Result<BundleImportAction, AppError> {
    match existing {
        None => Ok(BundleImportAction::Create),
        Some(_) if overwrite => Ok(BundleImportAction::Replace),
        Some(_) => Err(AppError::Conflict(format!(
            "una commessa con codice '{}' esiste già; passare overwrite=true per sostituirla",
            manifest.commessa_code
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> BundleManifest {
        BundleManifest {
            commessa_code: "K1".to_string(),
            commessa_name: "Cantiere K1".to_string(),
            business_unit: None,
        }
    }

    fn commessa() -> Commessa {
        Commessa {
            id: 1,
            code: "K1".to_string(),
            name: "Cantiere K1".to_string(),
            business_unit: None,
        }
    }

    #[test]
    fn test_no_collision_creates() {
        assert_eq!(
            resolve_bundle_import(&manifest(), None, false).unwrap(),
            BundleImportAction::Create
        );
    }

    #[test]
    fn test_collision_without_overwrite_is_conflict() {
        let err = resolve_bundle_import(&manifest(), Some(&commessa()), false).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn test_collision_with_overwrite_replaces() {
        assert_eq!(
            resolve_bundle_import(&manifest(), Some(&commessa()), true).unwrap(),
            BundleImportAction::Replace
        );
    }
}
