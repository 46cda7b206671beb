//! Role selection.

use crate::error::{BundleError, BundleResult};
use crate::model::ResolvedBundle;

/// Role used when neither the caller nor the reference names one.
pub const DEFAULT_ROLE: &str = "default";

/// A role chosen for materialization, with its layer names in manifest order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedRole {
    pub name: String,
    pub layers: Vec<String>,
}

/// Pick a role: explicit argument, then reference hint, then `default`.
///
/// Disagreement between `explicit` and `hint` is not an error; the explicit
/// argument wins.
pub fn select_role(
    bundle: &ResolvedBundle,
    explicit: Option<&str>,
    hint: Option<&str>,
) -> BundleResult<SelectedRole> {
    let available = bundle.role_names();
    let name = match explicit.or(hint) {
        Some(name) => name,
        None if bundle.roles.contains_key(DEFAULT_ROLE) => DEFAULT_ROLE,
        None => return Err(BundleError::NoRoleSelected { available }),
    };

    let wanted = bundle
        .roles
        .get(name)
        .ok_or_else(|| BundleError::RoleNotFound {
            role: name.to_string(),
            available: available.clone(),
        })?;

    let mut missing: Vec<String> = wanted
        .iter()
        .filter(|layer| bundle.layer(layer).is_none())
        .cloned()
        .collect();
    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(BundleError::MissingLayers {
            role: name.to_string(),
            missing,
        });
    }

    // Manifest order, not role-list order.
    let layers = bundle
        .layers
        .iter()
        .filter(|l| wanted.contains(&l.name))
        .map(|l| l.name.clone())
        .collect();

    Ok(SelectedRole {
        name: name.to_string(),
        layers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::error::ErrorKind;
    use crate::model::LayerDescriptor;
    use std::collections::BTreeMap;

    fn bundle(with_default: bool) -> ResolvedBundle {
        let mut roles = BTreeMap::new();
        roles.insert("runtime".to_string(), vec!["config".into(), "code".into()]);
        roles.insert("training".to_string(), vec!["code".into(), "data".into()]);
        if with_default {
            roles.insert(DEFAULT_ROLE.to_string(), vec!["code".into()]);
        }
        let layers: Vec<LayerDescriptor> = ["code", "config", "data"]
            .iter()
            .map(|n| LayerDescriptor {
                name: n.to_string(),
                layer_id: Digest::of_bytes(n.as_bytes()),
            })
            .collect();
        ResolvedBundle {
            manifest_digest: Digest::of_bytes(b"m"),
            media_type: crate::media::BUNDLE_MANIFEST.to_string(),
            roles,
            layer_index_digests: BTreeMap::new(),
            layers,
            external_index_present: false,
            cache_dir: None,
        }
    }

    #[test]
    fn test_precedence_explicit_over_hint_over_default() {
        let b = bundle(true);
        assert_eq!(select_role(&b, Some("training"), Some("runtime")).unwrap().name, "training");
        assert_eq!(select_role(&b, None, Some("runtime")).unwrap().name, "runtime");
        assert_eq!(select_role(&b, None, None).unwrap().name, DEFAULT_ROLE);
    }

    #[test]
    fn test_no_role_and_no_default() {
        let err = select_role(&bundle(false), None, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RoleLayerMismatch);
        let msg = err.to_string();
        assert!(msg.contains("runtime") && msg.contains("training"));
    }

    #[test]
    fn test_unknown_role_lists_available() {
        let err = select_role(&bundle(true), Some("eval"), None).unwrap_err();
        assert_eq!(err.exit_code(), 11);
        assert!(err.to_string().contains("runtime"));
    }

    #[test]
    fn test_missing_layers_named() {
        let mut b = bundle(false);
        b.roles
            .insert("broken".into(), vec!["code".into(), "ghost".into(), "phantom".into()]);
        let err = select_role(&b, Some("broken"), None).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ghost") && msg.contains("phantom"));
    }

    #[test]
    fn test_layers_in_manifest_order() {
        let selected = select_role(&bundle(false), Some("runtime"), None).unwrap();
        assert_eq!(selected.layers, vec!["code", "config"]);
    }
}
