//! In-memory registry of probe targets.

use std::collections::HashSet;
use std::net::IpAddr;

use thiserror::Error;

use crate::models::{PingTarget, TargetUpdate};

/// Registry error types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
    #[error("target {0} is already being probed")]
    DuplicateTarget(String),
    #[error("target not found: {0}")]
    NotFound(String),
}

/// Ordered set of targets, kept in insertion order.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: Vec<PingTarget>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new enabled target.
    pub fn add(&mut self, address: &str, label: Option<&str>) -> Result<PingTarget, RegistryError> {
        let address = address.trim();
        validate_address(address)?;

        if self.targets.iter().any(|t| t.enabled && t.address == address) {
            return Err(RegistryError::DuplicateTarget(address.to_string()));
        }

        let target = PingTarget::new(address, label.unwrap_or_default());
        self.targets.push(target.clone());
        Ok(target)
    }

    /// Remove a target, returning it.
    pub fn remove(&mut self, id: &str) -> Result<PingTarget, RegistryError> {
        let idx = self.position(id)?;
        Ok(self.targets.remove(idx))
    }

    /// Apply a partial update.
    pub fn update(&mut self, id: &str, fields: TargetUpdate) -> Result<PingTarget, RegistryError> {
        let idx = self.position(id)?;

        let address = match fields.address.as_deref().map(str::trim) {
            Some(addr) => {
                validate_address(addr)?;
                Some(addr.to_string())
            }
            None => None,
        };

        let target = &mut self.targets[idx];
        if let Some(addr) = address {
            target.address = addr;
        }
        if let Some(label) = fields.label {
            target.label = if label.trim().is_empty() {
                target.address.clone()
            } else {
                label
            };
        }
        if let Some(enabled) = fields.enabled {
            target.enabled = enabled;
        }

        Ok(target.clone())
    }

    /// Flip the enabled flag.
    pub fn toggle(&mut self, id: &str) -> Result<PingTarget, RegistryError> {
        let idx = self.position(id)?;
        let target = &mut self.targets[idx];
        target.enabled = !target.enabled;
        Ok(target.clone())
    }

    pub fn list(&self) -> Vec<PingTarget> {
        self.targets.clone()
    }

    /// Snapshot of the enabled targets, in registry order.
    pub fn enabled(&self) -> Vec<PingTarget> {
        self.targets.iter().filter(|t| t.enabled).cloned().collect()
    }

    /// Replace the whole list, e.g. from a loaded config.
    ///
    /// Every address is validated before anything changes. Targets with a
    /// missing or repeated id get a fresh one.
    pub fn replace_all(&mut self, targets: Vec<PingTarget>) -> Result<(), RegistryError> {
        for target in &targets {
            validate_address(target.address.trim())?;
        }

        let mut seen = HashSet::new();
        let mut installed = Vec::with_capacity(targets.len());
        for mut target in targets {
            target.address = target.address.trim().to_string();
            if target.label.trim().is_empty() {
                target.label = target.address.clone();
            }
            if target.id.is_empty() || !seen.insert(target.id.clone()) {
                let fresh = PingTarget::new(&target.address, &target.label);
                target.id = fresh.id;
                seen.insert(target.id.clone());
            }
            installed.push(target);
        }

        self.targets = installed;
        Ok(())
    }

    fn position(&self, id: &str) -> Result<usize, RegistryError> {
        self.targets
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }
}

/// Accept IPv4/IPv6 literals and hostnames made of alphanumeric/hyphen labels.
pub fn validate_address(address: &str) -> Result<(), RegistryError> {
    let invalid = || RegistryError::InvalidAddress(address.to_string());

    if address.is_empty() {
        return Err(invalid());
    }
    if address.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    if address.len() > 253 {
        return Err(invalid());
    }

    let valid_labels = address.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });

    if valid_labels {
        Ok(())
    } else {
        Err(invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_address() {
        for ok in ["1.1.1.1", "::1", "2606:4700:4700::1111", "example.com", "my-host", "a.b-c.d9"] {
            assert!(validate_address(ok).is_ok(), "{ok} should be valid");
        }
        for bad in ["", "exa mple.com", "foo..bar", "-lead.com", "trail-.com", "host_name", "http://x", "a.b."] {
            assert_eq!(
                validate_address(bad),
                Err(RegistryError::InvalidAddress(bad.to_string())),
                "{bad} should be invalid"
            );
        }
    }

    #[test]
    fn test_add_and_list_preserve_order() {
        let mut registry = TargetRegistry::new();
        let a = registry.add("1.1.1.1", Some("Cloudflare")).unwrap();
        let b = registry.add("8.8.8.8", None).unwrap();
        let c = registry.add("example.com", Some("")).unwrap();

        assert_eq!(b.label, "8.8.8.8");
        assert_eq!(c.label, "example.com");

        let ids: Vec<_> = registry.list().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
        assert_eq!(registry.list(), registry.list());
    }

    #[test]
    fn test_duplicate_enabled_address_rejected() {
        let mut registry = TargetRegistry::new();
        let first = registry.add("1.1.1.1", None).unwrap();
        assert_eq!(
            registry.add("1.1.1.1", Some("again")),
            Err(RegistryError::DuplicateTarget("1.1.1.1".to_string()))
        );

        // A disabled entry does not block a new enabled one.
        registry.toggle(&first.id).unwrap();
        assert!(registry.add("1.1.1.1", None).is_ok());
    }

    #[test]
    fn test_ids_not_reused_after_remove() {
        let mut registry = TargetRegistry::new();
        let first = registry.add("1.1.1.1", None).unwrap();
        registry.remove(&first.id).unwrap();
        let second = registry.add("1.1.1.1", None).unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_missing_ids() {
        let mut registry = TargetRegistry::new();
        let missing = RegistryError::NotFound("nope".to_string());
        assert_eq!(registry.remove("nope").unwrap_err(), missing);
        assert_eq!(registry.toggle("nope").unwrap_err(), missing);
        assert_eq!(registry.update("nope", TargetUpdate::default()).unwrap_err(), missing);
    }

    #[test]
    fn test_update_and_toggle() {
        let mut registry = TargetRegistry::new();
        let target = registry.add("1.1.1.1", Some("old")).unwrap();

        let updated = registry
            .update(
                &target.id,
                TargetUpdate {
                    address: Some("9.9.9.9".to_string()),
                    label: Some("Quad9".to_string()),
                    enabled: None,
                },
            )
            .unwrap();
        assert_eq!(updated.address, "9.9.9.9");
        assert_eq!(updated.label, "Quad9");

        let bad = registry.update(
            &target.id,
            TargetUpdate {
                address: Some("not valid".to_string()),
                ..Default::default()
            },
        );
        assert!(matches!(bad, Err(RegistryError::InvalidAddress(_))));
        assert_eq!(registry.list()[0].address, "9.9.9.9");

        let toggled = registry.toggle(&target.id).unwrap();
        assert!(!toggled.enabled);
        assert!(registry.enabled().is_empty());
    }

    #[test]
    fn test_replace_all_assigns_missing_ids() {
        let mut registry = TargetRegistry::new();
        let mut a = PingTarget::new("1.1.1.1", "a");
        let mut b = PingTarget::new("8.8.8.8", "");
        b.id = a.id.clone();
        b.label = String::new();
        a.enabled = false;

        registry.replace_all(vec![a.clone(), b]).unwrap();
        let list = registry.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, a.id);
        assert_ne!(list[1].id, a.id);
        assert_eq!(list[1].label, "8.8.8.8");
        assert_eq!(registry.enabled().len(), 1);

        let err = registry.replace_all(vec![PingTarget::new("bad host", "")]);
        assert!(err.is_err());
        assert_eq!(registry.list().len(), 2);
    }
}
