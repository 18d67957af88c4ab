//! Trust-on-first-use registry of agent host keys.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{LinkError, Result};
use crate::ssh::config::HostKeyPolicy;

pub struct HostKeyRegistry {
    policy: HostKeyPolicy,
    known: Mutex<HashMap<String, String>>,
}

impl HostKeyRegistry {
    pub fn new(policy: HostKeyPolicy) -> Self {
        Self {
            policy,
            known: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> HostKeyPolicy {
        self.policy
    }

    /// Check `fingerprint` against the one first seen for `instance_id`.
    pub fn verify(&self, instance_id: &str, fingerprint: Option<&str>) -> Result<()> {
        if self.policy == HostKeyPolicy::AcceptAny {
            return Ok(());
        }
        let Some(actual) = fingerprint else {
            return match self.policy {
                HostKeyPolicy::Strict => Err(LinkError::Ssh(format!(
                    "{} did not present a host key",
                    instance_id
                ))),
                _ => Ok(()),
            };
        };

        let mut known = self.known.lock();
        let Some(expected) = known.get(instance_id).cloned() else {
            tracing::debug!("Trusting host key {} for {}", actual, instance_id);
            known.insert(instance_id.to_string(), actual.to_string());
            return Ok(());
        };

        if expected == actual {
            return Ok(());
        }

        match self.policy {
            HostKeyPolicy::Strict => Err(LinkError::HostKeyMismatch {
                instance: instance_id.to_string(),
                expected,
                actual: actual.to_string(),
            }),
            _ => {
                tracing::warn!(
                    "Host key for {} changed from {} to {}; trusting the new key",
                    instance_id,
                    expected,
                    actual
                );
                known.insert(instance_id.to_string(), actual.to_string());
                Ok(())
            }
        }
    }

    pub fn known(&self, instance_id: &str) -> Option<String> {
        self.known.lock().get(instance_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_key_is_trusted() {
        let registry = HostKeyRegistry::new(HostKeyPolicy::Strict);
        registry.verify("bot-1", Some("SHA256:aaa")).unwrap();
        assert_eq!(registry.known("bot-1").as_deref(), Some("SHA256:aaa"));
        registry.verify("bot-1", Some("SHA256:aaa")).unwrap();
    }

    #[test]
    fn test_strict_rejects_changed_key() {
        let registry = HostKeyRegistry::new(HostKeyPolicy::Strict);
        registry.verify("bot-1", Some("SHA256:aaa")).unwrap();
        let err = registry.verify("bot-1", Some("SHA256:bbb")).unwrap_err();
        assert!(matches!(err, LinkError::HostKeyMismatch { .. }));
        assert_eq!(registry.known("bot-1").as_deref(), Some("SHA256:aaa"));
    }

    #[test]
    fn test_tofu_accepts_and_replaces_changed_key() {
        let registry = HostKeyRegistry::new(HostKeyPolicy::TrustOnFirstUse);
        registry.verify("bot-1", Some("SHA256:aaa")).unwrap();
        registry.verify("bot-1", Some("SHA256:bbb")).unwrap();
        assert_eq!(registry.known("bot-1").as_deref(), Some("SHA256:bbb"));
    }

    #[test]
    fn test_accept_any_remembers_nothing() {
        let registry = HostKeyRegistry::new(HostKeyPolicy::AcceptAny);
        registry.verify("bot-1", Some("SHA256:aaa")).unwrap();
        assert!(registry.known("bot-1").is_none());
    }

    #[test]
    fn test_missing_fingerprint() {
        assert!(HostKeyRegistry::new(HostKeyPolicy::TrustOnFirstUse)
            .verify("bot-1", None)
            .is_ok());
        assert!(HostKeyRegistry::new(HostKeyPolicy::Strict)
            .verify("bot-1", None)
            .is_err());
    }
}
