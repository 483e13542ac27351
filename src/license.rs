//! License gate for encryption providers.
//!
//! The license/JWT validator itself is an external collaborator; its decision
//! reaches the core as a list of permitted provider types fixed at startup.
//! The gate is a read-mostly, process-wide policy object passed explicitly
//! into the components that activate providers — it is consulted when the
//! KEK ring is built or swapped, never per request.

use crate::crypto::{CryptoError, ProviderKind};
use std::collections::HashSet;
use tracing::warn;

/// Provider types the running process is allowed to activate.
#[derive(Debug, Clone)]
pub struct LicenseGate {
    permitted: HashSet<ProviderKind>,
}

impl LicenseGate {
    /// All provider types permitted. Used when no gating collaborator is
    /// configured.
    pub fn permissive() -> Self {
        Self {
            permitted: [
                ProviderKind::Aes,
                ProviderKind::Rsa,
                ProviderKind::Tink,
                ProviderKind::None,
            ]
            .into_iter()
            .collect(),
        }
    }

    /// Gate from an explicit permitted-type list. `none` is always allowed:
    /// an unlicensed proxy must keep relaying traffic unencrypted rather
    /// than going dark.
    pub fn from_permitted(types: impl IntoIterator<Item = ProviderKind>) -> Self {
        let mut permitted: HashSet<ProviderKind> = types.into_iter().collect();
        permitted.insert(ProviderKind::None);
        Self { permitted }
    }

    pub fn allows(&self, kind: ProviderKind) -> bool {
        self.permitted.contains(&kind)
    }

    /// Refuse activation of unlicensed provider types.
    pub fn check(&self, kind: ProviderKind) -> Result<(), CryptoError> {
        if self.allows(kind) {
            Ok(())
        } else {
            warn!("License gate refused provider type '{kind}'");
            Err(CryptoError::LicenseRestriction(kind.name().to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permissive_allows_everything() {
        let gate = LicenseGate::permissive();
        for kind in [
            ProviderKind::Aes,
            ProviderKind::Rsa,
            ProviderKind::Tink,
            ProviderKind::None,
        ] {
            assert!(gate.allows(kind));
        }
    }

    #[test]
    fn test_unlicensed_keeps_none_working() {
        let gate = LicenseGate::from_permitted([]);
        assert!(gate.check(ProviderKind::None).is_ok());
        assert!(matches!(
            gate.check(ProviderKind::Aes),
            Err(CryptoError::LicenseRestriction(_))
        ));
        assert!(gate.check(ProviderKind::Tink).is_err());
    }

    #[test]
    fn test_partial_license() {
        let gate = LicenseGate::from_permitted([ProviderKind::Aes]);
        assert!(gate.check(ProviderKind::Aes).is_ok());
        assert!(gate.check(ProviderKind::Rsa).is_err());
    }
}
