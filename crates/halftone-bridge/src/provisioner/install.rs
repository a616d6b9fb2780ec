//! Ordered pip install strategies

/// pip's diagnostic for PEP 668 "externally managed" interpreters
pub const EXTERNALLY_MANAGED_MARKER: &str = "externally-managed-environment";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStrategy {
    /// `pip install <pkgs>`
    Standard,
    /// `pip install --break-system-packages <pkgs>`
    OverrideExternallyManaged,
    /// `pip install --user <pkgs>`
    UserScoped,
}

impl InstallStrategy {
    /// Tried in this order, each at most once
    pub const ORDER: [InstallStrategy; 3] = [
        InstallStrategy::Standard,
        InstallStrategy::OverrideExternallyManaged,
        InstallStrategy::UserScoped,
    ];

    pub fn flag(self) -> Option<&'static str> {
        match self {
            InstallStrategy::Standard => None,
            InstallStrategy::OverrideExternallyManaged => Some("--break-system-packages"),
            InstallStrategy::UserScoped => Some("--user"),
        }
    }

    /// Whether this strategy is worth trying given the previous failure text
    pub fn applies_after(self, previous_failure: Option<&str>) -> bool {
        match self {
            InstallStrategy::OverrideExternallyManaged => {
                previous_failure.is_some_and(|text| text.contains(EXTERNALLY_MANAGED_MARKER))
            }
            _ => true,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            InstallStrategy::Standard => "standard",
            InstallStrategy::OverrideExternallyManaged => "override",
            InstallStrategy::UserScoped => "user",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_only_after_marker() {
        let strategy = InstallStrategy::OverrideExternallyManaged;
        assert!(!strategy.applies_after(None));
        assert!(!strategy.applies_after(Some("ERROR: Could not find a version")));
        assert!(strategy.applies_after(Some(
            "error: externally-managed-environment\n\n× This environment is externally managed"
        )));
    }

    #[test]
    fn test_user_scope_always_applies() {
        assert!(InstallStrategy::UserScoped.applies_after(Some("anything")));
        assert_eq!(InstallStrategy::UserScoped.flag(), Some("--user"));
        assert_eq!(InstallStrategy::Standard.flag(), None);
    }
}
