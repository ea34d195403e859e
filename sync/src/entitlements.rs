use std::collections::BTreeSet;

pub const SEARCH_CONTEXTS: &str = "search-contexts";
pub const PERMISSION_SYNCING: &str = "permission-syncing";

/// Features licensed for this deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entitlements(BTreeSet<String>);

impl Entitlements {
    pub fn new<I, S>(entitlements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>
    {
        Self(entitlements.into_iter().map(Into::into).collect())
    }

    pub fn all() -> Self {
        Self::new([SEARCH_CONTEXTS, PERMISSION_SYNCING])
    }

    pub fn has(&self, entitlement: &str) -> bool {
        self.0.contains(entitlement)
    }
}
