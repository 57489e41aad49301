use std::fmt;

use async_trait::async_trait;

/// Resources created by side-effecting onboarding sub-steps. The catalog
/// records them; moving the underlying bytes is out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    IdentityDocument,
    ServicePackage,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::IdentityDocument => "identity_document",
            AssetKind::ServicePackage => "service_package",
        }
    }
}

#[derive(Debug)]
pub struct AssetError(pub String);

impl fmt::Display for AssetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "asset catalog error: {}", self.0)
    }
}

impl std::error::Error for AssetError {}

/// Records resources created during onboarding's final step.
///
/// `ensure` is keyed by `(provider_id, kind)`: re-invoking it after a crash
/// or retry returns the already-created asset instead of creating a second
/// one. This is what makes step completion safely resumable.
#[async_trait]
pub trait AssetCatalog: Send + Sync {
    async fn ensure(&self, provider_id: &str, kind: AssetKind) -> Result<String, AssetError>;
}
