//! Reference resolution, byte loading, and digest computation.
//!
//! A component can be named two ways at execution time:
//!
//! - **Registry form**: a canonical or shorthand reference string; bytes
//!   come from the external registry service.
//! - **Local-path form**: a filesystem path that must lie under the
//!   canonical layout
//!   `components/<type>s/<namespace>/<name>/<version>/<type>.wasm`; the
//!   reference is derived from the path segments.
//!
//! Either way the loader computes `sha256:<hex>` over the exact bytes that
//! will execute, so the digest recorded in the journal is stable across
//! repeated runs of the same binary.

// Layer 1: Standard library imports
use std::path::{Component as PathSegment, Path, PathBuf};
use std::sync::Arc;

// Layer 2: Third-party crate imports
use sha2::{Digest, Sha256};
use tokio::fs;

// Layer 3: Internal module imports
use crate::core::config::SandboxConfig;
use crate::core::error::{SandboxError, SandboxResult};
use crate::core::reference::ComponentReference;
use crate::core::stores::ComponentRegistry;

/// `sha256:<hex>` digest of a byte slice.
pub fn digest_of(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// A component resolved to concrete bytes.
#[derive(Debug, Clone)]
pub struct ResolvedComponent {
    /// Canonical reference (parsed, or derived from a local path).
    pub reference: ComponentReference,
    /// The exact bytes that will execute.
    pub bytes: Vec<u8>,
    /// `sha256:<hex>` of `bytes`.
    pub digest: String,
}

/// Resolves execution targets into bytes.
#[derive(Clone)]
pub struct ComponentLoader {
    registry: Arc<dyn ComponentRegistry>,
    components_root: PathBuf,
}

impl ComponentLoader {
    /// Create a loader over the external registry and the local layout root.
    pub fn new(registry: Arc<dyn ComponentRegistry>, config: &SandboxConfig) -> Self {
        Self {
            registry,
            components_root: config.components_root.clone(),
        }
    }

    /// Resolve a reference string or local path to component bytes.
    ///
    /// Inputs containing a path separator (or ending in `.wasm`) are
    /// treated as local paths; everything else must parse as a reference.
    ///
    /// # Errors
    ///
    /// - `SandboxError::InvalidRef` for unparseable inputs or paths outside
    ///   the canonical layout
    /// - `SandboxError::Registry` when the file read or registry fetch fails
    pub async fn resolve(&self, input: &str) -> SandboxResult<ResolvedComponent> {
        if Self::looks_like_path(input) {
            self.resolve_local(Path::new(input)).await
        } else {
            let reference = ComponentReference::parse(input)?;
            self.resolve_registry(reference).await
        }
    }

    /// Resolve an already-parsed reference through the registry.
    pub async fn resolve_reference(
        &self,
        reference: &ComponentReference,
    ) -> SandboxResult<ResolvedComponent> {
        self.resolve_registry(reference.clone()).await
    }

    fn looks_like_path(input: &str) -> bool {
        input.contains('/') || input.contains(std::path::MAIN_SEPARATOR) || input.ends_with(".wasm")
    }

    async fn resolve_local(&self, path: &Path) -> SandboxResult<ResolvedComponent> {
        let reference = self.derive_reference(path)?;
        let bytes = fs::read(path).await.map_err(|e| {
            SandboxError::registry(
                reference.to_string(),
                format!("failed to read '{}': {e}", path.display()),
            )
        })?;
        let digest = digest_of(&bytes);
        Ok(ResolvedComponent {
            reference,
            bytes,
            digest,
        })
    }

    async fn resolve_registry(
        &self,
        reference: ComponentReference,
    ) -> SandboxResult<ResolvedComponent> {
        let bytes = self.registry.fetch(&reference).await?;
        let digest = digest_of(&bytes);
        Ok(ResolvedComponent {
            reference,
            bytes,
            digest,
        })
    }

    /// Derive a reference from a local path.
    ///
    /// Relative paths are checked against the configured root directly.
    /// Absolute paths are accepted when they contain the layout root as a
    /// segment with the canonical five segments after it.
    fn derive_reference(&self, path: &Path) -> SandboxResult<ComponentReference> {
        if let Ok(reference) = ComponentReference::from_local_path(path, &self.components_root) {
            return Ok(reference);
        }

        let root_name = self
            .components_root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("components");

        let segments: Vec<&str> = path
            .components()
            .filter_map(|c| match c {
                PathSegment::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();

        // Last occurrence wins so a user directory named "components"
        // earlier in the path cannot confuse the derivation.
        let Some(root_index) = segments.iter().rposition(|s| *s == root_name) else {
            return Err(SandboxError::invalid_ref(
                path.display().to_string(),
                format!("path does not contain the '{root_name}' layout root"),
            ));
        };

        let pseudo_root: PathBuf = segments[..=root_index].iter().collect();
        let pseudo_path: PathBuf = segments.iter().collect();
        ComponentReference::from_local_path(&pseudo_path, &pseudo_root)
    }
}

impl std::fmt::Debug for ComponentLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentLoader")
            .field("components_root", &self.components_root)
            .finish_non_exhaustive()
    }
}
