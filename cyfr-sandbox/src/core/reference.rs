//! Component references and roles.
//!
//! A [`ComponentReference`] is the canonical identity of a component:
//! `<type>:<namespace>.<name>:<version>`, for example
//! `catalyst:weather.fetcher:1.2.0`. One-letter shorthands (`c`, `r`, `f`)
//! are accepted on input and normalized on output. A reference can also be
//! derived from a path under the canonical filesystem layout
//! `components/<type>s/<namespace>/<name>/<version>/<type>.wasm`.
//!
//! References are value objects: parsing is pure, invalid forms are rejected
//! before any I/O, and parsing then re-serializing a canonical reference
//! yields the same string.

// Layer 1: Standard library imports
use std::fmt;
use std::path::{Component as PathSegment, Path, PathBuf};
use std::str::FromStr;

// Layer 2: Third-party crate imports
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

// Layer 3: Internal module imports
use crate::core::error::SandboxError;

/// Component role, determining the installed capability set.
///
/// All role-dependent behavior in the capability installer is table-driven
/// on this enum:
///
/// - [`Catalyst`](ComponentRole::Catalyst): outbound HTTP (host-mediated),
///   granted secrets, MCP tools
/// - [`Reagent`](ComponentRole::Reagent): pure computation
/// - [`Formula`](ComponentRole::Formula): MCP tools plus recursive
///   component invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentRole {
    /// May perform outbound HTTP and read granted secrets.
    Catalyst,
    /// Pure computation; no network, no secrets, no sub-invocation.
    Reagent,
    /// May invoke other components by reference.
    Formula,
}

impl ComponentRole {
    /// Full lowercase name used in canonical references.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Catalyst => "catalyst",
            Self::Reagent => "reagent",
            Self::Formula => "formula",
        }
    }

    /// One-letter shorthand accepted in reference strings.
    pub fn shorthand(&self) -> &'static str {
        match self {
            Self::Catalyst => "c",
            Self::Reagent => "r",
            Self::Formula => "f",
        }
    }

    /// Directory segment in the canonical filesystem layout
    /// (`catalysts`, `reagents`, `formulas`).
    pub fn plural_segment(&self) -> &'static str {
        match self {
            Self::Catalyst => "catalysts",
            Self::Reagent => "reagents",
            Self::Formula => "formulas",
        }
    }

    /// Parse a role tag, accepting both full names and shorthands.
    pub fn parse(value: &str) -> Result<Self, SandboxError> {
        match value {
            "catalyst" | "c" => Ok(Self::Catalyst),
            "reagent" | "r" => Ok(Self::Reagent),
            "formula" | "f" => Ok(Self::Formula),
            other => Err(SandboxError::unknown_role(other)),
        }
    }

    /// Reverse lookup from the plural directory segment.
    fn from_plural_segment(segment: &str) -> Option<Self> {
        match segment {
            "catalysts" => Some(Self::Catalyst),
            "reagents" => Some(Self::Reagent),
            "formulas" => Some(Self::Formula),
            _ => None,
        }
    }
}

impl fmt::Display for ComponentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentRole {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Canonical component identity.
///
/// String form: `<type>:<namespace>.<name>:<version>`. The namespace is the
/// portion before the first dot of the qualified name; the remainder is the
/// component name (which may itself contain dots).
///
/// # Examples
///
/// ```rust
/// use cyfr_sandbox::core::reference::{ComponentReference, ComponentRole};
///
/// let r = ComponentReference::parse("catalyst:weather.fetcher:1.2.0").unwrap();
/// assert_eq!(r.role, ComponentRole::Catalyst);
/// assert_eq!(r.namespace, "weather");
/// assert_eq!(r.name, "fetcher");
/// assert_eq!(r.to_string(), "catalyst:weather.fetcher:1.2.0");
///
/// // Shorthand input normalizes to the full form
/// let s = ComponentReference::parse("r:math.sum:1.0.0").unwrap();
/// assert_eq!(s.to_string(), "reagent:math.sum:1.0.0");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentReference {
    /// Component type tag.
    pub role: ComponentRole,
    /// Logical grouping (portion of the qualified name before the first dot).
    pub namespace: String,
    /// Component name (remainder of the qualified name).
    pub name: String,
    /// Version string (free-form, non-empty, no colons).
    pub version: String,
}

impl ComponentReference {
    /// Create a reference from its parts, validating each segment.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::InvalidRef` when any segment is empty or
    /// contains whitespace, `:` or `/`.
    pub fn new(
        role: ComponentRole,
        namespace: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<Self, SandboxError> {
        let reference = Self {
            role,
            namespace: namespace.into(),
            name: name.into(),
            version: version.into(),
        };
        reference.validate()?;
        Ok(reference)
    }

    /// Parse a canonical or shorthand reference string.
    ///
    /// Accepted forms: `catalyst:ns.name:1.0.0`, `c:ns.name:1.0.0`.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::InvalidRef` for anything else; parsing never
    /// performs I/O.
    pub fn parse(input: &str) -> Result<Self, SandboxError> {
        let mut parts = input.splitn(3, ':');
        let (Some(tag), Some(qualified), Some(version)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(SandboxError::invalid_ref(
                input,
                "expected <type>:<namespace>.<name>:<version>",
            ));
        };

        let role = ComponentRole::parse(tag)
            .map_err(|_| SandboxError::invalid_ref(input, format!("unknown type tag '{tag}'")))?;

        let Some((namespace, name)) = qualified.split_once('.') else {
            return Err(SandboxError::invalid_ref(
                input,
                "qualified name must be <namespace>.<name>",
            ));
        };

        Self::new(role, namespace, name, version)
            .map_err(|e| SandboxError::invalid_ref(input, e.to_string()))
    }

    /// Derive a reference from a path under the canonical layout
    /// `<root>/<type>s/<namespace>/<name>/<version>/<type>.wasm`.
    ///
    /// The path is accepted only when every segment agrees: the plural type
    /// directory, the file name, and the segment count. The file is not
    /// touched; this is pure path inspection.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::InvalidRef` when the path does not lie under
    /// the canonical layout.
    pub fn from_local_path(path: &Path, components_root: &Path) -> Result<Self, SandboxError> {
        let display = path.display().to_string();
        let relative = path.strip_prefix(components_root).map_err(|_| {
            SandboxError::invalid_ref(
                &display,
                format!("path is not under '{}'", components_root.display()),
            )
        })?;

        let segments: Vec<&str> = relative
            .components()
            .filter_map(|c| match c {
                PathSegment::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();

        let [plural, namespace, name, version, file] = segments.as_slice() else {
            return Err(SandboxError::invalid_ref(
                &display,
                "expected <type>s/<namespace>/<name>/<version>/<type>.wasm",
            ));
        };

        let Some(role) = ComponentRole::from_plural_segment(plural) else {
            return Err(SandboxError::invalid_ref(
                &display,
                format!("unknown component type directory '{plural}'"),
            ));
        };

        let expected_file = format!("{}.wasm", role.as_str());
        if *file != expected_file {
            return Err(SandboxError::invalid_ref(
                &display,
                format!("expected file name '{expected_file}', found '{file}'"),
            ));
        }

        Self::new(role, *namespace, *name, *version)
            .map_err(|e| SandboxError::invalid_ref(&display, e.to_string()))
    }

    /// Canonical on-disk location of this component under `components_root`.
    pub fn expected_path(&self, components_root: &Path) -> PathBuf {
        components_root
            .join(self.role.plural_segment())
            .join(&self.namespace)
            .join(&self.name)
            .join(&self.version)
            .join(format!("{}.wasm", self.role.as_str()))
    }

    /// Qualified name without type or version (`<namespace>.<name>`).
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    fn validate(&self) -> Result<(), SandboxError> {
        for (label, value) in [
            ("namespace", &self.namespace),
            ("name", &self.name),
            ("version", &self.version),
        ] {
            if value.is_empty() {
                return Err(SandboxError::invalid_ref(
                    self.to_string(),
                    format!("{label} must not be empty"),
                ));
            }
            if value.chars().any(|c| c.is_whitespace() || c == ':' || c == '/') {
                return Err(SandboxError::invalid_ref(
                    self.to_string(),
                    format!("{label} contains a forbidden character"),
                ));
            }
        }
        // The namespace is everything before the first dot; a dotted
        // namespace would re-parse differently.
        if self.namespace.contains('.') {
            return Err(SandboxError::invalid_ref(
                self.to_string(),
                "namespace must not contain '.'",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ComponentReference {
    /// Canonical string form: `<type>:<namespace>.<name>:<version>`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}.{}:{}",
            self.role.as_str(),
            self.namespace,
            self.name,
            self.version
        )
    }
}

impl FromStr for ComponentReference {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ComponentReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ComponentReference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(de::Error::custom)
    }
}
