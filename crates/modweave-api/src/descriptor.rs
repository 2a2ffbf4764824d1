use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::abi;
use crate::origins::OriginPattern;

/// Capability a mod may request in its metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModFlag {
    /// The mod rewrites intercepted responses; enabling it invalidates
    /// the origin's cache.
    ModifyRequest,
    /// The mod runs a background entry point in the controller context.
    BackgroundScript,
    /// The mod may use the network host surface.
    Requests,
    /// The mod refuses live unload; a page refresh is required instead.
    DisableUnload,
    /// The mod participates in extended page loading.
    ExtendLoading,
}

/// A declared dependency on another installed mod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModRequirement {
    pub dependency_name: String,
    pub min_version: Version,
}

/// Raw metadata document as served by the guest. Field validation happens
/// in [`ModDescriptor::from_metadata`]; serde only shapes the JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModMetadata {
    #[serde(default)]
    pub abi_version: u32,
    #[serde(default)]
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub flags: Vec<ModFlag>,
    #[serde(default)]
    pub origins: Vec<String>,
    #[serde(default)]
    pub dependency_name: Option<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub priority: Option<i64>,
}

/// Validated identity and declarations of one mod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModDescriptor {
    pub name: String,
    pub description: String,
    pub version: Version,
    pub flags: Vec<ModFlag>,
    pub origins: Vec<OriginPattern>,
    pub dependency_name: Option<String>,
    pub requirements: Vec<ModRequirement>,
    pub priority: i64,
    /// Rolling content hash of the decompressed source. Primary key.
    pub hash: i32,
    #[serde(default)]
    pub dev: bool,
}

/// Declaration-level metadata failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    #[error("unsupported abi version {found} (host speaks {expected})")]
    AbiVersion { found: u32, expected: u32 },
    #[error("missing name")]
    MissingName,
    #[error("missing description")]
    MissingDescription,
    #[error("invalid version `{0}`")]
    InvalidVersion(String),
    #[error("dependency name must not be empty")]
    EmptyDependencyName,
    #[error("invalid requirement `{0}`")]
    InvalidRequirement(String),
    #[error("invalid origin pattern `{0}`")]
    InvalidOrigin(String),
}

impl ModDescriptor {
    /// Promotes a raw metadata document to a validated descriptor.
    ///
    /// `hash` is the content hash of the decompressed source; it is not
    /// part of the guest-declared document.
    pub fn from_metadata(meta: ModMetadata, hash: i32) -> Result<Self, MetadataError> {
        if meta.abi_version != abi::ABI_VERSION {
            return Err(MetadataError::AbiVersion {
                found: meta.abi_version,
                expected: abi::ABI_VERSION,
            });
        }
        if meta.name.trim().is_empty() {
            return Err(MetadataError::MissingName);
        }
        let description = meta.description.ok_or(MetadataError::MissingDescription)?;
        let version = Version::parse(meta.version.trim())
            .map_err(|_| MetadataError::InvalidVersion(meta.version.clone()))?;
        if let Some(dep) = meta.dependency_name.as_deref() {
            if dep.trim().is_empty() {
                return Err(MetadataError::EmptyDependencyName);
            }
        }

        let mut requirements = Vec::with_capacity(meta.requirements.len());
        for raw in &meta.requirements {
            requirements.push(
                parse_requirement(raw).ok_or_else(|| MetadataError::InvalidRequirement(raw.clone()))?,
            );
        }

        let mut origins = Vec::with_capacity(meta.origins.len());
        for raw in &meta.origins {
            origins
                .push(OriginPattern::parse(raw).ok_or_else(|| MetadataError::InvalidOrigin(raw.clone()))?);
        }

        Ok(Self {
            name: meta.name,
            description,
            version,
            flags: meta.flags,
            origins,
            dependency_name: meta.dependency_name,
            requirements,
            priority: meta.priority.unwrap_or(0),
            hash,
            dev: false,
        })
    }

    pub fn has_flag(&self, flag: ModFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// True when `origin` is covered by the allowlist. An empty allowlist
    /// is unrestricted.
    pub fn allows_origin(&self, origin: &str) -> bool {
        if self.origins.is_empty() {
            return true;
        }
        self.origins.iter().any(|p| p.matches(origin))
    }
}

/// Splits a `"name-version"` requirement string at the first `-`. The
/// remainder must be valid semver.
pub fn parse_requirement(raw: &str) -> Option<ModRequirement> {
    let index = raw.find('-')?;
    let (name, rest) = raw.split_at(index);
    let version = &rest[1..];
    if name.is_empty() {
        return None;
    }
    let min_version = Version::parse(version).ok()?;
    Some(ModRequirement {
        dependency_name: name.to_string(),
        min_version,
    })
}
