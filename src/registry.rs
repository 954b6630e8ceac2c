//! Read-only lookup mapping `(language, version)` to a [`RuntimeDescriptor`].
//!
//! This is the concrete stand-in for the external package/runtime catalog:
//! a real deployment points [`Registry::load_from_dir`] at a directory of
//! `<language>/<version>/metadata.toml` entries built by some other process.
//! Once built, a `Registry` is immutable and safe to share behind an `Arc`.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no runtime matches language {language:?} version {version_spec:?}")]
    NotFound {
        language: String,
        version_spec: String,
    },
    #[error("duplicate runtime descriptor for {language} {version}")]
    Duplicate { language: String, version: String },
    #[error("failed to read registry directory {path}")]
    Io {
        path: PathBuf,
        #[source]
        cause: std::io::Error,
    },
    #[error("invalid metadata file {path}")]
    InvalidMetadata {
        path: PathBuf,
        #[source]
        cause: toml::de::Error,
    },
}

/// A dotted numeric version, compared component-wise (semver-style without
/// the pre-release/build-metadata machinery we don't need here).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version(Vec<u64>);

impl Version {
    pub fn parse(s: &str) -> Option<Version> {
        let parts = s
            .split('.')
            .map(|p| p.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()?;
        if parts.is_empty() {
            return None;
        }
        Some(Version(parts))
    }

    /// `true` if `self` matches a (possibly shorter) requested version, i.e.
    /// every component the request specifies is equal. Requesting `"3.10"`
    /// matches an installed `"3.10.2"`.
    fn matches_request(&self, requested: &Version) -> bool {
        requested.0.iter().zip(&self.0).all(|(a, b)| a == b)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Immutable metadata identifying a language/version and its compile/run
/// scripts. Never mutated after the [`Registry`] that owns it is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    pub language: String,
    pub version: Version,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub install_prefix: PathBuf,
    /// Absent means the language is interpreted (no compile phase).
    #[serde(default)]
    pub compile_script: Option<PathBuf>,
    pub run_script: PathBuf,
    #[serde(default)]
    pub base_env: HashMap<String, String>,
    /// Free-form label for the backing toolchain family, e.g. `"cpython"`.
    pub runtime: String,
}

impl RuntimeDescriptor {
    fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.language.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

/// On-disk shape of a single `metadata.toml` entry read by
/// [`Registry::load_from_dir`].
#[derive(Debug, Deserialize)]
struct RuntimeManifest {
    language: String,
    version: String,
    #[serde(default)]
    aliases: Vec<String>,
    install_prefix: PathBuf,
    #[serde(default)]
    compile_script: Option<PathBuf>,
    run_script: PathBuf,
    #[serde(default)]
    base_env: HashMap<String, String>,
    runtime: String,
}

#[derive(Debug, Default)]
pub struct Registry {
    descriptors: Vec<RuntimeDescriptor>,
}

impl Registry {
    pub fn new(descriptors: Vec<RuntimeDescriptor>) -> Result<Registry, RegistryError> {
        let mut seen = std::collections::HashSet::new();
        for d in &descriptors {
            if !seen.insert((d.language.clone(), d.version.clone())) {
                return Err(RegistryError::Duplicate {
                    language: d.language.clone(),
                    version: d.version.to_string(),
                });
            }
        }
        Ok(Registry { descriptors })
    }

    /// Walks `root/<language>/<version>/metadata.toml` and builds a registry
    /// from whatever manifests it finds. Scripts referenced by a manifest are
    /// resolved relative to the manifest's own directory.
    pub fn load_from_dir(root: impl AsRef<Path>) -> Result<Registry, RegistryError> {
        let root = root.as_ref();
        let mut descriptors = Vec::new();
        let language_dirs = read_dir_entries(root)?;
        for language_dir in language_dirs {
            if !language_dir.is_dir() {
                continue;
            }
            for version_dir in read_dir_entries(&language_dir)? {
                if !version_dir.is_dir() {
                    continue;
                }
                let manifest_path = version_dir.join("metadata.toml");
                if !manifest_path.exists() {
                    continue;
                }
                let raw = std::fs::read_to_string(&manifest_path).map_err(|cause| {
                    RegistryError::Io {
                        path: manifest_path.clone(),
                        cause,
                    }
                })?;
                let manifest: RuntimeManifest =
                    toml::from_str(&raw).map_err(|cause| RegistryError::InvalidMetadata {
                        path: manifest_path.clone(),
                        cause,
                    })?;
                let version = Version::parse(&manifest.version).ok_or_else(|| {
                    RegistryError::InvalidMetadata {
                        path: manifest_path.clone(),
                        cause: toml::from_str::<()>("bad version").unwrap_err(),
                    }
                })?;
                descriptors.push(RuntimeDescriptor {
                    language: manifest.language,
                    version,
                    aliases: manifest.aliases,
                    install_prefix: manifest.install_prefix,
                    compile_script: manifest
                        .compile_script
                        .map(|p| version_dir.join(p)),
                    run_script: version_dir.join(manifest.run_script),
                    base_env: manifest.base_env,
                    runtime: manifest.runtime,
                });
            }
        }
        Registry::new(descriptors)
    }

    /// Matches the canonical language name or any alias against `version_spec`.
    /// When multiple versions match, the highest wins.
    pub fn lookup(
        &self,
        language_or_alias: &str,
        version_spec: &str,
    ) -> Result<&RuntimeDescriptor, RegistryError> {
        let requested = Version::parse(version_spec);
        let mut best: Option<&RuntimeDescriptor> = None;
        for d in &self.descriptors {
            if !d.names().any(|n| n == language_or_alias) {
                continue;
            }
            let is_match = match (&requested, version_spec) {
                (_, "*") => true,
                (Some(req), _) => d.version.matches_request(req),
                (None, _) => false,
            };
            if !is_match {
                continue;
            }
            if best.map_or(true, |b| d.version > b.version) {
                best = Some(d);
            }
        }
        best.ok_or_else(|| RegistryError::NotFound {
            language: language_or_alias.to_string(),
            version_spec: version_spec.to_string(),
        })
    }

    pub fn list(&self) -> impl Iterator<Item = &RuntimeDescriptor> {
        self.descriptors.iter()
    }
}

fn read_dir_entries(dir: &Path) -> Result<Vec<PathBuf>, RegistryError> {
    std::fs::read_dir(dir)
        .map_err(|cause| RegistryError::Io {
            path: dir.to_path_buf(),
            cause,
        })?
        .map(|entry| {
            entry
                .map(|e| e.path())
                .map_err(|cause| RegistryError::Io {
                    path: dir.to_path_buf(),
                    cause,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(language: &str, version: &str) -> RuntimeDescriptor {
        RuntimeDescriptor {
            language: language.to_string(),
            version: Version::parse(version).unwrap(),
            aliases: vec![format!("{language}-alias")],
            install_prefix: PathBuf::from("/opt").join(language),
            compile_script: None,
            run_script: PathBuf::from("run"),
            base_env: HashMap::new(),
            runtime: "test".to_string(),
        }
    }

    #[test]
    fn picks_highest_matching_version() {
        let reg = Registry::new(vec![
            descriptor("python", "3.9.0"),
            descriptor("python", "3.10.2"),
            descriptor("python", "3.10.9"),
        ])
        .unwrap();
        let d = reg.lookup("python", "3.10").unwrap();
        assert_eq!(d.version, Version::parse("3.10.9").unwrap());
    }

    #[test]
    fn resolves_via_alias() {
        let reg = Registry::new(vec![descriptor("python", "3.10.0")]).unwrap();
        let d = reg.lookup("python-alias", "3.10").unwrap();
        assert_eq!(d.language, "python");
    }

    #[test]
    fn unknown_language_is_not_found() {
        let reg = Registry::new(vec![descriptor("python", "3.10.0")]).unwrap();
        assert!(matches!(
            reg.lookup("ruby", "3.10"),
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[test]
    fn duplicate_language_version_rejected() {
        let err = Registry::new(vec![descriptor("python", "3.10.0"), descriptor("python", "3.10.0")])
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate { .. }));
    }

    #[test]
    fn wildcard_spec_matches_highest() {
        let reg = Registry::new(vec![descriptor("python", "3.9.0"), descriptor("python", "3.10.0")])
            .unwrap();
        let d = reg.lookup("python", "*").unwrap();
        assert_eq!(d.version, Version::parse("3.10.0").unwrap());
    }
}
