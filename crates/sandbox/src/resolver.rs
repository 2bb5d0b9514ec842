//! Matches a package manifest against the files present in a directory.
//!
//! Package files are named `{normalized_name}-{version}-{rest}`, where the
//! normalized name replaces `-` with `_`. A manifest entry is available only
//! when exactly one file carries its prefix; none or several leave it missing
//! so the choice never depends on directory order.

use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};

/// Required packages as ordered `(name, version)` pairs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest(Vec<(String, String)>);

impl Manifest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON object of `name -> version` strings, keeping the order
    /// the entries are written in. A repeated name keeps its last version.
    ///
    /// # Errors
    /// Returns an error if `json` is not an object of strings.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Add a requirement, replacing the version of an existing entry.
    pub fn insert(&mut self, name: impl Into<String>, version: impl Into<String>) {
        let name = name.into();
        let version = version.into();
        if let Some(existing) = self.0.iter_mut().find(|(n, _)| *n == name) {
            existing.1 = version;
        } else {
            self.0.push((name, version));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Manifest {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut manifest = Self::new();
        for (name, version) in iter {
            manifest.insert(name, version);
        }
        manifest
    }
}

impl<'de> Deserialize<'de> for Manifest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ManifestVisitor;

        impl<'de> Visitor<'de> for ManifestVisitor {
            type Value = Manifest;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of package names to versions")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Manifest, A::Error> {
                let mut manifest = Manifest::new();
                while let Some((name, version)) = map.next_entry::<String, String>()? {
                    manifest.insert(name, version);
                }
                Ok(manifest)
            }
        }

        deserializer.deserialize_map(ManifestVisitor)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageRecord {
    pub name: String,
    pub normalized_name: String,
    pub version: String,
    pub disk_path: Option<PathBuf>,
    pub file_name: Option<String>,
}

impl PackageRecord {
    #[must_use]
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            normalized_name: normalize_name(name),
            version: version.to_string(),
            disk_path: None,
            file_name: None,
        }
    }

    /// File name prefix a package file for this record must start with.
    #[must_use]
    pub fn file_prefix(&self) -> String {
        format!("{}-{}-", self.normalized_name, self.version)
    }
}

#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.replace('-', "_")
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub available: Vec<PackageRecord>,
    pub missing: Vec<PackageRecord>,
}

/// Classify every manifest entry against `listing`, the file names found in
/// `dir`. Results follow manifest order.
#[must_use]
pub fn resolve<S: AsRef<str>>(manifest: &Manifest, dir: &Path, listing: &[S]) -> Resolution {
    let mut resolution = Resolution::default();
    for (name, version) in manifest.iter() {
        let mut record = PackageRecord::new(name, version);
        let prefix = record.file_prefix();
        let mut matches = listing
            .iter()
            .map(AsRef::as_ref)
            .filter(|file| file.starts_with(&prefix));

        if let (Some(file), None) = (matches.next(), matches.next()) {
            record.disk_path = Some(dir.join(file));
            record.file_name = Some(file.to_string());
            resolution.available.push(record);
        } else {
            resolution.missing.push(record);
        }
    }
    resolution
}

/// Sorted names of the entries in `dir`. Names that are not valid UTF-8
/// cannot match a manifest entry and are skipped.
///
/// # Errors
/// Returns an error if the directory cannot be read.
pub fn list_dir(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        if let Ok(name) = entry?.file_name().into_string() {
            names.push(name);
        }
    }
    names.sort_unstable();
    Ok(names)
}

/// # Errors
/// Returns an error if the directory cannot be read.
pub fn resolve_dir(manifest: &Manifest, dir: &Path) -> io::Result<Resolution> {
    let listing = list_dir(dir)?;
    Ok(resolve(manifest, dir, &listing))
}
