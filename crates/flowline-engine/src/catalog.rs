//! Piece catalog for locating versioned WASM piece modules.
//!
//! The catalog persists as `catalog.toml` alongside a `modules/` directory
//! that holds the `.wasm` files. Entries are keyed by piece name, then by
//! exact version.
//!
//! ```text
//! <pieces_dir>/
//!   catalog.toml
//!   modules/
//!     slack-0.3.1.wasm
//!     echo-0.1.0.wasm
//! ```
//!
//! ```toml
//! [pieces.slack."0.3.1"]
//! description = "Slack messaging"
//! path = "modules/slack-0.3.1.wasm"
//! sha256 = "9f2c..."
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};
use crate::protocol::PieceRef;

/// A single piece module entry in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Path to the `.wasm` file, relative to the pieces directory.
    pub path: String,
    /// Expected hex SHA-256 of the module; verified on read when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Serialization wrapper for the catalog TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CatalogFile {
    /// Piece name → version → entry.
    #[serde(default)]
    pieces: BTreeMap<String, BTreeMap<String, CatalogEntry>>,
}

/// In-memory piece catalog with CRUD operations and persistence.
pub struct PieceCatalog {
    /// Root directory containing catalog.toml and modules/.
    root: PathBuf,
    entries: BTreeMap<String, BTreeMap<String, CatalogEntry>>,
}

impl PieceCatalog {
    /// Load or initialize a catalog from the given pieces directory.
    ///
    /// Creates `modules/` if missing. A missing `catalog.toml` yields an
    /// empty catalog.
    pub fn load(root: &Path) -> Result<Self> {
        let modules_dir = root.join("modules");
        for dir in [root, modules_dir.as_path()] {
            std::fs::create_dir_all(dir).map_err(|e| {
                EngineError::Catalog(format!(
                    "Failed to create directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        let catalog_path = root.join("catalog.toml");
        let entries = if catalog_path.exists() {
            let content = std::fs::read_to_string(&catalog_path).map_err(|e| {
                EngineError::Catalog(format!(
                    "Failed to read {}: {}",
                    catalog_path.display(),
                    e
                ))
            })?;
            let file: CatalogFile = toml::from_str(&content)
                .map_err(|e| EngineError::Catalog(format!("Invalid catalog TOML: {}", e)))?;
            file.pieces
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            root: root.to_path_buf(),
            entries,
        })
    }

    /// Persist the current catalog to `catalog.toml`.
    pub fn save(&self) -> Result<()> {
        let file = CatalogFile {
            pieces: self.entries.clone(),
        };
        let content = toml::to_string_pretty(&file)
            .map_err(|e| EngineError::Catalog(format!("Failed to serialize catalog: {}", e)))?;
        let path = self.root.join("catalog.toml");
        std::fs::write(&path, content).map_err(|e| {
            EngineError::Catalog(format!("Failed to write {}: {}", path.display(), e))
        })?;
        Ok(())
    }

    /// Add or update a piece version and persist.
    pub fn add(&mut self, piece: &PieceRef, entry: CatalogEntry) -> Result<()> {
        self.entries
            .entry(piece.name.clone())
            .or_default()
            .insert(piece.version.clone(), entry);
        self.save()
    }

    /// Copy a `.wasm` file into `modules/`, pin its digest, and register it.
    pub fn install(&mut self, piece: &PieceRef, source: &Path, description: &str) -> Result<()> {
        let bytes = std::fs::read(source).map_err(|e| {
            EngineError::Catalog(format!("Failed to read {}: {}", source.display(), e))
        })?;
        let relative = format!("modules/{}-{}.wasm", piece.name, piece.version);
        let target = self.root.join(&relative);
        std::fs::write(&target, &bytes).map_err(|e| {
            EngineError::Catalog(format!("Failed to write {}: {}", target.display(), e))
        })?;

        self.add(
            piece,
            CatalogEntry {
                description: description.to_string(),
                path: relative,
                sha256: Some(sha256_hex(&bytes)),
            },
        )
    }

    /// Remove one version, or every version when `version` is `None`, and
    /// persist. Returns the number of removed entries.
    pub fn remove(&mut self, name: &str, version: Option<&str>) -> Result<usize> {
        let removed = match version {
            Some(v) => {
                let removed = self
                    .entries
                    .get_mut(name)
                    .and_then(|versions| versions.remove(v))
                    .map_or(0, |_| 1);
                if self.entries.get(name).is_some_and(BTreeMap::is_empty) {
                    self.entries.remove(name);
                }
                removed
            }
            None => self.entries.remove(name).map_or(0, |versions| versions.len()),
        };
        self.save()?;
        Ok(removed)
    }

    /// Get an entry by exact name and version.
    pub fn get(&self, piece: &PieceRef) -> Option<&CatalogEntry> {
        self.entries.get(&piece.name)?.get(&piece.version)
    }

    /// All entries as `(piece, entry)` pairs, ordered by name then version.
    pub fn list(&self) -> Vec<(PieceRef, &CatalogEntry)> {
        self.entries
            .iter()
            .flat_map(|(name, versions)| {
                versions
                    .iter()
                    .map(move |(version, entry)| (PieceRef::new(name, version), entry))
            })
            .collect()
    }

    /// Resolve the absolute path to a piece's `.wasm` file.
    pub fn resolve_path(&self, piece: &PieceRef) -> Option<PathBuf> {
        self.get(piece).map(|e| self.root.join(&e.path))
    }

    /// Read a module's bytes, verifying its pinned digest.
    pub fn read_module(&self, piece: &PieceRef) -> Result<Vec<u8>> {
        let entry = self
            .get(piece)
            .ok_or_else(|| EngineError::Catalog(format!("Piece '{}' is not installed", piece)))?;
        let path = self.root.join(&entry.path);
        let bytes = std::fs::read(&path).map_err(|e| {
            EngineError::Catalog(format!("Failed to read {}: {}", path.display(), e))
        })?;

        if let Some(expected) = entry.sha256.as_deref() {
            let actual = sha256_hex(&bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(EngineError::Catalog(format!(
                    "Digest mismatch for '{}': expected {}, got {}",
                    piece, expected, actual
                )));
            }
        }
        Ok(bytes)
    }

    /// The root directory of the catalog.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(path: &str) -> CatalogEntry {
        CatalogEntry {
            description: String::new(),
            path: path.into(),
            sha256: None,
        }
    }

    #[test]
    fn test_load_creates_directories() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("pieces");
        let catalog = PieceCatalog::load(&root).unwrap();
        assert!(root.join("modules").is_dir());
        assert!(catalog.list().is_empty());
    }

    #[test]
    fn test_versions_are_distinct() {
        let tmp = TempDir::new().unwrap();
        let mut catalog = PieceCatalog::load(tmp.path()).unwrap();
        catalog
            .add(&PieceRef::new("slack", "0.3.0"), entry("modules/a.wasm"))
            .unwrap();
        catalog
            .add(&PieceRef::new("slack", "0.3.1"), entry("modules/b.wasm"))
            .unwrap();

        assert_eq!(catalog.list().len(), 2);
        assert_eq!(
            catalog.resolve_path(&PieceRef::new("slack", "0.3.1")).unwrap(),
            tmp.path().join("modules/b.wasm")
        );
        assert!(catalog.get(&PieceRef::new("slack", "9.9.9")).is_none());
    }

    #[test]
    fn test_remove_version_and_all() {
        let tmp = TempDir::new().unwrap();
        let mut catalog = PieceCatalog::load(tmp.path()).unwrap();
        for v in ["1.0.0", "1.1.0", "2.0.0"] {
            catalog
                .add(&PieceRef::new("http", v), entry("modules/x.wasm"))
                .unwrap();
        }
        assert_eq!(catalog.remove("http", Some("1.0.0")).unwrap(), 1);
        assert_eq!(catalog.remove("http", Some("1.0.0")).unwrap(), 0);
        assert_eq!(catalog.remove("http", None).unwrap(), 2);
        assert!(catalog.list().is_empty());
        assert_eq!(catalog.remove("nope", None).unwrap(), 0);
    }

    #[test]
    fn test_roundtrip_persistence() {
        let tmp = TempDir::new().unwrap();
        {
            let mut catalog = PieceCatalog::load(tmp.path()).unwrap();
            catalog
                .add(
                    &PieceRef::new("echo", "0.1.0"),
                    CatalogEntry {
                        description: "Echo input".into(),
                        path: "modules/echo-0.1.0.wasm".into(),
                        sha256: Some("abc".into()),
                    },
                )
                .unwrap();
        }
        let catalog = PieceCatalog::load(tmp.path()).unwrap();
        let loaded = catalog.get(&PieceRef::new("echo", "0.1.0")).unwrap();
        assert_eq!(loaded.description, "Echo input");
        assert_eq!(loaded.sha256.as_deref(), Some("abc"));
    }

    #[test]
    fn test_install_pins_digest() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("build.wasm");
        std::fs::write(&source, b"\0asm fake module").unwrap();

        let mut catalog = PieceCatalog::load(&tmp.path().join("pieces")).unwrap();
        let piece = PieceRef::new("echo", "0.1.0");
        catalog.install(&piece, &source, "echo").unwrap();

        let entry = catalog.get(&piece).unwrap();
        assert_eq!(entry.path, "modules/echo-0.1.0.wasm");
        assert_eq!(
            entry.sha256.as_deref(),
            Some(sha256_hex(b"\0asm fake module").as_str())
        );
        assert_eq!(catalog.read_module(&piece).unwrap(), b"\0asm fake module");
    }

    #[test]
    fn test_read_module_digest_mismatch() {
        let tmp = TempDir::new().unwrap();
        let mut catalog = PieceCatalog::load(tmp.path()).unwrap();
        std::fs::write(tmp.path().join("modules/m.wasm"), b"bytes").unwrap();
        let piece = PieceRef::new("m", "1.0.0");
        catalog
            .add(
                &piece,
                CatalogEntry {
                    description: String::new(),
                    path: "modules/m.wasm".into(),
                    sha256: Some("00".repeat(32)),
                },
            )
            .unwrap();

        let err = catalog.read_module(&piece).unwrap_err();
        assert!(err.to_string().contains("Digest mismatch"));
    }

    #[test]
    fn test_read_module_not_installed() {
        let tmp = TempDir::new().unwrap();
        let catalog = PieceCatalog::load(tmp.path()).unwrap();
        let err = catalog
            .read_module(&PieceRef::new("ghost", "1.0.0"))
            .unwrap_err();
        assert!(err.to_string().contains("not installed"));
    }
}
