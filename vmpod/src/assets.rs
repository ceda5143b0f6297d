//! Boot asset resolution and verification.
//!
//! An asset is one of the files a sandbox boots from: the hypervisor
//! binary, its jailer, the guest kernel, image, initrd and firmware. Each
//! has an optional per-sandbox override path, an optional expected content
//! digest, and a built-in default path.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use vmpod_shared::{VmpodError, VmpodResult};

/// Asset kinds a sandbox may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Hypervisor,
    Jailer,
    Kernel,
    Image,
    Initrd,
    Firmware,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Hypervisor => "hypervisor",
            AssetKind::Jailer => "jailer",
            AssetKind::Kernel => "kernel",
            AssetKind::Image => "image",
            AssetKind::Initrd => "initrd",
            AssetKind::Firmware => "firmware",
        }
    }
}

/// Digest algorithm used to verify asset contents.
///
/// The default is the 512-bit variant; 256-bit is selectable for setups
/// whose asset registry publishes shorter digests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    #[default]
    Sha512,
    Sha256,
}

/// One configured asset: override path and/or expected digest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetEntry {
    pub path: Option<PathBuf>,
    /// Hex-encoded expected content digest.
    pub digest: Option<String>,
}

/// Resolves and verifies boot assets for one sandbox.
#[derive(Debug, Clone, Default)]
pub struct AssetResolver {
    entries: HashMap<AssetKind, AssetEntry>,
    defaults: HashMap<AssetKind, PathBuf>,
    algorithm: DigestAlgorithm,
}

impl AssetResolver {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self {
            algorithm,
            ..Default::default()
        }
    }

    pub fn set_default(&mut self, kind: AssetKind, path: impl Into<PathBuf>) -> &mut Self {
        self.defaults.insert(kind, path.into());
        self
    }

    pub fn set_override(&mut self, kind: AssetKind, path: impl Into<PathBuf>) -> &mut Self {
        self.entries.entry(kind).or_default().path = Some(path.into());
        self
    }

    pub fn set_digest(&mut self, kind: AssetKind, hex_digest: impl Into<String>) -> &mut Self {
        self.entries.entry(kind).or_default().digest = Some(hex_digest.into());
        self
    }

    /// Whether anything is configured for `kind` (override or default).
    pub fn has(&self, kind: AssetKind) -> bool {
        self.entries.get(&kind).map_or(false, |e| e.path.is_some())
            || self.defaults.contains_key(&kind)
    }

    /// Resolve the path for `kind` and verify its digest when one is
    /// configured. The override wins over the default.
    pub fn path(&self, kind: AssetKind) -> VmpodResult<PathBuf> {
        let entry = self.entries.get(&kind);
        let path = entry
            .and_then(|e| e.path.clone())
            .or_else(|| self.defaults.get(&kind).cloned())
            .ok_or_else(|| {
                VmpodError::AssetMissing(format!("no path configured for {} asset", kind.as_str()))
            })?;

        if !path.exists() {
            return Err(VmpodError::AssetMissing(format!(
                "{} asset not found at {}",
                kind.as_str(),
                path.display()
            )));
        }

        if let Some(expected) = entry.and_then(|e| e.digest.as_deref()) {
            let actual = digest_file(&path, self.algorithm)?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(VmpodError::AssetHashMismatch {
                    path: path.display().to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        Ok(path)
    }
}

/// Hash the full file contents, returning the lowercase hex digest.
fn digest_file(path: &Path, algorithm: DigestAlgorithm) -> VmpodResult<String> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        VmpodError::AssetMissing(format!("cannot open {}: {}", path.display(), e))
    })?;

    let mut buf = [0u8; 64 * 1024];
    match algorithm {
        DigestAlgorithm::Sha512 => {
            let mut hasher = Sha512::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
        DigestAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn override_wins_over_default() {
        let dir = tempfile::tempdir().unwrap();
        let def = write_file(&dir, "default-kernel", b"default");
        let ovr = write_file(&dir, "override-kernel", b"override");

        let mut r = AssetResolver::new(DigestAlgorithm::Sha512);
        r.set_default(AssetKind::Kernel, &def);
        assert_eq!(r.path(AssetKind::Kernel).unwrap(), def);

        r.set_override(AssetKind::Kernel, &ovr);
        assert_eq!(r.path(AssetKind::Kernel).unwrap(), ovr);
    }

    #[test]
    fn missing_file_fails_with_asset_missing() {
        let mut r = AssetResolver::default();
        r.set_default(AssetKind::Initrd, "/definitely/not/here");
        let err = r.path(AssetKind::Initrd).unwrap_err();
        assert_eq!(err.kind(), "AssetMissing");

        let err = r.path(AssetKind::Firmware).unwrap_err();
        assert_eq!(err.kind(), "AssetMissing");
    }

    #[test]
    fn digest_verification_sha512() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = write_file(&dir, "kernel", b"vmlinuz");

        let expected = {
            let mut h = Sha512::new();
            h.update(b"vmlinuz");
            hex::encode(h.finalize())
        };

        let mut r = AssetResolver::new(DigestAlgorithm::Sha512);
        r.set_override(AssetKind::Kernel, &kernel);
        r.set_digest(AssetKind::Kernel, &expected);
        assert!(r.path(AssetKind::Kernel).is_ok());

        // Uppercase digests compare equal too.
        let mut r2 = AssetResolver::new(DigestAlgorithm::Sha512);
        r2.set_override(AssetKind::Kernel, &kernel);
        r2.set_digest(AssetKind::Kernel, expected.to_uppercase());
        assert!(r2.path(AssetKind::Kernel).is_ok());
    }

    #[test]
    fn digest_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = write_file(&dir, "kernel", b"vmlinuz");

        let mut r = AssetResolver::new(DigestAlgorithm::Sha256);
        r.set_override(AssetKind::Kernel, &kernel);
        r.set_digest(AssetKind::Kernel, "00".repeat(32));
        let err = r.path(AssetKind::Kernel).unwrap_err();
        assert_eq!(err.kind(), "AssetHashMismatch");
    }
}
