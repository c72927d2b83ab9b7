//! On-disk record of installed patches.
//!
//! Layout per target:
//!
//! ```text
//! <ROOT>/<pid>/comm                      the target's command name
//! <ROOT>/<pid>/map_files/patch-XXXXXX    byte copy of each staged ELF
//! <ROOT>/<pid>/patch-XXXXXX.json         reversal record for that image
//! ```
//!
//! The registry is advisory: a stale tree left by a crashed tool run is
//! harmless and is overwritten by the next open. The reversal record holds
//! everything `--unpatch` needs in a fresh process, the staged image name,
//! the patched call site with its original bytes, and the image/trampoline
//! mappings to unmap.

use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::prelude::*;

pub const DEFAULT_ROOT: &str = "/tmp/ulpatch";

/// Registry root, `ULPATCH_ROOT` overriding the default.
pub fn registry_root() -> PathBuf {
    std::env::var_os("ULPATCH_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT))
}

/// Reversal record of one active patch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatchRecord {
    /// Name of the staged image under `map_files/`.
    pub patch_file: String,
    /// The patch object the user passed in.
    pub source: PathBuf,
    pub target_func: String,
    pub author: String,
    pub call_site: u64,
    /// Bytes overwritten at the call site.
    pub original: Vec<u8>,
    pub image_base: u64,
    pub image_len: u64,
    pub trampoline_addr: Option<u64>,
    pub trampoline_len: Option<u64>,
}

#[derive(Debug)]
pub struct Registry {
    dir: PathBuf,
}

impl Registry {
    /// Create (or adopt) the registry directory for `pid` under the
    /// configured root.
    pub fn create(pid: i32, comm: &str) -> Result<Registry> {
        Self::create_at(&registry_root(), pid, comm)
    }

    pub fn create_at(root: &Path, pid: i32, comm: &str) -> Result<Registry> {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(dir.join("map_files"))
            .with_context(|| format!("create registry directory {}", dir.display()))?;
        fs::write(dir.join("comm"), format!("{comm}\n"))
            .with_context(|| format!("write {}/comm", dir.display()))?;
        debug!("registry for pid {pid} at {}", dir.display());
        Ok(Registry { dir })
    }

    /// Open an existing registry directory without touching it.
    pub fn open(pid: i32) -> Result<Registry> {
        let dir = registry_root().join(pid.to_string());
        if !dir.is_dir() {
            bail!("no registry entry for pid {pid} at {}", dir.display());
        }
        Ok(Registry { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy `src` into `map_files/` under a fresh `patch-XXXXXX` name and
    /// return (name, full path).
    pub fn stage_patch(&self, src: &Path) -> Result<(String, PathBuf)> {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        let name = format!("patch-{suffix}");
        let dest = self.dir.join("map_files").join(&name);
        fs::copy(src, &dest).with_context(|| {
            format!("copy {} into registry at {}", src.display(), dest.display())
        })?;
        Ok((name, dest))
    }

    pub fn staged_path(&self, record: &PatchRecord) -> PathBuf {
        self.dir.join("map_files").join(&record.patch_file)
    }

    fn record_path(&self, patch_file: &str) -> PathBuf {
        self.dir.join(format!("{patch_file}.json"))
    }

    pub fn write_record(&self, record: &PatchRecord) -> Result<()> {
        let path = self.record_path(&record.patch_file);
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// All reversal records in this registry, in no particular order.
    pub fn records(&self) -> Result<Vec<PatchRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let data = fs::read_to_string(&path)?;
            match serde_json::from_str::<PatchRecord>(&data) {
                Ok(record) => records.push(record),
                Err(err) => warn!("ignoring malformed record {}: {err}", path.display()),
            }
        }
        Ok(records)
    }

    /// The record whose source path or staged name matches `patch`, if any.
    pub fn find_record(&self, patch: &Path) -> Result<Option<PatchRecord>> {
        let canonical = fs::canonicalize(patch).ok();
        let name = patch.file_name().and_then(|n| n.to_str());
        Ok(self.records()?.into_iter().find(|r| {
            canonical.as_deref() == Some(r.source.as_path())
                || r.source == patch
                || name == Some(r.patch_file.as_str())
        }))
    }

    /// Drop a record and its staged image.
    pub fn remove_record(&self, record: &PatchRecord) -> Result<()> {
        self.remove_named(&record.patch_file)
    }

    /// Same, by staged name. Tolerates a record that was never written
    /// (unwind of a half-loaded patch).
    pub fn remove_named(&self, patch_file: &str) -> Result<()> {
        let staged = self.dir.join("map_files").join(patch_file);
        if let Err(err) = fs::remove_file(&staged) {
            warn!("remove staged image {}: {err}", staged.display());
        }
        let path = self.record_path(patch_file);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn record(name: &str, source: &Path) -> PatchRecord {
        PatchRecord {
            patch_file: name.into(),
            source: source.into(),
            target_func: "do_work".into(),
            author: "tester".into(),
            call_site: 0x40_1000,
            original: vec![0x55, 0x48, 0x89, 0xe5, 0x90],
            image_base: 0x7f00_0000_0000,
            image_len: 4096,
            trampoline_addr: None,
            trampoline_len: None,
        }
    }

    #[test]
    fn create_writes_comm_and_tolerates_reuse() {
        let root = TempDir::new().unwrap();
        let reg = Registry::create_at(root.path(), 1234, "sleeper").unwrap();
        assert_eq!(
            std::fs::read_to_string(reg.dir().join("comm")).unwrap(),
            "sleeper\n"
        );
        assert!(reg.dir().join("map_files").is_dir());

        // A stale directory from a crashed run is adopted, not an error.
        let again = Registry::create_at(root.path(), 1234, "renamed").unwrap();
        assert_eq!(
            std::fs::read_to_string(again.dir().join("comm")).unwrap(),
            "renamed\n"
        );
    }

    #[test]
    fn staged_patches_get_unique_names() {
        let root = TempDir::new().unwrap();
        let reg = Registry::create_at(root.path(), 1, "t").unwrap();

        let mut src = tempfile::NamedTempFile::new().unwrap();
        src.write_all(b"\x7fELFpatch").unwrap();

        let (name_a, path_a) = reg.stage_patch(src.path()).unwrap();
        let (name_b, path_b) = reg.stage_patch(src.path()).unwrap();
        assert_ne!(name_a, name_b);
        assert!(name_a.starts_with("patch-") && name_a.len() == 12);
        assert_eq!(std::fs::read(&path_a).unwrap(), b"\x7fELFpatch");
        assert_eq!(std::fs::read(&path_b).unwrap(), b"\x7fELFpatch");
    }

    #[test]
    fn records_round_trip_and_remove() {
        let root = TempDir::new().unwrap();
        let reg = Registry::create_at(root.path(), 99, "t").unwrap();

        let mut src = tempfile::NamedTempFile::new().unwrap();
        src.write_all(b"elf").unwrap();
        let (name, staged) = reg.stage_patch(src.path()).unwrap();

        let rec = record(&name, src.path());
        reg.write_record(&rec).unwrap();

        let loaded = reg.records().unwrap();
        assert_eq!(loaded, vec![rec.clone()]);

        // Lookup by source path and by staged name both hit.
        assert_eq!(reg.find_record(src.path()).unwrap(), Some(rec.clone()));
        assert_eq!(
            reg.find_record(Path::new(&rec.patch_file)).unwrap(),
            Some(rec.clone())
        );
        assert_eq!(reg.find_record(Path::new("/no/such")).unwrap(), None);

        reg.remove_record(&rec).unwrap();
        assert!(reg.records().unwrap().is_empty());
        assert!(!staged.exists());
    }
}
