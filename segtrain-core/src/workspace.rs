//! Output directory preparation.
//!
//! A fresh run wipes the output directory, but only through an explicit
//! [`PreparePlan`] that lists every entry to be removed and is confirmed by a
//! [`DeletionApprover`] before anything is touched.

use crate::error::{Result, SegTrainError};
use std::path::{Path, PathBuf};

/// Subdirectory that receives the sample comparison images.
pub const SAMPLE_DIR: &str = "sample_compare_result";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Denied,
}

/// Confirms destructive deletion of an existing output directory.
pub trait DeletionApprover: Send + Sync {
    fn approve(&self, root: &Path, entries: &[PathBuf]) -> ApprovalDecision;
}

/// Approves every deletion; for `--yes` and tests.
pub struct AutoApprove;

impl DeletionApprover for AutoApprove {
    fn approve(&self, _root: &Path, _entries: &[PathBuf]) -> ApprovalDecision {
        ApprovalDecision::Approved
    }
}

/// Refuses every deletion.
pub struct DenyDeletion;

impl DeletionApprover for DenyDeletion {
    fn approve(&self, _root: &Path, _entries: &[PathBuf]) -> ApprovalDecision {
        ApprovalDecision::Denied
    }
}

/// What preparing the workspace would do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreparePlan {
    /// Resume: keep the directory as it is.
    Reuse,
    /// The directory does not exist yet.
    Create,
    /// Delete these top-level entries, then recreate the sample directory.
    Wipe { entries: Vec<PathBuf> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareReport {
    pub created: bool,
    pub reused: bool,
    pub deleted: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputWorkspace {
    root: PathBuf,
    sample_dir: PathBuf,
}

impl OutputWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let sample_dir = root.join(SAMPLE_DIR);
        Self { root, sample_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sample_dir(&self) -> &Path {
        &self.sample_dir
    }

    pub fn model_best_path(&self) -> PathBuf {
        self.root.join("model_best.bin")
    }

    /// Work out what [`prepare`](Self::prepare) would do without touching disk.
    pub fn plan(&self, resume: bool) -> Result<PreparePlan> {
        if resume {
            return Ok(PreparePlan::Reuse);
        }
        if !self.root.exists() {
            return Ok(PreparePlan::Create);
        }
        if !self.root.is_dir() {
            return Err(SegTrainError::workspace(format!(
                "output path {} exists and is not a directory",
                self.root.display()
            )));
        }
        self.check_deletable()?;

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            // An empty sample directory is already in its prepared state.
            if path == self.sample_dir && is_empty_dir(&path)? {
                continue;
            }
            entries.push(path);
        }
        entries.sort();
        Ok(PreparePlan::Wipe { entries })
    }

    /// Apply the plan. Non-resume runs end with `root/` holding only an
    /// empty sample directory; resume runs keep everything.
    pub fn prepare(&self, resume: bool, approver: &dyn DeletionApprover) -> Result<PrepareReport> {
        let mut report = PrepareReport::default();
        match self.plan(resume)? {
            PreparePlan::Reuse => {
                report.created = !self.root.exists();
                std::fs::create_dir_all(&self.sample_dir)?;
                report.reused = !report.created;
                tracing::info!(dir = %self.root.display(), "resuming in existing output directory");
            }
            PreparePlan::Create => {
                std::fs::create_dir_all(&self.sample_dir)?;
                report.created = true;
                tracing::info!(dir = %self.root.display(), "created output directory");
            }
            PreparePlan::Wipe { entries } => {
                if !entries.is_empty()
                    && approver.approve(&self.root, &entries) == ApprovalDecision::Denied
                {
                    return Err(SegTrainError::workspace(format!(
                        "deletion of {} entries in {} was not approved",
                        entries.len(),
                        self.root.display()
                    )));
                }
                for path in entries {
                    tracing::warn!(path = %path.display(), "deleting previous run output");
                    if path.is_dir() && !path.is_symlink() {
                        std::fs::remove_dir_all(&path)?;
                    } else {
                        std::fs::remove_file(&path)?;
                    }
                    report.deleted.push(path);
                }
                std::fs::create_dir_all(&self.sample_dir)?;
            }
        }
        Ok(report)
    }

    fn check_deletable(&self) -> Result<()> {
        let resolved = std::fs::canonicalize(&self.root)?;
        if resolved.parent().is_none() {
            return Err(SegTrainError::workspace(format!(
                "refusing to wipe filesystem root {}",
                resolved.display()
            )));
        }
        let home = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf());
        if let Some(home) = home.and_then(|h| std::fs::canonicalize(h).ok()) {
            if resolved == home {
                return Err(SegTrainError::workspace(format!(
                    "refusing to wipe home directory {}",
                    resolved.display()
                )));
            }
        }
        if let Ok(cwd) = std::env::current_dir().and_then(std::fs::canonicalize) {
            if cwd.starts_with(&resolved) {
                return Err(SegTrainError::workspace(format!(
                    "refusing to wipe {}, which contains the working directory",
                    resolved.display()
                )));
            }
        }
        Ok(())
    }
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    Ok(path.is_dir() && std::fs::read_dir(path)?.next().is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording(Mutex<Vec<PathBuf>>);

    impl DeletionApprover for Recording {
        fn approve(&self, _root: &Path, entries: &[PathBuf]) -> ApprovalDecision {
            self.0.lock().unwrap().extend_from_slice(entries);
            ApprovalDecision::Approved
        }
    }

    fn populated() -> (tempfile::TempDir, OutputWorkspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = OutputWorkspace::new(dir.path().join("output"));
        std::fs::create_dir_all(ws.sample_dir()).unwrap();
        std::fs::write(ws.sample_dir().join("0.png"), b"x").unwrap();
        std::fs::write(ws.root().join("model_0000099.bin"), b"w").unwrap();
        std::fs::write(ws.root().join("last_checkpoint"), b"model_0000099.bin").unwrap();
        (dir, ws)
    }

    #[test]
    fn test_plan_lists_entries() {
        let (_dir, ws) = populated();
        let plan = ws.plan(false).unwrap();
        assert_eq!(
            plan,
            PreparePlan::Wipe {
                entries: vec![
                    ws.root().join("last_checkpoint"),
                    ws.root().join("model_0000099.bin"),
                    ws.sample_dir().to_path_buf(),
                ]
            }
        );
        assert_eq!(ws.plan(true).unwrap(), PreparePlan::Reuse);
    }

    #[test]
    fn test_fresh_prepare_leaves_only_sample_dir() {
        let (_dir, ws) = populated();
        let approver = Recording(Mutex::new(Vec::new()));
        let report = ws.prepare(false, &approver).unwrap();
        assert_eq!(report.deleted.len(), 3);
        assert_eq!(approver.0.lock().unwrap().len(), 3);

        let left: Vec<_> = std::fs::read_dir(ws.root())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(left, vec![ws.sample_dir().to_path_buf()]);
        assert!(is_empty_dir(ws.sample_dir()).unwrap());
    }

    #[test]
    fn test_prepare_is_idempotent() {
        let (_dir, ws) = populated();
        ws.prepare(false, &AutoApprove).unwrap();
        assert_eq!(
            ws.plan(false).unwrap(),
            PreparePlan::Wipe { entries: vec![] }
        );
        // Nothing left to delete, so even a refusing approver is not consulted.
        let report = ws.prepare(false, &DenyDeletion).unwrap();
        assert!(report.deleted.is_empty());
    }

    #[test]
    fn test_denied_deletion_keeps_files() {
        let (_dir, ws) = populated();
        let err = ws.prepare(false, &DenyDeletion).unwrap_err();
        assert!(matches!(err, SegTrainError::Workspace(_)));
        assert!(ws.root().join("model_0000099.bin").exists());
    }

    #[test]
    fn test_resume_keeps_files() {
        let (_dir, ws) = populated();
        let report = ws.prepare(true, &DenyDeletion).unwrap();
        assert!(report.reused);
        assert!(ws.root().join("last_checkpoint").exists());
    }

    #[test]
    fn test_resume_without_directory_creates_it() {
        let dir = tempfile::tempdir().unwrap();
        let ws = OutputWorkspace::new(dir.path().join("new"));
        let report = ws.prepare(true, &DenyDeletion).unwrap();
        assert!(report.created);
        assert!(ws.sample_dir().is_dir());
    }

    #[test]
    fn test_refuses_filesystem_root() {
        let ws = OutputWorkspace::new("/");
        assert!(matches!(
            ws.plan(false),
            Err(SegTrainError::Workspace(_))
        ));
    }
}
