use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{Builder, TempDir};

use crate::domain::CaseId;
use crate::error::KiraError;

#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn checkpoint_dir(&self) -> Utf8PathBuf {
        self.root.join("checkpoints")
    }

    pub fn scratch_dir(&self) -> Utf8PathBuf {
        self.root.join("scratch")
    }

    pub fn ensure_layout(&self) -> Result<(), KiraError> {
        fs::create_dir_all(self.checkpoint_dir().as_std_path()).map_err(KiraError::filesystem)?;
        fs::create_dir_all(self.scratch_dir().as_std_path()).map_err(KiraError::filesystem)?;
        Ok(())
    }

    pub fn case_scratch(&self, case_id: &CaseId) -> Result<TempDir, KiraError> {
        let scratch = self.scratch_dir();
        fs::create_dir_all(scratch.as_std_path()).map_err(KiraError::filesystem)?;
        Builder::new()
            .prefix(&format!("{}-", case_id.as_str()))
            .tempdir_in(scratch.as_std_path())
            .map_err(KiraError::filesystem)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), KiraError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path()).map_err(KiraError::filesystem)?;
        }
        let tmp_path = Utf8PathBuf::from(format!("{path}.tmp"));
        fs::write(tmp_path.as_std_path(), content).map_err(KiraError::filesystem)?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path()).map_err(KiraError::filesystem)?;
        Ok(())
    }
}
