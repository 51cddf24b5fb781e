use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "MEDRAG_DATA_DIR";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The MEDRAG_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/medrag/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Some(val) = std::env::var_os(DATA_DIR_ENV_VAR).filter(|v| !v.is_empty()) {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("medrag")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Default location of the persisted index. Not created here; the
    /// index is written atomically by [`crate::EmbeddingIndex::persist`].
    pub fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }
}
