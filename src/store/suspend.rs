// src/store/suspend.rs

//! Per-DAG suspend flag.
//!
//! A suspended DAG rejects new runs at admission time; in-flight runs are
//! unaffected. The flag is a marker file so it survives restarts and is
//! visible to every process sharing the data directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::Result;

#[derive(Debug, Clone)]
pub struct SuspendStore {
    root: PathBuf,
}

impl SuspendStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            root: data_dir.as_ref().join("suspend"),
        }
    }

    pub fn set_suspended(&self, dag: &str, suspended: bool) -> Result<()> {
        let flag = self.flag_path(dag);
        if suspended {
            fs::create_dir_all(&self.root)?;
            fs::write(&flag, b"suspended")?;
        } else if flag.exists() {
            fs::remove_file(&flag)?;
        }
        Ok(())
    }

    pub fn is_suspended(&self, dag: &str) -> bool {
        self.flag_path(dag).exists()
    }

    fn flag_path(&self, dag: &str) -> PathBuf {
        self.root.join(dag)
    }
}
