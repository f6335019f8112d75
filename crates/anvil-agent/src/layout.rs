use std::path::{Path, PathBuf};

use crate::error::{Result, RuntimeError};

pub const INSTANCES_DIR: &str = "instances";

/// Names double as directory names and container names.
pub fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(RuntimeError::invalid("name", "must be non-empty"));
    }
    if name.len() > 64 {
        return Err(RuntimeError::invalid("name", "must be at most 64 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(RuntimeError::invalid(
            "name",
            "only ASCII letters, digits, '-', '_' and '.' are allowed",
        ));
    }
    if name.starts_with('.') {
        return Err(RuntimeError::invalid("name", "must not start with '.'"));
    }
    Ok(name.to_string())
}

#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.root.join(INSTANCES_DIR)
    }

    pub fn instance_dir(&self, name: &str) -> Result<PathBuf> {
        let name = validate_name(name)?;
        Ok(self.instances_dir().join(name))
    }

    /// Names of all instance directories (including symlinked ones).
    pub async fn instance_names(&self) -> Result<Vec<String>> {
        let dir = self.instances_dir();
        let mut rd = match tokio::fs::read_dir(&dir).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RuntimeError::io(format!("read {}", dir.display()))(e)),
        };
        let mut out = Vec::new();
        while let Some(entry) = rd
            .next_entry()
            .await
            .map_err(RuntimeError::io("read instances dir"))?
        {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_name(&name).is_err() {
                continue;
            }
            if tokio::fs::metadata(entry.path())
                .await
                .is_ok_and(|m| m.is_dir())
            {
                out.push(name);
            }
        }
        out.sort();
        Ok(out)
    }
}

/// Removes an instance directory. A symlinked directory is resolved exactly once: the link
/// and its target are both removed, but links inside the target are not followed.
pub async fn remove_instance_dir(path: &Path) -> Result<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(RuntimeError::io(format!("stat {}", path.display()))(e)),
    };

    if meta.file_type().is_symlink() {
        let target = tokio::fs::read_link(path)
            .await
            .map_err(RuntimeError::io(format!("read link {}", path.display())))?;
        let target = if target.is_absolute() {
            target
        } else {
            path.parent().unwrap_or_else(|| Path::new(".")).join(target)
        };
        tokio::fs::remove_file(path)
            .await
            .map_err(RuntimeError::io(format!("remove link {}", path.display())))?;
        match tokio::fs::remove_dir_all(&target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(RuntimeError::io(format!("remove {}", target.display()))(e));
            }
        }
        return Ok(());
    }

    tokio::fs::remove_dir_all(path)
        .await
        .map_err(RuntimeError::io(format!("remove {}", path.display())))
}
