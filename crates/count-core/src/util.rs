use anyhow::Context;
use std::fs;
use std::path::Path;

pub fn atomic_write(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).context("write temp file")?;
    fs::rename(&tmp, path).context("rename temp file")?;
    Ok(())
}

pub fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).context("create parent directory")?;
        }
    }
    Ok(())
}
