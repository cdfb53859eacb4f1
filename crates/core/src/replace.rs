use std::fs::File;
use std::path::Path;

use crate::error::Result;

/// Install `src` at `dst` and make it durable before returning: rename
/// within a filesystem, or copy + fsync + rename across filesystems,
/// followed by an fsync of the containing directory.
pub fn replace_file(src: &Path, dst: &Path) -> Result<()> {
    if let Err(err) = std::fs::rename(src, dst) {
        tracing::debug!(
            src = %src.display(),
            dst = %dst.display(),
            error = %err,
            "rename failed, falling back to copy-then-rename"
        );
        copy_then_rename(src, dst)?;
    }
    fsync_parent(dst)
}

/// Unlink a file and fsync its directory so the removal is durable.
/// Used when a replacement landed under a different name than the
/// original.
pub fn remove_durably(path: &Path) -> Result<()> {
    std::fs::remove_file(path)?;
    fsync_parent(path)
}

fn copy_then_rename(src: &Path, dst: &Path) -> Result<()> {
    let mut staged = dst.as_os_str().to_owned();
    staged.push(".part");
    let staged = Path::new(&staged);

    let result = (|| {
        std::fs::copy(src, staged)?;
        File::open(staged)?.sync_all()?;
        std::fs::rename(staged, dst)?;
        std::fs::remove_file(src)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(staged);
    }
    result
}

fn fsync_parent(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}
