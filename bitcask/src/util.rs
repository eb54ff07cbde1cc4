use std::fs;
use std::path::Path;

use crate::error::Result;

/// Sums the sizes of every regular file directly inside `dir_path` (the
/// engine's directories are flat — no nested subdirectories besides the
/// index backends' own storage, which callers exclude explicitly).
pub fn dir_disk_size(dir_path: &Path) -> u64 {
    let mut total = 0u64;
    let Ok(entries) = fs::read_dir(dir_path) else {
        return 0;
    };
    for entry in entries.flatten() {
        if let Ok(metadata) = entry.metadata() {
            if metadata.is_file() {
                total += metadata.len();
            }
        }
    }
    total
}

/// Free space available on the filesystem holding `dir_path`, used by the
/// merge preflight check (spec.md §4.7).
pub fn available_disk_size(dir_path: &Path) -> Result<u64> {
    Ok(fs2::available_space(dir_path)?)
}

/// Recursively copies `src` into `dst`, skipping any entry whose file name
/// matches one of `exclude` — used by `Engine::backup` to leave the
/// advisory lock file behind (spec.md §5, "Directory lock").
pub fn copy_dir(src: &Path, dst: &Path, exclude: &[&str]) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_name = entry.file_name();
        if exclude.iter().any(|e| file_name.to_string_lossy() == *e) {
            continue;
        }
        let src_path = entry.path();
        let dst_path = dst.join(&file_name);
        if entry.file_type()?.is_dir() {
            copy_dir(&src_path, &dst_path, exclude)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}
