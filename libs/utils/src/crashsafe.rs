use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;

use camino::{Utf8Path, Utf8PathBuf};

/// Derive the sibling temp-file path used by [`overwrite`]: the suffix is
/// tacked onto the full file name, so "foo.conf" becomes "foo.conf.temp" and
/// an extension-less "cvversion" becomes "cvversion.temp".
pub fn path_with_suffix_extension(path: impl AsRef<Utf8Path>, suffix: &str) -> Utf8PathBuf {
    let path = path.as_ref();
    match path.extension() {
        None => path.with_extension(suffix),
        Some(extension) => path.with_extension(format!("{extension}.{suffix}")),
    }
}

/// Writes `content` to `final_path` in a crash safe fashion: the content goes
/// to a sibling temp file first, is fsynced, and only then renamed into
/// place, followed by an fsync of the parent directory. If we crash at any
/// point there will never be a partially written file at `final_path`.
///
/// Callers are responsible for serializing calls for a given `final_path`.
pub fn overwrite(final_path: &Utf8Path, content: &[u8], mode: u32) -> io::Result<()> {
    let final_path_parent = final_path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("File {final_path:?} has no parent"),
        )
    })?;

    let tmp_path = path_with_suffix_extension(final_path, "temp");
    if let Err(e) = fs::remove_file(&tmp_path) {
        if e.kind() != io::ErrorKind::NotFound {
            return Err(e);
        }
    }

    let mut file = fs::OpenOptions::new()
        .write(true)
        // Use `create_new` so that, if we race with ourselves or something
        // else, we bail out instead of causing damage.
        .create_new(true)
        .open(&tmp_path)?;
    file.set_permissions(fs::Permissions::from_mode(mode))?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file); // don't keep the fd open for longer than we have to

    fs::rename(&tmp_path, final_path)?;

    let final_parent_dirfd = fs::OpenOptions::new().read(true).open(final_path_parent)?;
    final_parent_dirfd.sync_all()?;
    Ok(())
}
