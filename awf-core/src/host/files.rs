//! Filesystem writes into the run's work directory.
//!
//! The work directory may sit under a shared temp root, so nothing here
//! follows a symlink or reuses a directory another user can write to.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};

/// Create `dir` (and missing parents) with `mode`, or accept an existing
/// directory that is neither a symlink nor writable by group or others.
pub fn prepare_dir(dir: &Path, mode: u32) -> Result<()> {
    match fs::symlink_metadata(dir) {
        Ok(meta) => {
            if meta.file_type().is_symlink() {
                bail!("{} is a symlink; refusing to use it", dir.display());
            }
            if !meta.is_dir() {
                bail!("{} exists and is not a directory", dir.display());
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if meta.permissions().mode() & 0o022 != 0 {
                    bail!("{} is writable by group or others", dir.display());
                }
            }
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let mut builder = DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(mode);
            }
            builder
                .create(dir)
                .with_context(|| format!("failed to create {}", dir.display()))
        }
        Err(err) => Err(err).with_context(|| format!("failed to inspect {}", dir.display())),
    }
}

/// Write `contents` to a freshly created file at `path`.
///
/// A regular file left by an earlier run is replaced; a symlink is an error.
/// The final open uses `O_EXCL`, so a link planted between the check and the
/// open also fails instead of being followed.
pub fn write_new_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            bail!("{} is a symlink; refusing to write through it", path.display());
        }
        Ok(meta) if meta.is_dir() => bail!("{} is a directory", path.display()),
        Ok(_) => fs::remove_file(path)
            .with_context(|| format!("failed to replace {}", path.display()))?,
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to inspect {}", path.display()));
        }
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("failed to write {}", path.display()))
}

/// Atomically replace `path` with `contents` via a sibling temp file.
///
/// The temp file is created owner-only; the rename swaps the directory entry
/// and never writes through whatever `path` pointed to.
pub fn replace_file(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut staged = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to stage a replacement in {}", dir.display()))?;
    staged
        .write_all(contents)
        .with_context(|| format!("failed to write {}", staged.path().display()))?;
    staged
        .persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn planted_symlink_is_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("victim.txt");
        fs::write(&victim, "precious").unwrap();
        let target = dir.path().join("squid.conf");
        std::os::unix::fs::symlink(&victim, &target).unwrap();

        let err = write_new_file(&target, b"http_port 3128\n", 0o644).unwrap_err();
        assert!(err.to_string().contains("symlink"));
        assert_eq!(fs::read_to_string(&victim).unwrap(), "precious");
    }

    #[cfg(unix)]
    #[test]
    fn stale_file_is_replaced_with_requested_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker-compose.yml");
        fs::write(&path, "stale").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o666)).unwrap();

        write_new_file(&path, b"services: {}\n", 0o600).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "services: {}\n");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn shared_writable_dir_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("awf-shared");
        fs::create_dir(&shared).unwrap();
        fs::set_permissions(&shared, fs::Permissions::from_mode(0o777)).unwrap();

        let err = prepare_dir(&shared, 0o700).unwrap_err();
        assert!(err.to_string().contains("writable by group or others"));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_dir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        fs::create_dir(&real).unwrap();
        let link = dir.path().join("awf-link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        assert!(prepare_dir(&link, 0o700).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn missing_dir_is_created_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("awf-run").join("nested");
        prepare_dir(&work, 0o700).unwrap();
        let mode = fs::metadata(&work).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[cfg(unix)]
    #[test]
    fn replace_swaps_a_symlink_instead_of_following_it() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("victim.txt");
        fs::write(&victim, "precious").unwrap();
        let target = dir.path().join("docker-compose.yml");
        std::os::unix::fs::symlink(&victim, &target).unwrap();

        replace_file(&target, b"redacted").unwrap();
        assert_eq!(fs::read_to_string(&victim).unwrap(), "precious");
        assert_eq!(fs::read_to_string(&target).unwrap(), "redacted");
        assert!(!fs::symlink_metadata(&target).unwrap().file_type().is_symlink());
    }
}
