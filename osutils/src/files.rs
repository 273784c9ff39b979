use std::{
    fs::{File, OpenOptions, Permissions},
    io::Write,
    os::{linux::fs::MetadataExt, unix::fs::PermissionsExt},
    path::Path,
};

use anyhow::{bail, Context, Error};

/// Creates a file and all parent directories if they don't exist
pub fn create_file<S>(path: S) -> Result<File, Error>
where
    S: AsRef<Path>,
{
    if let Some(parent) = path.as_ref().parent() {
        create_dirs(parent)?;
    }

    std::fs::File::create(path.as_ref()).context(format!(
        "Could not create file: {}",
        path.as_ref().display()
    ))
}

/// Creates a file and all parent directories if they don't exist, and sets the file mode
pub fn create_file_mode<S>(path: S, mode: u32) -> Result<File, Error>
where
    S: AsRef<Path>,
{
    let file = create_file(path.as_ref())?;
    std::fs::set_permissions(path.as_ref(), Permissions::from_mode(mode)).context(format!(
        "Could not set permissions {:#o} for file {}",
        mode,
        path.as_ref().display()
    ))?;
    Ok(file)
}

/// Creates all directories in a path if they don't exist
pub fn create_dirs<S>(path: S) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    std::fs::create_dir_all(path.as_ref()).context(format!(
        "Could not create path: {}",
        path.as_ref().display()
    ))
}

/// Creates a sparse file of the given virtual size. An existing file is left untouched.
///
/// Returns whether the file was created.
pub fn create_sparse_file<S>(path: S, size: u64) -> Result<bool, Error>
where
    S: AsRef<Path>,
{
    let path = path.as_ref();
    if path.exists() {
        if !path.is_file() {
            bail!("Path exists but is not a file: {}", path.display());
        }
        return Ok(false);
    }

    let file = create_file(path)?;
    file.set_len(size).context(format!(
        "Could not resize {} to {size} bytes",
        path.display()
    ))?;
    Ok(true)
}

/// Reads the content of a file and trims it
pub fn read_file_trim<S>(file_path: &S) -> Result<String, Error>
where
    S: AsRef<Path>,
{
    let content = std::fs::read_to_string(file_path.as_ref()).context(format!(
        "Could not read file contents: {:?}",
        file_path.as_ref()
    ))?;
    Ok(content.trim().to_string())
}

/// Writes to a file
pub fn write_file<S>(path: S, mode: u32, contents: &[u8]) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    let mut file = create_file_mode(path.as_ref(), mode).context(format!(
        "Could not create file: {}",
        path.as_ref().display()
    ))?;

    file.write_all(contents).context(format!(
        "Could not write to file: {}",
        path.as_ref().display()
    ))?;

    Ok(())
}

/// Appends each line that the file does not already contain. Existing content is never
/// rewritten, and the file is created when missing.
///
/// Returns the number of lines appended.
pub fn append_missing_lines<S>(path: S, lines: &[&str]) -> Result<usize, Error>
where
    S: AsRef<Path>,
{
    let path = path.as_ref();
    let existing = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(e).context(format!("Could not read file contents: {}", path.display()))
        }
    };

    let missing = lines
        .iter()
        .filter(|line| !existing.lines().any(|l| l == **line))
        .collect::<Vec<_>>();
    if missing.is_empty() {
        return Ok(0);
    }

    if let Some(parent) = path.parent() {
        create_dirs(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context(format!("Could not open file: {}", path.display()))?;

    let mut content = String::new();
    if !existing.is_empty() && !existing.ends_with('\n') {
        content.push('\n');
    }
    for line in &missing {
        content.push_str(line);
        content.push('\n');
    }
    file.write_all(content.as_bytes())
        .context(format!("Could not write to file: {}", path.display()))?;

    Ok(missing.len())
}

/// Copies `source` to `destination` if the source exists. Returns whether a copy happened.
pub fn copy_if_exists<S, D>(source: S, destination: D) -> Result<bool, Error>
where
    S: AsRef<Path>,
    D: AsRef<Path>,
{
    if !source.as_ref().is_file() {
        return Ok(false);
    }
    if let Some(parent) = destination.as_ref().parent() {
        create_dirs(parent)?;
    }
    std::fs::copy(source.as_ref(), destination.as_ref()).context(format!(
        "Could not copy {} to {}",
        source.as_ref().display(),
        destination.as_ref().display()
    ))?;
    Ok(true)
}

/// Recursively copies the contents of `source` into `destination`, keeping files that already
/// exist in the destination. Symlinks are recreated rather than followed.
pub fn copy_dir_contents<S, D>(source: S, destination: D) -> Result<(), Error>
where
    S: AsRef<Path>,
    D: AsRef<Path>,
{
    let source = source.as_ref();
    let destination = destination.as_ref();
    create_dirs(destination)?;

    for entry in std::fs::read_dir(source)
        .context(format!("Failed to read contents of directory {}", source.display()))?
    {
        let entry = entry.context("Failed to read entry")?;
        let target = destination.join(entry.file_name());
        let file_type = entry
            .file_type()
            .context(format!("Failed to get file type of {}", entry.path().display()))?;

        if file_type.is_dir() {
            copy_dir_contents(entry.path(), &target)?;
        } else if target.symlink_metadata().is_ok() {
            continue;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())
                .context(format!("Failed to read link {}", entry.path().display()))?;
            std::os::unix::fs::symlink(&link, &target)
                .context(format!("Failed to create symlink {}", target.display()))?;
        } else {
            std::fs::copy(entry.path(), &target).context(format!(
                "Could not copy {} to {}",
                entry.path().display(),
                target.display()
            ))?;
        }
    }
    Ok(())
}

pub fn get_owner_uid<S>(path: S) -> Result<u32, Error>
where
    S: AsRef<Path>,
{
    Ok(path
        .as_ref()
        .metadata()
        .context(format!(
            "Failed to get metadata for {}",
            path.as_ref().display()
        ))?
        .st_uid())
}

/// Permission bits of a path, without the file type.
pub fn get_mode<S>(path: S) -> Result<u32, Error>
where
    S: AsRef<Path>,
{
    Ok(path
        .as_ref()
        .metadata()
        .context(format!(
            "Failed to get metadata for {}",
            path.as_ref().display()
        ))?
        .permissions()
        .mode()
        & 0o7777)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn test_create_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("some/path").join("test.txt");
        create_file(&path).unwrap();
        assert!(path.exists());
        assert!(path.is_file());
    }

    #[test]
    fn test_create_file_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.txt");
        let file = create_file_mode(&path, 0o600).unwrap();
        assert!(path.exists());
        assert!(path.is_file());
        // Bitwise AND to ignore the file type
        assert_eq!(file.metadata().unwrap().permissions().mode() & 0o777, 0o600);
        assert_eq!(get_mode(&path).unwrap(), 0o600);
    }

    #[test]
    fn test_create_sparse_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chroot.img");

        assert!(create_sparse_file(&path, 1 << 40).unwrap());
        let metadata = path.metadata().unwrap();
        assert_eq!(metadata.len(), 1 << 40);
        // Sparse: nothing is allocated yet
        assert!(metadata.st_blocks() < 16);

        // Second call is a no-op, even with a different size
        assert!(!create_sparse_file(&path, 10).unwrap());
        assert_eq!(path.metadata().unwrap().len(), 1 << 40);

        // A directory in the way is an error
        assert!(create_sparse_file(dir.path(), 10).is_err());
    }

    #[test]
    fn test_read_file_trim() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cros_chroot_version");
        let contents = indoc::indoc! {r#"

                 42


        "#};
        std::fs::write(&path, contents).unwrap();
        assert_eq!(read_file_trim(&path).unwrap(), "42");
    }

    #[test]
    fn test_append_missing_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("home/user/.bash_profile");

        // File is created when missing
        assert_eq!(append_missing_lines(&path, &["cd ~/chromiumos"]).unwrap(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "cd ~/chromiumos\n");

        // Nothing is appended twice
        assert_eq!(append_missing_lines(&path, &["cd ~/chromiumos"]).unwrap(), 0);

        // Existing content is kept, even without a trailing newline
        std::fs::write(&path, "export EDITOR=vim").unwrap();
        assert_eq!(
            append_missing_lines(&path, &["export EDITOR=vim", "cd ~/chromiumos"]).unwrap(),
            1
        );
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            indoc::indoc! {r#"
                export EDITOR=vim
                cd ~/chromiumos
            "#}
        );
    }

    #[test]
    fn test_copy_if_exists() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("resolv.conf");
        let destination = dir.path().join("chroot/etc/resolv.conf");

        assert!(!copy_if_exists(&source, &destination).unwrap());
        assert!(!destination.exists());

        std::fs::write(&source, "nameserver 127.0.0.53\n").unwrap();
        assert!(copy_if_exists(&source, &destination).unwrap());
        assert_eq!(
            std::fs::read_to_string(&destination).unwrap(),
            "nameserver 127.0.0.53\n"
        );
    }

    #[test]
    fn test_copy_dir_contents() {
        let dir = tempdir().unwrap();
        let skel = dir.path().join("skel");
        create_dirs(skel.join(".config")).unwrap();
        std::fs::write(skel.join(".bashrc"), "skel bashrc").unwrap();
        std::fs::write(skel.join(".config/app"), "app").unwrap();
        std::os::unix::fs::symlink("/does/not/exist", skel.join("link")).unwrap();

        let home = dir.path().join("home/user");
        create_dirs(&home).unwrap();
        std::fs::write(home.join(".bashrc"), "mine").unwrap();

        copy_dir_contents(&skel, &home).unwrap();
        assert_eq!(std::fs::read_to_string(home.join(".bashrc")).unwrap(), "mine");
        assert_eq!(std::fs::read_to_string(home.join(".config/app")).unwrap(), "app");
        assert_eq!(
            std::fs::read_link(home.join("link")).unwrap(),
            Path::new("/does/not/exist")
        );
    }

    #[test]
    fn test_get_owner_uid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.txt");
        // Create a file, the owner should be the same as the current process
        let _ = create_file(&path).unwrap();

        assert_eq!(
            get_owner_uid(path).unwrap(),
            get_owner_uid("/proc/self").unwrap()
        );
    }
}
