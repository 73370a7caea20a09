//! Tar helpers for archive injection and extraction.
//!
//! Archives going *into* a container are built here with explicit ownership so
//! the non-root sandbox user owns what it receives. Archives coming *out* of a
//! container are untrusted: link entries are dropped and every path is
//! confined to the destination directory.

use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, warn};

/// Ownership stamped on archive entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn header(kind: EntryType, size: u64, mode: u32, owner: Owner) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_size(size);
    header.set_mode(mode);
    header.set_uid(owner.uid as u64);
    header.set_gid(owner.gid as u64);
    header.set_mtime(now_secs());
    header
}

/// Archive holding exactly one regular file named `name`.
pub fn single_file(name: &str, content: &[u8], owner: Owner) -> io::Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    let mut h = header(EntryType::Regular, content.len() as u64, 0o644, owner);
    builder.append_data(&mut h, name, content)?;
    builder.into_inner()
}

/// Archive of the *contents* of `dir` (entries relative to `dir`).
///
/// Symlinks are stored as links, never followed.
pub fn pack_dir(dir: &Path, owner: Owner) -> io::Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    append_tree(&mut builder, dir, Path::new(""), owner)?;
    builder.into_inner()
}

fn append_tree(
    builder: &mut Builder<Vec<u8>>,
    root: &Path,
    rel: &Path,
    owner: Owner,
) -> io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(root.join(rel))?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let rel_path = rel.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            let mut h = header(EntryType::Symlink, 0, 0o777, owner);
            builder.append_link(&mut h, &rel_path, &target)?;
        } else if file_type.is_dir() {
            let mut h = header(EntryType::Directory, 0, 0o755, owner);
            builder.append_data(&mut h, &rel_path, io::empty())?;
            append_tree(builder, root, &rel_path, owner)?;
        } else if file_type.is_file() {
            let mut file = std::fs::File::open(entry.path())?;
            let len = file.metadata()?.len();
            let mut h = header(EntryType::Regular, len, file_mode(&file)?, owner);
            builder.append_data(&mut h, &rel_path, &mut file)?;
        } else {
            debug!(path = %rel_path.display(), "Skipping special file");
        }
    }
    Ok(())
}

#[cfg(unix)]
fn file_mode(file: &std::fs::File) -> io::Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(file.metadata()?.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn file_mode(_file: &std::fs::File) -> io::Result<u32> {
    Ok(0o644)
}

/// Unpack an archive produced by a container into `dest`.
///
/// Returns the number of entries written. Link entries and entries whose
/// path would land outside `dest` are skipped.
pub fn unpack_untrusted(bytes: &[u8], dest: &Path) -> io::Result<usize> {
    std::fs::create_dir_all(dest)?;

    let mut archive = Archive::new(Cursor::new(bytes));
    archive.set_preserve_permissions(false);
    archive.set_unpack_xattrs(false);
    archive.set_overwrite(true);

    let mut written = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();
        let path = entry.path()?.into_owned();

        if kind.is_symlink() || kind.is_hard_link() {
            warn!(path = %path.display(), "Skipping link entry from container archive");
            continue;
        }
        if !(kind.is_file() || kind.is_dir()) {
            debug!(path = %path.display(), "Skipping special entry from container archive");
            continue;
        }
        if entry.unpack_in(dest)? {
            written += 1;
        } else {
            warn!(path = %path.display(), "Skipping archive entry outside destination");
        }
    }
    Ok(written)
}

/// A decoded archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveEntry {
    File { path: PathBuf, content: Vec<u8> },
    Dir { path: PathBuf },
    Link { path: PathBuf, target: PathBuf },
}

/// Decode all entries in memory.
pub fn read_entries(bytes: &[u8]) -> io::Result<Vec<ArchiveEntry>> {
    let mut archive = Archive::new(Cursor::new(bytes));
    let mut out = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            out.push(ArchiveEntry::Dir { path });
        } else if kind.is_symlink() || kind.is_hard_link() {
            let target = entry
                .link_name()?
                .map(|t| t.into_owned())
                .unwrap_or_default();
            out.push(ArchiveEntry::Link { path, target });
        } else {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            out.push(ArchiveEntry::File { path, content });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: Owner = Owner { uid: 1000, gid: 1000 };

    #[test]
    fn test_single_file_keeps_bytes_and_owner() {
        let bytes = single_file("a.txt", "héllo\n".as_bytes(), OWNER).unwrap();
        let mut archive = Archive::new(Cursor::new(bytes));
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.header().uid().unwrap(), 1000);
        assert_eq!(entry.path().unwrap().to_str(), Some("a.txt"));
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "héllo\n");
    }

    #[test]
    fn test_empty_file_archive() {
        let bytes = single_file("empty", b"", OWNER).unwrap();
        let entries = read_entries(&bytes).unwrap();
        assert_eq!(
            entries,
            vec![ArchiveEntry::File {
                path: PathBuf::from("empty"),
                content: Vec::new()
            }]
        );
    }

    #[test]
    fn test_pack_dir_is_relative() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.py"), "print(1)\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "# repo\n").unwrap();

        let entries = read_entries(&pack_dir(dir.path(), OWNER).unwrap()).unwrap();
        assert!(entries.contains(&ArchiveEntry::Dir {
            path: PathBuf::from("src")
        }));
        assert!(entries.contains(&ArchiveEntry::File {
            path: PathBuf::from("src/main.py"),
            content: b"print(1)\n".to_vec()
        }));
        assert!(entries.contains(&ArchiveEntry::File {
            path: PathBuf::from("README.md"),
            content: b"# repo\n".to_vec()
        }));
    }

    #[test]
    fn test_unpack_untrusted_skips_links() {
        let mut builder = Builder::new(Vec::new());
        let mut h = header(EntryType::Regular, 2, 0o644, OWNER);
        builder.append_data(&mut h, "app/ok.txt", &b"ok"[..]).unwrap();
        let mut h = header(EntryType::Symlink, 0, 0o777, OWNER);
        builder
            .append_link(&mut h, "app/passwd", "/etc/passwd")
            .unwrap();
        let bytes = builder.into_inner().unwrap();

        let dest = tempfile::tempdir().unwrap();
        let written = unpack_untrusted(&bytes, dest.path()).unwrap();
        assert_eq!(written, 1);
        assert_eq!(
            std::fs::read_to_string(dest.path().join("app/ok.txt")).unwrap(),
            "ok"
        );
        assert!(!dest.path().join("app/passwd").exists());
    }
}
