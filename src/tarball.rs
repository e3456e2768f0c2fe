//! Tar payload extraction and construction.
//!
//! Entry names are written raw into the header name field rather than through
//! `Header::set_path`, which would normalise away the `./` prefix and the
//! trailing `/` on directories that packaging tools expect to see.

use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use tar::{Archive, Builder, EntryType, Header};

use crate::alias::Alias;
use crate::error::{Error, Result};
use crate::remap::{PathRemapper, Topology};
use crate::utils::to_archive_path;

/// Directory holding control files inside an extracted package tree.
pub const CONTROL_DIR: &str = "DEBIAN";

const FIELD_LEN: usize = 100;
const GNU_LONG_NAME: &str = "././@LongLink";

/// Counts of what [`extract`] wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub directories: usize,
    pub files: usize,
    pub symlinks: usize,
    pub skipped: usize,
}

/// Lists entry names without extracting anything.
pub fn entry_names(tar: &[u8]) -> Result<Vec<String>> {
    let mut archive = Archive::new(tar);
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        names.push(String::from_utf8_lossy(&entry.path_bytes()).into_owned());
    }
    Ok(names)
}

/// Normalises an entry name to a relative path, or `None` for the archive root.
fn sanitize(name: &str) -> Result<Option<PathBuf>> {
    if name.starts_with('/') {
        return Err(Error::UnsafePath(name.to_string()));
    }
    let mut clean = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return Err(Error::UnsafePath(name.to_string())),
        }
    }
    Ok((!clean.as_os_str().is_empty()).then_some(clean))
}

/// Expands `tar` under `target`, passing every name through `remapper`.
/// Symlink targets are written exactly as archived.
pub fn extract(tar: &[u8], target: &Path, remapper: &PathRemapper) -> Result<ExtractStats> {
    let mut archive = Archive::new(tar);
    let mut stats = ExtractStats::default();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let name = remapper.remap(&raw_name);
        let Some(relative) = sanitize(&name)? else {
            continue;
        };
        let dest = target.join(&relative);
        let mode = entry.header().mode().unwrap_or(0o644) & 0o7777;
        let kind = entry.header().entry_type();

        match kind {
            EntryType::Directory => {
                fs::create_dir_all(&dest).map_err(Error::at(&dest))?;
                // Keep the workspace writable; the builder assigns directory modes.
                set_mode(&dest, mode | 0o700)?;
                stats.directories += 1;
            }
            EntryType::Regular | EntryType::Continuous => {
                create_parent(&dest)?;
                let mut data = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut data)?;
                fs::write(&dest, &data).map_err(Error::at(&dest))?;
                set_mode(&dest, mode)?;
                stats.files += 1;
            }
            EntryType::Symlink => {
                let Some(link) = entry.link_name()? else {
                    tracing::warn!("Symlink {} has no target, skipping", raw_name);
                    stats.skipped += 1;
                    continue;
                };
                create_parent(&dest)?;
                match make_symlink(&link, &dest) {
                    Ok(()) => stats.symlinks += 1,
                    Err(e) => {
                        tracing::warn!(
                            "Failed to create symlink {} -> {}: {}",
                            dest.display(),
                            link.display(),
                            e
                        );
                        stats.skipped += 1;
                    }
                }
            }
            other => {
                tracing::warn!("Skipping unsupported {:?} entry {}", other, raw_name);
                stats.skipped += 1;
            }
        }
    }

    tracing::debug!(
        "Extracted {} dir(s), {} file(s), {} symlink(s) into {}",
        stats.directories,
        stats.files,
        stats.symlinks,
        target.display()
    );
    Ok(stats)
}

fn create_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent).map_err(Error::at(parent)),
        None => Ok(()),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(Error::at(path))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks are not supported"))
}

/// What a file is for, which decides the mode it is packaged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    ServiceExecutable,
    AgentLibrary,
    ServiceDescriptor,
    Other,
}

impl FileRole {
    pub fn classify(archive_path: &str, alias: &Alias) -> Self {
        let file_name = archive_path.rsplit('/').next().unwrap_or(archive_path);
        let agent_stem = format!("{}-agent", alias);
        if file_name == "frida-server" || file_name == alias.as_str() {
            FileRole::ServiceExecutable
        } else if archive_path.contains("frida-agent") || archive_path.contains(&agent_stem) {
            FileRole::AgentLibrary
        } else if file_name.ends_with(".plist") {
            FileRole::ServiceDescriptor
        } else {
            FileRole::Other
        }
    }

    /// Mode to package the file with, given its on-disk permission bits.
    pub fn mode(self, disk_mode: u32) -> u32 {
        match self {
            FileRole::ServiceExecutable | FileRole::AgentLibrary => 0o755,
            FileRole::ServiceDescriptor => 0o644,
            FileRole::Other => disk_mode & 0o7777,
        }
    }
}

#[derive(Debug)]
enum NodeKind {
    Directory,
    File,
    Symlink(PathBuf),
}

#[derive(Debug)]
struct Node {
    path: PathBuf,
    relative: String,
    kind: NodeKind,
    mode: u32,
    mtime: u64,
    size: u64,
}

/// Pre-order walk: every directory precedes its children; within a directory,
/// subdirectories come before files and names sort bytewise.
fn walk(root: &Path, dir: &Path, skip_top: Option<&str>, out: &mut Vec<Node>) -> Result<()> {
    let mut children = fs::read_dir(dir)
        .map_err(Error::at(dir))?
        .collect::<io::Result<Vec<_>>>()
        .map_err(Error::at(dir))?;
    children.sort_by_key(|c| c.file_name());

    let mut nodes = Vec::with_capacity(children.len());
    for child in children {
        let path = child.path();
        if dir == root && skip_top.is_some_and(|skip| child.file_name() == skip) {
            continue;
        }
        let meta = fs::symlink_metadata(&path).map_err(Error::at(&path))?;
        let kind = if meta.file_type().is_symlink() {
            NodeKind::Symlink(fs::read_link(&path).map_err(Error::at(&path))?)
        } else if meta.is_dir() {
            NodeKind::Directory
        } else {
            NodeKind::File
        };
        let relative = to_archive_path(path.strip_prefix(root).unwrap_or(&path));
        nodes.push(Node {
            relative,
            mode: disk_mode(&meta),
            mtime: meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_secs()),
            size: meta.len(),
            kind,
            path,
        });
    }
    nodes.sort_by_key(|n| !matches!(n.kind, NodeKind::Directory));

    for node in nodes {
        let recurse = matches!(node.kind, NodeKind::Directory).then(|| node.path.clone());
        out.push(node);
        if let Some(sub) = recurse {
            walk(root, &sub, skip_top, out)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn disk_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn disk_mode(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

fn owned_header(entry_type: EntryType, mode: u32, mtime: u64, size: u64) -> Result<Header> {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(mtime);
    header.set_size(size);
    header.set_username("root")?;
    header.set_groupname("root")?;
    Ok(header)
}

/// Emits a GNU `././@LongLink` record carrying `value` for the entry that
/// follows; `kind` says whether it is the entry's name or its link target.
fn append_long_record(builder: &mut Builder<Vec<u8>>, kind: EntryType, value: &[u8]) -> Result<()> {
    let mut long = owned_header(kind, 0o644, 0, value.len() as u64 + 1)?;
    write_field(&mut long.as_old_mut().name, GNU_LONG_NAME.as_bytes());
    long.set_cksum();
    let mut payload = value.to_vec();
    payload.push(0);
    builder.append(&long, payload.as_slice())?;
    Ok(())
}

/// Appends an entry whose name and link target are written verbatim, with
/// GNU long-name and long-link records for values that do not fit the
/// 100-byte header fields.
fn append_raw<R: Read>(
    builder: &mut Builder<Vec<u8>>,
    mut header: Header,
    name: &str,
    link: Option<&[u8]>,
    data: R,
) -> Result<()> {
    if let Some(link) = link {
        if link.len() > FIELD_LEN {
            append_long_record(builder, EntryType::GNULongLink, link)?;
        }
        write_field(&mut header.as_old_mut().linkname, &link[..link.len().min(FIELD_LEN)]);
    }
    let name = name.as_bytes();
    if name.len() > FIELD_LEN {
        append_long_record(builder, EntryType::GNULongName, name)?;
    }
    write_field(&mut header.as_old_mut().name, &name[..name.len().min(FIELD_LEN)]);
    header.set_cksum();
    builder.append(&header, data)?;
    Ok(())
}

fn write_field(field: &mut [u8; FIELD_LEN], value: &[u8]) {
    field.fill(0);
    field[..value.len()].copy_from_slice(value);
}

fn append_node(builder: &mut Builder<Vec<u8>>, node: &Node, name: &str, mode: u32) -> Result<()> {
    match &node.kind {
        NodeKind::Directory => {
            let header = owned_header(EntryType::Directory, mode, node.mtime, 0)?;
            append_raw(builder, header, &format!("{name}/"), None, io::empty())
        }
        NodeKind::File => {
            let file = fs::File::open(&node.path).map_err(Error::at(&node.path))?;
            let header = owned_header(EntryType::Regular, mode, node.mtime, node.size)?;
            append_raw(builder, header, name, None, file)
        }
        NodeKind::Symlink(target) => {
            let header = owned_header(EntryType::Symlink, 0o777, node.mtime, 0)?;
            let target = target.to_string_lossy();
            append_raw(builder, header, name, Some(target.as_bytes()), io::empty())
        }
    }
}

/// Builds the data payload from an extracted tree, skipping the top-level
/// control directory.
pub fn build_data(root: &Path, topology: Topology, alias: &Alias) -> Result<Vec<u8>> {
    let mut nodes = Vec::new();
    walk(root, root, Some(CONTROL_DIR), &mut nodes)?;

    let mut builder = Builder::new(Vec::new());
    let prefix = match topology {
        Topology::Root => {
            let header = owned_header(EntryType::Directory, 0o700, now(), 0)?;
            append_raw(&mut builder, header, "./", None, io::empty())?;
            "./"
        }
        Topology::Rootless => "",
    };

    for node in &nodes {
        let name = format!("{prefix}{}", node.relative);
        let mode = match node.kind {
            NodeKind::Directory => 0o755,
            _ => FileRole::classify(&name, alias).mode(node.mode),
        };
        tracing::trace!("data: {} ({:o})", name, mode);
        append_node(&mut builder, node, &name, mode)?;
    }

    tracing::debug!("Built data payload with {} entries ({} layout)", nodes.len(), topology);
    Ok(builder.into_inner()?)
}

/// Builds the control payload from the contents of `dir` with bare names.
pub fn build_control(dir: &Path) -> Result<Vec<u8>> {
    let mut nodes = Vec::new();
    walk(dir, dir, None, &mut nodes)?;

    let mut builder = Builder::new(Vec::new());
    for node in &nodes {
        let mode = match node.kind {
            NodeKind::Directory => 0o755,
            _ => node.mode,
        };
        append_node(&mut builder, node, &node.relative, mode)?;
    }
    Ok(builder.into_inner()?)
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
