//! The runtime's private filesystem and the bridge from host directories.
//!
//! Workload sources live on the host. They reach the runtime by mounting the
//! host directory at a staging path, copying the tree into the runtime's own
//! writable area and dropping the staging mount again.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use bytes::Bytes;

use crate::{TRACE_TARGET_SANDBOX, error::FsError};

type FsResult<T> = Result<T, FsError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Filesystem view owned by a runtime instance. Paths are absolute,
/// `/`-separated guest paths.
pub trait VirtualFs: Send {
    /// Expose `host` read-through at `guest`.
    ///
    /// # Errors
    /// Fails if `guest` is already a mount point or `host` is not a directory.
    fn mount(&mut self, host: &Path, guest: &str) -> FsResult<()>;

    /// # Errors
    /// Fails if `guest` is not a mount point.
    fn unmount(&mut self, guest: &str) -> FsResult<()>;

    fn exists(&self, path: &str) -> bool;

    fn is_dir(&self, path: &str) -> bool;

    /// # Errors
    /// Fails if a path component is a file or lies under a mount.
    fn mkdir_all(&mut self, path: &str) -> FsResult<()>;

    /// Entries of a directory, sorted by name.
    ///
    /// # Errors
    /// Fails if `path` is missing or not a directory.
    fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>>;

    /// # Errors
    /// Fails if `path` is missing or a directory.
    fn read_file(&self, path: &str) -> FsResult<Bytes>;

    /// # Errors
    /// Fails if the parent directory is missing, `path` is a directory, or
    /// `path` lies under a mount.
    fn write_file(&mut self, path: &str, data: Bytes) -> FsResult<()>;

    /// Remove an empty directory.
    ///
    /// # Errors
    /// Fails if `path` is missing, not empty, or still mounted.
    fn remove_dir(&mut self, path: &str) -> FsResult<()>;
}

#[derive(Clone, Debug)]
enum Node {
    Dir,
    File(Bytes),
}

/// In-memory filesystem with read-through host mounts.
#[derive(Debug)]
pub struct MemFs {
    nodes: BTreeMap<String, Node>,
    mounts: BTreeMap<String, PathBuf>,
}

impl Default for MemFs {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        Self {
            nodes,
            mounts: BTreeMap::new(),
        }
    }
}

impl MemFs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_mounted(&self, guest: &str) -> bool {
        self.mounts.contains_key(&normalize(guest))
    }

    /// Host path backing `path` if it lies on or under a mount.
    fn host_path(&self, path: &str) -> Option<PathBuf> {
        self.mounts
            .iter()
            .rev()
            .find_map(|(guest, host)| match relative_to(path, guest) {
                Some("") => Some(host.clone()),
                Some(rel) => Some(host.join(rel)),
                None => None,
            })
    }

    fn children(&self, dir: &str) -> impl Iterator<Item = (&str, &Node)> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{dir}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .filter_map(move |(k, v)| {
                let name = &k[dir.len().max(1)..];
                let name = name.strip_prefix('/').unwrap_or(name);
                (!name.is_empty() && !name.contains('/')).then_some((name, v))
            })
    }
}

impl VirtualFs for MemFs {
    fn mount(&mut self, host: &Path, guest: &str) -> FsResult<()> {
        let guest = normalize(guest);
        if self.mounts.contains_key(&guest) {
            return Err(FsError::AlreadyMounted(guest));
        }
        if !std::fs::metadata(host)?.is_dir() {
            return Err(FsError::NotADirectory(host.display().to_string()));
        }
        self.mkdir_all(&guest)?;
        tracing::debug!(
            target: TRACE_TARGET_SANDBOX,
            host = %host.display(),
            %guest,
            "mounted"
        );
        self.mounts.insert(guest, host.to_path_buf());
        Ok(())
    }

    fn unmount(&mut self, guest: &str) -> FsResult<()> {
        let guest = normalize(guest);
        if self.mounts.remove(&guest).is_none() {
            return Err(FsError::NotMounted(guest));
        }
        tracing::debug!(target: TRACE_TARGET_SANDBOX, %guest, "unmounted");
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        let path = normalize(path);
        self.host_path(&path)
            .map_or_else(|| self.nodes.contains_key(&path), |host| host.exists())
    }

    fn is_dir(&self, path: &str) -> bool {
        let path = normalize(path);
        self.host_path(&path).map_or_else(
            || matches!(self.nodes.get(&path), Some(Node::Dir)),
            |host| host.is_dir(),
        )
    }

    fn mkdir_all(&mut self, path: &str) -> FsResult<()> {
        let path = normalize(path);
        let mut current = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current.push('/');
            current.push_str(component);
            if self.host_path(&current).is_some() {
                return Err(FsError::ReadOnly(current));
            }
            match self.nodes.get(&current) {
                Some(Node::Dir) => {}
                Some(Node::File(_)) => return Err(FsError::NotADirectory(current)),
                None => {
                    self.nodes.insert(current.clone(), Node::Dir);
                }
            }
        }
        Ok(())
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let path = normalize(path);
        if let Some(host) = self.host_path(&path) {
            let mut entries = Vec::new();
            for entry in std::fs::read_dir(&host)? {
                let entry = entry?;
                let kind = if entry.file_type()?.is_dir() {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                };
                entries.push(DirEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    kind,
                });
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            return Ok(entries);
        }

        match self.nodes.get(&path) {
            Some(Node::Dir) => Ok(self
                .children(&path)
                .map(|(name, node)| DirEntry {
                    name: name.to_string(),
                    kind: match node {
                        Node::Dir => EntryKind::Dir,
                        Node::File(_) => EntryKind::File,
                    },
                })
                .collect()),
            Some(Node::File(_)) => Err(FsError::NotADirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    fn read_file(&self, path: &str) -> FsResult<Bytes> {
        let path = normalize(path);
        if let Some(host) = self.host_path(&path) {
            if host.is_dir() {
                return Err(FsError::IsADirectory(path));
            }
            return Ok(Bytes::from(std::fs::read(host)?));
        }
        match self.nodes.get(&path) {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Dir) => Err(FsError::IsADirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    fn write_file(&mut self, path: &str, data: Bytes) -> FsResult<()> {
        let path = normalize(path);
        if self.host_path(&path).is_some() {
            return Err(FsError::ReadOnly(path));
        }
        match self.nodes.get(parent(&path)) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => return Err(FsError::NotADirectory(parent(&path).to_string())),
            None => return Err(FsError::NotFound(parent(&path).to_string())),
        }
        if matches!(self.nodes.get(&path), Some(Node::Dir)) {
            return Err(FsError::IsADirectory(path));
        }
        self.nodes.insert(path, Node::File(data));
        Ok(())
    }

    fn remove_dir(&mut self, path: &str) -> FsResult<()> {
        let path = normalize(path);
        if self.host_path(&path).is_some() {
            return Err(FsError::ReadOnly(path));
        }
        match self.nodes.get(&path) {
            Some(Node::Dir) if path == "/" || self.children(&path).next().is_some() => {
                Err(FsError::NotEmpty(path))
            }
            Some(Node::Dir) => {
                self.nodes.remove(&path);
                Ok(())
            }
            Some(Node::File(_)) => Err(FsError::NotADirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }
}

/// Collapse `.`/`..` and duplicate separators into an absolute path.
#[must_use]
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

#[must_use]
pub fn join(dir: &str, name: &str) -> String {
    normalize(&format!("{dir}/{name}"))
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn relative_to<'a>(path: &'a str, base: &str) -> Option<&'a str> {
    if base == "/" {
        return Some(path.trim_start_matches('/'));
    }
    match path.strip_prefix(base)? {
        "" => Some(""),
        rest => rest.strip_prefix('/'),
    }
}

/// Recursively copy every entry under `from` into `to`, returning the number
/// of files copied.
///
/// # Errors
/// Returns the first filesystem error encountered.
pub fn copy_tree(fs: &mut dyn VirtualFs, from: &str, to: &str) -> FsResult<usize> {
    fs.mkdir_all(to)?;
    let mut copied = 0;
    for entry in fs.read_dir(from)? {
        let src = join(from, &entry.name);
        let dst = join(to, &entry.name);
        match entry.kind {
            EntryKind::Dir => copied += copy_tree(fs, &src, &dst)?,
            EntryKind::File => {
                let data = fs.read_file(&src)?;
                fs.write_file(&dst, data)?;
                copied += 1;
            }
        }
    }
    Ok(copied)
}

/// Copy a host directory into the runtime at `dest` through a temporary
/// mount at `staging`.
///
/// The host directory is mounted by its canonical path. The staging mount is
/// always released, even when the copy fails.
///
/// # Errors
/// Returns the first error from resolving, mounting, copying or cleanup.
pub fn bridge_source(
    fs: &mut dyn VirtualFs,
    host_dir: &Path,
    staging: &str,
    dest: &str,
) -> FsResult<usize> {
    let canonical = std::fs::canonicalize(host_dir)?;
    fs.mount(&canonical, staging)?;

    let copied = copy_tree(fs, staging, dest);
    let released = fs.unmount(staging).and_then(|()| fs.remove_dir(staging));

    let copied = copied?;
    released?;
    tracing::info!(
        target: TRACE_TARGET_SANDBOX,
        source = %canonical.display(),
        dest,
        files = copied,
        "workload sources copied"
    );
    Ok(copied)
}

/// Expose a host import directory at `guest` for the lifetime of the runtime.
///
/// # Errors
/// Returns an error if the directory cannot be resolved or mounted.
pub fn mount_imports(fs: &mut dyn VirtualFs, host_dir: &Path, guest: &str) -> FsResult<()> {
    let canonical = std::fs::canonicalize(host_dir)?;
    fs.mount(&canonical, guest)?;
    tracing::warn!(
        target: TRACE_TARGET_SANDBOX,
        host = %canonical.display(),
        guest,
        "import directory mounted; read-only access is not guaranteed by the runtime"
    );
    Ok(())
}
