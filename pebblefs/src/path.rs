//! Path resolution.
//!
//! Paths are slash-separated and immutable; resolution walks component by
//! component from either the root directory (leading `/`) or the caller's
//! current directory. `.` and `..` resolve through the per-process
//! [`DirContext`], which the syscall layer owns and passes in explicitly.

use std::sync::Arc;

use pebble_fs_types::{ROOT_DIR_SECTOR, SectorNo};

use crate::{
    dir::Dir,
    error::Error,
    fs::FsInner,
    inode::{self, InodeHandle},
};

/// A process's resolution state: its current directory and the directory it
/// was in before the last `chdir`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirContext {
    pub cwd: SectorNo,
    pub parent: SectorNo,
}

impl DirContext {
    /// A fresh context sitting in the root directory.
    #[must_use]
    pub fn rooted() -> Self {
        Self {
            cwd: ROOT_DIR_SECTOR,
            parent: ROOT_DIR_SECTOR,
        }
    }
}

impl Default for DirContext {
    fn default() -> Self {
        Self::rooted()
    }
}

/// Splits a path into its non-empty components.
///
/// `"a/bb/c"` yields `a`, `bb`, `c`; leading, trailing, and repeated
/// slashes are skipped, so `"///a//bb/"` yields `a`, `bb` and `"///"`
/// yields nothing.
fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Opens the directory resolution starts from.
fn start(fs: &Arc<FsInner>, ctx: &DirContext, path: &str) -> Result<Dir, Error> {
    let sector = if path.starts_with('/') {
        ROOT_DIR_SECTOR
    } else {
        ctx.cwd
    };
    Dir::from_handle(inode::open(fs, sector))
}

/// Steps from `dir` through one path component.
fn advance(fs: &Arc<FsInner>, ctx: &DirContext, dir: &Dir, component: &str) -> Result<Dir, Error> {
    let sector = match component {
        "." => ctx.cwd,
        ".." => ctx.parent,
        name => dir.lookup(name).ok_or(Error::NotFound)?,
    };
    Dir::from_handle(inode::open(fs, sector))
}

/// Resolves the whole of `path` to a directory (for `chdir`, `readdir`).
pub(crate) fn resolve_all(fs: &Arc<FsInner>, ctx: &DirContext, path: &str) -> Result<Dir, Error> {
    let mut dir = start(fs, ctx, path)?;
    for component in components(path) {
        dir = advance(fs, ctx, &dir, component)?;
    }
    Ok(dir)
}

/// Resolves `path` to its parent directory and final component (for
/// `create`, `remove`). Fails on paths with no final component, such as `/`.
pub(crate) fn resolve_parent<'p>(
    fs: &Arc<FsInner>,
    ctx: &DirContext,
    path: &'p str,
) -> Result<(Dir, &'p str), Error> {
    let mut dir = start(fs, ctx, path)?;
    let mut comps = components(path).peekable();
    let leaf = loop {
        let Some(component) = comps.next() else {
            return Err(Error::BadPath);
        };
        if comps.peek().is_none() {
            break component;
        }
        dir = advance(fs, ctx, &dir, component)?;
    };
    Ok((dir, leaf))
}

/// Resolves the whole of `path` to an open inode of any kind (for `open`).
pub(crate) fn resolve_open(
    fs: &Arc<FsInner>,
    ctx: &DirContext,
    path: &str,
) -> Result<InodeHandle, Error> {
    if components(path).next().is_none() {
        // `/` or all slashes: the starting directory itself.
        return Ok(start(fs, ctx, path)?.into_handle());
    }
    let (dir, leaf) = resolve_parent(fs, ctx, path)?;
    let sector = match leaf {
        "." => ctx.cwd,
        ".." => ctx.parent,
        name => dir.lookup(name).ok_or(Error::NotFound)?,
    };
    Ok(inode::open(fs, sector))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(path: &str) -> Vec<&str> {
        components(path).collect()
    }

    #[test]
    fn components_skip_empty_runs() {
        assert_eq!(split("a/bb/c"), ["a", "bb", "c"]);
        assert_eq!(split("///a//bb"), ["a", "bb"]);
        assert_eq!(split("a/"), ["a"]);
        assert_eq!(split("/"), Vec::<&str>::new());
        assert_eq!(split(""), Vec::<&str>::new());
        assert_eq!(split("///"), Vec::<&str>::new());
    }

    #[test]
    fn dot_components_survive_splitting() {
        assert_eq!(split("./a/.."), [".", "a", ".."]);
    }
}
