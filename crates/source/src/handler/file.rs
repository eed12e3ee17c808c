//! Local filesystem scheme handler.
//!
//! Serves `file:` URIs. Metadata and hashing go through the extractor and
//! [`Hasher`]; opening hands back a `tokio::fs::File`; watching is backed by
//! `notify`'s recommended (native) watcher.

use crate::capability::Capabilities;
use crate::error::{ErrorKind, Result};
use crate::handler::{OpenedSource, SchemeHandler, WatchEventKind, WatchGuard, WatchHandle, WatchSink};
use crate::hash::{ContentHash, Hasher};
use crate::metadata::{self, Metadata};
use crate::uri::SourceUri;
use async_trait::async_trait;
use notify::event::{EventKind, ModifyKind};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::task::spawn_blocking;
use tracing::instrument;

/// Handler for `file:` URIs. Supports every capability.
///
/// # Examples
///
/// ```no_run
/// use srcwatch_source::{FileHandler, SchemeHandler, SourceUri};
///
/// # async fn example() -> srcwatch_source::error::Result<()> {
/// let handler = FileHandler::default();
/// let uri = SourceUri::parse("file:///etc/hostname")?;
/// let meta = handler.extract_metadata(&uri).await?;
/// println!("{} is {} bytes", meta.name, meta.size);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct FileHandler {
    hasher: Hasher,
}

impl FileHandler {
    pub const SCHEME: &'static str = "file";

    pub fn new(hasher: Hasher) -> Self {
        Self { hasher }
    }
}

#[async_trait]
impl SchemeHandler for FileHandler {
    fn scheme(&self) -> &str {
        Self::SCHEME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    async fn extract_metadata(&self, uri: &SourceUri) -> Result<Metadata> {
        metadata::extract(uri.to_file_path()?).await
    }

    #[instrument(skip_all, fields(uri = %uri))]
    async fn open(&self, uri: &SourceUri) -> Result<OpenedSource> {
        let path = uri.to_file_path()?;
        let file = File::open(&path).await.map_err(|e| ErrorKind::io(&path, e))?;
        let size = file.metadata().await.ok().map(|meta| meta.len());
        Ok(OpenedSource { reader: Box::new(file), size })
    }

    async fn hash(&self, uri: &SourceUri) -> Result<ContentHash> {
        self.hasher.hash_file(uri.to_file_path()?).await
    }

    #[instrument(skip_all, fields(uri = %uri))]
    async fn watch(&self, uri: &SourceUri, sink: WatchSink) -> Result<WatchHandle> {
        let path = uri.to_file_path()?;
        // notify's own error for a missing path doesn't always say which
        // path; stat first so the failure carries it.
        fs::symlink_metadata(&path).await.map_err(|e| ErrorKind::io(&path, e))?;
        let target = path.clone();
        // Creating a native watcher makes blocking syscalls (and on some
        // platforms spawns a thread); keep it off the async workers.
        let guard = spawn_blocking(move || NotifyGuard::establish(target, sink))
            .await
            .map_err(|e| ErrorKind::io(&path, io::Error::other(e)))??;
        tracing::debug!(path = %path.display(), "Established native watch");
        Ok(Box::new(guard))
    }
}

struct NotifyGuard {
    watcher: RecommendedWatcher,
    path: PathBuf,
    watched: Vec<PathBuf>,
}

impl NotifyGuard {
    fn establish(path: PathBuf, sink: WatchSink) -> Result<Self> {
        let scope = Scope::resolve(path.clone()).map_err(|e| ErrorKind::io(&path, e))?;
        let watched = scope.watched.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if let Some(kind) = scope.classify(&event) {
                        tracing::trace!(path = %scope.target.display(), raw = ?event.kind, normalized = %kind, "Watch notification");
                        sink.emit(kind);
                    }
                },
                Err(err) => {
                    tracing::warn!(path = %scope.target.display(), error = %err, "Native watch failed");
                    sink.fail(err.to_string());
                },
            },
            NotifyConfig::default(),
        )
        .map_err(|e| ErrorKind::io(&path, into_io(e)))?;
        for dir in &watched {
            watcher.watch(dir, RecursiveMode::NonRecursive).map_err(|e| ErrorKind::io(dir, into_io(e)))?;
        }
        Ok(Self { watcher, path, watched })
    }
}

impl WatchGuard for NotifyGuard {
    fn close(mut self: Box<Self>) -> Result<()> {
        let mut failure = None;
        for dir in &self.watched {
            match self.watcher.unwatch(dir) {
                Ok(()) => {},
                // The OS already dropped it (e.g. the directory was deleted).
                Err(err) if matches!(err.kind, notify::ErrorKind::WatchNotFound) => {},
                Err(err) => failure = Some(into_io(err)),
            }
        }
        match failure {
            Some(err) => exn::bail!(ErrorKind::io(&self.path, err)),
            None => Ok(()),
        }
    }
}

/// What a watch on one path has to listen to.
///
/// A file is watched through its parent directory rather than by inode:
/// editors save by writing a temporary file and renaming it over the target,
/// which leaves an inode watch attached to the unlinked original. Listening
/// on the directory and filtering by name survives any number of replaces.
/// A symlink also pulls in the directory of the file it points at. A
/// directory is watched directly, and anything happening to its children is
/// a `change` of the directory.
#[derive(Clone, Debug)]
struct Scope {
    target: PathBuf,
    directory: bool,
    /// Every spelling of the target that may show up in an event.
    names: Vec<PathBuf>,
    /// Directories whose own removal or rename takes the target with them.
    parents: Vec<PathBuf>,
    /// Directories registered with the native watcher.
    watched: Vec<PathBuf>,
}

impl Scope {
    fn resolve(target: PathBuf) -> io::Result<Self> {
        let link = std::fs::symlink_metadata(&target)?;
        let followed = std::fs::metadata(&target).ok();
        let mut scope = Self {
            target: target.clone(),
            directory: followed.as_ref().is_some_and(|meta| meta.is_dir()),
            names: vec![target.clone()],
            parents: Vec::new(),
            watched: Vec::new(),
        };
        if scope.directory {
            scope.watched.push(target);
            return Ok(scope);
        }
        scope.add_file(&target)?;
        if link.file_type().is_symlink() && followed.is_some() {
            scope.add_file(&std::fs::canonicalize(&target)?)?;
        }
        Ok(scope)
    }

    fn add_file(&mut self, file: &Path) -> io::Result<()> {
        let (Some(parent), Some(name)) = (file.parent(), file.file_name()) else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory"));
        };
        let parent = if parent.as_os_str().is_empty() { Path::new(".") } else { parent };
        // Some backends (FSEvents) report canonical paths only.
        let canonical = std::fs::canonicalize(parent)?;
        push_unique(&mut self.names, file.to_path_buf());
        push_unique(&mut self.names, canonical.join(name));
        push_unique(&mut self.parents, parent.to_path_buf());
        push_unique(&mut self.parents, canonical.clone());
        push_unique(&mut self.watched, canonical);
        Ok(())
    }

    /// Fold a native notification into `change`/`delete`, or drop it.
    ///
    /// Renames and removals are reported very differently across platforms
    /// (inotify, FSEvents and ReadDirectoryChangesW disagree on whether a
    /// rename is one event or two, and on which path it carries). Rather than
    /// trusting the event shape, any removal or rename touching the target is
    /// resolved by checking whether the target still exists: a
    /// write-then-rename-over save is a `change`, an unlink or move-away is a
    /// `delete`.
    fn classify(&self, event: &Event) -> Option<WatchEventKind> {
        if matches!(event.kind, EventKind::Access(_)) {
            return None;
        }
        let hits_target = event.paths.is_empty() || event.paths.iter().any(|p| self.names.contains(p));
        let hits_parent = event.paths.iter().any(|p| self.parents.contains(p));
        match event.kind {
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) if hits_target || hits_parent => {
                match std::fs::symlink_metadata(&self.target) {
                    Ok(_) => Some(WatchEventKind::Change),
                    Err(_) => Some(WatchEventKind::Delete),
                }
            },
            _ if hits_target || self.directory => Some(WatchEventKind::Change),
            _ => None,
        }
    }
}

fn push_unique(paths: &mut Vec<PathBuf>, path: PathBuf) {
    if !paths.contains(&path) {
        paths.push(path);
    }
}

fn into_io(err: notify::Error) -> io::Error {
    let message = err.to_string();
    match err.kind {
        notify::ErrorKind::Io(io) => io,
        notify::ErrorKind::PathNotFound => io::Error::new(io::ErrorKind::NotFound, message),
        _ => io::Error::other(message),
    }
}
