use crate::{errors::NamespaceError, namespace::NamespaceKind};
use nix::{
    mount::{mount, umount2, MntFlags, MsFlags},
    sched::unshare,
};
use std::{
    fs, io,
    path::{Path, PathBuf},
    thread,
};

/// Creates namespaces that outlive any process, by pinning them to a path
///
/// Calls may block; the namespace manager runs them on the blocking pool.
pub trait NamespacePinner: Send + Sync + 'static {
    /// Create a new namespace of `kind` and return the path that keeps it
    /// alive
    fn pin(&self, kind: NamespaceKind, name: &str) -> Result<PathBuf, NamespaceError>;

    /// Destroy a namespace made by [pin](Self::pin)
    ///
    /// Unpinning a path that is already gone is not an error.
    fn unpin(&self, kind: NamespaceKind, path: &Path) -> Result<(), NamespaceError>;
}

/// Pins network, IPC, and UTS namespaces with bind mounts
///
/// Each namespace is created by a short-lived thread which unshares it and
/// bind mounts `/proc/thread-self/ns/<kind>` onto a file under
/// `<root>/<kind>/`. These namespace kinds belong to a thread, so the rest of
/// the daemon is unaffected.
#[derive(Clone, Debug)]
pub struct BindMountPinner {
    root: PathBuf,
}

impl BindMountPinner {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        BindMountPinner { root: root.into() }
    }
}

impl NamespacePinner for BindMountPinner {
    fn pin(&self, kind: NamespaceKind, name: &str) -> Result<PathBuf, NamespaceError> {
        if !kind.is_pinnable() {
            return Err(NamespaceError::Unsupported(kind));
        }
        let dir = self.root.join(kind.proc_name());
        fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        pin_file(&path, || {
            let thread_path = path.clone();
            thread::Builder::new()
                .name(format!("pin-{}", kind.proc_name()))
                .spawn(move || -> Result<(), NamespaceError> {
                    unshare(kind.clone_flag())
                        .map_err(|source| NamespaceError::Create { kind, source })?;
                    let source = format!("/proc/thread-self/ns/{}", kind.proc_name());
                    mount(
                        Some(source.as_str()),
                        &thread_path,
                        None::<&str>,
                        MsFlags::MS_BIND,
                        None::<&str>,
                    )
                    .map_err(|source| NamespaceError::Pin {
                        kind,
                        path: thread_path.clone(),
                        source,
                    })
                })?
                .join()
                .unwrap_or_else(|_| Err(NamespaceError::PinThread))
        })?;
        log::debug!("pinned {} namespace at {:?}", kind, path);
        Ok(path)
    }

    fn unpin(&self, kind: NamespaceKind, path: &Path) -> Result<(), NamespaceError> {
        match umount2(path, MntFlags::MNT_DETACH) {
            Ok(()) | Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => {}
            Err(source) => {
                return Err(NamespaceError::Unpin {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
        match fs::remove_file(path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
            _ => {}
        }
        log::debug!("unpinned {} namespace at {:?}", kind, path);
        Ok(())
    }
}

/// Create the pin file at `path` and run `bind` to mount a namespace onto
/// it; the file is removed again if `bind` fails
fn pin_file<F>(path: &Path, bind: F) -> Result<(), NamespaceError>
where
    F: FnOnce() -> Result<(), NamespaceError>,
{
    fs::File::create(path)?;
    bind().map_err(|err| {
        let _ = fs::remove_file(path);
        err
    })
}
