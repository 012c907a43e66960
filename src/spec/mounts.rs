//! Mount resolution, filtering, and ordering

use crate::{
    errors::SpecError,
    request::{MountRequest, Propagation},
    spec::Mount,
};
use std::{
    collections::{HashSet, VecDeque},
    ffi::OsString,
    fs, io,
    path::{Component, Path, PathBuf},
};

/// Symlinks followed while resolving one path before giving up
const MAX_SYMLINKS: usize = 255;

/// Mounts every container gets unless the request overrides them
pub fn default_mounts() -> Vec<Mount> {
    vec![
        Mount::new("/proc", "proc", "proc", &["nosuid", "noexec", "nodev"]),
        Mount::new(
            "/dev",
            "tmpfs",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        ),
        Mount::new(
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
        ),
        Mount::new(
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        ),
        Mount::new(
            "/dev/mqueue",
            "mqueue",
            "mqueue",
            &["nosuid", "noexec", "nodev"],
        ),
        Mount::new("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
        Mount::new(
            "/sys/fs/cgroup",
            "cgroup",
            "cgroup",
            &["nosuid", "noexec", "nodev", "relatime", "ro"],
        ),
    ]
}

/// Lexically clean an absolute container path
///
/// Repeated separators, `.` segments, and trailing separators are removed,
/// `..` segments consume their parent, never going above the root.
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// True if `target` is `base` itself or anything underneath it
pub fn is_sub_directory_of(base: &str, target: &str) -> bool {
    let base = base.trim_end_matches('/');
    let target = target.trim_end_matches('/');
    if base.is_empty() {
        return target.starts_with('/') || target.is_empty();
    }
    target == base
        || (target.starts_with(base) && target.as_bytes().get(base.len()) == Some(&b'/'))
}

/// Number of path segments, used to order mounts parents-first
pub fn mount_depth(destination: &str) -> usize {
    clean_path(destination)
        .split('/')
        .filter(|part| !part.is_empty())
        .count()
}

/// Stable sort by destination depth, so `/data` is applied before
/// `/data/sub` regardless of request order
pub fn sort_by_depth(mounts: &mut [Mount]) {
    mounts.sort_by_key(|mount| mount_depth(&mount.destination));
}

/// Drop default mounts that user mounts replace
///
/// A default is dropped if a user mount has the same destination, or if a
/// user mount covers `/dev` or `/sys` and the default lives underneath.
pub fn filter_default_mounts(defaults: Vec<Mount>, user_destinations: &HashSet<String>) -> Vec<Mount> {
    let covers_dev = user_destinations.contains("/dev");
    let covers_sys = user_destinations.contains("/sys");
    defaults
        .into_iter()
        .filter(|mount| {
            let destination = clean_path(&mount.destination);
            if user_destinations.contains(&destination) {
                log::debug!("default mount {} replaced by request", destination);
                return false;
            }
            if covers_dev && destination.starts_with("/dev/") {
                return false;
            }
            if covers_sys && destination.starts_with("/sys/") {
                return false;
            }
            true
        })
        .collect()
}

/// Check the recursive read-only constraints of one mount
///
/// Runs before anything on the filesystem is touched.
pub fn validate_recursive_read_only(
    mount: &MountRequest,
    rro_supported: bool,
) -> Result<(), SpecError> {
    if !mount.recursive_read_only {
        return Ok(());
    }
    if !mount.readonly {
        return Err(SpecError::RecursiveReadOnlyReadWrite(mount.host_path.clone()));
    }
    if mount.propagation != Propagation::Private {
        return Err(SpecError::RecursiveReadOnlyPropagation {
            host_path: mount.host_path.clone(),
            propagation: mount.propagation.to_string(),
        });
    }
    if !rro_supported {
        return Err(SpecError::RecursiveReadOnlyUnsupported(mount.host_path.clone()));
    }
    Ok(())
}

/// One line of `/proc/self/mountinfo`, reduced to what propagation checks
/// need
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_point: PathBuf,
    /// optional fields like `shared:1 master:2`
    pub optional: String,
}

impl MountInfo {
    pub fn is_shared(&self) -> bool {
        self.optional.split(' ').any(|tag| tag.starts_with("shared:"))
    }

    pub fn is_slave(&self) -> bool {
        self.optional.split(' ').any(|tag| tag.starts_with("master:"))
    }
}

/// Parse mountinfo text; malformed lines are skipped
pub fn parse_mountinfo(text: &str) -> Vec<MountInfo> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(' ').collect();
            let separator = fields.iter().position(|field| *field == "-")?;
            if separator < 6 {
                return None;
            }
            Some(MountInfo {
                mount_point: PathBuf::from(unescape_mountinfo(fields[4])),
                optional: fields[6..separator].join(" "),
            })
        })
        .collect()
}

fn unescape_mountinfo(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

pub fn load_mountinfo() -> io::Result<Vec<MountInfo>> {
    Ok(parse_mountinfo(&fs::read_to_string("/proc/self/mountinfo")?))
}

/// The mount containing `path`: the deepest mount point that is a prefix
pub fn find_mount<'a>(infos: &'a [MountInfo], path: &Path) -> Option<&'a MountInfo> {
    infos
        .iter()
        .filter(|info| path.starts_with(&info.mount_point))
        .max_by_key(|info| info.mount_point.components().count())
}

/// Everything mount resolution needs to know about the host
#[derive(Clone, Debug, Default)]
pub struct MountContext {
    /// container storage root; bind mounts containing it need
    /// host-to-container propagation
    pub storage_root: PathBuf,
    /// host paths are resolved inside this prefix
    pub bind_mount_prefix: Option<PathBuf>,
    /// sources that must exist; they are never auto-created
    pub protected_sources: Vec<PathBuf>,
    pub rro_supported: bool,
    pub idmap_supported: bool,
    /// restoring from a checkpoint; missing sources are left alone
    pub restoring: bool,
    pub mount_infos: Vec<MountInfo>,
}

/// A bind mount after resolving its source on the host
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedMount {
    pub mount: Mount,
    pub volume: Volume,
    /// rootfs propagation this mount requires, if any
    pub root_propagation: Option<&'static str>,
}

/// A mounted host path, for status reporting
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub container_path: String,
    pub host_path: String,
    pub readonly: bool,
    pub recursive_read_only: bool,
    pub propagation: Propagation,
}

/// Resolve a requested bind mount into a runtime mount
///
/// Validation happens first. The host path is then resolved within the bind
/// mount prefix, following symlinks without escaping it. A missing source is
/// created as a directory, unless it is protected (an error) or the
/// container is being restored (left for the runtime to report).
pub fn resolve_bind_mount(request: &MountRequest, ctx: &MountContext) -> Result<ResolvedMount, SpecError> {
    if request.container_path.is_empty() {
        return Err(SpecError::EmptyContainerPath);
    }
    if request.host_path.is_empty() {
        return Err(SpecError::EmptyHostPath(request.container_path.clone()));
    }
    validate_recursive_read_only(request, ctx.rro_supported)?;
    let has_idmap = !request.uid_mappings.is_empty() || !request.gid_mappings.is_empty();
    if has_idmap && !ctx.idmap_supported {
        return Err(SpecError::IdMapUnsupported(request.container_path.clone()));
    }

    let destination = clean_path(&request.container_path);
    let source = match &ctx.bind_mount_prefix {
        Some(prefix) => secure_join(prefix, Path::new(&request.host_path))?,
        None => secure_join(Path::new("/"), Path::new(&request.host_path))?,
    };

    match fs::symlink_metadata(&source) {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            if ctx
                .protected_sources
                .iter()
                .any(|protected| protected == &source || protected == Path::new(&request.host_path))
            {
                return Err(SpecError::ProtectedSourceMissing(source));
            }
            if ctx.restoring {
                log::debug!("restoring, not creating missing mount source {:?}", source);
            } else {
                log::debug!("creating missing mount source {:?}", source);
                fs::create_dir_all(&source).map_err(|err| SpecError::io(&source, err))?;
            }
        }
        Err(err) => return Err(SpecError::io(&source, err)),
    }

    let mut propagation = request.propagation;
    if propagation == Propagation::Private
        && !ctx.storage_root.as_os_str().is_empty()
        && is_sub_directory_of(&request.host_path, &ctx.storage_root.to_string_lossy())
    {
        log::info!(
            "mount {:?} includes the storage root, using host-to-container propagation",
            request.host_path
        );
        propagation = Propagation::HostToContainer;
    }

    let mut options = vec!["rbind".to_string()];
    options.push(if request.readonly { "ro" } else { "rw" }.to_string());
    if request.recursive_read_only {
        options.push("rro".to_string());
    }
    let root_propagation = match propagation {
        Propagation::Private => {
            options.push("rprivate".to_string());
            None
        }
        Propagation::HostToContainer => {
            let info = find_mount(&ctx.mount_infos, &source)
                .ok_or_else(|| SpecError::MountPointMissing(source.clone()))?;
            if !info.is_shared() && !info.is_slave() {
                return Err(SpecError::NotSharedOrSlave {
                    path: source.clone(),
                    mount_point: info.mount_point.clone(),
                });
            }
            options.push("rslave".to_string());
            Some("rslave")
        }
        Propagation::Bidirectional => {
            let info = find_mount(&ctx.mount_infos, &source)
                .ok_or_else(|| SpecError::MountPointMissing(source.clone()))?;
            if !info.is_shared() {
                return Err(SpecError::NotShared {
                    path: source.clone(),
                    mount_point: info.mount_point.clone(),
                });
            }
            options.push("rshared".to_string());
            Some("rshared")
        }
    };

    let source_text = source.to_string_lossy().into_owned();
    Ok(ResolvedMount {
        mount: Mount {
            destination: destination.clone(),
            kind: "bind".to_string(),
            source: source_text.clone(),
            options,
            uid_mappings: request.uid_mappings.clone(),
            gid_mappings: request.gid_mappings.clone(),
        },
        volume: Volume {
            container_path: destination,
            host_path: source_text,
            readonly: request.readonly,
            recursive_read_only: request.recursive_read_only,
            propagation,
        },
        root_propagation,
    })
}

/// Join `path` onto `root`, resolving symlinks as if `root` were `/`
///
/// The result never leaves `root`: `..` stops at the root and absolute
/// symlink targets restart from it. Components that don't exist yet are
/// appended as they are.
pub fn secure_join(root: &Path, path: &Path) -> Result<PathBuf, SpecError> {
    let mut pending: VecDeque<OsString> = path_parts(path).into();
    let mut resolved = PathBuf::new();
    let mut links = 0;

    while let Some(part) = pending.pop_front() {
        if part == ".." {
            resolved.pop();
            continue;
        }
        let candidate = resolved.join(&part);
        let full = root.join(&candidate);
        match fs::symlink_metadata(&full) {
            Ok(meta) if meta.file_type().is_symlink() => {
                links += 1;
                if links > MAX_SYMLINKS {
                    return Err(SpecError::SymlinkLoop(path.to_path_buf()));
                }
                let target = fs::read_link(&full).map_err(|err| SpecError::io(&full, err))?;
                if target.is_absolute() {
                    resolved = PathBuf::new();
                }
                for target_part in path_parts(&target).into_iter().rev() {
                    pending.push_front(target_part);
                }
            }
            Ok(_) => resolved = candidate,
            Err(err) if err.kind() == io::ErrorKind::NotFound => resolved = candidate,
            Err(err) => return Err(SpecError::io(&full, err)),
        }
    }
    Ok(root.join(resolved))
}

fn path_parts(path: &Path) -> Vec<OsString> {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            _ => None,
        })
        .collect()
}
