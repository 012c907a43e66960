use crate::{
    adapters::{
        ArtifactInfo, ImageConfig, ImageInfo, RootfsRequest, StorageAdapter, StorageInfo,
        StoredEntry,
    },
    errors::AdapterError,
};
use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::SystemTime,
};
use tokio::{io::AsyncWriteExt, task};

const ENTRY_FILE: &str = "entry.json";

/// Storage backed by plain directories
///
/// ```text
/// <root>/images/<reference>/config.json   image configuration
/// <root>/images/<reference>/rootfs/       image contents
/// <root>/artifacts/<reference>/           artifact files
/// <root>/containers/<id>/                 persistent dir, rootfs/ inside
/// <run_root>/containers/<id>/             run dir and bundle
/// ```
///
/// A container rootfs is a copy of its image's rootfs. Sandboxes use the
/// infra image if it exists and an empty rootfs otherwise.
#[derive(Clone, Debug)]
pub struct DirectoryStorage {
    root: PathBuf,
    run_root: PathBuf,
}

impl DirectoryStorage {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(root: P, run_root: Q) -> Self {
        DirectoryStorage {
            root: root.into(),
            run_root: run_root.into(),
        }
    }

    fn image_dir(&self, reference: &str) -> Result<PathBuf, AdapterError> {
        let mut path = self.root.clone();
        push_checked_path(&mut path, "images")?;
        push_checked_path(&mut path, &reference_dir_name(reference))?;
        Ok(path)
    }

    fn container_dirs(&self, id: &str) -> Result<(PathBuf, PathBuf), AdapterError> {
        let mut dir = self.root.clone();
        push_checked_path(&mut dir, "containers")?;
        push_checked_path(&mut dir, id)?;
        let mut run_dir = self.run_root.clone();
        push_checked_path(&mut run_dir, "containers")?;
        push_checked_path(&mut run_dir, id)?;
        Ok((dir, run_dir))
    }

    async fn create_entry(
        &self,
        request: &RootfsRequest,
        image_rootfs: Option<PathBuf>,
    ) -> Result<StorageInfo, AdapterError> {
        let (dir, run_dir) = self.container_dirs(&request.id)?;
        if tokio::fs::metadata(dir.join(ENTRY_FILE)).await.is_ok() {
            return Err(AdapterError::Storage(format!(
                "rootfs for {} already exists",
                request.id
            )));
        }
        tokio::fs::create_dir_all(&run_dir).await?;
        let rootfs = dir.join("rootfs");
        match image_rootfs {
            Some(source) => {
                let dest = rootfs.clone();
                task::spawn_blocking(move || copy_tree(&source, &dest)).await??;
            }
            None => tokio::fs::create_dir_all(&rootfs).await?,
        }

        let mount_label = request.selinux.as_ref().map(|options| {
            format!("system_u:object_r:container_file_t:{}", options.level)
        });
        let info = StorageInfo {
            dir: dir.clone(),
            run_dir,
            mount_label,
            process_label: request.selinux.as_ref().map(|options| options.label()),
        };
        let entry = StoredEntry {
            id: request.id.clone(),
            name: request.name.clone(),
            sandbox_id: request.sandbox_id.clone(),
            info: info.clone(),
        };
        write_atomic(&dir, ENTRY_FILE, &serde_json::to_vec_pretty(&entry)?).await?;
        log::debug!("storage created {} at {:?}", request.id, dir);
        Ok(info)
    }
}

#[async_trait]
impl StorageAdapter for DirectoryStorage {
    async fn create_sandbox_rootfs(&self, request: &RootfsRequest) -> Result<StorageInfo, AdapterError> {
        let image_rootfs = self.image_dir(&request.image)?.join("rootfs");
        let source = match tokio::fs::metadata(&image_rootfs).await {
            Ok(meta) if meta.is_dir() => Some(image_rootfs),
            _ => None,
        };
        self.create_entry(request, source).await
    }

    async fn resolve_image(&self, reference: &str) -> Result<ImageInfo, AdapterError> {
        let config_path = self.image_dir(reference)?.join("config.json");
        let data = match tokio::fs::read(&config_path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(AdapterError::ImageNotFound(reference.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        let config: ImageConfig = serde_json::from_slice(&data)?;
        Ok(ImageInfo {
            id: format!("{:x}", Sha256::digest(&data)),
            reference: reference.to_string(),
            config,
        })
    }

    async fn create_container_rootfs(
        &self,
        request: &RootfsRequest,
        image: &ImageInfo,
    ) -> Result<StorageInfo, AdapterError> {
        let image_rootfs = self.image_dir(&image.reference)?.join("rootfs");
        if tokio::fs::metadata(&image_rootfs).await.is_err() {
            return Err(AdapterError::ImageNotFound(image.reference.clone()));
        }
        self.create_entry(request, Some(image_rootfs)).await
    }

    async fn start(&self, id: &str) -> Result<PathBuf, AdapterError> {
        let (dir, _) = self.container_dirs(id)?;
        let rootfs = dir.join("rootfs");
        if tokio::fs::metadata(&rootfs).await.is_err() {
            return Err(AdapterError::Storage(format!("no rootfs for {}", id)));
        }
        Ok(rootfs)
    }

    async fn stop(&self, _id: &str) -> Result<(), AdapterError> {
        // nothing is mounted
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), AdapterError> {
        let (dir, run_dir) = self.container_dirs(id)?;
        for path in vec![run_dir, dir] {
            match tokio::fs::remove_dir_all(&path).await {
                Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
                _ => {}
            }
        }
        log::debug!("storage deleted {}", id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StoredEntry>, AdapterError> {
        let dir = self.root.join("containers");
        let mut entries = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(err.into()),
        };
        while let Some(child) = read_dir.next_entry().await? {
            let path = child.path().join(ENTRY_FILE);
            match tokio::fs::read(&path).await {
                Ok(data) => match serde_json::from_slice::<StoredEntry>(&data) {
                    Ok(entry) => entries.push(entry),
                    Err(err) => log::error!("skipping unreadable storage entry {:?}: {}", path, err),
                },
                Err(err) => log::warn!("skipping storage entry {:?}: {}", path, err),
            }
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn artifact(&self, reference: &str) -> Result<ArtifactInfo, AdapterError> {
        let mut root = self.root.clone();
        push_checked_path(&mut root, "artifacts")?;
        push_checked_path(&mut root, &reference_dir_name(reference))?;
        if tokio::fs::metadata(&root).await.is_err() {
            return Err(AdapterError::ArtifactNotFound(reference.to_string()));
        }
        let walk_root = root.clone();
        let mut paths = task::spawn_blocking(move || list_files(&walk_root)).await??;
        paths.sort();
        Ok(ArtifactInfo {
            reference: reference.to_string(),
            root,
            paths,
        })
    }
}

fn reference_dir_name(reference: &str) -> String {
    reference.replace("/", "_").replace(":", "_").replace("@", "_")
}

fn push_checked_path<'a>(buf: &'a mut PathBuf, path: &str) -> Result<&'a mut PathBuf, AdapterError> {
    lazy_static! {
        static ref RE: Regex = Regex::new(r"^[a-zA-Z0-9]+[a-zA-Z0-9_\.\-]*$").unwrap();
    }
    if RE.is_match(path) {
        buf.push(path);
        Ok(buf)
    } else {
        Err(AdapterError::Storage(format!("bad storage path {:?}", path)))
    }
}

async fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> Result<(), AdapterError> {
    tokio::fs::create_dir_all(dir).await?;
    let ts = match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(duration) => duration.as_millis(),
        Err(_) => 0,
    };
    let temp_path = dir.join(format!(".{}.{}.{}", name, std::process::id(), ts));
    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    std::mem::drop(file);
    tokio::fs::rename(temp_path, dir.join(name)).await?;
    Ok(())
}

/// Regular files and symlinks under `root`, as relative paths
fn list_files(root: &Path) -> io::Result<Vec<String>> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(root) {
                found.push(relative.to_string_lossy().into_owned());
            }
        }
    }
    Ok(found)
}

/// Recursively copy a directory, keeping symlinks as symlinks
pub fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let source = entry.path();
        let dest = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&source, &dest)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&source)?;
            match fs::remove_file(&dest) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
                _ => {}
            }
            std::os::unix::fs::symlink(&target, &dest)?;
        } else {
            fs::copy(&source, &dest)?;
        }
    }
    Ok(())
}
