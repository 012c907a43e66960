//! Secret mounts and image-declared volumes

use crate::{
    adapters::storage::copy_tree,
    errors::SpecError,
    request::Propagation,
    spec::{
        mounts::{clean_path, secure_join, Volume},
        Mount, SpecBuilder,
    },
};
use sha2::{Digest, Sha256};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Host directory whose contents every container gets a private copy of
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMount {
    pub host_path: PathBuf,
    pub container_path: String,
}

impl FromStr for SecretMount {
    type Err = ();

    /// Parses `host_path:container_path`
    fn from_str(s: &str) -> Result<Self, ()> {
        let (host, container) = s.split_once(':').ok_or(())?;
        if host.is_empty() || !container.starts_with('/') {
            return Err(());
        }
        Ok(SecretMount {
            host_path: PathBuf::from(host),
            container_path: container.to_string(),
        })
    }
}

/// What to do with volumes an image declares
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageVolumeMode {
    /// create the directory inside the rootfs
    Mkdir,
    /// bind mount a fresh directory from the container's run dir
    Bind,
    Ignore,
}

impl Default for ImageVolumeMode {
    fn default() -> Self {
        ImageVolumeMode::Mkdir
    }
}

impl fmt::Display for ImageVolumeMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ImageVolumeMode::Mkdir => "mkdir",
            ImageVolumeMode::Bind => "bind",
            ImageVolumeMode::Ignore => "ignore",
        })
    }
}

fn path_key(container_path: &str) -> String {
    let digest = Sha256::digest(container_path.as_bytes());
    digest
        .iter()
        .take(8)
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

/// Copy secrets into `run_dir/secrets` and mount the copies
///
/// Secrets whose destination already has a mount are skipped, as are
/// secrets whose host directory doesn't exist.
pub fn add_secret_mounts(
    builder: &mut SpecBuilder,
    secrets: &[SecretMount],
    run_dir: &Path,
) -> Result<(), SpecError> {
    for secret in secrets {
        if builder.has_mount(&secret.container_path) {
            log::debug!(
                "skipping secret mount at {}, already mounted by request",
                secret.container_path
            );
            continue;
        }
        if !secret.host_path.exists() {
            log::debug!("secret source {:?} does not exist, skipping", secret.host_path);
            continue;
        }
        let copy = run_dir.join("secrets").join(path_key(&secret.container_path));
        copy_tree(&secret.host_path, &copy).map_err(|err| SpecError::io(&secret.host_path, err))?;
        builder.add_mount(Mount::bind(
            &secret.container_path,
            &copy.to_string_lossy(),
            &["rw", "rprivate"],
        ));
    }
    Ok(())
}

/// Handle the volumes declared by a container's image
pub fn add_image_volumes(
    builder: &mut SpecBuilder,
    volumes: &[String],
    mode: ImageVolumeMode,
    rootfs: &Path,
    run_dir: &Path,
) -> Result<(), SpecError> {
    for volume in volumes {
        let destination = clean_path(volume);
        if builder.has_mount(&destination) {
            continue;
        }
        match mode {
            ImageVolumeMode::Ignore => {
                log::debug!("ignoring image volume {}", destination);
            }
            ImageVolumeMode::Mkdir => {
                let path = secure_join(rootfs, Path::new(&destination))?;
                fs::create_dir_all(&path).map_err(|err| SpecError::io(&path, err))?;
            }
            ImageVolumeMode::Bind => {
                let dir = run_dir.join("volumes").join(path_key(&destination));
                fs::create_dir_all(&dir).map_err(|err| SpecError::io(&dir, err))?;
                let source = dir.to_string_lossy().into_owned();
                builder.add_mount(Mount::bind(&destination, &source, &["rw", "rprivate"]));
                builder.add_volume(Volume {
                    container_path: destination.clone(),
                    host_path: source,
                    readonly: false,
                    recursive_read_only: false,
                    propagation: Propagation::Private,
                });
            }
        }
    }
    Ok(())
}
