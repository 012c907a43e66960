use crate::{
    adapters::{AppArmorPolicy, SeccompPolicy, SelinuxLabels, SelinuxPolicy},
    errors::AdapterError,
    request::{SecurityProfile, SelinuxOptions},
};
use std::{fs, path::PathBuf};

/// Seccomp profiles read from JSON files
///
/// `runtime/default` uses the configured default profile, or none if there
/// isn't one. Localhost profiles are paths, relative ones resolved against
/// `profile_root`.
#[derive(Clone, Debug, Default)]
pub struct DefaultSeccomp {
    pub default_profile: Option<PathBuf>,
    pub profile_root: PathBuf,
}

impl DefaultSeccomp {
    fn load(&self, path: &PathBuf) -> Result<serde_json::Value, AdapterError> {
        let path = if path.is_absolute() {
            path.clone()
        } else {
            self.profile_root.join(path)
        };
        let data = fs::read(&path).map_err(|err| {
            AdapterError::Policy(format!("reading seccomp profile {:?}: {}", path, err))
        })?;
        serde_json::from_slice(&data).map_err(|err| {
            AdapterError::Policy(format!("parsing seccomp profile {:?}: {}", path, err))
        })
    }
}

impl SeccompPolicy for DefaultSeccomp {
    fn resolve(
        &self,
        profile: &SecurityProfile,
        privileged: bool,
    ) -> Result<Option<serde_json::Value>, AdapterError> {
        match profile {
            SecurityProfile::Unconfined => Ok(None),
            SecurityProfile::RuntimeDefault if privileged => Ok(None),
            SecurityProfile::RuntimeDefault => match &self.default_profile {
                Some(path) => self.load(path).map(Some),
                None => Ok(None),
            },
            SecurityProfile::Localhost(path) => self.load(&PathBuf::from(path)).map(Some),
        }
    }
}

/// AppArmor profiles by name
#[derive(Clone, Debug)]
pub struct DefaultAppArmor {
    pub default_profile: String,
}

impl Default for DefaultAppArmor {
    fn default() -> Self {
        DefaultAppArmor {
            default_profile: "podvisor-default".to_string(),
        }
    }
}

impl AppArmorPolicy for DefaultAppArmor {
    fn resolve(&self, profile: &SecurityProfile, privileged: bool) -> Result<Option<String>, AdapterError> {
        match profile {
            SecurityProfile::Unconfined => Ok(None),
            SecurityProfile::RuntimeDefault if privileged => Ok(None),
            SecurityProfile::RuntimeDefault if self.default_profile.is_empty() => Ok(None),
            SecurityProfile::RuntimeDefault => Ok(Some(self.default_profile.clone())),
            SecurityProfile::Localhost(name) if name.is_empty() => Err(AdapterError::Policy(
                "empty localhost AppArmor profile name".to_string(),
            )),
            SecurityProfile::Localhost(name) => Ok(Some(name.clone())),
        }
    }
}

/// SELinux labels taken from request options as given
#[derive(Clone, Copy, Debug, Default)]
pub struct StaticSelinux;

impl SelinuxPolicy for StaticSelinux {
    fn labels(&self, options: Option<&SelinuxOptions>, privileged: bool) -> Result<SelinuxLabels, AdapterError> {
        match options {
            Some(_) if privileged => Ok(SelinuxLabels::default()),
            None => Ok(SelinuxLabels::default()),
            Some(options) => {
                if options.kind.is_empty() {
                    return Err(AdapterError::Policy(format!(
                        "SELinux options {:?} have no type",
                        options
                    )));
                }
                Ok(SelinuxLabels {
                    process: Some(options.label()),
                    mount: Some(format!(
                        "system_u:object_r:container_file_t:{}",
                        options.level
                    )),
                })
            }
        }
    }
}
