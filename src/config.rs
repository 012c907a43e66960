//! Daemon configuration

use crate::{
    errors::ConfigError,
    spec::{
        volumes::{ImageVolumeMode, SecretMount},
        Rlimit, SpecDefaults,
    },
};
use regex::Regex;
use std::{collections::BTreeMap, path::Path, path::PathBuf, time::Duration};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// persistent storage for rootfs and template specs
    pub root: PathBuf,
    /// runtime state: bundles and running spec copies
    pub run_root: PathBuf,
    /// pinned namespaces are bind mounted under here
    pub namespaces_dir: PathBuf,
    /// bind mounts containing this path get host-to-container propagation
    pub storage_root_for_propagation: PathBuf,
    pub bind_mount_prefix: Option<PathBuf>,
    /// bind mount sources that must already exist
    pub absent_mount_sources_to_reject: Vec<PathBuf>,
    pub default_capabilities: Vec<String>,
    pub default_env: Vec<String>,
    /// `name=soft:hard`
    pub default_ulimits: Vec<String>,
    pub default_sysctls: BTreeMap<String, String>,
    /// `host_path:container_path`
    pub secret_mounts: Vec<String>,
    pub image_volumes: ImageVolumeMode,
    /// skip the infra process when no container needs it
    pub drop_infra: bool,
    /// the runtime isolates with a VM, which always needs an infra process
    pub vm_isolated_runtime: bool,
    pub rro_supported: bool,
    pub idmap_supported: bool,
    pub pause_command: Vec<String>,
    pub pause_image: String,
    pub runtime_path: PathBuf,
    pub cni_plugin: Option<PathBuf>,
    pub cni_config: Option<PathBuf>,
    pub stop_workers: usize,
    pub in_flight_wait_secs: u64,
    pub infra_stop_timeout_secs: u64,
    pub abandoned_after_secs: u64,
    pub seccomp_default_profile: Option<PathBuf>,
    pub apparmor_default_profile: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            root: PathBuf::from("/var/lib/podvisor"),
            run_root: PathBuf::from("/run/podvisor"),
            namespaces_dir: PathBuf::from("/run/podvisor/ns"),
            storage_root_for_propagation: PathBuf::from("/var/lib/podvisor"),
            bind_mount_prefix: None,
            absent_mount_sources_to_reject: vec![PathBuf::from("/etc/hostname")],
            default_capabilities: [
                "CAP_CHOWN",
                "CAP_DAC_OVERRIDE",
                "CAP_FSETID",
                "CAP_FOWNER",
                "CAP_SETGID",
                "CAP_SETUID",
                "CAP_SETPCAP",
                "CAP_NET_BIND_SERVICE",
                "CAP_KILL",
            ]
            .iter()
            .map(|cap| cap.to_string())
            .collect(),
            default_env: vec![
                "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            ],
            default_ulimits: Vec::new(),
            default_sysctls: BTreeMap::new(),
            secret_mounts: Vec::new(),
            image_volumes: ImageVolumeMode::Mkdir,
            drop_infra: true,
            vm_isolated_runtime: false,
            rro_supported: false,
            idmap_supported: false,
            pause_command: vec!["/pause".to_string()],
            pause_image: "registry.k8s.io/pause:3.9".to_string(),
            runtime_path: PathBuf::from("runc"),
            cni_plugin: None,
            cni_config: None,
            stop_workers: 128,
            in_flight_wait_secs: 240,
            infra_stop_timeout_secs: 10,
            abandoned_after_secs: 600,
            seccomp_default_profile: None,
            apparmor_default_profile: "podvisor-default".to_string(),
        }
    }
}

impl ServerConfig {
    /// Read a JSON config file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)?;
        let config: ServerConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rlimits()?;
        self.secrets()?;
        Ok(())
    }

    pub fn rlimits(&self) -> Result<Vec<Rlimit>, ConfigError> {
        self.default_ulimits.iter().map(|s| parse_ulimit(s)).collect()
    }

    pub fn secrets(&self) -> Result<Vec<SecretMount>, ConfigError> {
        self.secret_mounts
            .iter()
            .map(|s| {
                s.parse()
                    .map_err(|_| ConfigError::InvalidSecretMount(s.clone()))
            })
            .collect()
    }

    pub fn spec_defaults(&self) -> Result<SpecDefaults, ConfigError> {
        Ok(SpecDefaults {
            env: self.default_env.clone(),
            rlimits: self.rlimits()?,
            capabilities: self.default_capabilities.clone(),
            sysctls: self.default_sysctls.clone(),
        })
    }

    pub fn in_flight_wait(&self) -> Duration {
        Duration::from_secs(self.in_flight_wait_secs)
    }

    pub fn infra_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.infra_stop_timeout_secs)
    }

    pub fn abandoned_after(&self) -> Duration {
        Duration::from_secs(self.abandoned_after_secs)
    }
}

/// Parse `nofile=1024:4096` into an rlimit
pub fn parse_ulimit(s: &str) -> Result<Rlimit, ConfigError> {
    lazy_static! {
        static ref RE: Regex = Regex::new(r"^([a-z_]+)=(-?[0-9]+):(-?[0-9]+)$").unwrap();
    }
    let invalid = || ConfigError::InvalidUlimit(s.to_string());
    let captures = RE.captures(s).ok_or_else(invalid)?;
    let limit = |index: usize| -> Result<u64, ConfigError> {
        match &captures[index] {
            "-1" => Ok(u64::MAX),
            number => number.parse().map_err(|_| invalid()),
        }
    };
    let soft = limit(2)?;
    let hard = limit(3)?;
    if soft > hard {
        return Err(invalid());
    }
    Ok(Rlimit {
        kind: format!("RLIMIT_{}", captures[1].to_ascii_uppercase()),
        hard,
        soft,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulimits() {
        let limit = parse_ulimit("nofile=1024:4096").unwrap();
        assert_eq!(limit.kind, "RLIMIT_NOFILE");
        assert_eq!((limit.soft, limit.hard), (1024, 4096));
        assert_eq!(parse_ulimit("core=-1:-1").unwrap().hard, u64::MAX);
        assert!(parse_ulimit("nofile=4096:1024").is_err());
        assert!(parse_ulimit("nofile:1024").is_err());
        assert!(parse_ulimit("NOFILE=1:2").is_err());
    }

    #[test]
    fn validation() {
        let mut config = ServerConfig::default();
        assert!(config.validate().is_ok());
        config.secret_mounts = vec!["/etc/pki".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSecretMount(_))
        ));
        config.secret_mounts.clear();
        config.default_ulimits = vec!["bogus".to_string()];
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUlimit(_))));
    }

    #[test]
    fn load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("podvisor.json");
        std::fs::write(
            &path,
            r#"{"root": "/srv/pv", "stop_workers": 4, "image_volumes": "bind",
                "default_ulimits": ["nproc=10:20"]}"#,
        )
        .unwrap();
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/pv"));
        assert_eq!(config.stop_workers, 4);
        assert_eq!(config.image_volumes, ImageVolumeMode::Bind);
        assert_eq!(config.in_flight_wait_secs, 240);
        let defaults = config.spec_defaults().unwrap();
        assert_eq!(defaults.rlimits[0].kind, "RLIMIT_NPROC");
        assert!(ServerConfig::load(&dir.path().join("missing.json")).is_err());
    }
}
