use crate::{
    adapters::{NetworkAdapter, NetworkResult},
    errors::AdapterError,
};
use async_trait::async_trait;
use std::{
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::{io::AsyncWriteExt, process::Command};

/// Runs a CNI plugin binary directly
///
/// The network configuration file is handed to the plugin on stdin, with
/// `CNI_COMMAND` set to `ADD` or `DEL`.
#[derive(Clone, Debug)]
pub struct CniNetwork {
    plugin: PathBuf,
    config: PathBuf,
    plugin_dirs: Vec<PathBuf>,
    interface: String,
}

impl CniNetwork {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(plugin: P, config: Q) -> Self {
        let plugin = plugin.into();
        let plugin_dirs = plugin.parent().map(Path::to_path_buf).into_iter().collect();
        CniNetwork {
            plugin,
            config: config.into(),
            plugin_dirs,
            interface: "eth0".to_string(),
        }
    }

    pub fn interface(mut self, name: &str) -> Self {
        self.interface = name.to_string();
        self
    }

    async fn invoke(&self, command: &str, sandbox_id: &str, netns: &Path) -> Result<Vec<u8>, AdapterError> {
        let config = tokio::fs::read(&self.config).await?;
        let cni_path = std::env::join_paths(&self.plugin_dirs)
            .map_err(|err| AdapterError::Network(err.to_string()))?;
        let mut child = Command::new(&self.plugin)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", sandbox_id)
            .env("CNI_NETNS", netns)
            .env("CNI_IFNAME", &self.interface)
            .env("CNI_PATH", cni_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&config).await?;
        }
        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(AdapterError::CommandFailed {
                command: format!("{} {}", self.plugin.display(), command),
                status: output.status,
                stderr: format!(
                    "{}{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                ),
            })
        }
    }
}

/// Addresses from a CNI result, without prefix lengths
pub fn parse_ips(result: &serde_json::Value) -> Vec<String> {
    result
        .get("ips")
        .and_then(|ips| ips.as_array())
        .map(|ips| {
            ips.iter()
                .filter_map(|ip| ip.get("address").and_then(|a| a.as_str()))
                .map(|address| address.split('/').next().unwrap_or(address).to_string())
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl NetworkAdapter for CniNetwork {
    async fn attach(&self, sandbox_id: &str, netns: &Path) -> Result<NetworkResult, AdapterError> {
        let stdout = self.invoke("ADD", sandbox_id, netns).await?;
        let raw: serde_json::Value = serde_json::from_slice(&stdout)?;
        let ips = parse_ips(&raw);
        log::info!("sandbox {} attached to network with {:?}", sandbox_id, ips);
        Ok(NetworkResult { ips, raw })
    }

    async fn detach(&self, sandbox_id: &str, netns: &Path) -> Result<(), AdapterError> {
        self.invoke("DEL", sandbox_id, netns).await?;
        log::debug!("sandbox {} detached from network", sandbox_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt};
    use tokio::runtime::Runtime;

    #[test]
    fn ips_from_result() {
        let result = serde_json::json!({
            "cniVersion": "0.4.0",
            "ips": [
                {"version": "4", "address": "10.88.0.5/16"},
                {"version": "6", "address": "fd00::5/64"}
            ]
        });
        assert_eq!(parse_ips(&result), vec!["10.88.0.5", "fd00::5"]);
        assert!(parse_ips(&serde_json::json!({})).is_empty());
    }

    #[test]
    fn plugin_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = dir.path().join("fake-cni");
        fs::write(
            &plugin,
            "#!/bin/sh\ncat > \"$(dirname \"$0\")/stdin-$CNI_COMMAND\"\n\
             if [ \"$CNI_COMMAND\" = ADD ]; then echo '{\"ips\": [{\"address\": \"10.0.0.2/24\"}]}'; fi\n",
        )
        .unwrap();
        fs::set_permissions(&plugin, fs::Permissions::from_mode(0o755)).unwrap();
        let config = dir.path().join("net.conf");
        fs::write(&config, r#"{"name": "test"}"#).unwrap();

        let network = CniNetwork::new(&plugin, &config);
        Runtime::new().unwrap().block_on(async {
            let result = network.attach("sb1", Path::new("/run/netns/sb1")).await.unwrap();
            assert_eq!(result.ips, vec!["10.0.0.2"]);
            network.detach("sb1", Path::new("/run/netns/sb1")).await.unwrap();
        });
        assert_eq!(
            fs::read_to_string(dir.path().join("stdin-ADD")).unwrap(),
            r#"{"name": "test"}"#
        );
        assert!(dir.path().join("stdin-DEL").exists());
    }
}
