use crate::{
    adapters::{ProcessState, ProcessStatus, RuntimeAdapter},
    errors::AdapterError,
};
use async_trait::async_trait;
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::{process::Command, time};

/// Drives a `runc`-compatible command line runtime
#[derive(Clone, Debug)]
pub struct OciRuntime {
    binary: PathBuf,
    state_root: Option<PathBuf>,
    poll_interval: Duration,
}

impl OciRuntime {
    pub fn new<P: Into<PathBuf>>(binary: P) -> Self {
        OciRuntime {
            binary: binary.into(),
            state_root: None,
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Keep the runtime's own state under this directory (`--root`)
    pub fn state_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.state_root = Some(root.into());
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        if let Some(root) = &self.state_root {
            command.arg("--root").arg(root);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>, AdapterError> {
        let mut command = self.command();
        command.args(args);
        log::debug!("runtime: {:?} {}", self.binary, args.join(" "));
        let output = command.output().await?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(AdapterError::CommandFailed {
                command: format!("{} {}", self.binary.display(), args.join(" ")),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    /// Run a teardown command, treating an unknown container as done
    async fn run_teardown(&self, args: &[&str]) -> Result<(), AdapterError> {
        match self.run(args).await {
            Ok(_) => Ok(()),
            Err(err) if is_missing(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn wait_stopped(&self, id: &str, timeout: Duration) -> Result<bool, AdapterError> {
        let deadline = time::Instant::now() + timeout;
        loop {
            match self.state(id).await? {
                None => return Ok(true),
                Some(state) if state.status == ProcessStatus::Stopped => return Ok(true),
                Some(_) => {}
            }
            if time::Instant::now() >= deadline {
                return Ok(false);
            }
            time::sleep(self.poll_interval).await;
        }
    }
}

fn is_missing(err: &AdapterError) -> bool {
    match err {
        AdapterError::CommandFailed { stderr, .. } => {
            let stderr = stderr.to_ascii_lowercase();
            stderr.contains("does not exist") || stderr.contains("not found")
        }
        _ => false,
    }
}

#[derive(Deserialize)]
struct StateOutput {
    status: String,
    #[serde(default)]
    pid: u32,
}

fn parse_state(output: &[u8]) -> Result<ProcessState, AdapterError> {
    let raw: StateOutput = serde_json::from_slice(output)?;
    let status = match raw.status.as_str() {
        "creating" => ProcessStatus::Creating,
        "created" => ProcessStatus::Created,
        "running" => ProcessStatus::Running,
        "paused" => ProcessStatus::Paused,
        "stopped" => ProcessStatus::Stopped,
        other => {
            return Err(AdapterError::Runtime(format!(
                "unknown process status {:?}",
                other
            )))
        }
    };
    Ok(ProcessState {
        status,
        pid: if raw.pid == 0 { None } else { Some(raw.pid) },
    })
}

#[async_trait]
impl RuntimeAdapter for OciRuntime {
    async fn create_process(&self, id: &str, bundle: &Path) -> Result<u32, AdapterError> {
        let pid_file = bundle.join("pid");
        let bundle_arg = bundle.to_string_lossy().into_owned();
        let pid_arg = pid_file.to_string_lossy().into_owned();
        self.run(&[
            "create",
            "--bundle",
            bundle_arg.as_str(),
            "--pid-file",
            pid_arg.as_str(),
            id,
        ])
        .await?;
        let pid = tokio::fs::read_to_string(&pid_file).await?;
        pid.trim()
            .parse()
            .map_err(|_| AdapterError::Runtime(format!("bad pid file contents {:?}", pid)))
    }

    async fn start(&self, id: &str) -> Result<(), AdapterError> {
        self.run(&["start", id]).await?;
        Ok(())
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), AdapterError> {
        match self.state(id).await? {
            None => return Ok(()),
            Some(state) if state.status == ProcessStatus::Stopped => return Ok(()),
            Some(_) => {}
        }
        self.run_teardown(&["kill", id, "TERM"]).await?;
        if self.wait_stopped(id, timeout).await? {
            return Ok(());
        }
        log::info!("{} did not stop within {:?}, killing", id, timeout);
        self.run_teardown(&["kill", id, "KILL"]).await?;
        if self.wait_stopped(id, Duration::from_secs(10)).await? {
            Ok(())
        } else {
            Err(AdapterError::Runtime(format!("{} survived SIGKILL", id)))
        }
    }

    async fn delete(&self, id: &str) -> Result<(), AdapterError> {
        self.run_teardown(&["delete", "--force", id]).await
    }

    async fn state(&self, id: &str) -> Result<Option<ProcessState>, AdapterError> {
        match self.run(&["state", id]).await {
            Ok(output) => parse_state(&output).map(Some),
            Err(err) if is_missing(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
