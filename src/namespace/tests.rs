use super::*;
use crate::{cleanup::CleanupStack, spec::SpecBuilder};
use std::{
    fs,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
};
use tokio::runtime::Runtime;

/// Pins namespaces as plain files, failing on request
struct FilePinner {
    root: PathBuf,
    fail_kind: Option<NamespaceKind>,
    unpin_delay: Option<Duration>,
    unpinned: AtomicUsize,
}

impl FilePinner {
    fn new(root: &Path, fail_kind: Option<NamespaceKind>) -> Arc<Self> {
        Arc::new(FilePinner {
            root: root.to_path_buf(),
            fail_kind,
            unpin_delay: None,
            unpinned: AtomicUsize::new(0),
        })
    }

    fn slow_unpin(root: &Path, delay: Duration) -> Arc<Self> {
        Arc::new(FilePinner {
            root: root.to_path_buf(),
            fail_kind: None,
            unpin_delay: Some(delay),
            unpinned: AtomicUsize::new(0),
        })
    }
}

impl NamespacePinner for FilePinner {
    fn pin(&self, kind: NamespaceKind, name: &str) -> Result<PathBuf, NamespaceError> {
        if self.fail_kind == Some(kind) {
            return Err(NamespaceError::Create {
                kind,
                source: nix::errno::Errno::EPERM,
            });
        }
        let dir = self.root.join(kind.proc_name());
        fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        fs::write(&path, "")?;
        Ok(path)
    }

    fn unpin(&self, _kind: NamespaceKind, path: &Path) -> Result<(), NamespaceError> {
        if let Some(delay) = self.unpin_delay {
            thread::sleep(delay);
        }
        self.unpinned.fetch_add(1, Ordering::SeqCst);
        match fs::remove_file(path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

fn pod_requests() -> PerKind<NamespaceRequest> {
    PerKind {
        network: NamespaceRequest::New,
        ipc: NamespaceRequest::New,
        uts: NamespaceRequest::New,
        user: NamespaceRequest::Host,
        pid: NamespaceRequest::New,
    }
}

#[test]
fn mode_defaults() {
    let options = NamespaceOptions::standard();
    assert!(!options.needs_infra());
    let mut shared_pid = options.clone();
    shared_pid.pid = NamespaceMode::Pod;
    assert!(shared_pid.needs_infra());
    assert_eq!(NamespaceKind::Network.spec_type(), "network");
    assert_eq!(NamespaceKind::Network.proc_name(), "net");
    assert_eq!(
        NamespaceKind::Ipc.proc_path(42),
        PathBuf::from("/proc/42/ns/ipc")
    );
}

#[test]
fn create_and_release() {
    let dir = tempfile::tempdir().unwrap();
    let pinner = FilePinner::new(dir.path(), None);
    let manager = NamespaceManager::new(pinner.clone());
    Runtime::new().unwrap().block_on(async {
        let (result, undo) = manager.new_pod_namespaces("sb1", &pod_requests()).await;
        let set = result.unwrap();
        assert_eq!(undo.len(), 3);
        assert_eq!(manager.live_count(), 3);
        let net = set.network_path().unwrap().to_path_buf();
        assert!(net.exists());
        assert_eq!(manager.owner_of(&net).as_deref(), Some("sb1"));
        assert_eq!(set.pid, Namespace::Owned { path: None });
        assert!(set.user.is_host());

        manager.release_set(&set).await.unwrap();
        assert!(!net.exists());
        assert_eq!(manager.live_count(), 0);
        assert_eq!(pinner.unpinned.load(Ordering::SeqCst), 3);

        // already gone
        manager.release_set(&set).await.unwrap();
        assert_eq!(pinner.unpinned.load(Ordering::SeqCst), 3);
    })
}

#[test]
fn partial_failure_returns_undo() {
    let dir = tempfile::tempdir().unwrap();
    let pinner = FilePinner::new(dir.path(), Some(NamespaceKind::Uts));
    let manager = NamespaceManager::new(pinner.clone());
    Runtime::new().unwrap().block_on(async {
        let (result, undo) = manager.new_pod_namespaces("sb1", &pod_requests()).await;
        assert!(matches!(
            result,
            Err(NamespaceError::Create {
                kind: NamespaceKind::Uts,
                ..
            })
        ));
        assert_eq!(undo.len(), 2);
        assert_eq!(manager.live_count(), 2);

        let mut stack = CleanupStack::new();
        stack.extend(undo);
        assert!(stack.unwind().await.is_empty());
        assert_eq!(manager.live_count(), 0);
        assert_eq!(pinner.unpinned.load(Ordering::SeqCst), 2);
        assert_eq!(fs::read_dir(dir.path().join("net")).unwrap().count(), 0);
    })
}

#[test]
fn joined_namespace_outlives_owner_release() {
    let dir = tempfile::tempdir().unwrap();
    let pinner = FilePinner::new(dir.path(), None);
    let manager = NamespaceManager::new(pinner.clone());
    Runtime::new().unwrap().block_on(async {
        let (owner, _) = manager.new_pod_namespaces("owner", &pod_requests()).await;
        let owner = owner.unwrap();
        let net = owner.network_path().unwrap().to_path_buf();

        let joiner_requests = PerKind {
            network: NamespaceRequest::Join {
                owner: "owner".to_string(),
                path: net.clone(),
            },
            ..Default::default()
        };
        let (joiner, undo) = manager.new_pod_namespaces("joiner", &joiner_requests).await;
        let joiner = joiner.unwrap();
        assert_eq!(undo.len(), 1);
        assert_eq!(manager.joiners(&net), 1);
        assert!(matches!(joiner.network, Namespace::Joined { .. }));

        manager.release_set(&owner).await.unwrap();
        assert!(net.exists());
        assert_eq!(pinner.unpinned.load(Ordering::SeqCst), 2);

        let late = PerKind {
            network: NamespaceRequest::Join {
                owner: "owner".to_string(),
                path: net.clone(),
            },
            ..Default::default()
        };
        let (late, late_undo) = manager.new_pod_namespaces("late", &late).await;
        assert!(matches!(late, Err(NamespaceError::Closed { .. })));
        assert!(late_undo.is_empty());

        manager.release_set(&joiner).await.unwrap();
        assert!(!net.exists());
        assert_eq!(manager.live_count(), 0);
    })
}

#[test]
fn join_while_owner_unpins_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let manager = NamespaceManager::new(FilePinner::slow_unpin(dir.path(), Duration::from_millis(300)));
    Runtime::new().unwrap().block_on(async {
        let (owner, _) = manager.new_pod_namespaces("owner", &pod_requests()).await;
        let net = owner.unwrap().network_path().unwrap().to_path_buf();

        let releasing = {
            let manager = manager.clone();
            let net = net.clone();
            tokio::spawn(async move { manager.release(&net).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let requests = PerKind {
            network: NamespaceRequest::Join {
                owner: "owner".to_string(),
                path: net.clone(),
            },
            ..Default::default()
        };
        let (joined, undo) = manager.new_pod_namespaces("joiner", &requests).await;
        assert!(matches!(joined, Err(NamespaceError::Closed { .. })));
        assert!(undo.is_empty());
        assert_eq!(manager.joiners(&net), 0);

        releasing.await.unwrap().unwrap();
        assert!(!net.exists());
        assert_eq!(manager.owner_of(&net), None);
    })
}

#[test]
fn join_missing_path_fails() {
    let dir = tempfile::tempdir().unwrap();
    let manager = NamespaceManager::new(FilePinner::new(dir.path(), None));
    Runtime::new().unwrap().block_on(async {
        let requests = PerKind {
            ipc: NamespaceRequest::Join {
                owner: "gone".to_string(),
                path: dir.path().join("nothing"),
            },
            ..Default::default()
        };
        let (result, undo) = manager.new_pod_namespaces("sb", &requests).await;
        assert!(result.is_err());
        assert!(undo.is_empty());
    })
}

#[test]
fn container_namespaces_follow_sandbox() {
    let sandbox = NamespaceSet {
        network: Namespace::Owned {
            path: Some("/run/ns/net/sb".into()),
        },
        ipc: Namespace::Owned {
            path: Some("/run/ns/ipc/sb".into()),
        },
        uts: Namespace::Host,
        user: Namespace::Host,
        pid: Namespace::Owned { path: None },
    };
    let mut options = NamespaceOptions::standard();
    options.pid = NamespaceMode::Pod;
    let set = sandbox.for_container("sb", &options, Some(77), None).unwrap();
    assert_eq!(
        set.network,
        Namespace::Joined {
            path: "/run/ns/net/sb".into(),
            owner: "sb".to_string()
        }
    );
    assert_eq!(set.pid.path(), Some(Path::new("/proc/77/ns/pid")));
    assert!(set.uts.is_host());

    options.pid = NamespaceMode::Private;
    let set = sandbox.for_container("sb", &options, Some(77), None).unwrap();
    assert_eq!(set.pid, Namespace::Owned { path: None });

    options.pid = NamespaceMode::Target("other".to_string());
    assert!(matches!(
        sandbox.for_container("sb", &options, Some(77), None),
        Err(NamespaceError::NoTarget { .. })
    ));
    let set = sandbox
        .for_container("sb", &options, Some(77), Some(99))
        .unwrap();
    assert_eq!(set.pid.path(), Some(Path::new("/proc/99/ns/pid")));
}

#[test]
fn applied_to_spec() {
    let set = NamespaceSet {
        network: Namespace::Joined {
            path: "/run/ns/net/sb".into(),
            owner: "sb".to_string(),
        },
        ipc: Namespace::Host,
        uts: Namespace::Host,
        user: Namespace::Host,
        pid: Namespace::Owned { path: None },
    };
    let mut builder = SpecBuilder::new();
    builder.hostname("pod");
    builder.add_namespace(NamespaceKind::Ipc, None);
    set.apply_to_spec(&mut builder);
    let (spec, _) = builder.finalize();
    assert_eq!(spec.hostname, "");
    assert!(spec.namespace("ipc").is_none());
    assert_eq!(
        spec.namespace("network").unwrap().path.as_deref(),
        Some("/run/ns/net/sb")
    );
    assert_eq!(spec.namespace("pid").unwrap().path, None);
}

#[test]
fn restore_registers_owners_then_joins() {
    let dir = tempfile::tempdir().unwrap();
    let manager = NamespaceManager::new(FilePinner::new(dir.path(), None));
    let net = dir.path().join("net-owner");
    fs::write(&net, "").unwrap();
    let owner = NamespaceSet {
        network: Namespace::Owned {
            path: Some(net.clone()),
        },
        ..Default::default()
    };
    let joiner = NamespaceSet {
        network: Namespace::Joined {
            path: net.clone(),
            owner: "owner".to_string(),
        },
        ..Default::default()
    };
    manager.restore_owned("owner", &owner).unwrap();
    manager.restore_joins(&joiner).unwrap();
    assert_eq!(manager.joiners(&net), 1);

    let missing = NamespaceSet {
        ipc: Namespace::Owned {
            path: Some(dir.path().join("gone")),
        },
        ..Default::default()
    };
    assert!(manager.restore_owned("other", &missing).is_err());
}
