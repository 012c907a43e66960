mod common;

use common::{container_request, sandbox_request, Harness};
use podvisor::{
    adapters::{ArtifactInfo, ImageConfig, ImageInfo},
    container::ContainerState,
    namespace::{NamespaceMode, NamespaceOptions},
    request::{ArtifactMount, EnvVar, MountRequest},
    spec::{annotations, persist},
    Context, ServerError,
};
use std::{fs, time::Duration};
use tokio::runtime::Runtime;

async fn sandbox(h: &Harness, name: &str) -> String {
    h.server
        .run_sandbox(&Context::background(), &sandbox_request(name))
        .await
        .unwrap()
}

#[test]
fn create_and_start() {
    Runtime::new().unwrap().block_on(async {
        let h = Harness::new();
        let ctx = Context::background();
        let sandbox_id = sandbox(&h, "pod").await;
        let mut request = container_request("app");
        request.env.push(EnvVar {
            key: "MODE".to_string(),
            value: "test".to_string(),
        });
        let id = h.server.create_container(&ctx, &sandbox_id, &request).await.unwrap();

        let status = h.server.container(&id).unwrap();
        assert_eq!(status.state, ContainerState::Created);
        assert!(status.pid.is_some());
        assert_eq!(status.sandbox_id, sandbox_id);
        assert_eq!(status.image_id, "sha256:busybox");
        assert_eq!(h.server.sandbox(&sandbox_id).unwrap().members, vec![id.clone()]);
        assert_eq!(h.server.list_containers(Some(&sandbox_id)).len(), 1);
        assert!(h.server.list_containers(Some("other")).is_empty());

        let spec = persist::load(&h.path("run").join(&id)).unwrap();
        assert_eq!(spec.process.args, vec!["sh"]);
        assert!(spec.process.env.contains(&"PATH=/bin".to_string()));
        assert!(spec.process.env.contains(&"MODE=test".to_string()));
        assert_eq!(spec.hostname, "pod-host");
        assert_eq!(spec.annotation(annotations::SANDBOX_ID), Some(sandbox_id.as_str()));
        assert_eq!(spec.annotation(annotations::IMAGE_NAME), Some("busybox"));
        assert_eq!(spec.annotation(annotations::STOP_SIGNAL), Some("SIGTERM"));
        assert_eq!(spec.annotation("test.hooked"), Some("true"));
        let hostname = spec.mount("/etc/hostname").unwrap();
        assert!(hostname.options.contains(&"rw".to_string()));

        h.server.start_container(&id).await.unwrap();
        assert_eq!(h.server.container(&id).unwrap().state, ContainerState::Running);
        let err = h.server.start_container(&id).await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidState { expected: "created", .. }));

        h.server.stop_container(&id, Duration::from_secs(1)).await.unwrap();
        let status = h.server.container(&id).unwrap();
        assert_eq!(status.state, ContainerState::Stopped);
        assert!(status.finished.is_some());
    })
}

#[test]
fn request_command_overrides_image() {
    Runtime::new().unwrap().block_on(async {
        let h = Harness::new();
        let ctx = Context::background();
        let sandbox_id = sandbox(&h, "pod").await;
        let mut request = container_request("app");
        request.command = vec!["/bin/app".to_string()];
        request.args = vec!["-v".to_string()];
        request.working_dir = "/srv".to_string();
        request.security.readonly_rootfs = true;
        let id = h.server.create_container(&ctx, &sandbox_id, &request).await.unwrap();

        let spec = persist::load(&h.path("run").join(&id)).unwrap();
        assert_eq!(spec.process.args, vec!["/bin/app", "-v"]);
        assert_eq!(spec.process.cwd, "/srv");
        assert!(spec.root.readonly);
        let hostname = spec.mount("/etc/hostname").unwrap();
        assert!(hostname.options.contains(&"ro".to_string()));
    })
}

#[test]
fn missing_command_is_rejected() {
    Runtime::new().unwrap().block_on(async {
        let h = Harness::new();
        h.storage.add_image(ImageInfo {
            id: "sha256:empty".to_string(),
            reference: "empty".to_string(),
            config: ImageConfig::default(),
        });
        let sandbox_id = sandbox(&h, "pod").await;
        let mut request = container_request("app");
        request.image = "empty".to_string();

        let err = h
            .server
            .create_container(&Context::background(), &sandbox_id, &request)
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.stage(), Some("building spec"));
        assert_eq!(h.storage.len(), 1);
    })
}

#[test]
fn unknown_sandbox_or_image() {
    Runtime::new().unwrap().block_on(async {
        let h = Harness::new();
        let ctx = Context::background();
        let err = h
            .server
            .create_container(&ctx, "nope", &container_request("app"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::SandboxNotFound(_)));

        let sandbox_id = sandbox(&h, "pod").await;
        let mut request = container_request("app");
        request.image = "missing".to_string();
        let err = h.server.create_container(&ctx, &sandbox_id, &request).await.unwrap_err();
        assert_eq!(err.stage(), Some("resolving image"));

        // the name was released by the rollback
        h.storage.add_image(ImageInfo {
            id: "sha256:missing".to_string(),
            reference: "missing".to_string(),
            config: ImageConfig {
                cmd: vec!["true".to_string()],
                ..Default::default()
            },
        });
        h.server.create_container(&ctx, &sandbox_id, &request).await.unwrap();
    })
}

#[test]
fn failures_roll_back_everything() {
    let stages = [
        ("storage.create_container", "creating storage"),
        ("storage.start", "creating storage"),
        ("hooks.container_create", "running container hooks"),
        ("runtime.create", "creating process"),
    ];
    for (call, stage) in stages.iter() {
        Runtime::new().unwrap().block_on(async {
            let h = Harness::new();
            let ctx = Context::background();
            let sandbox_id = sandbox(&h, "pod").await;
            h.failures.set(call);

            let err = h
                .server
                .create_container(&ctx, &sandbox_id, &container_request("app"))
                .await
                .unwrap_err();
            assert_eq!(err.stage(), Some(*stage), "failing {}", call);
            assert_eq!(h.storage.len(), 1, "failing {}", call);
            assert_eq!(h.runtime.len(), 0, "failing {}", call);
            assert!(h.server.list_containers(None).is_empty(), "failing {}", call);
            assert!(h.server.sandbox(&sandbox_id).unwrap().members.is_empty());
            assert_eq!(h.server.in_flight(), 0, "failing {}", call);
            if *call == "runtime.create" {
                assert_eq!(h.events.count("hooks.container_undo"), 1);
            }

            h.failures.clear();
            h.server
                .create_container(&ctx, &sandbox_id, &container_request("app"))
                .await
                .unwrap();
        })
    }
}

#[test]
fn identical_requests_share_one_container() {
    Runtime::new().unwrap().block_on(async {
        let h = Harness::new();
        let ctx = Context::background();
        let sandbox_id = sandbox(&h, "pod").await;
        let request = container_request("app");

        let (first, second) = tokio::join!(
            h.server.create_container(&ctx, &sandbox_id, &request),
            h.server.create_container(&ctx, &sandbox_id, &request)
        );
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(h.events.count("storage.create_container"), 1);
    })
}

#[test]
fn bind_mounts() {
    Runtime::new().unwrap().block_on(async {
        let h = Harness::new();
        let ctx = Context::background();
        let sandbox_id = sandbox(&h, "pod").await;
        fs::create_dir_all(h.path("data")).unwrap();
        let mut request = container_request("app");
        request.mounts = vec![
            MountRequest {
                container_path: "/data/".to_string(),
                host_path: h.path("data").to_string_lossy().into_owned(),
                readonly: true,
                ..Default::default()
            },
            MountRequest {
                container_path: "/scratch".to_string(),
                host_path: h.path("scratch").to_string_lossy().into_owned(),
                ..Default::default()
            },
        ];
        let id = h.server.create_container(&ctx, &sandbox_id, &request).await.unwrap();

        let status = h.server.container(&id).unwrap();
        assert_eq!(status.volumes.len(), 2);
        assert_eq!(status.volumes[0].container_path, "/data");
        assert!(status.volumes[0].readonly);
        assert!(h.path("scratch").is_dir());

        let spec = persist::load(&h.path("run").join(&id)).unwrap();
        let data = spec.mount("/data").unwrap();
        assert_eq!(data.options, vec!["rbind", "ro", "rprivate"]);
        assert!(spec.annotation(annotations::VOLUMES).unwrap().contains("/scratch"));
    })
}

#[test]
fn protected_mount_source_must_exist() {
    Runtime::new().unwrap().block_on(async {
        let protected = tempfile::tempdir().unwrap();
        let missing = protected.path().join("absent");
        let absent = missing.clone();
        let h = Harness::with_config(move |config| {
            config.absent_mount_sources_to_reject = vec![absent];
        });
        let sandbox_id = sandbox(&h, "pod").await;
        let mut request = container_request("app");
        request.mounts = vec![MountRequest {
            container_path: "/absent".to_string(),
            host_path: missing.to_string_lossy().into_owned(),
            ..Default::default()
        }];

        let err = h
            .server
            .create_container(&Context::background(), &sandbox_id, &request)
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some("building spec"));
        assert!(!missing.exists());
        assert_eq!(h.storage.len(), 1);
    })
}

#[test]
fn artifact_mounts() {
    Runtime::new().unwrap().block_on(async {
        let h = Harness::new();
        let ctx = Context::background();
        h.storage.add_artifact(ArtifactInfo {
            reference: "models".to_string(),
            root: h.path("artifact"),
            paths: vec!["a/x.bin".to_string(), "a/y.bin".to_string(), "b/z.bin".to_string()],
        });
        let sandbox_id = sandbox(&h, "pod").await;
        let mut request = container_request("app");
        request.mounts = vec![MountRequest {
            container_path: "/models".to_string(),
            artifact: Some(ArtifactMount {
                reference: "models".to_string(),
                sub_path: "a".to_string(),
            }),
            ..Default::default()
        }];
        let id = h.server.create_container(&ctx, &sandbox_id, &request).await.unwrap();

        let spec = persist::load(&h.path("run").join(&id)).unwrap();
        let x = spec.mount("/models/x.bin").unwrap();
        assert_eq!(x.source, h.path("artifact/a/x.bin").to_string_lossy());
        assert!(x.options.contains(&"ro".to_string()));
        assert!(spec.mount("/models/y.bin").is_some());
        assert!(spec.mount("/models/z.bin").is_none());

        request.metadata.name = "other".to_string();
        request.mounts[0].artifact.as_mut().unwrap().sub_path = "c".to_string();
        let err = h.server.create_container(&ctx, &sandbox_id, &request).await.unwrap_err();
        assert!(err.to_string().contains("/models"));
    })
}

#[test]
fn pid_namespace_of_another_container() {
    Runtime::new().unwrap().block_on(async {
        let h = Harness::new();
        let ctx = Context::background();
        let sandbox_id = sandbox(&h, "pod").await;
        let first = h
            .server
            .create_container(&ctx, &sandbox_id, &container_request("first"))
            .await
            .unwrap();
        let first_pid = h.server.container(&first).unwrap().pid.unwrap();

        let mut request = container_request("second");
        request.namespaces = Some(NamespaceOptions {
            pid: NamespaceMode::Target(first.clone()),
            ..NamespaceOptions::standard()
        });
        let second = h.server.create_container(&ctx, &sandbox_id, &request).await.unwrap();
        let spec = persist::load(&h.path("run").join(&second)).unwrap();
        assert_eq!(
            spec.namespace("pid").unwrap().path,
            Some(format!("/proc/{}/ns/pid", first_pid))
        );

        request.metadata.name = "third".to_string();
        request.namespaces = Some(NamespaceOptions {
            pid: NamespaceMode::Target("nobody".to_string()),
            ..NamespaceOptions::standard()
        });
        let err = h.server.create_container(&ctx, &sandbox_id, &request).await.unwrap_err();
        assert!(matches!(err.root(), ServerError::Namespace(_)));
    })
}

#[test]
fn remove_releases_everything() {
    Runtime::new().unwrap().block_on(async {
        let h = Harness::new();
        let ctx = Context::background();
        let sandbox_id = sandbox(&h, "pod").await;
        let id = h
            .server
            .create_container(&ctx, &sandbox_id, &container_request("app"))
            .await
            .unwrap();
        h.server.start_container(&id).await.unwrap();

        h.server.remove_container(&id).await.unwrap();
        h.server.remove_container(&id).await.unwrap();
        h.server.stop_container(&id, Duration::from_secs(1)).await.unwrap();
        assert!(h.server.container(&id).is_err());
        assert!(!h.storage.has(&id));
        assert_eq!(h.runtime.len(), 0);
        assert!(h.server.sandbox(&sandbox_id).unwrap().members.is_empty());
        assert!(h.events.contains(&format!("runtime.stop {}", id)));

        h.server
            .create_container(&ctx, &sandbox_id, &container_request("app"))
            .await
            .unwrap();
    })
}
