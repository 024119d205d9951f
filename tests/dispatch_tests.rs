//! Dispatcher behavior against a recording fake cluster.


use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use jobgate::cluster::ClusterClient;
use jobgate::dispatch::{Dispatched, Dispatcher, TAG_APP, TAG_RELEASE};
use jobgate::error::{ControllerError, Phase};
use jobgate::scheduler::{NewJob, RandomHost};
use test_harness::{app, running_job, seeded_catalog, test_timeouts, FakeCluster, RELEASE_ID};

fn dispatcher(cluster: &FakeCluster) -> Dispatcher {
    let cluster: Arc<dyn ClusterClient> = Arc::new(cluster.clone());
    Dispatcher::new(Arc::new(seeded_catalog()), cluster, Arc::new(RandomHost))
        .with_timeouts(test_timeouts())
}

fn new_job(cmd: &[&str]) -> NewJob {
    NewJob {
        release_id: RELEASE_ID.to_string(),
        cmd: cmd.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_non_interactive_run_returns_summary() {
    let cluster = FakeCluster::new().with_host("h1", vec![]);
    let mut job = new_job(&["echo", "hi"]);
    job.env = BTreeMap::from([("MODE".to_string(), "debug".to_string())]);

    let dispatched = dispatcher(&cluster).run_job(&app(), job, false).await.unwrap();
    let summary = match dispatched {
        Dispatched::Scheduled(summary) => summary,
        other => panic!("expected scheduled job, got {:?}", other),
    };

    let submitted = cluster.submitted();
    assert_eq!(submitted.len(), 1);
    let (host_id, spec) = &submitted[0];
    assert_eq!(host_id, "h1");
    assert_eq!(summary.id, format!("h1-{}", spec.id));
    assert_eq!(summary.release_id, RELEASE_ID);
    assert_eq!(summary.cmd, Some(vec!["echo".to_string(), "hi".to_string()]));
    assert_eq!(summary.job_type, None);

    assert_eq!(spec.app_id, "app1");
    assert_eq!(spec.release_id, RELEASE_ID);
    assert_eq!(spec.tags.get(TAG_APP).map(String::as_str), Some("app1"));
    assert_eq!(spec.tags.get(TAG_RELEASE).map(String::as_str), Some(RELEASE_ID));
    assert_eq!(spec.config.env, vec!["MODE=debug", "PORT=80"]);
    assert_eq!(spec.config.image.name, "registry.local/web");
    assert_eq!(spec.config.image.tag.as_deref(), Some("v2"));
    assert_eq!(spec.config.image.id.as_deref(), Some("abc123"));
    assert!(spec.config.attach_stdout && spec.config.attach_stderr);
    assert!(!spec.config.attach_stdin && !spec.config.open_stdin);

    // No attach for non-interactive jobs.
    assert!(cluster.call_index("dial:").is_none());
    assert!(cluster.call_index("attach:").is_none());
}

#[tokio::test]
async fn test_interactive_attach_precedes_submit() {
    let cluster = FakeCluster::new().with_host("h1", vec![]);

    let dispatched = dispatcher(&cluster)
        .run_job(&app(), new_job(&["sh"]), true)
        .await
        .unwrap();
    let mut attached = match dispatched {
        Dispatched::Attached(job) => job,
        other => panic!("expected attached job, got {:?}", other),
    };

    let attach = cluster.call_index("attach:").expect("attach recorded");
    let submit = cluster.call_index("add_jobs").expect("submit recorded");
    assert!(attach < submit, "calls: {:?}", cluster.calls());
    assert_eq!(attached.id.host_id, "h1");
    assert_eq!(cluster.calls()[attach], format!("attach:{}", attached.id.job_id));

    let (_, spec) = &cluster.submitted()[0];
    assert!(spec.config.attach_stdin && spec.config.open_stdin && spec.config.stdin_once);

    // The fake job echoes its input.
    attached.stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    attached.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    assert!(cluster.call_index("close:").is_none());
    drop(attached);
    assert_eq!(cluster.calls().last().map(String::as_str), Some("close:h1"));
}

#[tokio::test]
async fn test_no_hosts_fails_every_time() {
    let cluster = FakeCluster::new();
    let dispatcher = dispatcher(&cluster);

    for interactive in [false, true, false] {
        let err = dispatcher
            .run_job(&app(), new_job(&["true"]), interactive)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::NoHostsAvailable), "got {:?}", err);
    }

    assert!(cluster.submitted().is_empty());
    assert!(cluster.call_index("add_jobs").is_none());
    assert!(cluster.call_index("dial:").is_none());
}

#[tokio::test]
async fn test_missing_release_id_is_validation_error() {
    let cluster = FakeCluster::new().with_host("h1", vec![]);
    let job = NewJob {
        cmd: vec!["true".into()],
        ..Default::default()
    };

    let err = dispatcher(&cluster).run_job(&app(), job, false).await.unwrap_err();
    match err {
        ControllerError::Validation { field, .. } => assert_eq!(field, "releaseID"),
        other => panic!("expected validation error, got {:?}", other),
    }
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_release_is_not_found() {
    let cluster = FakeCluster::new().with_host("h1", vec![]);
    let mut job = new_job(&["true"]);
    job.release_id = "nope".into();

    let err = dispatcher(&cluster).run_job(&app(), job, false).await.unwrap_err();
    assert!(matches!(err, ControllerError::NotFound(_)), "got {:?}", err);
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn test_invalid_artifact_uri_is_validation_error() {
    let cluster = FakeCluster::new().with_host("h1", vec![]);
    let mut job = new_job(&["true"]);
    job.release_id = "badrel".into();

    let err = dispatcher(&cluster).run_job(&app(), job, false).await.unwrap_err();
    match err {
        ControllerError::Validation { field, .. } => assert_eq!(field, "artifact.uri"),
        other => panic!("expected validation error, got {:?}", other),
    }
    assert!(cluster.submitted().is_empty());
}

#[tokio::test]
async fn test_schedule_failure_releases_attach() {
    let cluster = FakeCluster::new().with_host("h1", vec![]);
    cluster.fail_add_jobs();

    let err = dispatcher(&cluster)
        .run_job(&app(), new_job(&["sh"]), true)
        .await
        .unwrap_err();
    match err {
        ControllerError::Transport { phase, .. } => assert_eq!(phase, Phase::Schedule),
        other => panic!("expected transport error, got {:?}", other),
    }

    let submit = cluster.call_index("add_jobs").unwrap();
    let detach = cluster.call_index("detach:").expect("attach detached");
    assert!(submit < detach);
    assert_eq!(cluster.pending_attaches(), 0);
    assert_eq!(cluster.calls().last().map(String::as_str), Some("close:h1"));
}

#[tokio::test]
async fn test_least_loaded_host_gets_the_job() {
    use jobgate::scheduler::LeastLoaded;

    let busy = vec![
        running_job("a", "app1", "web", &[]),
        running_job("b", "app1", "web", &[]),
    ];
    let cluster = FakeCluster::new()
        .with_host("h1", busy)
        .with_host("h2", vec![]);
    let shared: Arc<dyn ClusterClient> = Arc::new(cluster.clone());
    let dispatcher = Dispatcher::new(Arc::new(seeded_catalog()), shared, Arc::new(LeastLoaded));

    let summary = match dispatcher.run_job(&app(), new_job(&["true"]), false).await.unwrap() {
        Dispatched::Scheduled(summary) => summary,
        other => panic!("expected scheduled job, got {:?}", other),
    };
    assert!(summary.id.starts_with("h2-"));
}
