//! End-to-end engine tests over the local filesystem backend.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use crosspane::{CoreApi, EngineConfig, JobEvent, JobKind, JobOptions, JobSpec, JobStatus};
use object_storage::registry::StoreRegistry;
use object_storage::{
    FileConfig, GenericObjectStore, ListOptions, LocalFs, ObjectUri, Scheme,
};
use tokio_util::sync::CancellationToken;

fn registry() -> Arc<StoreRegistry> {
    let registry = StoreRegistry::new();
    registry.register(
        Scheme::File,
        Arc::new(GenericObjectStore::LocalFs(LocalFs::new(
            FileConfig::default(),
            Duration::from_secs(30),
        ))),
        "local-default",
    );
    Arc::new(registry)
}

async fn core_at(root: &Utf8Path) -> CoreApi {
    CoreApi::new(
        EngineConfig::rooted_at(root.join("engine")),
        registry(),
        root.join("state.json"),
    )
    .await
    .expect("engine init")
}

fn file_uri(path: &Utf8Path) -> ObjectUri {
    ObjectUri::parse(&format!("file://{path}")).unwrap()
}

async fn wait_terminal(core: &CoreApi, id: crosspane::JobId) -> JobStatus {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let job = core.get_job(id).expect("job exists");
            if job.status.is_terminal() {
                return job.status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job should reach a terminal status")
}

#[tokio::test]
async fn copy_job_runs_to_completion_with_ordered_events() {
    let dir = camino_tempfile::tempdir().unwrap();
    let core = core_at(dir.path()).await;
    let mut events = core.subscribe_job_events();

    let src = dir.path().join("in.bin");
    let payload: Vec<u8> = (0..2_000_000u32).map(|i| (i % 251) as u8).collect();
    tokio::fs::write(&src, &payload).await.unwrap();

    let id = core
        .enqueue_job(JobSpec {
            kind: JobKind::Copy,
            source: file_uri(&src),
            destination: Some(file_uri(&dir.path().join("out.bin"))),
            options: JobOptions::default(),
        })
        .await
        .unwrap();

    assert_eq!(wait_terminal(&core, id).await, JobStatus::Completed);
    assert_eq!(
        tokio::fs::read(dir.path().join("out.bin")).await.unwrap(),
        payload
    );

    // Per-job ordering: created, then started, then progress, then the
    // terminal event, nothing after it.
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.job_id() == id {
            seen.push(event);
        }
    }
    assert!(matches!(seen.first(), Some(JobEvent::Created { .. })));
    assert!(matches!(seen.get(1), Some(JobEvent::Started { .. })));
    let terminal_at = seen.iter().position(|e| e.is_terminal()).unwrap();
    assert!(matches!(seen[terminal_at], JobEvent::Completed { .. }));
    assert_eq!(terminal_at, seen.len() - 1, "nothing after the terminal event");
    for event in &seen[2..terminal_at] {
        assert!(matches!(event, JobEvent::Progress { .. }));
    }

    // Progress was monotonic.
    let mut last = 0;
    for event in &seen {
        if let JobEvent::Progress { bytes_done, .. } = event {
            assert!(*bytes_done >= last);
            last = *bytes_done;
        }
    }
}

#[tokio::test]
async fn move_job_removes_the_source() {
    let dir = camino_tempfile::tempdir().unwrap();
    let core = core_at(dir.path()).await;

    let src = dir.path().join("moved.txt");
    tokio::fs::write(&src, vec![b'A'; 1024]).await.unwrap();
    let dst = dir.path().join("dest/moved.txt");

    let id = core
        .enqueue_job(JobSpec {
            kind: JobKind::Move,
            source: file_uri(&src),
            destination: Some(file_uri(&dst)),
            options: JobOptions::default(),
        })
        .await
        .unwrap();

    assert_eq!(wait_terminal(&core, id).await, JobStatus::Completed);
    assert!(!src.exists());
    assert_eq!(tokio::fs::read(&dst).await.unwrap().len(), 1024);
}

#[tokio::test]
async fn mkdir_then_parent_listing_contains_it() {
    let dir = camino_tempfile::tempdir().unwrap();
    let core = core_at(dir.path()).await;
    let cancel = CancellationToken::new();

    let new_dir = ObjectUri::parse(&format!("file://{}/made/", dir.path())).unwrap();
    let id = core
        .enqueue_job(JobSpec {
            kind: JobKind::Mkdir,
            source: new_dir.clone(),
            destination: None,
            options: JobOptions::default(),
        })
        .await
        .unwrap();
    assert_eq!(wait_terminal(&core, id).await, JobStatus::Completed);

    let page = core
        .list(&new_dir.parent(), &ListOptions::default(), &cancel)
        .await
        .unwrap();
    assert!(page.items.iter().any(|i| i.name == "made" && i.is_dir));
}

#[tokio::test]
async fn delete_then_gone() {
    let dir = camino_tempfile::tempdir().unwrap();
    let core = core_at(dir.path()).await;
    let cancel = CancellationToken::new();

    let tree = dir.path().join("tree");
    tokio::fs::create_dir_all(tree.join("sub")).await.unwrap();
    tokio::fs::write(tree.join("sub/f.txt"), b"x").await.unwrap();

    let uri = ObjectUri::parse(&format!("file://{tree}/")).unwrap();
    let id = core
        .enqueue_job(JobSpec {
            kind: JobKind::Delete,
            source: uri.clone(),
            destination: None,
            options: JobOptions {
                recursive: true,
                ..Default::default()
            },
        })
        .await
        .unwrap();
    assert_eq!(wait_terminal(&core, id).await, JobStatus::Completed);
    assert!(core.stat(&uri, &cancel).await.is_err());
}

#[tokio::test]
async fn cancel_of_queued_job_is_immediate() {
    let dir = camino_tempfile::tempdir().unwrap();
    let mut config = EngineConfig::rooted_at(dir.path().join("engine"));
    config.workers = 1;
    let core = CoreApi::new(config, registry(), dir.path().join("state.json"))
        .await
        .unwrap();

    // Occupy the single worker with a decently sized copy.
    let big = dir.path().join("big.bin");
    tokio::fs::write(&big, vec![7u8; 64 * 1024 * 1024]).await.unwrap();
    let blocker = core
        .enqueue_job(JobSpec {
            kind: JobKind::Copy,
            source: file_uri(&big),
            destination: Some(file_uri(&dir.path().join("big-copy.bin"))),
            options: JobOptions::default(),
        })
        .await
        .unwrap();

    let small = dir.path().join("small.bin");
    tokio::fs::write(&small, b"tiny").await.unwrap();
    let queued = core
        .enqueue_job(JobSpec {
            kind: JobKind::Copy,
            source: file_uri(&small),
            destination: Some(file_uri(&dir.path().join("small-copy.bin"))),
            options: JobOptions::default(),
        })
        .await
        .unwrap();

    core.cancel_job(queued).await.unwrap();
    let status = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let job = core.get_job(queued).unwrap();
            if job.status.is_terminal() {
                return job.status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("cancel resolves within the grace window");
    assert_eq!(status, JobStatus::Canceled);
    assert!(!dir.path().join("small-copy.bin").exists());

    // The occupied worker still finishes its own job.
    assert_eq!(wait_terminal(&core, blocker).await, JobStatus::Completed);
}

#[tokio::test]
async fn cancel_of_running_job_reaches_terminal_quickly() {
    let dir = camino_tempfile::tempdir().unwrap();
    let core = core_at(dir.path()).await;
    let mut events = core.subscribe_job_events();

    let src = dir.path().join("in.bin");
    tokio::fs::write(&src, vec![1u8; 32 * 1024 * 1024]).await.unwrap();

    let id = core
        .enqueue_job(JobSpec {
            kind: JobKind::Copy,
            source: file_uri(&src),
            destination: Some(file_uri(&dir.path().join("out.bin"))),
            options: JobOptions::default(),
        })
        .await
        .unwrap();

    // Wait for it to start, then cancel.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(JobEvent::Started { id: started }) if started == id => break,
                Ok(_) => {}
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await
    .unwrap();
    core.cancel_job(id).await.unwrap();

    // Within the grace window the job is terminal: canceled if the copy
    // was interrupted, completed if it won the race.
    let status = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let job = core.get_job(id).unwrap();
            if job.status.is_terminal() {
                return job.status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("terminal within the grace window");
    assert!(matches!(
        status,
        JobStatus::Canceled | JobStatus::Completed | JobStatus::Failed
    ));
}

#[tokio::test]
async fn pause_then_resume_completes() {
    let dir = camino_tempfile::tempdir().unwrap();
    let mut config = EngineConfig::rooted_at(dir.path().join("engine"));
    config.workers = 1;
    let core = CoreApi::new(config, registry(), dir.path().join("state.json"))
        .await
        .unwrap();

    // Block the only worker so the second job stays queued.
    let big = dir.path().join("big.bin");
    tokio::fs::write(&big, vec![7u8; 64 * 1024 * 1024]).await.unwrap();
    core.enqueue_job(JobSpec {
        kind: JobKind::Copy,
        source: file_uri(&big),
        destination: Some(file_uri(&dir.path().join("big-copy.bin"))),
        options: JobOptions::default(),
    })
    .await
    .unwrap();

    let small = dir.path().join("small.bin");
    tokio::fs::write(&small, b"payload").await.unwrap();
    let id = core
        .enqueue_job(JobSpec {
            kind: JobKind::Copy,
            source: file_uri(&small),
            destination: Some(file_uri(&dir.path().join("small-copy.bin"))),
            options: JobOptions::default(),
        })
        .await
        .unwrap();

    core.pause_job(id).await.unwrap();
    assert_eq!(core.get_job(id).unwrap().status, JobStatus::Paused);

    core.resume_job(id).await.unwrap();
    assert_eq!(wait_terminal(&core, id).await, JobStatus::Completed);
    assert_eq!(
        tokio::fs::read(dir.path().join("small-copy.bin")).await.unwrap(),
        b"payload"
    );
}

#[tokio::test]
async fn restart_recovery_applies_journal_rules() {
    let dir = camino_tempfile::tempdir().unwrap();
    let engine_root = dir.path().join("engine");

    // First engine instance: enqueue a job and complete it, then fabricate
    // a crash by writing a running job into the journal.
    {
        let core = CoreApi::new(
            EngineConfig::rooted_at(engine_root.clone()),
            registry(),
            dir.path().join("state.json"),
        )
        .await
        .unwrap();
        let src = dir.path().join("done.txt");
        tokio::fs::write(&src, b"x").await.unwrap();
        let id = core
            .enqueue_job(JobSpec {
                kind: JobKind::Copy,
                source: file_uri(&src),
                destination: Some(file_uri(&dir.path().join("done-copy.txt"))),
                options: JobOptions::default(),
            })
            .await
            .unwrap();
        assert_eq!(wait_terminal(&core, id).await, JobStatus::Completed);
    }

    // Inject a "running" job as if the process died mid-transfer.
    let journal_path = engine_root.join("jobs.json");
    let mut doc: serde_json::Value =
        serde_json::from_slice(&tokio::fs::read(&journal_path).await.unwrap()).unwrap();
    let mut interrupted = doc["jobs"][0].clone();
    interrupted["id"] = serde_json::json!(uuid::Uuid::new_v4());
    interrupted["status"] = serde_json::json!("running");
    interrupted["finished_at"] = serde_json::Value::Null;
    interrupted["error"] = serde_json::Value::Null;
    doc["jobs"].as_array_mut().unwrap().push(interrupted);
    tokio::fs::write(&journal_path, serde_json::to_vec(&doc).unwrap())
        .await
        .unwrap();

    // Second instance: the running job (no resume token) must come back
    // failed with the interrupted reason.
    let core = CoreApi::new(
        EngineConfig::rooted_at(engine_root),
        registry(),
        dir.path().join("state.json"),
    )
    .await
    .unwrap();
    let jobs = core.list_jobs();
    assert_eq!(jobs.len(), 2);
    let failed = jobs
        .iter()
        .find(|j| j.status == JobStatus::Failed)
        .expect("the interrupted job failed on recovery");
    assert_eq!(
        failed.error.as_ref().unwrap().kind,
        object_storage::ErrorKind::Interrupted
    );
    assert!(jobs.iter().any(|j| j.status == JobStatus::Completed));
}

#[tokio::test]
async fn state_store_roundtrips_opaque_bytes() {
    let dir = camino_tempfile::tempdir().unwrap();
    let core = core_at(dir.path()).await;

    assert!(core.load_state().await.unwrap().is_none());
    core.save_state(br#"{"left":"s3://bucket/","divider":42}"#)
        .await
        .unwrap();
    assert_eq!(
        core.load_state().await.unwrap().unwrap(),
        br#"{"left":"s3://bucket/","divider":42}"#
    );
}

#[tokio::test]
async fn unknown_scheme_job_is_rejected_at_enqueue() {
    let dir = camino_tempfile::tempdir().unwrap();
    let core = core_at(dir.path()).await;

    let err = core
        .enqueue_job(JobSpec {
            kind: JobKind::Copy,
            source: ObjectUri::parse("s3://nope/x").unwrap(),
            destination: Some(file_uri(&dir.path().join("x"))),
            options: JobOptions::default(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), object_storage::ErrorKind::UnsupportedScheme);
}
