//! End-to-end tests of the download pipeline against a mock HTTP server:
//! concurrency caps, retries with backoff, ledger dedup, pause/resume and
//! collision policies.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ibh_core::filename::FilenameTemplate;
use ibh_core::ledger::{HashLedger, LedgerStatus};
use ibh_core::queue::{Batch, BatchOptions, BatchState, CollisionPolicy, JobOutcome, JobState};
use ibh_common::post::Post;
use ibh_sources::auth::Credentials;
use ibh_sources::client::RateLimiter;
use ibh_sources::descriptor::{
    ApiFormat, Endpoints, FieldMap, PollIntervals, SourceDescriptor, TransportPolicy,
    DEFAULT_SOURCES,
};
use ibh_sources::ApiClient;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_descriptor(server_url: &str) -> SourceDescriptor {
    let mut descriptor = DEFAULT_SOURCES.get("danbooru").unwrap().clone();
    descriptor.name = "testbooru".to_string();
    descriptor.api = ApiFormat::Json;
    descriptor.field_map = Some(FieldMap::default());
    descriptor.transport = TransportPolicy::Never;
    descriptor.endpoints = Endpoints {
        post_list: Some(format!("{server_url}/posts.json")),
        post: None,
        login: None,
        token: None,
    };
    descriptor.intervals = PollIntervals {
        thumbnail_ms: 0,
        image_ms: 0,
        page_ms: 0,
        details_ms: 0,
        error_ms: 10,
    };
    descriptor
}

fn test_client(server_url: &str) -> Arc<ApiClient> {
    Arc::new(ApiClient::new(
        Arc::new(test_descriptor(server_url)),
        Arc::new(RateLimiter::disabled()),
        Credentials::default(),
    ))
}

fn post_for(server_url: &str, id: u64, body: &[u8]) -> Post {
    Post {
        id,
        md5: Some(format!("{:x}", md5::compute(body))),
        file_url: format!("{server_url}/files/{id}.png"),
        ..Post::default()
    }
}

async fn mount_file(server: &MockServer, id: u64, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path(format!("/files/{id}.png")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

#[tokio::test]
async fn batch_downloads_and_records_ledger() {
    let server = MockServer::start().await;
    let body = b"fake image bytes";
    mount_file(&server, 1, body).await;

    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(HashLedger::in_memory());
    let posts = vec![post_for(&server.uri(), 1, body)];
    let md5 = posts[0].md5.clone().unwrap();

    let batch = Batch::new(
        test_client(&server.uri()),
        ledger.clone(),
        posts,
        &FilenameTemplate::new("%id%.%ext%"),
        &[],
        dir.path(),
        BatchOptions::default(),
    )
    .unwrap();

    let summary = batch.run().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.errored, 0);

    let saved = std::fs::read(dir.path().join("1.png")).unwrap();
    assert_eq!(saved, body);
    assert!(ledger.contains(&md5).await);
}

#[tokio::test]
async fn recorded_hash_skips_the_transfer_entirely() {
    let server = MockServer::start().await;
    // The file endpoint must never be hit.
    Mock::given(method("GET"))
        .and(path("/files/5.png"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let body = b"previously downloaded";
    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(HashLedger::in_memory());
    let post = post_for(&server.uri(), 5, body);
    let md5 = post.md5.clone().unwrap();

    assert_eq!(ledger.check_and_claim(&md5).await, LedgerStatus::Claimed);
    ledger.record(&md5, Path::new("elsewhere/5.png")).await.unwrap();

    let batch = Batch::new(
        test_client(&server.uri()),
        ledger,
        vec![post],
        &FilenameTemplate::new("%id%.%ext%"),
        &[],
        dir.path(),
        BatchOptions::default(),
    )
    .unwrap();

    let summary = batch.run().await.unwrap();
    assert_eq!(summary.already_exists, 1);
    assert_eq!(summary.succeeded, 0);
    assert!(!dir.path().join("5.png").exists());
}

#[tokio::test]
async fn force_redownload_transfers_anyway() {
    let server = MockServer::start().await;
    let body = b"fresh copy";
    mount_file(&server, 6, body).await;

    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(HashLedger::in_memory());
    let post = post_for(&server.uri(), 6, body);
    let md5 = post.md5.clone().unwrap();

    ledger.check_and_claim(&md5).await;
    ledger.record(&md5, Path::new("elsewhere/6.png")).await.unwrap();

    let batch = Batch::new(
        test_client(&server.uri()),
        ledger,
        vec![post],
        &FilenameTemplate::new("%id%.%ext%"),
        &[],
        dir.path(),
        BatchOptions {
            force_redownload: true,
            ..BatchOptions::default()
        },
    )
    .unwrap();

    let summary = batch.run().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert!(dir.path().join("6.png").exists());
}

#[tokio::test]
async fn concurrency_never_exceeds_the_cap() {
    let server = MockServer::start().await;
    let body = b"slow image";
    for id in 1..=6u64 {
        Mock::given(method("GET"))
            .and(path(format!("/files/{id}.png")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(body.to_vec())
                    .set_delay(Duration::from_millis(80)),
            )
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let posts: Vec<Post> = (1..=6).map(|id| post_for(&server.uri(), id, body)).collect();

    let batch = Batch::new(
        test_client(&server.uri()),
        Arc::new(HashLedger::in_memory()),
        posts,
        &FilenameTemplate::new("%id%.%ext%"),
        &[],
        dir.path(),
        BatchOptions {
            simultaneous: 2,
            ..BatchOptions::default()
        },
    )
    .unwrap();

    let watcher = {
        let batch = batch.clone();
        tokio::spawn(async move {
            let mut max_active = 0;
            loop {
                max_active = max_active.max(batch.active_jobs());
                if batch.state() == BatchState::Finished {
                    return max_active;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let summary = batch.run().await.unwrap();
    assert_eq!(summary.succeeded, 6);

    let max_active = watcher.await.unwrap();
    assert!(max_active <= 2, "saw {max_active} simultaneously active jobs");
}

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let server = MockServer::start().await;
    let body = b"eventually fine";

    // Five posts; post 2 fails twice before succeeding on the third try.
    for id in [1u64, 3, 4, 5] {
        mount_file(&server, id, body).await;
    }
    Mock::given(method("GET"))
        .and(path("/files/2.png"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_file(&server, 2, body).await;

    let dir = TempDir::new().unwrap();
    let posts: Vec<Post> = (1..=5).map(|id| post_for(&server.uri(), id, body)).collect();

    let batch = Batch::new(
        test_client(&server.uri()),
        Arc::new(HashLedger::in_memory()),
        posts,
        &FilenameTemplate::new("%id%.%ext%"),
        &[],
        dir.path(),
        BatchOptions {
            simultaneous: 2,
            retries: 3,
            ..BatchOptions::default()
        },
    )
    .unwrap();

    let summary = batch.run().await.unwrap();
    assert_eq!(summary.succeeded, 5);
    assert_eq!(summary.errored, 0);
}

#[tokio::test]
async fn exhausted_retries_fail_the_job_with_a_reason() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/9.png"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let post = post_for(&server.uri(), 9, b"never arrives");

    let batch = Batch::new(
        test_client(&server.uri()),
        Arc::new(HashLedger::in_memory()),
        vec![post],
        &FilenameTemplate::new("%id%.%ext%"),
        &[],
        dir.path(),
        BatchOptions {
            retries: 2,
            ..BatchOptions::default()
        },
    )
    .unwrap();

    let mut events = batch.subscribe();
    let summary = batch.run().await.unwrap();
    assert_eq!(summary.errored, 1);
    assert_eq!(summary.succeeded, 0);

    let mut saw_failure_reason = false;
    while let Ok(event) = events.try_recv() {
        if event.state == JobState::Done(JobOutcome::Failed) {
            saw_failure_reason = event.error.is_some();
        }
    }
    assert!(saw_failure_reason, "failure reason must be attached");

    // Bulk retry-failed requeues the job.
    assert_eq!(batch.requeue_failed(), 1);
    assert_eq!(batch.job_state(0), Some(JobState::Queued));
}

#[tokio::test]
async fn corrupted_transfer_is_retried_then_succeeds() {
    let server = MockServer::start().await;
    let good = b"the real content";

    // First answer is corrupted relative to the post's md5.
    Mock::given(method("GET"))
        .and(path("/files/7.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"garbage".to_vec()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_file(&server, 7, good).await;

    let dir = TempDir::new().unwrap();
    let post = post_for(&server.uri(), 7, good);

    let batch = Batch::new(
        test_client(&server.uri()),
        Arc::new(HashLedger::in_memory()),
        vec![post],
        &FilenameTemplate::new("%id%.%ext%"),
        &[],
        dir.path(),
        BatchOptions {
            retries: 3,
            ..BatchOptions::default()
        },
    )
    .unwrap();

    let summary = batch.run().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(std::fs::read(dir.path().join("7.png")).unwrap(), good);
}

#[tokio::test]
async fn missing_remote_file_is_not_found_not_failed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/8.png"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let post = post_for(&server.uri(), 8, b"whatever");

    let batch = Batch::new(
        test_client(&server.uri()),
        Arc::new(HashLedger::in_memory()),
        vec![post],
        &FilenameTemplate::new("%id%.%ext%"),
        &[],
        dir.path(),
        BatchOptions::default(),
    )
    .unwrap();

    let summary = batch.run().await.unwrap();
    assert_eq!(summary.not_found, 1);
    assert_eq!(summary.errored, 0);
}

#[tokio::test]
async fn pause_parks_promotion_and_resume_continues() {
    let server = MockServer::start().await;
    let body = b"pausable";
    for id in 1..=4u64 {
        Mock::given(method("GET"))
            .and(path(format!("/files/{id}.png")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(body.to_vec())
                    .set_delay(Duration::from_millis(50)),
            )
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let posts: Vec<Post> = (1..=4).map(|id| post_for(&server.uri(), id, body)).collect();

    let batch = Batch::new(
        test_client(&server.uri()),
        Arc::new(HashLedger::in_memory()),
        posts,
        &FilenameTemplate::new("%id%.%ext%"),
        &[],
        dir.path(),
        BatchOptions {
            simultaneous: 1,
            ..BatchOptions::default()
        },
    )
    .unwrap();

    let runner = {
        let batch = batch.clone();
        tokio::spawn(async move { batch.run().await.unwrap() })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    batch.pause();
    assert_eq!(batch.state(), BatchState::Paused);

    // The in-flight transfer finishes, nothing new starts.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(batch.active_jobs(), 0);
    let done_while_paused: usize = (0..batch.len())
        .filter(|i| matches!(batch.job_state(*i), Some(JobState::Done(_))))
        .count();
    assert!(done_while_paused < 4, "pause must stop promotion");

    batch.resume();
    let summary = runner.await.unwrap();
    assert_eq!(summary.succeeded, 4);
}

#[tokio::test]
async fn cancel_abandons_queued_jobs() {
    let server = MockServer::start().await;
    let body = b"cancellable";
    for id in 1..=4u64 {
        Mock::given(method("GET"))
            .and(path(format!("/files/{id}.png")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(body.to_vec())
                    .set_delay(Duration::from_millis(50)),
            )
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let posts: Vec<Post> = (1..=4).map(|id| post_for(&server.uri(), id, body)).collect();

    let batch = Batch::new(
        test_client(&server.uri()),
        Arc::new(HashLedger::in_memory()),
        posts,
        &FilenameTemplate::new("%id%.%ext%"),
        &[],
        dir.path(),
        BatchOptions {
            simultaneous: 1,
            ..BatchOptions::default()
        },
    )
    .unwrap();

    let runner = {
        let batch = batch.clone();
        tokio::spawn(async move { batch.run().await.unwrap() })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    batch.cancel();
    let _ = runner.await.unwrap();

    assert_eq!(batch.state(), BatchState::Cancelled);
    let cancelled = (0..batch.len())
        .filter(|i| batch.job_state(*i) == Some(JobState::Cancelled))
        .count();
    assert!(cancelled >= 2, "queued jobs must be abandoned");
}

#[tokio::test]
async fn collision_policies_on_existing_files() {
    let server = MockServer::start().await;
    let body = b"new content";
    mount_file(&server, 1, body).await;

    for policy in [
        CollisionPolicy::DontSave,
        CollisionPolicy::Copy,
        CollisionPolicy::Move,
    ] {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("1.png"), b"old content").unwrap();

        let batch = Batch::new(
            test_client(&server.uri()),
            Arc::new(HashLedger::in_memory()),
            vec![post_for(&server.uri(), 1, body)],
            &FilenameTemplate::new("%id%.%ext%"),
            &[],
            dir.path(),
            BatchOptions {
                collision_existing: policy,
                ..BatchOptions::default()
            },
        )
        .unwrap();

        let summary = batch.run().await.unwrap();
        match policy {
            CollisionPolicy::DontSave => {
                assert_eq!(summary.skipped, 1);
                assert_eq!(
                    std::fs::read(dir.path().join("1.png")).unwrap(),
                    b"old content"
                );
            }
            CollisionPolicy::Copy => {
                assert_eq!(summary.succeeded, 1);
                assert_eq!(
                    std::fs::read(dir.path().join("1.png")).unwrap(),
                    b"old content"
                );
                assert_eq!(
                    std::fs::read(dir.path().join("1 (1).png")).unwrap(),
                    body
                );
            }
            CollisionPolicy::Move => {
                assert_eq!(summary.succeeded, 1);
                assert_eq!(std::fs::read(dir.path().join("1.png")).unwrap(), body);
            }
        }
    }
}

#[tokio::test]
async fn sidecar_metadata_file_uses_the_template_engine() {
    let server = MockServer::start().await;
    let body = b"with sidecar";
    mount_file(&server, 3, body).await;

    let dir = TempDir::new().unwrap();
    let mut post = post_for(&server.uri(), 3, body);
    post.tags = vec![
        ibh_common::post::tags::Tag::new("solo", ibh_common::post::tags::TagType::General),
        ibh_common::post::tags::Tag::new("sky", ibh_common::post::tags::TagType::General),
    ];

    let batch = Batch::new(
        test_client(&server.uri()),
        Arc::new(HashLedger::in_memory()),
        vec![post],
        &FilenameTemplate::new("%id%.%ext%"),
        &[],
        dir.path(),
        BatchOptions {
            sidecar_template: Some("%tags%".to_string()),
            ..BatchOptions::default()
        },
    )
    .unwrap();

    let summary = batch.run().await.unwrap();
    assert_eq!(summary.succeeded, 1);

    let sidecar = std::fs::read_to_string(dir.path().join("3.png.txt")).unwrap();
    assert_eq!(sidecar, "solo sky");
}

#[tokio::test]
async fn posts_without_md5_download_without_ledger() {
    let server = MockServer::start().await;
    let body = b"feed entry media";
    mount_file(&server, 4, body).await;

    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(HashLedger::in_memory());
    let mut post = post_for(&server.uri(), 4, body);
    post.md5 = None;

    let batch = Batch::new(
        test_client(&server.uri()),
        ledger.clone(),
        vec![post],
        &FilenameTemplate::new("%id%.%ext%"),
        &[],
        dir.path(),
        BatchOptions::default(),
    )
    .unwrap();

    let summary = batch.run().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert!(ledger.is_empty().await);
}
