//! Plan lifecycle and background-job behavior through the public API:
//! status gating of derived views, delete semantics, and the job tracker
//! surface used by the HTTP layer.

use std::fs;
use std::sync::Arc;

use chrono::Duration;
use too_marshal::api::DateObs;
use too_marshal::config::AppConfig;
use too_marshal::db::{
    EventRepository, FullRepository, LocalRepository, LocalizationRepository, PlanRepository,
    RepositoryError,
};
use too_marshal::models::{Plan, PlanArgs, PlanError, PlanStatus};
use too_marshal::services::acquisition::synthesize_cone;
use too_marshal::services::pipeline::{acquire_map_async, generate_plan_async};
use too_marshal::services::{
    export_plan, generate_plan, load_tessellations, submit_plan, GreedyAllocator, JobStatus,
    JobTracker, MapAcquisition, PlanGenerationError, PlanRequest, SubmissionError, TileAllocator,
};

fn key() -> DateObs {
    "2018-01-16T00:36:53".parse().unwrap()
}

fn test_config(data_dir: &std::path::Path) -> AppConfig {
    AppConfig {
        data_dir: data_dir.to_path_buf(),
        ..AppConfig::default()
    }
}

/// Event, cone map and a Gattini grid covering it. Fields go in through
/// the tessellation-file path the server uses at startup.
async fn seeded_repo(config: &AppConfig) -> (LocalRepository, String) {
    let repo = LocalRepository::new();
    repo.upsert_event(key()).await.unwrap();
    let map = synthesize_cone(30.65, 10.12, 2.23, key()).unwrap();
    let map_name = map.name.clone();
    repo.insert_localization(map).await.unwrap();

    let dir = config.data_dir.join("tessellations");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("Gattini.tess"),
        "# 3x3 grid over the cone\n\
         1 26.0 5.5\n2 30.5 5.5\n3 35.0 5.5\n\
         4 26.0 10.0\n5 30.5 10.0\n6 35.0 10.0\n\
         7 26.0 14.5\n8 30.5 14.5\n9 35.0 14.5\n",
    )
    .unwrap();
    assert_eq!(load_tessellations(&repo, config).await.unwrap(), 9);
    (repo, map_name)
}

#[tokio::test]
async fn plan_names_are_scoped_per_telescope() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let (repo, map_name) = seeded_repo(&config).await;

    // The same plan name on two telescopes is two distinct plans.
    let request = PlanRequest {
        plan_name: Some("tonight".to_string()),
        args: Some(PlanArgs {
            filters: vec![too_marshal::api::Filter::J],
            exposure_times: vec![300.0],
            ..PlanArgs::default()
        }),
        ..PlanRequest::new(key(), "Gattini", &map_name)
    };
    generate_plan(&repo, &GreedyAllocator, &config, request.clone())
        .await
        .unwrap();

    let mut ztf_request = request.clone();
    ztf_request.telescope = "ZTF".to_string();
    ztf_request.args = None;
    generate_plan(&repo, &GreedyAllocator, &config, ztf_request)
        .await
        .unwrap();

    let plans = repo.list_plans(key()).await.unwrap();
    assert_eq!(plans.len(), 2);

    // Reusing the name on the same telescope collides before any work.
    let err = generate_plan(&repo, &GreedyAllocator, &config, request)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PlanGenerationError::Repository(RepositoryError::ValidationError { .. })
    ));
}

#[tokio::test]
async fn derived_views_demand_a_ready_plan() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let (repo, map_name) = seeded_repo(&config).await;
    let client = reqwest::Client::new();

    // A freshly created plan is WORKING until the allocator finishes.
    let start = key().datetime();
    let plan = Plan::new(
        key(),
        "Gattini",
        "still_generating",
        &map_name,
        start,
        start + Duration::days(1),
        PlanArgs::default(),
    );
    repo.create_plan(&plan).await.unwrap();

    let err = export_plan(&repo, &config, key(), "Gattini", "still_generating")
        .await
        .unwrap_err();
    assert!(matches!(err, SubmissionError::Plan(PlanError::NotReady(_))));

    let err = submit_plan(&repo, &client, &config, key(), "Gattini", "still_generating")
        .await
        .unwrap_err();
    assert!(matches!(err, SubmissionError::Plan(PlanError::NotReady(_))));

    // A missing plan is a different failure than a not-ready one.
    let err = export_plan(&repo, &config, key(), "Gattini", "never_made")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SubmissionError::Repository(RepositoryError::NotFound { .. })
    ));
}

#[tokio::test]
async fn delete_never_contacts_the_backend() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let (repo, map_name) = seeded_repo(&config).await;
    let client = reqwest::Client::new();

    let plan = generate_plan(
        &repo,
        &GreedyAllocator,
        &config,
        PlanRequest::new(key(), "Gattini", &map_name),
    )
    .await
    .unwrap();
    submit_plan(&repo, &client, &config, key(), "Gattini", &plan.plan_name)
        .await
        .unwrap();
    let drop = tmp
        .path()
        .join("gattini")
        .join(format!("{}.json", plan.queue_name()));
    assert!(drop.exists());

    repo.delete_plan(key(), "Gattini", &plan.plan_name)
        .await
        .unwrap();
    // The stored plan is gone, the already-dropped file stays until a
    // resubmission supersedes it.
    assert!(repo
        .get_plan(key(), "Gattini", &plan.plan_name)
        .await
        .is_err());
    assert!(drop.exists());

    // The name is free again.
    let again = generate_plan(
        &repo,
        &GreedyAllocator,
        &config,
        PlanRequest::new(key(), "Gattini", &map_name),
    )
    .await
    .unwrap();
    assert_eq!(again.status, PlanStatus::Ready);
}

#[tokio::test]
async fn resubmission_is_allowed_and_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let (repo, map_name) = seeded_repo(&config).await;
    let client = reqwest::Client::new();

    let plan = generate_plan(
        &repo,
        &GreedyAllocator,
        &config,
        PlanRequest::new(key(), "Gattini", &map_name),
    )
    .await
    .unwrap();

    let first = submit_plan(&repo, &client, &config, key(), "Gattini", &plan.plan_name)
        .await
        .unwrap();
    let second = submit_plan(&repo, &client, &config, key(), "Gattini", &plan.plan_name)
        .await
        .unwrap();
    assert_eq!(first.status, PlanStatus::Submitted);
    assert_eq!(second.status, PlanStatus::Submitted);
}

#[tokio::test]
async fn generation_job_completes_with_the_plan_name() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(tmp.path()));
    let (repo, map_name) = seeded_repo(&config).await;
    let repo: Arc<dyn FullRepository> = Arc::new(repo);
    let allocator: Arc<dyn TileAllocator> = Arc::new(GreedyAllocator);
    let tracker = JobTracker::new();

    let job_id = tracker.create_job();
    let plan_name = generate_plan_async(
        job_id.clone(),
        tracker.clone(),
        Arc::clone(&repo),
        Arc::clone(&allocator),
        Arc::clone(&config),
        PlanRequest::new(key(), "Gattini", &map_name),
    )
    .await
    .unwrap();

    let job = tracker.get_job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.as_ref().unwrap()["plan_name"], plan_name);

    // An explicit request for a taken name fails its job, unlike the
    // notice pipeline which skips.
    let job_id = tracker.create_job();
    let err = generate_plan_async(
        job_id.clone(),
        tracker.clone(),
        Arc::clone(&repo),
        allocator,
        config,
        PlanRequest::new(key(), "Gattini", &map_name),
    )
    .await
    .unwrap_err();
    assert!(err.contains("failed"));
    let job = tracker.get_job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn acquisition_job_requires_an_event() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(tmp.path()));
    let repo: Arc<dyn FullRepository> = Arc::new(LocalRepository::new());
    let tracker = JobTracker::new();
    let client = reqwest::Client::new();
    let strategy = MapAcquisition::Cone {
        ra: 30.65,
        dec: 10.12,
        error: 2.23,
    };

    // No event on record: the job fails.
    let job_id = tracker.create_job();
    let result = acquire_map_async(
        job_id.clone(),
        tracker.clone(),
        Arc::clone(&repo),
        client.clone(),
        Arc::clone(&config),
        key(),
        strategy.clone(),
    )
    .await;
    assert!(result.is_err());
    assert_eq!(tracker.get_job(&job_id).unwrap().status, JobStatus::Failed);

    // With the event present the same request stores the map.
    repo.upsert_event(key()).await.unwrap();
    let job_id = tracker.create_job();
    let map_name = acquire_map_async(
        job_id.clone(),
        tracker.clone(),
        Arc::clone(&repo),
        client,
        config,
        key(),
        strategy,
    )
    .await
    .unwrap();
    assert_eq!(tracker.get_job(&job_id).unwrap().status, JobStatus::Completed);
    let stored = repo.get_localization(key(), &map_name).await.unwrap();
    assert!(!stored.uniq.is_empty());
}
