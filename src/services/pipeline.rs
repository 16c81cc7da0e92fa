//! End-to-end notice processing.
//!
//! One background run per accepted notice: correlate, acquire the event's
//! probability map, then fan out contour extraction and one plan generation
//! per configured telescope. Acquisition strictly precedes the fan-out; the
//! fan-out tasks run concurrently with no ordering among themselves.
//! Progress is logged to the job tracker so clients can follow along over
//! SSE.

use std::sync::Arc;

use crate::api::DateObs;
use crate::config::AppConfig;
use crate::correlator::{self, AlertNotifier};
use crate::db::{FullRepository, RepositoryError};
use crate::services::acquisition::{FetchPolicy, MapAcquisition};
use crate::services::contour;
use crate::services::job_tracker::{JobTracker, LogLevel};
use crate::services::tiler::{self, PlanGenerationError, PlanRequest, TileAllocator};

/// Process one raw notice payload in the background.
///
/// Designed to be spawned as a task; every step logs to the tracker. A
/// notice without a localization (retractions, duplicate deliveries)
/// completes after correlation. Plan-name collisions during the fan-out
/// mean the plan already exists for this event and are skipped, not
/// failures.
#[allow(clippy::too_many_arguments)]
pub async fn process_notice_async(
    job_id: String,
    tracker: JobTracker,
    repo: Arc<dyn FullRepository>,
    allocator: Arc<dyn TileAllocator>,
    notifier: Arc<dyn AlertNotifier>,
    client: reqwest::Client,
    config: Arc<AppConfig>,
    payload: String,
) -> Result<DateObs, String> {
    tracker.start_job(&job_id);
    tracker.log(&job_id, LogLevel::Info, "Correlating notice...");

    let outcome = match correlator::ingest_notice(repo.as_ref(), notifier.as_ref(), &payload)
        .await
    {
        Ok(outcome) => {
            tracker.log(
                &job_id,
                LogLevel::Success,
                format!("✓ Correlated to event {}", outcome.dateobs),
            );
            outcome
        }
        Err(e) => {
            let msg = format!("Failed to ingest notice: {}", e);
            tracker.fail_job(&job_id, &msg);
            return Err(msg);
        }
    };
    if outcome.alertable_edge {
        tracker.log(
            &job_id,
            LogLevel::Success,
            "✓ Alert-worthiness changed, notifier invoked",
        );
    }

    let Some(strategy) = outcome.acquisition else {
        let message = if outcome.notice_added {
            "Notice carries no localization; pipeline stops here"
        } else {
            "Duplicate delivery; nothing to do"
        };
        tracker.log(&job_id, LogLevel::Info, message);
        tracker.complete_job(
            &job_id,
            Some(serde_json::json!({ "dateobs": outcome.dateobs.to_string() })),
        );
        return Ok(outcome.dateobs);
    };

    let map_name = strategy.map_name();
    tracker.log(
        &job_id,
        LogLevel::Info,
        format!("Acquiring probability map '{}'...", map_name),
    );
    let policy = FetchPolicy::from(&config.acquisition);
    let map = match strategy
        .acquire(repo.as_ref(), &client, &policy, outcome.dateobs)
        .await
    {
        Ok(map) => {
            tracker.log(
                &job_id,
                LogLevel::Success,
                format!("✓ Map '{}' stored ({} tiles)", map.name, map.uniq.len()),
            );
            map
        }
        Err(e) => {
            let msg = format!("Map acquisition failed: {}", e);
            tracker.fail_job(&job_id, &msg);
            return Err(msg);
        }
    };

    let failures = fan_out(
        &job_id,
        &tracker,
        &repo,
        &allocator,
        &config,
        outcome.dateobs,
        &map.name,
    )
    .await;
    if failures > 0 {
        let msg = format!(
            "{} pipeline task(s) failed for {}",
            failures, outcome.dateobs
        );
        tracker.fail_job(&job_id, &msg);
        return Err(msg);
    }

    tracker.log(
        &job_id,
        LogLevel::Success,
        format!("✅ Pipeline complete for {}", outcome.dateobs),
    );
    tracker.complete_job(
        &job_id,
        Some(serde_json::json!({
            "dateobs": outcome.dateobs.to_string(),
            "localization": map.name,
            "telescopes": config.telescopes.len(),
        })),
    );
    Ok(outcome.dateobs)
}

/// Spawn contour extraction plus one plan generation per telescope and wait
/// for all of them. Returns the number of failed tasks.
async fn fan_out(
    job_id: &str,
    tracker: &JobTracker,
    repo: &Arc<dyn FullRepository>,
    allocator: &Arc<dyn TileAllocator>,
    config: &Arc<AppConfig>,
    dateobs: DateObs,
    map_name: &str,
) -> usize {
    let mut handles = Vec::with_capacity(1 + config.telescopes.len());

    {
        let repo = Arc::clone(repo);
        let tracker = tracker.clone();
        let job_id = job_id.to_string();
        let map_name = map_name.to_string();
        handles.push(tokio::spawn(async move {
            match contour::compute_contour(repo.as_ref(), dateobs, &map_name).await {
                Ok(collection) => {
                    tracker.log(
                        &job_id,
                        LogLevel::Success,
                        format!("✓ Contour ready ({} features)", collection.features.len()),
                    );
                    true
                }
                Err(e) => {
                    tracker.log(
                        &job_id,
                        LogLevel::Error,
                        format!("Contour extraction failed: {}", e),
                    );
                    false
                }
            }
        }));
    }

    for telescope in &config.telescopes {
        let repo = Arc::clone(repo);
        let allocator = Arc::clone(allocator);
        let config = Arc::clone(config);
        let tracker = tracker.clone();
        let job_id = job_id.to_string();
        let map_name = map_name.to_string();
        let name = telescope.name.clone();
        handles.push(tokio::spawn(async move {
            let request = PlanRequest::new(dateobs, &name, &map_name);
            match tiler::generate_plan(
                repo.as_ref(),
                allocator.as_ref(),
                config.as_ref(),
                request,
            )
            .await
            {
                Ok(plan) => {
                    tracker.log(
                        &job_id,
                        LogLevel::Success,
                        format!(
                            "✓ {}: plan '{}' ready ({} observations)",
                            name,
                            plan.plan_name,
                            plan.num_observations()
                        ),
                    );
                    true
                }
                Err(PlanGenerationError::Repository(
                    RepositoryError::ValidationError { .. },
                )) => {
                    tracker.log(
                        &job_id,
                        LogLevel::Warning,
                        format!("{}: plan already exists, skipping", name),
                    );
                    true
                }
                Err(e) => {
                    tracker.log(
                        &job_id,
                        LogLevel::Error,
                        format!("{}: plan generation failed: {}", name, e),
                    );
                    false
                }
            }
        }));
    }

    let mut failures = 0;
    for handle in handles {
        match handle.await {
            Ok(true) => {}
            Ok(false) => failures += 1,
            Err(e) => {
                failures += 1;
                tracker.log(job_id, LogLevel::Error, format!("Task panicked: {}", e));
            }
        }
    }
    failures
}

/// Acquire one probability map in the background, for explicit acquisition
/// requests outside the notice pipeline.
pub async fn acquire_map_async(
    job_id: String,
    tracker: JobTracker,
    repo: Arc<dyn FullRepository>,
    client: reqwest::Client,
    config: Arc<AppConfig>,
    dateobs: DateObs,
    strategy: MapAcquisition,
) -> Result<String, String> {
    tracker.start_job(&job_id);
    let map_name = strategy.map_name();
    tracker.log(
        &job_id,
        LogLevel::Info,
        format!("Acquiring probability map '{}'...", map_name),
    );
    let policy = FetchPolicy::from(&config.acquisition);
    match strategy
        .acquire(repo.as_ref(), &client, &policy, dateobs)
        .await
    {
        Ok(map) => {
            tracker.log(
                &job_id,
                LogLevel::Success,
                format!("✓ Map '{}' stored ({} tiles)", map.name, map.uniq.len()),
            );
            tracker.complete_job(
                &job_id,
                Some(serde_json::json!({
                    "dateobs": dateobs.to_string(),
                    "localization": map.name,
                })),
            );
            Ok(map.name)
        }
        Err(e) => {
            let msg = format!("Map acquisition failed: {}", e);
            tracker.fail_job(&job_id, &msg);
            Err(msg)
        }
    }
}

/// Generate one plan in the background, for explicit plan requests. Unlike
/// the notice fan-out, a name collision here is the caller's mistake and
/// fails the job.
pub async fn generate_plan_async(
    job_id: String,
    tracker: JobTracker,
    repo: Arc<dyn FullRepository>,
    allocator: Arc<dyn TileAllocator>,
    config: Arc<AppConfig>,
    request: PlanRequest,
) -> Result<String, String> {
    tracker.start_job(&job_id);
    tracker.log(
        &job_id,
        LogLevel::Info,
        format!(
            "Generating plan for {} from map '{}'...",
            request.telescope, request.map_name
        ),
    );
    match tiler::generate_plan(repo.as_ref(), allocator.as_ref(), config.as_ref(), request)
        .await
    {
        Ok(plan) => {
            tracker.log(
                &job_id,
                LogLevel::Success,
                format!(
                    "✓ Plan '{}' ready ({} observations, {:.0} s total)",
                    plan.plan_name,
                    plan.num_observations(),
                    plan.tot_time_with_overheads()
                ),
            );
            tracker.complete_job(
                &job_id,
                Some(serde_json::json!({
                    "dateobs": plan.dateobs.to_string(),
                    "telescope": plan.telescope,
                    "plan_name": plan.plan_name,
                    "num_observations": plan.num_observations(),
                })),
            );
            Ok(plan.plan_name)
        }
        Err(e) => {
            let msg = format!("Plan generation failed: {}", e);
            tracker.fail_job(&job_id, &msg);
            Err(msg)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::NoopNotifier;
    use crate::db::{LocalRepository, LocalizationRepository, PlanRepository};
    use crate::services::job_tracker::JobStatus;
    use crate::services::tiler::GreedyAllocator;

    fn fermi_payload(serial: u32, ra: f64) -> String {
        format!(
            r#"<VOEvent ivorn="ivo://nasa.gsfc.gcn/Fermi#GBM_Flt_Pos_{serial}">
  <Who><Date>2018-01-16T00:4{serial}:03</Date></Who>
  <What>
    <Param name="Packet_Type" value="111"/>
    <Param name="Long_short" value="Short"/>
  </What>
  <WhereWhen><ObsDataLocation><ObservationLocation>
    <AstroCoords coord_system_id="UTC-FK5-GEO">
      <Time><TimeInstant><ISOTime>2018-01-16T00:36:52.81</ISOTime></TimeInstant></Time>
      <Position2D><Value2><C1>{ra}</C1><C2>10.12</C2></Value2><Error2Radius>5.47</Error2Radius></Position2D>
    </AstroCoords>
  </ObservationLocation></ObsDataLocation></WhereWhen>
</VOEvent>"#
        )
    }

    const LVC_RETRACTION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<voe:VOEvent xmlns:voe="http://www.ivoa.net/xml/VOEvent/v2.0" version="2.0"
    role="observation" ivorn="ivo://gwnet/LVC#S190425z-3-Retraction">
  <Who><Date>2019-04-25T09:00:00</Date></Who>
  <What>
    <Param name="Packet_Type" value="164"/>
    <Param name="Retraction" value="1"/>
  </What>
  <WhereWhen>
    <ObsDataLocation><ObservationLocation>
      <AstroCoords coord_system_id="UTC-FK5-GEO">
        <Time unit="s"><TimeInstant><ISOTime>2019-04-25T08:18:05.017147</ISOTime></TimeInstant></Time>
      </AstroCoords>
    </ObservationLocation></ObsDataLocation>
  </WhereWhen>
</voe:VOEvent>"#;

    /// One-telescope configuration so the fan-out stays small.
    fn gattini_only() -> Arc<AppConfig> {
        let mut config = AppConfig::default();
        config.telescopes.retain(|t| t.name == "Gattini");
        Arc::new(config)
    }

    struct Runner {
        tracker: JobTracker,
        repo: Arc<dyn FullRepository>,
        allocator: Arc<dyn TileAllocator>,
        notifier: Arc<dyn AlertNotifier>,
        client: reqwest::Client,
        config: Arc<AppConfig>,
    }

    impl Runner {
        fn new(config: Arc<AppConfig>) -> Self {
            Self {
                tracker: JobTracker::new(),
                repo: Arc::new(LocalRepository::new()),
                allocator: Arc::new(GreedyAllocator),
                notifier: Arc::new(NoopNotifier),
                client: reqwest::Client::new(),
                config,
            }
        }

        async fn run(&self, payload: &str) -> (String, Result<DateObs, String>) {
            let job_id = self.tracker.create_job();
            let result = process_notice_async(
                job_id.clone(),
                self.tracker.clone(),
                Arc::clone(&self.repo),
                Arc::clone(&self.allocator),
                Arc::clone(&self.notifier),
                self.client.clone(),
                Arc::clone(&self.config),
                payload.to_string(),
            )
            .await;
            (job_id, result)
        }
    }

    #[tokio::test]
    async fn cone_notice_runs_acquisition_and_fanout() {
        let runner = Runner::new(gattini_only());
        let (job_id, result) = runner.run(&fermi_payload(1, 30.65)).await;
        let dateobs = result.unwrap();

        let job = runner.tracker.get_job(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.unwrap()["dateobs"], dateobs.to_string());

        let maps = runner.repo.list_localizations(dateobs).await.unwrap();
        assert_eq!(maps.len(), 1);
        // Fan-out attached the contour and produced one plan per telescope.
        let stored = runner
            .repo
            .get_localization(dateobs, &maps[0].name)
            .await
            .unwrap();
        assert!(stored.contour.is_some());
        let plans = runner.repo.list_plans(dateobs).await.unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].telescope, "Gattini");
    }

    #[tokio::test]
    async fn retraction_completes_without_fanout() {
        let runner = Runner::new(gattini_only());
        let (job_id, result) = runner.run(LVC_RETRACTION).await;
        let dateobs = result.unwrap();

        let job = runner.tracker.get_job(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(runner
            .repo
            .list_localizations(dateobs)
            .await
            .unwrap()
            .is_empty());
        assert!(runner.repo.list_plans(dateobs).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_delivery_is_a_cheap_noop() {
        let runner = Runner::new(gattini_only());
        let payload = fermi_payload(1, 30.65);
        runner.run(&payload).await.1.unwrap();
        let (job_id, result) = runner.run(&payload).await;
        let dateobs = result.unwrap();

        let job = runner.tracker.get_job(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job
            .logs
            .iter()
            .any(|l| l.message.contains("Duplicate delivery")));
        assert_eq!(
            runner.repo.list_localizations(dateobs).await.unwrap().len(),
            1
        );
        assert_eq!(runner.repo.list_plans(dateobs).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn existing_plan_is_skipped_not_failed() {
        let runner = Runner::new(gattini_only());
        runner.run(&fermi_payload(1, 30.65)).await.1.unwrap();
        // Second notice for the same event, updated position: new map, same
        // default plan name.
        let (job_id, result) = runner.run(&fermi_payload(2, 30.66)).await;
        let dateobs = result.unwrap();

        let job = runner.tracker.get_job(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job
            .logs
            .iter()
            .any(|l| l.message.contains("already exists")));
        assert_eq!(
            runner.repo.list_localizations(dateobs).await.unwrap().len(),
            2
        );
        assert_eq!(runner.repo.list_plans(dateobs).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unparseable_payload_fails_the_job() {
        let runner = Runner::new(gattini_only());
        let (job_id, result) = runner.run("this is not xml").await;
        assert!(result.is_err());
        let job = runner.tracker.get_job(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }
}
