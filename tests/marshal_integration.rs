//! End-to-end flows through the public library API: notice ingestion,
//! map acquisition, contouring, plan generation and backend submission
//! against the in-memory repository.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use too_marshal::api::FlatExposure;
use too_marshal::config::AppConfig;
use too_marshal::correlator::{ingest_notice, AlertNotifier, NoopNotifier};
use too_marshal::db::{
    EventRepository, FieldRepository, LocalRepository, LocalizationRepository,
};
use too_marshal::models::telescope::fields_from_tessellation;
use too_marshal::models::{Event, PlanStatus, WORKING_ORDER};
use too_marshal::services::{
    compute_contour, export_plan, generate_plan, submit_plan, FetchPolicy, GreedyAllocator,
    PlanRequest,
};

const FLIGHT_POSITION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<voe:VOEvent xmlns:voe="http://www.ivoa.net/xml/VOEvent/v2.0" version="2.0"
    role="observation" ivorn="ivo://nasa.gsfc.gcn/Fermi#GBM_Flt_Pos_2018-01-16T00-36-52.81_537755817_57-431">
  <Who><Date>2018-01-16T00:38:12</Date></Who>
  <What>
    <Param name="Packet_Type" value="111"/>
    <Param name="Long_short" value="Short"/>
  </What>
  <WhereWhen><ObsDataLocation><ObservationLocation>
    <AstroCoords coord_system_id="UTC-FK5-GEO">
      <Time unit="s"><TimeInstant><ISOTime>2018-01-16T00:36:52.81</ISOTime></TimeInstant></Time>
      <Position2D unit="deg">
        <Value2><C1>30.6500</C1><C2>10.1200</C2></Value2>
        <Error2Radius>5.4700</Error2Radius>
      </Position2D>
    </AstroCoords>
  </ObservationLocation></ObsDataLocation></WhereWhen>
</voe:VOEvent>"#;

const GROUND_POSITION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<voe:VOEvent xmlns:voe="http://www.ivoa.net/xml/VOEvent/v2.0" version="2.0"
    role="observation" ivorn="ivo://nasa.gsfc.gcn/Fermi#GBM_Gnd_Pos_2018-01-16T00-36-52.81_537755817_1-539">
  <Who><Date>2018-01-16T00:52:47</Date></Who>
  <What>
    <Param name="Packet_Type" value="112"/>
  </What>
  <WhereWhen><ObsDataLocation><ObservationLocation>
    <AstroCoords coord_system_id="UTC-FK5-GEO">
      <Time unit="s"><TimeInstant><ISOTime>2018-01-16T00:36:52.81</ISOTime></TimeInstant></Time>
      <Position2D unit="deg">
        <Value2><C1>30.2100</C1><C2>9.8800</C2></Value2>
        <Error2Radius>3.1200</Error2Radius>
      </Position2D>
    </AstroCoords>
  </ObservationLocation></ObsDataLocation></WhereWhen>
</voe:VOEvent>"#;

fn test_config(data_dir: &std::path::Path) -> AppConfig {
    AppConfig {
        data_dir: data_dir.to_path_buf(),
        ..AppConfig::default()
    }
}

/// 3x3 Gattini grid covering the burst's credible region.
async fn seed_gattini_grid(repo: &LocalRepository, config: &AppConfig) {
    let telescope = config.telescope("Gattini").unwrap();
    let rows: Vec<(i64, f64, f64)> = (0..9)
        .map(|i| {
            (
                i + 1,
                26.0 + (i % 3) as f64 * 4.5,
                5.5 + (i / 3) as f64 * 4.5,
            )
        })
        .collect();
    let fields = fields_from_tessellation(telescope, &rows, WORKING_ORDER);
    repo.merge_fields(&fields).await.unwrap();
}

#[tokio::test]
async fn notice_to_submitted_plan_full_flow() {
    let repo = LocalRepository::new();
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let client = reqwest::Client::new();

    // Ingest: correlate and tag. A short GRB is alert-worthy.
    let outcome = ingest_notice(&repo, &NoopNotifier, FLIGHT_POSITION)
        .await
        .unwrap();
    let dateobs = outcome.dateobs;
    assert_eq!(dateobs.to_string(), "2018-01-16T00:36:53");
    assert!(outcome.notice_added);
    assert!(outcome.alertable_edge);
    let event = repo.get_event(dateobs).await.unwrap();
    assert!(event.tags.contains("Fermi"));
    assert!(event.tags.contains("short"));

    // Acquire: the flight position has no map URL, so the error cone is
    // synthesized into a probability map.
    let strategy = outcome.acquisition.expect("position notice yields a strategy");
    let policy = FetchPolicy::from(&config.acquisition);
    let map = strategy
        .acquire(&repo, &client, &policy, dateobs)
        .await
        .unwrap();
    assert!(!map.uniq.is_empty());
    let flat = map.flatten(WORKING_ORDER);
    let total: f64 = flat.iter().sum();
    assert!((total - 1.0).abs() < 1e-6, "map should stay normalized");

    // Contour: computed on demand, cached on the stored row.
    let contour = compute_contour(&repo, dateobs, &map.name).await.unwrap();
    assert!(!contour.features.is_empty());
    let stored = repo.get_localization(dateobs, &map.name).await.unwrap();
    assert!(stored.contour.is_some());

    // Plan: greedy tiling over the seeded grid reaches READY.
    seed_gattini_grid(&repo, &config).await;
    let plan = generate_plan(
        &repo,
        &GreedyAllocator,
        &config,
        PlanRequest::new(dateobs, "Gattini", &map.name),
    )
    .await
    .unwrap();
    assert_eq!(plan.status, PlanStatus::Ready);
    assert_eq!(plan.plan_name, "J_greedy_0_0_block_300_90");
    assert!(plan.num_observations() > 0);

    // Export: queue wire format with the campaign naming conventions.
    let export = export_plan(&repo, &config, dateobs, "Gattini", &plan.plan_name)
        .await
        .unwrap();
    assert!(export
        .queue_name
        .starts_with("ToO_2018-01-16-00:36:53_J_greedy_0_0_block_300_90_"));
    assert_eq!(export.targets.len(), plan.num_observations());
    assert!(export.validity_window_mjd[0] < export.validity_window_mjd[1]);
    for target in &export.targets {
        assert_eq!(target.program_id, 2);
        assert_eq!(target.filter_id, 5); // J
        assert_eq!(target.subprogram_name, "ToO_Fermi_2018-01-16-00:36:53");
        assert_eq!(target.program_pi, "Kasliwal");
    }

    // Submit: Gattini is a JSON file drop. The plan advances to SUBMITTED
    // and one file per plan lands under the data directory.
    let submitted = submit_plan(&repo, &client, &config, dateobs, "Gattini", &plan.plan_name)
        .await
        .unwrap();
    assert_eq!(submitted.status, PlanStatus::Submitted);
    let drop = tmp
        .path()
        .join("gattini")
        .join(format!("{}.json", plan.queue_name()));
    let body = std::fs::read_to_string(&drop).unwrap();
    let rows: Vec<FlatExposure> = serde_json::from_str(&body).unwrap();
    assert_eq!(rows.len(), plan.num_observations());
}

#[tokio::test]
async fn followup_notices_accrete_to_one_event() {
    let repo = LocalRepository::new();

    let first = ingest_notice(&repo, &NoopNotifier, FLIGHT_POSITION)
        .await
        .unwrap();
    let second = ingest_notice(&repo, &NoopNotifier, GROUND_POSITION)
        .await
        .unwrap();

    // Same trigger time, same event.
    assert_eq!(first.dateobs, second.dateobs);
    assert!(second.notice_added);
    // The refined position supersedes the flight one as a new map, not a
    // new event.
    assert!(second.acquisition.is_some());

    let events = repo.list_events().await.unwrap();
    assert_eq!(events.len(), 1);
    let event = repo.get_event(first.dateobs).await.unwrap();
    assert_eq!(event.gcn_notices.len(), 2);
    // Notices are kept in message-date order.
    assert!(event.gcn_notices[0].date < event.gcn_notices[1].date);
}

#[tokio::test]
async fn duplicate_delivery_changes_nothing() {
    let repo = LocalRepository::new();

    ingest_notice(&repo, &NoopNotifier, FLIGHT_POSITION)
        .await
        .unwrap();
    let replay = ingest_notice(&repo, &NoopNotifier, FLIGHT_POSITION)
        .await
        .unwrap();

    assert!(!replay.notice_added);
    assert!(!replay.tags_changed);
    assert!(replay.acquisition.is_none());
    let event = repo.get_event(replay.dateobs).await.unwrap();
    assert_eq!(event.gcn_notices.len(), 1);
}

struct CountingNotifier {
    calls: AtomicUsize,
}

#[async_trait]
impl AlertNotifier for CountingNotifier {
    async fn notify(&self, _event: &Event) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

const RECLASSIFIED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<voe:VOEvent xmlns:voe="http://www.ivoa.net/xml/VOEvent/v2.0" version="2.0"
    role="observation" ivorn="ivo://nasa.gsfc.gcn/Fermi#GBM_Fin_Pos_2018-01-16T00-36-52.81_537755817_0-120">
  <Who><Date>2018-01-16T01:44:09</Date></Who>
  <What>
    <Param name="Packet_Type" value="115"/>
  </What>
  <WhereWhen><ObsDataLocation><ObservationLocation>
    <AstroCoords coord_system_id="UTC-FK5-GEO">
      <Time unit="s"><TimeInstant><ISOTime>2018-01-16T00:36:52.81</ISOTime></TimeInstant></Time>
      <Position2D unit="deg">
        <Value2><C1>30.3300</C1><C2>9.9500</C2></Value2>
        <Error2Radius>2.0100</Error2Radius>
      </Position2D>
    </AstroCoords>
  </ObservationLocation></ObsDataLocation></WhereWhen>
  <Why>
    <Inference probability="0.9">
      <Concept>process.variation.trans;em.gamma</Concept>
    </Inference>
  </Why>
</voe:VOEvent>"#;

#[tokio::test]
async fn alert_edges_fire_on_gain_and_on_loss() {
    let repo = LocalRepository::new();
    let notifier = CountingNotifier {
        calls: AtomicUsize::new(0),
    };

    // Gaining the "short" tag crosses into alert-worthy.
    ingest_notice(&repo, &notifier, FLIGHT_POSITION).await.unwrap();
    assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);

    // A follow-up that adds nothing new does not re-notify.
    ingest_notice(&repo, &notifier, GROUND_POSITION).await.unwrap();
    assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);

    // Reclassification as a non-burst transient vetoes follow-up; losing
    // alert-worthiness is an edge too.
    ingest_notice(&repo, &notifier, RECLASSIFIED).await.unwrap();
    assert_eq!(notifier.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn reacquiring_a_map_returns_the_stored_row() {
    let repo = LocalRepository::new();
    let config = AppConfig::default();
    let client = reqwest::Client::new();
    let policy = FetchPolicy::from(&config.acquisition);

    let outcome = ingest_notice(&repo, &NoopNotifier, FLIGHT_POSITION)
        .await
        .unwrap();
    let strategy = outcome.acquisition.unwrap();

    let first = strategy
        .acquire(&repo, &client, &policy, outcome.dateobs)
        .await
        .unwrap();
    let again = strategy
        .acquire(&repo, &client, &policy, outcome.dateobs)
        .await
        .unwrap();

    assert_eq!(first.name, again.name);
    assert_eq!(
        repo.list_localizations(outcome.dateobs).await.unwrap().len(),
        1
    );
}
