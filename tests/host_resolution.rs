mod common;

use common::{make_test_job, make_test_settings};
use vice_exposer::controller::{expired_external_ids, find_by_host, with_time_limit};
use vice_exposer::labels;
use vice_exposer::listing::{deployment_info, ingress_info, service_info};
use vice_exposer::resources::{deployment, ingress, service};

// ══════════════════════════════════════════════════════════════════
// Host reverse-lookup and projection pipeline (no cluster required)
//
// Each test builds real objects for one or more jobs and drives the
// read side: host → deployment → projected view.
// ══════════════════════════════════════════════════════════════════

#[test]
fn test_host_resolves_back_to_owning_deployment() {
    let settings = make_test_settings();
    let deployments: Vec<_> = [("abc123", "u1"), ("def456", "u2"), ("ghi789", "u3")]
        .iter()
        .map(|(id, user)| {
            deployment::deployment(&make_test_job(id, user, "demo:1.0", 8888), &settings).unwrap()
        })
        .collect();

    let host = labels::subdomain("u2", "def456");
    let found = find_by_host(&deployments, &host).unwrap();
    assert_eq!(found.metadata.name.as_deref(), Some("def456"));

    assert!(find_by_host(&deployments, "a000000000").is_none());
}

#[test]
fn test_projection_pipeline_for_one_analysis() {
    let settings = make_test_settings();
    let job = make_test_job("abc123", "u1", "demo:1.0", 8888);

    let dep = deployment::deployment(&job, &settings).unwrap();
    let svc = service::service(&job);
    let ing = ingress::ingress(&job, &svc).unwrap();

    let dep_view = deployment_info(&dep);
    assert_eq!(dep_view.meta.external_id, "abc123");
    assert_eq!(dep_view.meta.username, "ipcdev");
    assert_eq!(dep_view.image, "demo:1.0");
    assert_eq!(dep_view.port, Some(8888));

    let svc_view = service_info(&svc);
    let names: Vec<_> = svc_view
        .ports
        .iter()
        .filter_map(|p| p.name.clone())
        .collect();
    assert!(names.contains(&"tcp-proxy".to_string()));
    assert!(names.contains(&"tcp-input".to_string()));

    let ing_view = ingress_info(&ing);
    assert_eq!(ing_view.default_backend, "abc123:tcp-proxy");
    assert_eq!(
        ing_view.rules[0].host.as_deref(),
        Some(labels::subdomain("u1", "abc123").as_str())
    );
}

#[test]
fn test_time_limit_sweep_picks_only_expired_analyses() {
    let settings = make_test_settings();

    let mut expired = deployment::deployment(
        &make_test_job("old-analysis", "u1", "demo:1.0", 8888),
        &settings,
    )
    .unwrap();
    with_time_limit(&mut expired, 1_000);

    let mut alive = deployment::deployment(
        &make_test_job("new-analysis", "u1", "demo:1.0", 8888),
        &settings,
    )
    .unwrap();
    with_time_limit(&mut alive, i64::MAX);

    let ids = expired_external_ids(&[expired, alive], 2_000);
    assert_eq!(ids, vec!["old-analysis"]);
}
