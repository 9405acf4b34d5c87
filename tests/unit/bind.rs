//! Unit tests for Bind fan-out, status merge and deletion ordering

use std::collections::HashMap;
use std::time::Duration;

use kube::ResourceExt;

use lbcf_operator::controller::bind::{merge_statuses, plan_targets};
use lbcf_operator::controller::conditions::{condition_types, is_condition_true};
use lbcf_operator::controller::{SyncResult, reconcile_backend_record, reconcile_bind};
use lbcf_operator::crd::{
    Bind, BindStatus, FINALIZER_DELETE_LB, LABEL_BIND, LABEL_LB_NAME, TargetLoadBalancerStatus,
};
use lbcf_operator::store::{ObjectStore, has_finalizer};

use crate::common::*;

const BIND: &str = "web";

fn web_bind(targets: &[&str]) -> Bind {
    bind(
        BIND,
        targets.iter().map(|t| target(t)).collect(),
        &[("app", "web")],
        &[80],
    )
}

fn seed_pods(env: &TestEnv) {
    env.seed_pod(pod("web-1", &[("app", "web")], Some("10.1.0.1")));
    env.seed_pod(pod("web-2", &[("app", "web")], Some("10.1.0.2")));
}

async fn reconcile(env: &TestEnv) -> SyncResult {
    reconcile_bind(&env.ctx, NAMESPACE, BIND).await.unwrap()
}

async fn sync_records(env: &TestEnv) {
    for record in env.records() {
        reconcile_backend_record(&env.ctx, NAMESPACE, &record.name_any())
            .await
            .unwrap();
    }
}

fn target_status(env: &TestEnv, name: &str) -> Option<TargetLoadBalancerStatus> {
    env.bind(BIND)?.status?.target(name).cloned()
}

fn records_for(env: &TestEnv, lb: &str) -> usize {
    env.records()
        .iter()
        .filter(|r| r.labels().get(LABEL_LB_NAME).map(String::as_str) == Some(lb))
        .count()
}

mod plan_tests {
    use super::*;

    fn entry(name: &str) -> TargetLoadBalancerStatus {
        TargetLoadBalancerStatus {
            name: name.to_string(),
            driver: DRIVER.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_adds_new_and_flags_removed_targets() {
        let mut bind = web_bind(&["lb-1", "lb-2"]);
        bind.status = Some(BindStatus {
            load_balancer_statuses: vec![entry("lb-1"), entry("lb-old")],
        });

        let planned = plan_targets(&bind);
        let flags: Vec<(String, bool)> = planned
            .iter()
            .map(|e| (e.name.clone(), e.deleting))
            .collect();
        assert_eq!(
            flags,
            vec![
                ("lb-1".to_string(), false),
                ("lb-2".to_string(), false),
                ("lb-old".to_string(), true),
            ]
        );
        assert_eq!(planned[1].spec, target("lb-2").spec);
    }

    #[test]
    fn test_deleting_bind_flags_every_target() {
        let mut bind = web_bind(&["lb-1", "lb-2"]);
        bind.metadata.deletion_timestamp =
            serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z")).unwrap();
        assert!(plan_targets(&bind).iter().all(|e| e.deleting));
    }

    #[test]
    fn test_readded_target_stops_deleting() {
        let mut bind = web_bind(&["lb-1", "lb-2"]);
        let mut readded = entry("lb-1");
        readded.spec = target("lb-1").spec;
        readded.deleting = true;
        let mut respecced = entry("lb-2");
        respecced.deleting = true;
        respecced.spec = string_map(&[("vip", "10.9.9.9")]);
        bind.status = Some(BindStatus {
            load_balancer_statuses: vec![readded, respecced],
        });

        let planned = plan_targets(&bind);
        assert_eq!(planned.len(), 2);
        assert!(!planned[0].deleting);
        assert!(planned[1].deleting);

        bind.metadata.deletion_timestamp =
            serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z")).unwrap();
        assert!(plan_targets(&bind).iter().all(|e| e.deleting));
    }

    #[test]
    fn test_merge_carries_entries_without_outcome() {
        let planned = vec![entry("lb-1"), entry("lb-2")];
        let status = merge_statuses(planned, &HashMap::new());
        assert_eq!(status.load_balancer_statuses.len(), 2);
    }
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_targets_are_created_and_backends_attached() {
        let env = TestEnv::new();
        seed_pods(&env);
        env.seed_bind(web_bind(&["lb-1", "lb-2"]));

        let result = reconcile(&env).await;
        assert!(result.is_finished());

        let bind = env.bind(BIND).unwrap();
        assert!(has_finalizer(&bind, FINALIZER_DELETE_LB));
        let status = bind.status.unwrap();
        assert_eq!(status.load_balancer_statuses.len(), 2);
        for entry in &status.load_balancer_statuses {
            assert!(is_condition_true(&entry.state.conditions, condition_types::CREATED));
            assert!(!entry.deleting);
        }

        let creates = env.driver.calls("createLoadBalancer");
        assert_eq!(creates.len(), 2);
        let mut ids: Vec<String> = creates
            .iter()
            .map(|c| c.body["recordID"].as_str().unwrap().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["default/web/lb-1", "default/web/lb-2"]);

        // 2 targets x 2 pods x 1 port
        let records = env.records();
        assert_eq!(records.len(), 4);
        assert!(
            records
                .iter()
                .all(|r| r.labels().get(LABEL_BIND).map(String::as_str) == Some(BIND))
        );
        assert_eq!(records_for(&env, "lb-1"), 2);
    }

    #[tokio::test]
    async fn test_records_carry_target_info_and_attributes() {
        let env = TestEnv::new();
        seed_pods(&env);
        let mut bind = web_bind(&["lb-1"]);
        bind.spec.load_balancers[0].attributes = string_map(&[("listener", "443")]);
        bind.spec.parameters = string_map(&[("weight", "5")]);
        env.seed_bind(bind);

        reconcile(&env).await;

        let record = &env.records()[0];
        assert_eq!(record.spec.lb_name, "lb-1");
        assert_eq!(record.spec.lb_driver, DRIVER);
        assert_eq!(record.spec.lb_info["lbID"], "lb-default/web/lb-1");
        assert_eq!(record.spec.lb_attributes["listener"], "443");
        assert_eq!(record.spec.parameters["weight"], "5");
    }

    #[tokio::test]
    async fn test_failed_target_gets_no_backends() {
        let env = TestEnv::new();
        seed_pods(&env);
        env.seed_bind(web_bind(&["lb-1"]));
        env.driver
            .push("createLoadBalancer", Reply::json(fail("no capacity", 90)));

        let result = reconcile(&env).await;
        assert_eq!(
            result,
            SyncResult::failed_after("no capacity", Duration::from_secs(90))
        );
        let entry = target_status(&env, "lb-1").unwrap();
        assert!(!is_condition_true(&entry.state.conditions, condition_types::CREATED));
        assert!(entry.state.retry_after.is_some());
        assert!(env.records().is_empty());

        // a later success attaches the backends
        assert!(reconcile(&env).await.is_finished());
        assert_eq!(env.records().len(), 2);
    }

    #[tokio::test]
    async fn test_results_of_targets_are_merged() {
        let env = TestEnv::new();
        seed_pods(&env);
        env.seed_bind(web_bind(&["lb-1", "lb-2"]));
        env.driver
            .push("createLoadBalancer", Reply::json(running("provisioning", 20)));

        let result = reconcile(&env).await;
        assert_eq!(result, SyncResult::running(Duration::from_secs(20)));

        let created = env
            .bind(BIND)
            .unwrap()
            .status
            .unwrap()
            .load_balancer_statuses
            .iter()
            .filter(|e| is_condition_true(&e.state.conditions, condition_types::CREATED))
            .count();
        assert_eq!(created, 1);
        assert_eq!(env.records().len(), 2);
    }

    #[tokio::test]
    async fn test_new_pod_gets_attached() {
        let env = TestEnv::new();
        seed_pods(&env);
        env.seed_bind(web_bind(&["lb-1"]));
        reconcile(&env).await;
        assert_eq!(env.records().len(), 2);

        env.seed_pod(pod("web-3", &[("app", "web")], Some("10.1.0.3")));
        reconcile(&env).await;
        assert_eq!(env.records().len(), 3);
        assert_eq!(env.driver.call_count("createLoadBalancer"), 1);
    }

    #[tokio::test]
    async fn test_attribute_change_reaches_driver_and_records() {
        let env = TestEnv::new();
        seed_pods(&env);
        env.seed_bind(web_bind(&["lb-1"]));
        reconcile(&env).await;

        let mut bind = env.bind(BIND).unwrap();
        bind.spec.load_balancers[0].attributes = string_map(&[("listener", "8443")]);
        env.binds.replace(&bind).await.unwrap();
        reconcile(&env).await;

        let ensure = env.driver.calls("ensureLoadBalancer");
        assert_eq!(ensure.len(), 1);
        assert_eq!(ensure[0].body["attributes"]["listener"], "8443");
        assert!(
            env.records()
                .iter()
                .all(|r| r.spec.lb_attributes.get("listener").map(String::as_str) == Some("8443"))
        );
    }
}

mod deletion_tests {
    use super::*;

    #[tokio::test]
    async fn test_removed_target_is_deleted_after_its_backends() {
        let env = TestEnv::new();
        seed_pods(&env);
        env.seed_bind(web_bind(&["lb-1", "lb-2"]));
        reconcile(&env).await;
        sync_records(&env).await;

        let mut bind = env.bind(BIND).unwrap();
        bind.spec.load_balancers.retain(|t| t.name == "lb-1");
        env.binds.replace(&bind).await.unwrap();

        let result = reconcile(&env).await;
        assert!(result.is_running());
        assert_eq!(env.driver.call_count("deleteLoadBalancer"), 0);
        assert!(target_status(&env, "lb-2").unwrap().deleting);
        assert!(
            env.records()
                .iter()
                .filter(|r| r.spec.lb_name == "lb-2")
                .all(|r| r.metadata.deletion_timestamp.is_some())
        );

        sync_records(&env).await;
        assert_eq!(records_for(&env, "lb-2"), 0);
        assert_eq!(env.driver.call_count("deregisterBackend"), 2);

        let result = reconcile(&env).await;
        assert!(result.is_finished());
        let deletes = env.driver.calls("deleteLoadBalancer");
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].body["recordID"], "default/web/lb-2");
        assert!(target_status(&env, "lb-2").is_none());
        assert_eq!(records_for(&env, "lb-1"), 2);
    }

    #[tokio::test]
    async fn test_deleted_bind_releases_after_all_targets() {
        let env = TestEnv::new();
        seed_pods(&env);
        env.seed_bind(web_bind(&["lb-1", "lb-2"]));
        reconcile(&env).await;
        sync_records(&env).await;

        env.delete_bind(BIND).await;
        let result = reconcile(&env).await;
        assert!(result.is_running());
        assert!(env.bind(BIND).is_some());
        assert_eq!(env.driver.call_count("deleteLoadBalancer"), 0);

        sync_records(&env).await;
        assert!(env.records().is_empty());

        let result = reconcile(&env).await;
        assert!(result.is_finished());
        assert_eq!(env.driver.call_count("deleteLoadBalancer"), 2);
        assert!(env.bind(BIND).is_none());
    }

    #[tokio::test]
    async fn test_delete_failure_keeps_bind() {
        let env = TestEnv::new();
        seed_pods(&env);
        env.seed_bind(web_bind(&["lb-1"]));
        reconcile(&env).await;
        env.delete_bind(BIND).await;
        reconcile(&env).await;
        sync_records(&env).await;

        env.driver
            .push("deleteLoadBalancer", Reply::json(fail("locked", 30)));
        let result = reconcile(&env).await;
        assert!(result.is_failed());
        assert!(env.bind(BIND).is_some());
        assert!(target_status(&env, "lb-1").is_some());

        assert!(reconcile(&env).await.is_finished());
        assert!(env.bind(BIND).is_none());
    }
}
