//! Unit tests for the LoadBalancer lifecycle

use std::time::Duration;

use lbcf_operator::controller::conditions::{condition_types, find_condition, is_condition_true};
use lbcf_operator::controller::{SyncResult, reconcile_backend_group, reconcile_backend_record};
use lbcf_operator::controller::reconcile_load_balancer;
use lbcf_operator::crd::{ConditionStatus, EnsurePolicy, FINALIZER_DELETE_LB, LoadBalancer};
use lbcf_operator::driver::TransportError;
use lbcf_operator::store::{ObjectStore, has_finalizer};

use crate::common::*;

async fn reconcile(env: &TestEnv, name: &str) -> SyncResult {
    reconcile_load_balancer(&env.ctx, NAMESPACE, name)
        .await
        .unwrap()
}

async fn set_attributes(env: &TestEnv, name: &str, pairs: &[(&str, &str)]) -> LoadBalancer {
    let mut lb = env.lb(name).unwrap();
    lb.spec.attributes = string_map(pairs);
    env.load_balancers.replace(&lb).await.unwrap()
}

mod create_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_succ_marks_created_and_ready() {
        let env = TestEnv::new();
        env.seed_lb(load_balancer("lb-a"));

        let result = reconcile(&env, "lb-a").await;
        assert!(result.is_finished());

        let lb = env.lb("lb-a").unwrap();
        assert!(has_finalizer(&lb, FINALIZER_DELETE_LB));
        let status = lb.status.unwrap();
        assert!(is_condition_true(&status.conditions, condition_types::CREATED));
        assert!(is_condition_true(&status.conditions, condition_types::READY));
        assert_eq!(status.lb_info["lbID"], "lb-default/lb-a");
        assert!(status.retry_after.is_none());
        assert_eq!(env.driver.call_count("createLoadBalancer"), 1);
        assert!(env.events.reasons().contains(&"LoadBalancerCreated".to_string()));
    }

    #[tokio::test]
    async fn test_create_request_carries_ids_and_spec() {
        let env = TestEnv::new();
        env.seed_lb(load_balancer_with("lb-a", string_map(&[("tier", "web")]), None));

        reconcile(&env, "lb-a").await;
        reconcile(&env, "lb-a").await;

        let calls = env.driver.calls("createLoadBalancer");
        assert_eq!(calls.len(), 1);
        let body = &calls[0].body;
        assert_eq!(body["recordID"], "default/lb-a");
        assert!(body["retryID"].as_str().is_some_and(|id| !id.is_empty()));
        assert_eq!(body["lbSpec"]["vip"], "10.0.0.100");
        assert_eq!(body["attributes"]["tier"], "web");
    }

    #[tokio::test]
    async fn test_empty_lb_info_falls_back_to_spec() {
        let env = TestEnv::new();
        env.seed_lb(load_balancer("lb-a"));
        env.driver.push("createLoadBalancer", Reply::json(succ()));

        reconcile(&env, "lb-a").await;

        let status = env.lb("lb-a").unwrap().status.unwrap();
        assert_eq!(status.lb_info, string_map(&[("vip", "10.0.0.100")]));
    }

    #[tokio::test]
    async fn test_created_load_balancer_is_left_alone() {
        let env = TestEnv::new();
        env.seed_lb(load_balancer("lb-a"));

        reconcile(&env, "lb-a").await;
        let before = env.lb("lb-a").unwrap();
        let result = reconcile(&env, "lb-a").await;

        assert!(result.is_finished());
        assert_eq!(env.driver.total_calls(), 1);
        assert_eq!(
            env.lb("lb-a").unwrap().metadata.resource_version,
            before.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn test_create_running_then_succ() {
        let env = TestEnv::new();
        env.seed_lb(load_balancer("lb-a"));
        env.driver
            .push("createLoadBalancer", Reply::json(running("provisioning", 15)));

        let result = reconcile(&env, "lb-a").await;
        assert_eq!(result, SyncResult::running(Duration::from_secs(15)));

        let status = env.lb("lb-a").unwrap().status.unwrap();
        let created = find_condition(&status.conditions, condition_types::CREATED).unwrap();
        assert_eq!(created.status, ConditionStatus::False);
        assert_eq!(created.reason.as_deref(), Some("InProgress"));
        assert_eq!(created.message.as_deref(), Some("provisioning"));

        let result = reconcile(&env, "lb-a").await;
        assert!(result.is_finished());
        let status = env.lb("lb-a").unwrap().status.unwrap();
        assert!(is_condition_true(&status.conditions, condition_types::CREATED));
        assert_eq!(env.driver.call_count("createLoadBalancer"), 2);
    }

    #[tokio::test]
    async fn test_create_fail_records_retry_floor() {
        let env = TestEnv::new();
        env.seed_lb(load_balancer("lb-a"));
        env.driver
            .push("createLoadBalancer", Reply::json(fail("quota exceeded", 60)));

        let result = reconcile(&env, "lb-a").await;
        assert_eq!(
            result,
            SyncResult::failed_after("quota exceeded", Duration::from_secs(60))
        );

        let status = env.lb("lb-a").unwrap().status.unwrap();
        let created = find_condition(&status.conditions, condition_types::CREATED).unwrap();
        assert_eq!(created.status, ConditionStatus::False);
        assert_eq!(created.reason.as_deref(), Some("CreateFailed"));
        assert!(status.retry_after.is_some());

        let warnings = env.events.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].reason, "DriverFailed");
        assert_eq!(warnings[0].note.as_deref(), Some("quota exceeded"));
    }

    #[tokio::test]
    async fn test_fail_without_interval_uses_default() {
        let env = TestEnv::new();
        env.seed_lb(load_balancer("lb-a"));
        env.driver
            .push("createLoadBalancer", Reply::json(fail("later", 0)));

        let result = reconcile(&env, "lb-a").await;
        assert_eq!(
            result,
            SyncResult::failed_after("later", Duration::from_secs(10))
        );
    }

    #[tokio::test]
    async fn test_transport_error_leaves_status_untouched() {
        let env = TestEnv::new();
        env.seed_lb(load_balancer("lb-a"));
        env.driver.push(
            "createLoadBalancer",
            Reply::Error(TransportError::Status {
                status: 503,
                body: "unavailable".to_string(),
            }),
        );

        let result = reconcile(&env, "lb-a").await;
        assert!(matches!(
            result,
            SyncResult::Failed {
                retry_after: None,
                ..
            }
        ));
        assert!(env.lb("lb-a").unwrap().status.is_none());
        assert_eq!(env.events.reasons(), vec!["WebhookError".to_string()]);
    }

    #[tokio::test]
    async fn test_malformed_response_is_a_transport_error() {
        let env = TestEnv::new();
        env.seed_lb(load_balancer("lb-a"));
        env.driver.push(
            "createLoadBalancer",
            Reply::json(serde_json::json!({"status": "Maybe"})),
        );

        let result = reconcile(&env, "lb-a").await;
        assert!(result.is_failed());
        assert!(env.lb("lb-a").unwrap().status.is_none());
    }

    #[tokio::test]
    async fn test_unknown_driver_is_an_error() {
        let env = TestEnv::new();
        let mut lb = load_balancer("lb-a");
        lb.spec.lb_driver = "missing".to_string();
        env.seed_lb(lb);

        let err = reconcile_load_balancer(&env.ctx, NAMESPACE, "lb-a")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(env.driver.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_driver_found_in_system_namespace() {
        let env = TestEnv::new();
        env.drivers.insert(lb_driver("shared", "kube-system")).unwrap();
        let mut lb = load_balancer("lb-a");
        lb.spec.lb_driver = "shared".to_string();
        env.seed_lb(lb);

        assert!(reconcile(&env, "lb-a").await.is_finished());
        assert_eq!(env.driver.call_count("createLoadBalancer"), 1);
    }

    #[tokio::test]
    async fn test_missing_object_is_finished() {
        let env = TestEnv::new();
        assert!(reconcile(&env, "ghost").await.is_finished());
    }
}

mod ensure_tests {
    use super::*;

    #[tokio::test]
    async fn test_attribute_change_triggers_ensure() {
        let env = TestEnv::new();
        env.seed_lb(load_balancer("lb-a"));
        reconcile(&env, "lb-a").await;

        set_attributes(&env, "lb-a", &[("weight", "10")]).await;
        let result = reconcile(&env, "lb-a").await;

        assert!(result.is_finished());
        let calls = env.driver.calls("ensureLoadBalancer");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].body["attributes"]["weight"], "10");
        assert_eq!(calls[0].body["lbInfo"]["lbID"], "lb-default/lb-a");

        let status = env.lb("lb-a").unwrap().status.unwrap();
        assert_eq!(status.last_synced_attributes, string_map(&[("weight", "10")]));

        // attributes are in sync now
        reconcile(&env, "lb-a").await;
        assert_eq!(env.driver.call_count("ensureLoadBalancer"), 1);
    }

    #[tokio::test]
    async fn test_ensure_fail_never_reverts_created() {
        let env = TestEnv::new();
        env.seed_lb(load_balancer("lb-a"));
        reconcile(&env, "lb-a").await;

        set_attributes(&env, "lb-a", &[("weight", "10")]).await;
        env.driver
            .push("ensureLoadBalancer", Reply::json(fail("listener busy", 30)));
        let result = reconcile(&env, "lb-a").await;
        assert!(result.is_failed());

        let status = env.lb("lb-a").unwrap().status.unwrap();
        assert!(is_condition_true(&status.conditions, condition_types::CREATED));
        let ready = find_condition(&status.conditions, condition_types::READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason.as_deref(), Some("EnsureFailed"));
        assert!(status.last_synced_attributes.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_running_keeps_ready() {
        let env = TestEnv::new();
        env.seed_lb(load_balancer("lb-a"));
        reconcile(&env, "lb-a").await;

        set_attributes(&env, "lb-a", &[("weight", "10")]).await;
        env.driver
            .push("ensureLoadBalancer", Reply::json(running("applying", 5)));
        let result = reconcile(&env, "lb-a").await;
        assert_eq!(result, SyncResult::running(Duration::from_secs(5)));

        let status = env.lb("lb-a").unwrap().status.unwrap();
        assert!(is_condition_true(&status.conditions, condition_types::READY));
        assert!(status.last_synced_attributes.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_transport_error_keeps_status() {
        let env = TestEnv::new();
        env.seed_lb(load_balancer("lb-a"));
        reconcile(&env, "lb-a").await;
        let before = env.lb("lb-a").unwrap().status;

        set_attributes(&env, "lb-a", &[("weight", "10")]).await;
        env.driver.push(
            "ensureLoadBalancer",
            Reply::Error(TransportError::Request("connection refused".to_string())),
        );
        let result = reconcile(&env, "lb-a").await;

        assert!(result.is_failed());
        assert_eq!(env.lb("lb-a").unwrap().status, before);
    }

    #[tokio::test]
    async fn test_always_policy_ensures_every_pass() {
        let env = TestEnv::new();
        env.seed_lb(load_balancer_with(
            "lb-a",
            Default::default(),
            Some(EnsurePolicy::always(60)),
        ));

        let result = reconcile(&env, "lb-a").await;
        assert_eq!(result, SyncResult::periodic(Duration::from_secs(60)));
        assert_eq!(env.driver.call_count("ensureLoadBalancer"), 0);

        for _ in 0..2 {
            let result = reconcile(&env, "lb-a").await;
            assert_eq!(result, SyncResult::periodic(Duration::from_secs(60)));
        }
        assert_eq!(env.driver.call_count("ensureLoadBalancer"), 2);
    }

    #[tokio::test]
    async fn test_short_resync_period_is_clamped() {
        let env = TestEnv::new();
        env.seed_lb(load_balancer_with(
            "lb-a",
            Default::default(),
            Some(EnsurePolicy::always(1)),
        ));

        let result = reconcile(&env, "lb-a").await;
        assert_eq!(result, SyncResult::periodic(Duration::from_secs(30)));
    }
}

mod delete_tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_succ_releases_finalizer() {
        let env = TestEnv::new();
        env.seed_lb(load_balancer("lb-a"));
        reconcile(&env, "lb-a").await;

        env.delete_lb("lb-a").await;
        assert!(env.lb("lb-a").unwrap().metadata.deletion_timestamp.is_some());

        let result = reconcile(&env, "lb-a").await;
        assert!(result.is_finished());
        assert!(env.lb("lb-a").is_none());

        let calls = env.driver.calls("deleteLoadBalancer");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].body["lbInfo"]["lbID"], "lb-default/lb-a");
        assert!(env.events.reasons().contains(&"LoadBalancerDeleted".to_string()));
    }

    #[tokio::test]
    async fn test_delete_fail_keeps_finalizer() {
        let env = TestEnv::new();
        env.seed_lb(load_balancer("lb-a"));
        reconcile(&env, "lb-a").await;
        env.delete_lb("lb-a").await;
        env.driver
            .push("deleteLoadBalancer", Reply::json(fail("in use", 20)));

        let result = reconcile(&env, "lb-a").await;
        assert_eq!(
            result,
            SyncResult::failed_after("in use", Duration::from_secs(20))
        );

        let lb = env.lb("lb-a").unwrap();
        assert!(has_finalizer(&lb, FINALIZER_DELETE_LB));
        let status = lb.status.unwrap();
        let ready = find_condition(&status.conditions, condition_types::READY).unwrap();
        assert_eq!(ready.reason.as_deref(), Some("DeleteFailed"));
        assert!(is_condition_true(&status.conditions, condition_types::CREATED));

        reconcile(&env, "lb-a").await;
        assert!(env.lb("lb-a").is_none());
    }

    #[tokio::test]
    async fn test_delete_running_waits() {
        let env = TestEnv::new();
        env.seed_lb(load_balancer("lb-a"));
        reconcile(&env, "lb-a").await;
        env.delete_lb("lb-a").await;
        env.driver
            .push("deleteLoadBalancer", Reply::json(running("draining", 8)));

        let result = reconcile(&env, "lb-a").await;
        assert_eq!(result, SyncResult::running(Duration::from_secs(8)));
        assert!(env.lb("lb-a").is_some());
    }

    #[tokio::test]
    async fn test_deletion_waits_for_backends() {
        let env = TestEnv::new();
        env.seed_lb(load_balancer("lb-a"));
        reconcile(&env, "lb-a").await;
        env.seed_group(static_group("g", &["lb-a"], &["1.1.1.1:80", "2.2.2.2:80"]));
        reconcile_backend_group(&env.ctx, NAMESPACE, "g").await.unwrap();
        assert_eq!(env.records().len(), 2);

        env.delete_lb("lb-a").await;
        let result = reconcile(&env, "lb-a").await;
        assert!(result.is_running());
        assert_eq!(env.driver.call_count("deleteLoadBalancer"), 0);
        assert!(
            env.records()
                .iter()
                .all(|r| r.metadata.deletion_timestamp.is_some())
        );

        // records never got an address, so they go without driver calls
        for record in env.records() {
            let name = record.metadata.name.unwrap();
            reconcile_backend_record(&env.ctx, NAMESPACE, &name)
                .await
                .unwrap();
        }
        assert!(env.records().is_empty());

        let result = reconcile(&env, "lb-a").await;
        assert!(result.is_finished());
        assert_eq!(env.driver.call_count("deleteLoadBalancer"), 1);
        assert!(env.lb("lb-a").is_none());
    }

    #[tokio::test]
    async fn test_deleting_without_finalizer_is_ignored() {
        let env = TestEnv::new();
        let mut lb = load_balancer("lb-a");
        lb.metadata.deletion_timestamp =
            serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z")).unwrap();
        env.seed_lb(lb);

        assert!(reconcile(&env, "lb-a").await.is_finished());
        assert_eq!(env.driver.total_calls(), 0);
    }
}
