mod common;

#[cfg(test)]
mod tests {
    use crate::common::{FakeIam, ACCOUNT_ID};
    use awslogin::app::config::{default_policy_document, policy_name_for, role_name_for};
    use awslogin::app::trust_provisioning::{
        IamErrorKind, ProvisioningError, ProvisioningStep, StepOutcome, StepRecord, TrustConfig,
        TrustProvisioner,
    };
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    const PROVIDER_URL: &str = "https://vstoken.dev.azure.com/00000000-0000-0000-0000-000000000000";

    fn config(pipeline: Option<&str>) -> TrustConfig {
        TrustConfig {
            oidc_provider_url: PROVIDER_URL.to_string(),
            audience: "api://AzureADTokenExchange".to_string(),
            thumbprint: "a031c46782e6e6c662c2c87c76da9aa62ccabd8e".to_string(),
            role_name: role_name_for("azPipelinesUser"),
            policy_name: policy_name_for("azPipelinesUser"),
            organization: "contoso".to_string(),
            project: "web".to_string(),
            pipeline: pipeline.map(str::to_string),
            policy_document: default_policy_document(),
        }
    }

    fn record(step: ProvisioningStep, outcome: StepOutcome) -> StepRecord {
        StepRecord { step, outcome }
    }

    #[tokio::test]
    async fn test_create_provisions_everything() {
        let iam = FakeIam::new();
        let trust = config(Some("deploy"));

        let report = TrustProvisioner::new(&iam, &trust).create().await.unwrap();

        let provider_arn = FakeIam::provider_arn(PROVIDER_URL);
        assert_eq!(report.provider_arn, provider_arn);
        assert_eq!(
            report.role_arn,
            format!("arn:aws:iam::{}:role/azPipelinesUser-OIDCRole", ACCOUNT_ID)
        );
        assert_eq!(
            report.steps,
            vec![
                record(ProvisioningStep::CreateOidcProvider, StepOutcome::Applied),
                record(ProvisioningStep::CreateRole, StepOutcome::Applied),
                record(ProvisioningStep::PutRolePolicy, StepOutcome::Applied),
            ]
        );

        let role = iam.role("azPipelinesUser-OIDCRole").unwrap();
        let trust_policy: Value = serde_json::from_str(&role.trust_policy).unwrap();
        assert_eq!(trust_policy, trust.trust_policy(&provider_arn));
        assert_eq!(
            trust_policy["Statement"][0]["Condition"]["StringLike"]
                ["vstoken.dev.azure.com/00000000-0000-0000-0000-000000000000:sub"],
            "sc://contoso/web/deploy"
        );

        let policy: Value =
            serde_json::from_str(&role.policies["azPipelinesUser-OIDCPolicy"]).unwrap();
        assert_eq!(policy, default_policy_document());
    }

    #[tokio::test]
    async fn test_create_twice_converges() {
        let iam = FakeIam::new();
        TrustProvisioner::new(&iam, &config(Some("deploy")))
            .create()
            .await
            .unwrap();

        // Second run widens the subject to any pipeline
        let trust = config(None);
        let report = TrustProvisioner::new(&iam, &trust).create().await.unwrap();

        assert_eq!(
            report.steps,
            vec![
                record(ProvisioningStep::CreateOidcProvider, StepOutcome::AlreadyPresent),
                record(ProvisioningStep::CreateRole, StepOutcome::AlreadyPresent),
                record(ProvisioningStep::UpdateTrustPolicy, StepOutcome::Applied),
                record(ProvisioningStep::PutRolePolicy, StepOutcome::Applied),
            ]
        );
        assert_eq!(iam.providers().len(), 1);

        let role = iam.role("azPipelinesUser-OIDCRole").unwrap();
        assert!(role.trust_policy.contains("sc://contoso/web/*"));
    }

    #[tokio::test]
    async fn test_missing_provider_after_create_is_an_error() {
        let iam = FakeIam {
            hide_providers: true,
            ..FakeIam::default()
        };
        let trust = config(None);

        let err = TrustProvisioner::new(&iam, &trust).create().await.unwrap_err();

        assert!(matches!(err, ProvisioningError::ProviderNotFound(ref url) if url == PROVIDER_URL));
        assert!(iam.role("azPipelinesUser-OIDCRole").is_none());
    }

    #[tokio::test]
    async fn test_untolerated_error_stops_the_workflow() {
        let iam = FakeIam {
            fail_operation: Some("CreateRole".to_string()),
            ..FakeIam::default()
        };
        let trust = config(None);

        let err = TrustProvisioner::new(&iam, &trust).create().await.unwrap_err();

        match err {
            ProvisioningError::Iam(error) => {
                assert_eq!(error.operation, "CreateRole");
                assert_eq!(error.kind, IamErrorKind::Other);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!iam.recorded_calls().contains(&"PutRolePolicy".to_string()));
    }

    #[tokio::test]
    async fn test_delete_removes_role_and_keeps_provider() {
        let iam = FakeIam::new();
        let trust = config(None);
        TrustProvisioner::new(&iam, &trust).create().await.unwrap();

        let report = TrustProvisioner::new(&iam, &trust).delete(false).await.unwrap();

        assert_eq!(
            report.steps,
            vec![
                record(ProvisioningStep::DeleteRolePolicy, StepOutcome::Applied),
                record(ProvisioningStep::DeleteRole, StepOutcome::Applied),
            ]
        );
        assert!(iam.role("azPipelinesUser-OIDCRole").is_none());
        assert_eq!(iam.providers().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_all_removes_provider() {
        let iam = FakeIam::new();
        let trust = config(None);
        TrustProvisioner::new(&iam, &trust).create().await.unwrap();

        let report = TrustProvisioner::new(&iam, &trust).delete(true).await.unwrap();

        assert_eq!(
            report.steps.last(),
            Some(&record(ProvisioningStep::DeleteOidcProvider, StepOutcome::Applied))
        );
        assert!(iam.providers().is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_absent_resources_is_informational() {
        let iam = FakeIam::new();
        let trust = config(None);

        let report = TrustProvisioner::new(&iam, &trust).delete(true).await.unwrap();

        assert_eq!(
            report.steps,
            vec![
                record(ProvisioningStep::DeleteRolePolicy, StepOutcome::AlreadyAbsent),
                record(ProvisioningStep::DeleteRole, StepOutcome::AlreadyAbsent),
                record(ProvisioningStep::DeleteOidcProvider, StepOutcome::AlreadyAbsent),
            ]
        );
        assert_eq!(report.steps[1].to_string(), "IAM role does not exist");
    }
}
