use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::StorageCredentials;
use crate::{Error, Result};

pub const DEFAULT_API_URL: &str = "https://api.let.sh.cn/query";

/// Status text the control plane reports for a deployment that ended in failure.
pub const FAILED_STATUS: &str = "Failed";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Static,
    BuildBundle,
}

impl UploadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadKind::Static => "static",
            UploadKind::BuildBundle => "buildBundle",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DeployCapability {
    #[serde(rename = "hashID")]
    pub hash_id: String,
    pub exists: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartDeploymentRequest {
    pub project_type: String,
    pub name: String,
    /// Merged project config, JSON encoded.
    pub config: String,
    pub cn: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    #[serde(rename = "targetFQDN", default)]
    pub target_fqdn: String,
    #[serde(default)]
    pub network_stage: String,
    #[serde(default)]
    pub packer_stage: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    #[serde(rename = "targetFQDN", default)]
    pub target_fqdn: String,
    #[serde(default)]
    pub network_stage: String,
    #[serde(default)]
    pub packer_stage: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl DeploymentStatus {
    pub fn stage_line(&self) -> String {
        format!(
            "NetworkStage: {}, PackerStage: {}, Status: {}",
            self.network_stage, self.packer_stage, self.status
        )
    }

    pub fn is_failed(&self) -> bool {
        self.status == FAILED_STATUS
    }
}

/// Remote control plane of the deploy service.
pub trait ControlPlane: Send + Sync {
    fn check_deploy_capability<'a>(
        &'a self,
        project_name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<DeployCapability>> + Send + 'a>>;

    fn get_storage_credentials<'a>(
        &'a self,
        kind: UploadKind,
        project_name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<StorageCredentials>> + Send + 'a>>;

    fn start_deployment<'a>(
        &'a self,
        request: &'a StartDeploymentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Deployment>> + Send + 'a>>;

    fn get_deployment_status<'a>(
        &'a self,
        deployment_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<DeploymentStatus>> + Send + 'a>>;

    fn cancel_deployment<'a>(
        &'a self,
        deployment_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    fn get_preference<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}

const CHECK_DEPLOY_CAPABILITY: &str = r#"
query($name: String!) {
    checkDeployCapability(projectName: $name) {
        hashID
        exists
    }
}
"#;

const STS_TOKEN: &str = r#"
query($type: String!, $name: String!) {
    stsToken(type: $type, projectName: $name) {
        host
        accessKeyID
        accessKeySecret
        securityToken
    }
}
"#;

const DEPLOY: &str = r#"
mutation($type: String!, $name: String!, $config: String!, $cn: Boolean!) {
    deploy(input: {type: $type, projectName: $name, config: $config, cn: $cn}) {
        id
        targetFQDN
        networkStage
        packerStage
        status
    }
}
"#;

const DEPLOYMENT_STATUS: &str = r#"
query($id: UUID!) {
    deployment(id: $id) {
        targetFQDN
        networkStage
        packerStage
        status
        done
        errorMessage
    }
}
"#;

const CANCEL_DEPLOYMENT: &str = r#"
mutation($id: UUID!) {
    cancelDeployment(id: $id)
}
"#;

const PREFERENCE: &str = r#"
query($name: String!) {
    preference(name: $name)
}
"#;

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

/// Outcome of one GraphQL exchange before it is mapped onto an operation.
#[derive(Debug)]
pub(crate) enum GraphqlOutcome<T> {
    Data(T),
    Rejected(String),
}

pub(crate) fn decode_graphql<T: DeserializeOwned>(
    status: reqwest::StatusCode,
    body: &str,
) -> Result<GraphqlOutcome<T>> {
    let parsed: GraphqlResponse<T> = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(e) if status.is_success() => {
            return Err(Error::transport(format!("invalid json: {e}; body={body}")));
        }
        Err(_) => return Err(Error::transport(format!("http {status}: {body}"))),
    };

    if let Some(first) = parsed.errors.into_iter().next() {
        return Ok(GraphqlOutcome::Rejected(first.message));
    }
    if !status.is_success() {
        return Err(Error::transport(format!("http {status}: {body}")));
    }
    parsed
        .data
        .map(GraphqlOutcome::Data)
        .ok_or_else(|| Error::transport("response has neither data nor errors"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckDeployCapabilityData {
    check_deploy_capability: DeployCapability,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StsTokenData {
    sts_token: StorageCredentials,
}

#[derive(Debug, Deserialize)]
struct DeployData {
    deploy: Deployment,
}

#[derive(Debug, Deserialize)]
struct DeploymentStatusData {
    deployment: DeploymentStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelDeploymentData {
    cancel_deployment: bool,
}

#[derive(Debug, Deserialize)]
struct PreferenceData {
    preference: String,
}

#[derive(Debug, Clone)]
pub struct GraphqlControlPlaneConfig {
    pub endpoint: String,
    pub token: String,
}

/// [`ControlPlane`] over the GraphQL API, authenticated with a bearer token.
pub struct GraphqlControlPlane {
    config: GraphqlControlPlaneConfig,
    client: reqwest::Client,
}

impl GraphqlControlPlane {
    pub fn new(config: GraphqlControlPlaneConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::transport(format!("build http client failed: {e}")))?;
        Ok(Self { config, client })
    }

    async fn run<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        query: &'static str,
        variables: serde_json::Value,
    ) -> Result<GraphqlOutcome<T>> {
        debug!(event = "io.api.request", operation, "io.api.request");
        let res = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.token)
            .json(&serde_json::json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| Error::transport(format!("{operation} request failed: {e}")))?;

        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| Error::transport(format!("{operation} read response failed: {e}")))?;
        decode_graphql(status, &body)
    }

    async fn run_data<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        query: &'static str,
        variables: serde_json::Value,
    ) -> Result<T> {
        match self.run(operation, query, variables).await? {
            GraphqlOutcome::Data(data) => Ok(data),
            GraphqlOutcome::Rejected(message) => {
                Err(Error::transport(format!("{operation}: {message}")))
            }
        }
    }
}

impl ControlPlane for GraphqlControlPlane {
    fn check_deploy_capability<'a>(
        &'a self,
        project_name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<DeployCapability>> + Send + 'a>> {
        Box::pin(async move {
            let outcome = self
                .run::<CheckDeployCapabilityData>(
                    "checkDeployCapability",
                    CHECK_DEPLOY_CAPABILITY,
                    serde_json::json!({ "name": project_name }),
                )
                .await?;
            match outcome {
                GraphqlOutcome::Data(data) => Ok(data.check_deploy_capability),
                GraphqlOutcome::Rejected(message) => Err(Error::Capability {
                    project: project_name.to_string(),
                    message,
                }),
            }
        })
    }

    fn get_storage_credentials<'a>(
        &'a self,
        kind: UploadKind,
        project_name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<StorageCredentials>> + Send + 'a>> {
        Box::pin(async move {
            let data: StsTokenData = self
                .run_data(
                    "stsToken",
                    STS_TOKEN,
                    serde_json::json!({ "type": kind.as_str(), "name": project_name }),
                )
                .await?;
            Ok(data.sts_token)
        })
    }

    fn start_deployment<'a>(
        &'a self,
        request: &'a StartDeploymentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Deployment>> + Send + 'a>> {
        Box::pin(async move {
            let data: DeployData = self
                .run_data(
                    "deploy",
                    DEPLOY,
                    serde_json::json!({
                        "type": request.project_type,
                        "name": request.name,
                        "config": request.config,
                        "cn": request.cn,
                    }),
                )
                .await?;
            Ok(data.deploy)
        })
    }

    fn get_deployment_status<'a>(
        &'a self,
        deployment_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<DeploymentStatus>> + Send + 'a>> {
        Box::pin(async move {
            let data: DeploymentStatusData = self
                .run_data(
                    "deployment",
                    DEPLOYMENT_STATUS,
                    serde_json::json!({ "id": deployment_id }),
                )
                .await?;
            Ok(data.deployment)
        })
    }

    fn cancel_deployment<'a>(
        &'a self,
        deployment_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            let data: CancelDeploymentData = self
                .run_data(
                    "cancelDeployment",
                    CANCEL_DEPLOYMENT,
                    serde_json::json!({ "id": deployment_id }),
                )
                .await?;
            Ok(data.cancel_deployment)
        })
    }

    fn get_preference<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let data: PreferenceData = self
                .run_data("preference", PREFERENCE, serde_json::json!({ "name": key }))
                .await?;
            Ok(data.preference)
        })
    }
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::*;

    #[test]
    fn decodes_capability_payload() {
        let body = r#"{"data":{"checkDeployCapability":{"hashID":"a1b2c3","exists":true}}}"#;
        let outcome: GraphqlOutcome<CheckDeployCapabilityData> =
            decode_graphql(StatusCode::OK, body).unwrap();
        match outcome {
            GraphqlOutcome::Data(d) => {
                assert_eq!(d.check_deploy_capability.hash_id, "a1b2c3");
                assert!(d.check_deploy_capability.exists);
            }
            GraphqlOutcome::Rejected(m) => panic!("unexpected rejection: {m}"),
        }
    }

    #[test]
    fn first_graphql_error_wins_over_data() {
        let body = r#"{"data":null,"errors":[{"message":"project not found"},{"message":"other"}]}"#;
        let outcome: GraphqlOutcome<PreferenceData> =
            decode_graphql(StatusCode::OK, body).unwrap();
        assert!(matches!(outcome, GraphqlOutcome::Rejected(m) if m == "project not found"));
    }

    #[test]
    fn non_json_error_page_is_transport_error() {
        let err = decode_graphql::<PreferenceData>(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>")
            .unwrap_err();
        match err {
            Error::Transport { message } => assert!(message.contains("502")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn deployment_status_parses_remote_field_names() {
        let body = r#"{"data":{"deployment":{"targetFQDN":"demo.let.sh.cn","networkStage":"Done","packerStage":"Done","status":"Failed","done":true,"errorMessage":"disk full"}}}"#;
        let outcome: GraphqlOutcome<DeploymentStatusData> =
            decode_graphql(StatusCode::OK, body).unwrap();
        let GraphqlOutcome::Data(data) = outcome else {
            panic!("expected data");
        };
        let status = data.deployment;
        assert_eq!(status.target_fqdn, "demo.let.sh.cn");
        assert!(status.done);
        assert!(status.is_failed());
        assert_eq!(status.error_message.as_deref(), Some("disk full"));
        assert_eq!(
            status.stage_line(),
            "NetworkStage: Done, PackerStage: Done, Status: Failed"
        );
    }

    #[test]
    fn sts_token_uses_remote_casing() {
        let body = r#"{"data":{"stsToken":{"host":"https://b.oss-cn-hangzhou.aliyuncs.com","accessKeyID":"id","accessKeySecret":"secret","securityToken":"tok"}}}"#;
        let outcome: GraphqlOutcome<StsTokenData> = decode_graphql(StatusCode::OK, body).unwrap();
        let GraphqlOutcome::Data(data) = outcome else {
            panic!("expected data");
        };
        assert_eq!(data.sts_token.access_key_id, "id");
        assert_eq!(data.sts_token.access_key_secret, "secret");
        assert_eq!(data.sts_token.security_token, "tok");
    }
}
