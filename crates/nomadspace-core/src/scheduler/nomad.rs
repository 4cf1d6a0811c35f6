//! Nomad HTTP API client

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{RunResult, Scheduler};
use crate::error::{NomadSpaceError, Result};
use crate::job::Job;

const DEFAULT_ADDR: &str = "http://127.0.0.1:4646";

/// Nomad connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NomadConfig {
    /// Agent address, e.g. `http://127.0.0.1:4646`
    pub address: String,
    /// ACL token sent as `X-Nomad-Token`
    pub token: Option<String>,
    pub region: Option<String>,
    pub namespace: Option<String>,
}

impl Default for NomadConfig {
    fn default() -> Self {
        NomadConfig {
            address: DEFAULT_ADDR.to_string(),
            token: None,
            region: None,
            namespace: None,
        }
    }
}

impl NomadConfig {
    /// Read `NOMAD_ADDR`, `NOMAD_TOKEN`, `NOMAD_REGION` and `NOMAD_NAMESPACE`.
    pub fn from_env() -> Self {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        NomadConfig {
            address: non_empty("NOMAD_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            token: non_empty("NOMAD_TOKEN"),
            region: non_empty("NOMAD_REGION"),
            namespace: non_empty("NOMAD_NAMESPACE"),
        }
    }

    pub fn new(address: &str) -> Self {
        NomadConfig {
            address: address.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ParseRequest<'a> {
    #[serde(rename = "JobHCL")]
    job_hcl: &'a str,
    canonicalize: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct RegisterRequest<'a> {
    job: &'a Job,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RegisterResponse {
    #[serde(rename = "EvalID", default)]
    eval_id: String,
    #[serde(default)]
    warnings: Option<String>,
}

impl From<RegisterResponse> for RunResult {
    fn from(resp: RegisterResponse) -> Self {
        let warnings = resp
            .warnings
            .unwrap_or_default()
            .lines()
            .map(str::trim)
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        RunResult {
            eval_id: resp.eval_id,
            warnings,
        }
    }
}

/// Client for the Nomad jobs API
pub struct NomadClient {
    config: NomadConfig,
    http_client: reqwest::Client,
}

impl NomadClient {
    pub fn new(config: NomadConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("nomadspace/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(NomadClient {
            config,
            http_client,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(NomadConfig::from_env())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.address.trim_end_matches('/'), path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http_client.request(method, self.url(path));
        if let Some(token) = &self.config.token {
            req = req.header("X-Nomad-Token", token);
        }
        if let Some(region) = &self.config.region {
            req = req.query(&[("region", region)]);
        }
        if let Some(namespace) = &self.config.namespace {
            req = req.query(&[("namespace", namespace)]);
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = req.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(NomadSpaceError::Api {
            status: status.as_u16(),
            body: body.trim().to_string(),
        })
    }
}

#[async_trait]
impl Scheduler for NomadClient {
    async fn parse_native(&self, source: &str) -> Result<Job> {
        let req = self
            .request(reqwest::Method::POST, "/v1/jobs/parse")
            .json(&ParseRequest {
                job_hcl: source,
                canonicalize: true,
            });
        let job = self.send(req).await?.json::<Job>().await?;
        debug!(job_id = %job.id_or_default(), "Parsed native job");
        Ok(job)
    }

    async fn register(&self, job: &Job) -> Result<RunResult> {
        let req = self
            .request(reqwest::Method::PUT, "/v1/jobs")
            .json(&RegisterRequest { job });
        let response = self.send(req).await?.json::<RegisterResponse>().await?;
        Ok(response.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_request_wraps_job() {
        let job = Job {
            id: Some("abc-svc".to_string()),
            ..Default::default()
        };
        let body = serde_json::to_value(RegisterRequest { job: &job }).unwrap();
        assert_eq!(body, json!({"Job": {"ID": "abc-svc"}}));
    }

    #[test]
    fn test_parse_request_shape() {
        let body = serde_json::to_value(ParseRequest {
            job_hcl: "job \"x\" {}",
            canonicalize: true,
        })
        .unwrap();
        assert_eq!(body, json!({"JobHCL": "job \"x\" {}", "Canonicalize": true}));
    }

    #[test]
    fn test_register_response_splits_warnings() {
        let resp: RegisterResponse = serde_json::from_value(json!({
            "EvalID": "eval-1",
            "EvalCreateIndex": 10,
            "Warnings": "1 warning:\n\n* Group \"web\" has no update stanza\n"
        }))
        .unwrap();
        let result = RunResult::from(resp);
        assert_eq!(result.eval_id, "eval-1");
        assert_eq!(
            result.warnings,
            vec!["1 warning:", "* Group \"web\" has no update stanza"]
        );
    }

    #[test]
    fn test_register_response_without_warnings() {
        let resp: RegisterResponse =
            serde_json::from_value(json!({"EvalID": "eval-2", "Warnings": ""})).unwrap();
        assert!(RunResult::from(resp).warnings.is_empty());
    }

    #[test]
    fn test_url_trims_trailing_slash() {
        let client = NomadClient::new(NomadConfig::new("http://nomad:4646/")).unwrap();
        assert_eq!(client.url("/v1/jobs"), "http://nomad:4646/v1/jobs");
    }
}
