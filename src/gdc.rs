use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{CaseId, CaseSummary, FileDescriptor, FileId, ProjectId, ProjectSummary};
use crate::error::{KiraError, is_retryable_status};

pub const PROJECT_PAGE_SIZE: u32 = 2000;
pub const CASE_PAGE_SIZE: u32 = 10_000;
pub const FILE_PAGE_SIZE: u32 = 100;

const PROJECTS_QUERY: &str = r#"
query Projects($size: Int) {
  projects {
    hits(first: $size) {
      edges { node { project_id name summary { case_count } } }
    }
  }
}"#;

const CASES_QUERY: &str = r#"
query ProjectCases($filters: FiltersArgument, $size: Int) {
  repository {
    cases {
      hits(first: $size, filters: $filters) {
        edges { node { case_id submitter_id } }
      }
    }
  }
}"#;

const FILES_QUERY: &str = r#"
query FileSearch($filters: FiltersArgument, $size: Int) {
  repository {
    files {
      hits(first: $size, filters: $filters) {
        edges { node { file_id file_name } }
      }
    }
  }
}"#;

#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<ProjectSummary>, KiraError>;
    async fn list_cases(&self, project: &ProjectId) -> Result<Vec<CaseSummary>, KiraError>;
    /// The single open-access STAR count table for `case`, or `None` when absent or ambiguous.
    async fn resolve_file(&self, case: &CaseId) -> Result<Option<FileDescriptor>, KiraError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", content = "content")]
pub enum Filter {
    #[serde(rename = "and")]
    And(Vec<Filter>),
    #[serde(rename = "=")]
    Eq(FieldValue),
    #[serde(rename = "in")]
    In(FieldValues),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldValue {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldValues {
    pub field: String,
    pub value: Vec<String>,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Eq(FieldValue {
            field: field.into(),
            value: value.into(),
        })
    }

    pub fn any_of(field: impl Into<String>, values: impl IntoIterator<Item = String>) -> Self {
        Filter::In(FieldValues {
            field: field.into(),
            value: values.into_iter().collect(),
        })
    }

    pub fn all(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(filters.into_iter().collect())
    }
}

pub fn eligible_file_filters(prefix: &str) -> Vec<Filter> {
    vec![
        Filter::any_of(
            format!("{prefix}data_category"),
            ["Transcriptome Profiling".to_string()],
        ),
        Filter::eq(format!("{prefix}analysis.workflow_type"), "STAR - Counts"),
        Filter::eq(format!("{prefix}data_format"), "TSV"),
        Filter::eq(format!("{prefix}access"), "open"),
    ]
}

pub fn project_cases_filter(project: &ProjectId) -> Filter {
    let mut filters = vec![Filter::eq("project.project_id", project.as_str())];
    filters.extend(eligible_file_filters("files."));
    Filter::all(filters)
}

pub fn case_files_filter(case: &CaseId) -> Filter {
    let mut filters = vec![Filter::any_of(
        "cases.case_id",
        [case.as_str().to_string()],
    )];
    filters.extend(eligible_file_filters(""));
    Filter::all(filters)
}

#[derive(Debug, Serialize)]
struct GraphQlRequest<V> {
    query: &'static str,
    variables: V,
}

#[derive(Debug, Serialize)]
struct SizeVariables {
    size: u32,
}

#[derive(Debug, Serialize)]
struct FilterVariables {
    filters: Filter,
    size: u32,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Hits<T> {
    hits: Edges<T>,
}

#[derive(Debug, Deserialize)]
struct Edges<T> {
    #[serde(default = "Vec::new")]
    edges: Vec<Edge<T>>,
}

#[derive(Debug, Deserialize)]
struct Edge<T> {
    node: T,
}

#[derive(Debug, Deserialize)]
struct Repository<T> {
    repository: T,
}

#[derive(Debug, Deserialize)]
struct ProjectsData {
    projects: Hits<ProjectNode>,
}

#[derive(Debug, Deserialize)]
struct ProjectNode {
    project_id: String,
    name: Option<String>,
    summary: Option<ProjectSummaryNode>,
}

#[derive(Debug, Deserialize)]
struct ProjectSummaryNode {
    case_count: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CasesData {
    cases: Hits<CaseNode>,
}

#[derive(Debug, Deserialize)]
struct CaseNode {
    case_id: String,
    submitter_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FilesData {
    files: Hits<FileNode>,
}

#[derive(Debug, Deserialize)]
struct FileNode {
    file_id: String,
    file_name: String,
}

#[derive(Clone)]
pub struct GdcHttpClient {
    client: Client,
    graphql_url: String,
    retry_delay: Duration,
}

impl GdcHttpClient {
    pub fn new(base_url: &str) -> Result<Self, KiraError> {
        let client = Client::builder()
            .default_headers(default_headers()?)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(KiraError::from_reqwest)?;
        Ok(Self {
            client,
            graphql_url: format!("{}/v0/graphql", base_url.trim_end_matches('/')),
            retry_delay: Duration::from_secs(1),
        })
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    async fn query<V, T>(&self, query: &'static str, variables: V) -> Result<T, KiraError>
    where
        V: Serialize,
        T: DeserializeOwned,
    {
        let body = GraphQlRequest { query, variables };
        let response = self
            .send_with_retries(|| self.client.post(&self.graphql_url).json(&body))
            .await?;
        let response = handle_status(response).await?;
        let envelope: GraphQlResponse<T> = response.json().await.map_err(|err| {
            if err.is_decode() {
                KiraError::Response(err.to_string())
            } else {
                KiraError::from_reqwest(err)
            }
        })?;
        match envelope.data {
            Some(data) => Ok(data),
            None => Err(KiraError::Response(format!(
                "no data in response: {}",
                Value::Array(envelope.errors)
            ))),
        }
    }

    async fn send_with_retries<F>(&self, make_req: F) -> Result<Response, KiraError>
    where
        F: Fn() -> RequestBuilder,
    {
        const MAX_RETRIES: u32 = 3;
        let mut attempt = 0u32;
        loop {
            match make_req().send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        attempt += 1;
                        debug!(status, attempt, "retrying GDC request");
                        tokio::time::sleep(self.retry_delay * attempt).await;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    let err = KiraError::from_reqwest(err);
                    if attempt < MAX_RETRIES && err.is_transient() {
                        attempt += 1;
                        debug!(error = %err, attempt, "retrying GDC request");
                        tokio::time::sleep(self.retry_delay * attempt).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[async_trait]
impl DiscoveryClient for GdcHttpClient {
    async fn list_projects(&self) -> Result<Vec<ProjectSummary>, KiraError> {
        let data: ProjectsData = self
            .query(PROJECTS_QUERY, SizeVariables {
                size: PROJECT_PAGE_SIZE,
            })
            .await?;
        let mut projects = Vec::new();
        for Edge { node } in data.projects.hits.edges {
            let project_id = match node.project_id.parse::<ProjectId>() {
                Ok(id) => id,
                Err(err) => {
                    warn!(error = %err, "skipping project with invalid id");
                    continue;
                }
            };
            projects.push(ProjectSummary {
                project_id,
                name: node.name,
                case_count: node
                    .summary
                    .and_then(|summary| summary.case_count)
                    .as_ref()
                    .and_then(coerce_count),
            });
        }
        Ok(projects)
    }

    async fn list_cases(&self, project: &ProjectId) -> Result<Vec<CaseSummary>, KiraError> {
        let data: Repository<CasesData> = self
            .query(CASES_QUERY, FilterVariables {
                filters: project_cases_filter(project),
                size: CASE_PAGE_SIZE,
            })
            .await?;
        let mut cases = Vec::new();
        for Edge { node } in data.repository.cases.hits.edges {
            match node.case_id.parse::<CaseId>() {
                Ok(case_id) => cases.push(CaseSummary {
                    case_id,
                    submitter_id: node.submitter_id,
                }),
                Err(err) => warn!(project_id = %project, error = %err, "skipping case"),
            }
        }
        Ok(cases)
    }

    async fn resolve_file(&self, case: &CaseId) -> Result<Option<FileDescriptor>, KiraError> {
        let data: Repository<FilesData> = self
            .query(FILES_QUERY, FilterVariables {
                filters: case_files_filter(case),
                size: FILE_PAGE_SIZE,
            })
            .await?;
        let candidates: BTreeMap<String, String> = data
            .repository
            .files
            .hits
            .edges
            .into_iter()
            .map(|Edge { node }| (node.file_id, node.file_name))
            .collect();
        pick_single_file(case, candidates)
    }
}

fn pick_single_file(
    case: &CaseId,
    candidates: BTreeMap<String, String>,
) -> Result<Option<FileDescriptor>, KiraError> {
    if candidates.len() > 1 {
        warn!(case_id = %case, candidates = candidates.len(), "ambiguous count files");
        return Ok(None);
    }
    let Some((file_id, file_name)) = candidates.into_iter().next() else {
        return Ok(None);
    };
    let file_id: FileId = file_id.parse()?;
    Ok(Some(FileDescriptor { file_id, file_name }))
}

pub(crate) fn default_headers() -> Result<HeaderMap, KiraError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("kira-ei/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| KiraError::Response(err.to_string()))?,
    );
    Ok(headers)
}

pub(crate) async fn handle_status(response: Response) -> Result<Response, KiraError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "GDC request failed".to_string());
    if status.as_u16() == 429 {
        return Err(KiraError::RateLimited(message));
    }
    Err(KiraError::Status {
        status: status.as_u16(),
        message,
    })
}

fn coerce_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64)),
        Value::String(text) => text.trim().parse::<f64>().ok().filter(|v| *v >= 0.0).map(|v| v as u64),
        _ => None,
    }
}
