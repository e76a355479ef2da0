use std::time::Duration;

use async_trait::async_trait;
use config::AgentConfig;
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::{Credentials, TokenProvider};
use crate::rows::{TableRow, convert_row};
use crate::{
    DatasetRef, Field, QueryResult, TableId, TableMetadata, TableSummary, Warehouse,
    WarehouseError,
};

const DEFAULT_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";
const MAX_POLL_ATTEMPTS: usize = 30;
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetList {
    #[serde(default)]
    datasets: Vec<DatasetListEntry>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetListEntry {
    dataset_reference: DatasetReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetReference {
    project_id: String,
    dataset_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableList {
    #[serde(default)]
    tables: Vec<TableListEntry>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableListEntry {
    table_reference: TableReference,
    #[serde(rename = "type")]
    table_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableReference {
    project_id: String,
    dataset_id: String,
    table_id: String,
}

impl From<TableReference> for TableId {
    fn from(r: TableReference) -> Self {
        TableId::new(r.project_id, r.dataset_id, r.table_id)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableResource {
    table_reference: TableReference,
    /// int64 values are strings on the wire
    num_rows: Option<String>,
    schema: Option<SchemaResource>,
}

#[derive(Debug, Default, Deserialize)]
struct SchemaResource {
    #[serde(default)]
    fields: Vec<Field>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    timeout_ms: u64,
    request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
    format_options: FormatOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FormatOptions {
    use_int64_timestamp: bool,
}

/// Shape shared by `jobs.query` and `jobs.getQueryResults`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    job_reference: Option<JobReference>,
    #[serde(default)]
    job_complete: bool,
    schema: Option<SchemaResource>,
    #[serde(default)]
    rows: Vec<TableRow>,
    page_token: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// BigQuery over its REST API (v2)
#[derive(Debug)]
pub struct BigQueryWarehouse {
    project: String,
    location: Option<String>,
    query_timeout_ms: u64,
    base_url: String,
    http: reqwest::Client,
    tokens: TokenProvider,
}

impl BigQueryWarehouse {
    pub fn new(project: impl Into<String>, credentials: Credentials) -> Self {
        let http = reqwest::Client::new();
        Self {
            project: project.into(),
            location: None,
            query_timeout_ms: 30_000,
            base_url: DEFAULT_BASE_URL.to_string(),
            tokens: TokenProvider::new(credentials, http.clone()),
            http,
        }
    }

    /// Builds a client from the process config. Fails, without touching the network, when
    /// there is no project or no way to obtain credentials.
    pub fn from_config(conf: &AgentConfig) -> Result<Self, WarehouseError> {
        let project = conf
            .warehouse
            .project
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or(WarehouseError::NoProject)?;
        let credentials =
            Credentials::detect(conf.warehouse.access_token.as_deref(), conf.use_managed_auth)?;
        info!("Using BigQuery project {project} with {:?}", CredentialKind(&credentials));

        let mut warehouse = Self::new(project, credentials);
        warehouse.location = conf.warehouse.location.clone();
        warehouse.query_timeout_ms = conf.warehouse.query_timeout_ms;
        Ok(warehouse)
    }

    /// Points the client at another endpoint, such as a local emulator.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url, WarehouseError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| WarehouseError::Url(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| WarehouseError::Url(format!("{} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn api_request<T>(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, String)],
        body: Option<&impl Serialize>,
    ) -> Result<T, WarehouseError>
    where
        T: DeserializeOwned,
    {
        debug!("Making {} request to {}", method, url);
        let token = self.tokens.token().await?;

        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(token)
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        debug!("Received {} with {} bytes", status, text.len());

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            warn!("BigQuery request failed with status {status}: {message}");
            return Err(WarehouseError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(serde_json::from_str(&text)?)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<T, WarehouseError> {
        self.api_request(Method::GET, url, query, None::<&()>).await
    }

    async fn query_results(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> Result<QueryResponse, WarehouseError> {
        let url = self.url(&["projects", &job.project_id, "queries", &job.job_id])?;
        let mut params = vec![
            ("timeoutMs", self.query_timeout_ms.to_string()),
            ("formatOptions.useInt64Timestamp", "true".to_string()),
        ];
        if let Some(location) = &job.location {
            params.push(("location", location.clone()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }
        self.get(url, &params).await
    }
}

/// Logs the credential source without leaking a static token
struct CredentialKind<'a>(&'a Credentials);

impl std::fmt::Debug for CredentialKind<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Credentials::Static(_) => f.write_str("static token"),
            Credentials::MetadataServer => f.write_str("metadata server"),
            Credentials::GcloudCli => f.write_str("gcloud CLI"),
        }
    }
}

fn job_failure(job: Option<&JobReference>, errors: &[ErrorProto]) -> Option<WarehouseError> {
    let message = errors
        .iter()
        .filter_map(|e| e.message.as_deref())
        .collect::<Vec<_>>()
        .join("; ");
    if message.is_empty() {
        return None;
    }
    Some(WarehouseError::Job {
        job_id: job.map(|j| j.job_id.clone()).unwrap_or_default(),
        message,
    })
}

/// `errors` on a query response can be warnings. They only fail the query while no schema
/// or rows have come back.
fn check_errors(response: &QueryResponse) -> Result<(), WarehouseError> {
    let Some(err) = job_failure(response.job_reference.as_ref(), &response.errors) else {
        return Ok(());
    };
    if response.schema.is_none() && response.rows.is_empty() {
        return Err(err);
    }
    warn!("Query finished with errors reported: {err}");
    Ok(())
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    fn default_project(&self) -> &str {
        &self.project
    }

    async fn list_datasets(&self) -> Result<Vec<DatasetRef>, WarehouseError> {
        let url = self.url(&["projects", &self.project, "datasets"])?;
        let mut datasets = vec![];
        let mut page_token: Option<String> = None;

        loop {
            let params: Vec<(&str, String)> =
                page_token.take().map(|t| ("pageToken", t)).into_iter().collect();
            let page: DatasetList = self.get(url.clone(), &params).await?;
            datasets.extend(page.datasets.into_iter().map(|d| {
                DatasetRef::new(d.dataset_reference.project_id, d.dataset_reference.dataset_id)
            }));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!("Listed {} datasets in {}", datasets.len(), self.project);
        Ok(datasets)
    }

    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Vec<TableSummary>, WarehouseError> {
        let url = self.url(&[
            "projects",
            &dataset.project,
            "datasets",
            &dataset.dataset_id,
            "tables",
        ])?;
        let mut tables = vec![];
        let mut page_token: Option<String> = None;

        loop {
            let params: Vec<(&str, String)> =
                page_token.take().map(|t| ("pageToken", t)).into_iter().collect();
            let page: TableList = self.get(url.clone(), &params).await?;
            tables.extend(page.tables.into_iter().map(|t| TableSummary {
                id: t.table_reference.into(),
                table_type: t.table_type.unwrap_or_else(|| "TABLE".to_string()),
            }));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(tables)
    }

    async fn get_table(&self, table: &TableId) -> Result<TableMetadata, WarehouseError> {
        let url = self.url(&[
            "projects",
            &table.project,
            "datasets",
            &table.dataset_id,
            "tables",
            &table.table_id,
        ])?;
        let resource: TableResource = self.get(url, &[]).await?;

        Ok(TableMetadata {
            id: resource.table_reference.into(),
            num_rows: resource.num_rows.and_then(|n| n.parse().ok()),
            fields: resource.schema.unwrap_or_default().fields,
        })
    }

    async fn query(&self, sql: &str) -> Result<QueryResult, WarehouseError> {
        let url = self.url(&["projects", &self.project, "queries"])?;
        let request = QueryRequest {
            query: sql,
            use_legacy_sql: false,
            timeout_ms: self.query_timeout_ms,
            request_id: uuid::Uuid::new_v4().to_string(),
            location: self.location.as_deref(),
            format_options: FormatOptions {
                use_int64_timestamp: true,
            },
        };
        debug!("Submitting query: {sql}");
        let mut response: QueryResponse = self
            .api_request(Method::POST, url, &[], Some(&request))
            .await?;

        let mut attempts = 0;
        while !response.job_complete {
            check_errors(&response)?;
            let job = response.job_reference.clone().ok_or_else(|| {
                WarehouseError::Job {
                    job_id: String::new(),
                    message: "incomplete response without a job reference".to_string(),
                }
            })?;
            attempts += 1;
            if attempts > MAX_POLL_ATTEMPTS {
                return Err(WarehouseError::Timeout(job.job_id));
            }
            debug!("Waiting for job {} (attempt {attempts})", job.job_id);
            tokio::time::sleep(POLL_INTERVAL).await;
            response = self.query_results(&job, None).await?;
        }

        check_errors(&response)?;

        let fields = response.schema.take().unwrap_or_default().fields;
        let mut rows: Vec<_> = response.rows.iter().map(|r| convert_row(&fields, r)).collect();

        // follow result pages until the job has handed over every row
        let mut page_token = response.page_token.take();
        while let Some(token) = page_token.filter(|t| !t.is_empty()) {
            let job = response.job_reference.clone().ok_or_else(|| WarehouseError::Job {
                job_id: String::new(),
                message: "paged response without a job reference".to_string(),
            })?;
            let page = self.query_results(&job, Some(&token)).await?;
            rows.extend(page.rows.iter().map(|r| convert_row(&fields, r)));
            page_token = page.page_token;
        }

        info!("Query returned {} rows", rows.len());
        Ok(QueryResult { rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn warehouse() -> BigQueryWarehouse {
        BigQueryWarehouse::new("proj", Credentials::Static("t".to_string()))
    }

    #[test]
    fn urls_are_built_from_escaped_segments() {
        let url = warehouse()
            .url(&["projects", "proj", "datasets", "sales", "tables", "a b"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://bigquery.googleapis.com/bigquery/v2/projects/proj/datasets/sales/tables/a%20b"
        );
    }

    #[test]
    fn custom_base_url_drops_trailing_slash() {
        let url = warehouse()
            .with_base_url("http://localhost:9050/bigquery/v2/")
            .url(&["projects", "p", "queries"])
            .unwrap();
        assert_eq!(url.as_str(), "http://localhost:9050/bigquery/v2/projects/p/queries");
    }

    #[test]
    fn from_config_requires_a_project() {
        let conf = AgentConfig::default();
        assert!(matches!(
            BigQueryWarehouse::from_config(&conf),
            Err(WarehouseError::NoProject)
        ));
    }

    #[test]
    fn from_config_uses_static_token_and_settings() {
        let mut conf = AgentConfig::default();
        conf.warehouse.project = Some("proj".to_string());
        conf.warehouse.access_token = Some("tok".to_string());
        conf.warehouse.location = Some("EU".to_string());

        let warehouse = BigQueryWarehouse::from_config(&conf).unwrap();
        assert_eq!(warehouse.default_project(), "proj");
        assert_eq!(warehouse.location.as_deref(), Some("EU"));
    }

    #[test]
    fn query_request_wire_format() {
        let request = QueryRequest {
            query: "SELECT 1",
            use_legacy_sql: false,
            timeout_ms: 1000,
            request_id: "rid".to_string(),
            location: None,
            format_options: FormatOptions {
                use_int64_timestamp: true,
            },
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "query": "SELECT 1",
                "useLegacySql": false,
                "timeoutMs": 1000,
                "requestId": "rid",
                "formatOptions": {"useInt64Timestamp": true},
            })
        );
    }

    #[test]
    fn table_resource_parses_schema() {
        let resource: TableResource = serde_json::from_value(json!({
            "tableReference": {"projectId": "p", "datasetId": "d", "tableId": "t"},
            "numRows": "1234",
            "type": "TABLE",
            "schema": {"fields": [
                {"name": "id", "type": "INTEGER", "mode": "REQUIRED"},
                {"name": "note", "type": "STRING", "description": "free text"},
            ]},
        }))
        .unwrap();

        assert_eq!(resource.num_rows.as_deref(), Some("1234"));
        let fields = resource.schema.unwrap().fields;
        assert_eq!(fields[0].mode, "REQUIRED");
        assert_eq!(fields[1].mode, "NULLABLE");
        assert_eq!(fields[1].description.as_deref(), Some("free text"));
    }

    #[test]
    fn incomplete_query_response_parses() {
        let response: QueryResponse = serde_json::from_value(json!({
            "jobReference": {"projectId": "p", "jobId": "job_1", "location": "US"},
            "jobComplete": false,
        }))
        .unwrap();
        assert!(!response.job_complete);
        assert!(response.rows.is_empty());
        assert_eq!(response.job_reference.unwrap().job_id, "job_1");
    }

    #[test]
    fn job_errors_are_joined() {
        let job = JobReference {
            project_id: "p".to_string(),
            job_id: "j".to_string(),
            location: None,
        };
        let errors = vec![
            ErrorProto {
                message: Some("bad column".to_string()),
            },
            ErrorProto { message: None },
            ErrorProto {
                message: Some("syntax".to_string()),
            },
        ];
        let err = job_failure(Some(&job), &errors).unwrap();
        assert_eq!(err.to_string(), "query job j failed: bad column; syntax");
        assert!(job_failure(Some(&job), &[]).is_none());
    }

    #[test]
    fn errors_without_results_fail_the_query() {
        let response: QueryResponse = serde_json::from_value(json!({
            "jobReference": {"projectId": "p", "jobId": "job_2"},
            "jobComplete": true,
            "errors": [{"message": "Unrecognized name: nme"}],
        }))
        .unwrap();
        let err = check_errors(&response).unwrap_err();
        assert_eq!(err.to_string(), "query job job_2 failed: Unrecognized name: nme");
    }

    #[test]
    fn errors_next_to_results_are_only_warnings() {
        let response: QueryResponse = serde_json::from_value(json!({
            "jobReference": {"projectId": "p", "jobId": "job_3"},
            "jobComplete": true,
            "schema": {"fields": [{"name": "n", "type": "INTEGER"}]},
            "rows": [{"f": [{"v": "1"}]}],
            "errors": [{"message": "Slot contention"}],
        }))
        .unwrap();
        assert!(check_errors(&response).is_ok());
    }

    #[test]
    fn api_error_envelope_extracts_message() {
        let envelope: ErrorEnvelope = serde_json::from_str(
            r#"{"error": {"code": 404, "message": "Not found: Dataset p:nope", "status": "NOT_FOUND"}}"#,
        )
        .unwrap();
        assert_eq!(envelope.error.message, "Not found: Dataset p:nope");
    }
}
