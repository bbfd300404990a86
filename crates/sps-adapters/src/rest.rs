use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value as JsonValue;
use sps_core::{Gameweek, RecordKind, Table};
use sps_storage::HttpFetcher;
use tracing::{debug, info};

use crate::{windowed_column, RecordSource, SourceError};

#[derive(Debug, Clone)]
pub struct RestSourceConfig {
    pub base_url: String,
    pub page_size: usize,
    pub id_chunk_size: usize,
}

impl Default for RestSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321".to_string(),
            page_size: 1000,
            id_chunk_size: 100,
        }
    }
}

/// PostgREST-style table reader: `GET <base>/rest/v1/<table>?select=*` with
/// `limit`/`offset` paging and column filters.
#[derive(Debug)]
pub struct RestSource {
    http: HttpFetcher,
    base_url: Url,
    page_size: usize,
    id_chunk_size: usize,
}

impl RestSource {
    pub fn new(http: HttpFetcher, config: RestSourceConfig) -> anyhow::Result<Self> {
        let mut base = config.base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = Url::parse(&base)
            .map_err(|err| anyhow::anyhow!("invalid base url {}: {err}", config.base_url))?;
        Ok(Self {
            http,
            base_url,
            page_size: config.page_size.max(1),
            id_chunk_size: config.id_chunk_size.max(1),
        })
    }

    pub fn table_url(
        &self,
        kind: RecordKind,
        filters: &[(String, String)],
        offset: usize,
    ) -> Result<Url, SourceError> {
        let mut url = self
            .base_url
            .join(&format!("rest/v1/{}", kind.source_table()))
            .map_err(|err| anyhow::anyhow!("building url for {}: {err}", kind.source_table()))?;
        let order = kind
            .key_columns()
            .iter()
            .map(|c| format!("{c}.asc"))
            .collect::<Vec<_>>()
            .join(",");
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("select", "*");
            for (column, filter) in filters {
                query.append_pair(column, filter);
            }
            query.append_pair("order", &order);
            query.append_pair("limit", &self.page_size.to_string());
            query.append_pair("offset", &offset.to_string());
        }
        Ok(url)
    }

    /// Reads pages until one comes back empty. The server may return fewer
    /// rows than `limit` (PostgREST `max-rows`), so a short page is not the end.
    async fn fetch_pages(
        &self,
        kind: RecordKind,
        filters: &[(String, String)],
    ) -> Result<Vec<JsonValue>, SourceError> {
        let table = kind.source_table();
        let mut rows = Vec::new();
        let mut offset = 0usize;
        loop {
            let url = self.table_url(kind, filters, offset)?;
            let body = self
                .http
                .fetch_json(url.as_str())
                .await
                .map_err(|source| SourceError::Fetch {
                    table: table.to_string(),
                    source,
                })?;
            let JsonValue::Array(page) = body else {
                return Err(SourceError::Shape {
                    table: table.to_string(),
                });
            };
            if page.is_empty() {
                break;
            }
            let page_len = page.len();
            debug!(table, offset, page_len, "fetched page");
            rows.extend(page);
            offset += page_len;
        }
        Ok(rows)
    }

    fn decode(kind: RecordKind, rows: &[JsonValue]) -> Result<Table, SourceError> {
        Table::from_json_rows(rows).map_err(|source| SourceError::Decode {
            table: kind.source_table().to_string(),
            source,
        })
    }
}

/// `in.("a","b")` filter value with PostgREST quoting.
pub fn postgrest_in_filter(ids: &[String]) -> String {
    let quoted = ids
        .iter()
        .map(|id| format!("\"{}\"", id.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",");
    format!("in.({quoted})")
}

#[async_trait]
impl RecordSource for RestSource {
    fn source_id(&self) -> &str {
        self.base_url.as_str()
    }

    async fn fetch_all(&self, kind: RecordKind) -> Result<Table, SourceError> {
        let rows = self.fetch_pages(kind, &[]).await?;
        info!(table = kind.source_table(), rows = rows.len(), "fetched all records");
        Self::decode(kind, &rows)
    }

    async fn fetch_since(
        &self,
        kind: RecordKind,
        gameweek: Gameweek,
    ) -> Result<Table, SourceError> {
        let column = windowed_column(kind)?;
        let filters = [(column.to_string(), format!("gte.{gameweek}"))];
        let rows = self.fetch_pages(kind, &filters).await?;
        info!(
            table = kind.source_table(),
            gameweek,
            rows = rows.len(),
            "fetched records since gameweek"
        );
        Self::decode(kind, &rows)
    }

    async fn fetch_by_parent_ids(
        &self,
        kind: RecordKind,
        parent_key: &str,
        ids: &[String],
    ) -> Result<Table, SourceError> {
        let mut rows = Vec::new();
        for chunk in ids.chunks(self.id_chunk_size) {
            let filters = [(parent_key.to_string(), postgrest_in_filter(chunk))];
            rows.extend(self.fetch_pages(kind, &filters).await?);
        }
        info!(
            table = kind.source_table(),
            parents = ids.len(),
            rows = rows.len(),
            "fetched records by parent ids"
        );
        Self::decode(kind, &rows)
    }
}
