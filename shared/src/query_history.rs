//! Query-history store backed by LanceDB on S3.
//!
//! Every successful Athena query is upserted as a [`QueryHistoryRecord`]
//! keyed by a fresh random `query_id`, with an embedding of the originating
//! prompt as the vector column. New prompts retrieve their nearest
//! neighbors to serve as few-shot exemplars.

use std::sync::Arc;

use arrow_array::builder::{ListBuilder, StringBuilder};
use arrow_array::cast::AsArray;
use arrow_array::types::{Float32Type, Int64Type};
use arrow_array::{
    Array, FixedSizeListArray, Int64Array, RecordBatch, RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Connection, DistanceType, Table};
use tracing::{info, warn};
use uuid::Uuid;

use crate::embeddings::{EmbeddingClient, EMBEDDING_DIM};
use crate::models::QueryHistoryRecord;
use crate::sql_metadata::extract_sql_metadata;
use crate::{Error, Result};

/// LanceDB table holding the query history.
pub const TABLE_NAME: &str = "workout_queries";

/// Hard cap on the number of nearest neighbors returned by a search.
pub const MAX_NEIGHBORS: usize = 20;

/// Store of successfully executed queries, searchable by prompt similarity.
#[derive(Clone)]
pub struct QueryHistoryStore {
    uri: String,
    table_name: String,
    embeddings: EmbeddingClient,
}

impl QueryHistoryStore {
    /// Create a store over the given LanceDB URI (`s3://bucket/lancedb` in
    /// production, a local path in tests).
    pub fn new(uri: impl Into<String>, embeddings: EmbeddingClient) -> Self {
        Self {
            uri: uri.into(),
            table_name: TABLE_NAME.to_string(),
            embeddings,
        }
    }

    /// Record a successful query. The prompt is embedded and the record is
    /// merge-inserted on `query_id`: update if the key exists, insert
    /// otherwise. Keys are fresh UUIDs, so the practical effect is
    /// always-insert.
    ///
    /// Returns the generated `query_id`.
    pub async fn record_successful_query(
        &self,
        user_prompt: &str,
        sql_query: &str,
        returned_rows: i64,
    ) -> Result<String> {
        let metadata = extract_sql_metadata(sql_query);
        let query_id = Uuid::new_v4().simple().to_string();

        let record = QueryHistoryRecord {
            user_prompt: user_prompt.to_string(),
            query_id: query_id.clone(),
            sql_query: sql_query.to_string(),
            tables_used: metadata.tables_used,
            columns_used: metadata.columns_used,
            query_type: metadata.query_type,
            returned_rows,
            timestamp: Utc::now(),
        };

        let vector = self.embeddings.embed(user_prompt).await?;
        self.upsert(&record, &vector).await?;

        info!(query_id = %record.query_id, "Recorded successful query");
        Ok(query_id)
    }

    /// Retrieve the k nearest historical queries for a prompt, capped at
    /// [`MAX_NEIGHBORS`].
    pub async fn retrieve_similar(&self, prompt: &str, k: usize) -> Result<Vec<QueryHistoryRecord>> {
        let vector = self.embeddings.embed(prompt).await?;
        self.search_by_vector(&vector, k).await
    }

    /// Upsert a record with a pre-computed embedding.
    pub async fn upsert(&self, record: &QueryHistoryRecord, vector: &[f32]) -> Result<()> {
        let db = self.connect_db().await?;
        let table = self.open_or_create_table(&db).await?;

        let batch = record_to_batch(record, vector)?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema);

        let mut merge = table.merge_insert(&["query_id"]);
        merge
            .when_matched_update_all(None)
            .when_not_matched_insert_all();
        merge.execute(Box::new(batches)).await?;

        Ok(())
    }

    /// Nearest-neighbor search with a pre-computed query vector.
    pub async fn search_by_vector(
        &self,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<QueryHistoryRecord>> {
        let k = k.min(MAX_NEIGHBORS);
        let db = self.connect_db().await?;

        let names = db.table_names().execute().await?;
        if !names.contains(&self.table_name) {
            warn!(table = %self.table_name, "Query history table does not exist yet");
            return Ok(Vec::new());
        }

        let table = db.open_table(&self.table_name).execute().await?;
        let batches: Vec<RecordBatch> = table
            .query()
            .nearest_to(vector.to_vec())?
            .distance_type(DistanceType::Cosine)
            .limit(k)
            .execute()
            .await?
            .try_collect()
            .await?;

        let mut records = Vec::new();
        for batch in &batches {
            records.extend(batch_to_records(batch)?);
        }
        records.truncate(k);

        if records.is_empty() {
            warn!("Query history search returned no results");
        }
        Ok(records)
    }

    async fn connect_db(&self) -> Result<Connection> {
        Ok(connect(&self.uri).execute().await?)
    }

    async fn open_or_create_table(&self, db: &Connection) -> Result<Table> {
        let names = db.table_names().execute().await?;
        if names.contains(&self.table_name) {
            return Ok(db.open_table(&self.table_name).execute().await?);
        }

        let schema = history_schema();
        let empty = RecordBatchIterator::new(vec![].into_iter().map(Ok), schema);
        let table = db
            .create_table(&self.table_name, Box::new(empty))
            .execute()
            .await?;
        info!(table = %self.table_name, uri = %self.uri, "Created query history table");
        Ok(table)
    }
}

fn history_schema() -> Arc<Schema> {
    let string_list = || {
        DataType::List(Arc::new(Field::new("item", DataType::Utf8, true)))
    };
    Arc::new(Schema::new(vec![
        Field::new("user_prompt", DataType::Utf8, false),
        Field::new("query_id", DataType::Utf8, false),
        Field::new("sql_query", DataType::Utf8, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                EMBEDDING_DIM as i32,
            ),
            false,
        ),
        Field::new("tables_used", string_list(), false),
        Field::new("columns_used", string_list(), false),
        Field::new("query_type", string_list(), false),
        Field::new("returned_rows", DataType::Int64, false),
        Field::new("timestamp_ms", DataType::Int64, false),
    ]))
}

fn string_list_array(values: &[String]) -> Result<Arc<dyn Array>> {
    let mut builder = ListBuilder::new(StringBuilder::new());
    for value in values {
        builder.values().append_value(value);
    }
    builder.append(true);
    Ok(Arc::new(builder.finish()))
}

fn record_to_batch(record: &QueryHistoryRecord, vector: &[f32]) -> Result<RecordBatch> {
    if vector.len() != EMBEDDING_DIM {
        return Err(Error::Validation(format!(
            "Embedding must have {} dimensions, got {}",
            EMBEDDING_DIM,
            vector.len()
        )));
    }

    let vector_array = FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
        vec![Some(vector.iter().map(|&f| Some(f)).collect::<Vec<_>>())],
        EMBEDDING_DIM as i32,
    );

    let batch = RecordBatch::try_new(
        history_schema(),
        vec![
            Arc::new(StringArray::from(vec![record.user_prompt.clone()])),
            Arc::new(StringArray::from(vec![record.query_id.clone()])),
            Arc::new(StringArray::from(vec![record.sql_query.clone()])),
            Arc::new(vector_array),
            string_list_array(&record.tables_used)?,
            string_list_array(&record.columns_used)?,
            string_list_array(&record.query_type)?,
            Arc::new(Int64Array::from(vec![record.returned_rows])),
            Arc::new(Int64Array::from(vec![record.timestamp.timestamp_millis()])),
        ],
    )?;
    Ok(batch)
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| Error::Internal(format!("Missing or mistyped column '{}'", name)))
}

fn string_list_column(batch: &RecordBatch, name: &str) -> Result<Vec<Vec<String>>> {
    let list = batch
        .column_by_name(name)
        .map(|col| col.as_list::<i32>())
        .ok_or_else(|| Error::Internal(format!("Missing column '{}'", name)))?;

    let mut rows = Vec::with_capacity(list.len());
    for i in 0..list.len() {
        let values = list.value(i);
        let strings = values
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| Error::Internal(format!("Column '{}' is not a string list", name)))?;
        rows.push(
            strings
                .iter()
                .map(|s| s.unwrap_or_default().to_string())
                .collect(),
        );
    }
    Ok(rows)
}

fn batch_to_records(batch: &RecordBatch) -> Result<Vec<QueryHistoryRecord>> {
    let user_prompts = string_column(batch, "user_prompt")?;
    let query_ids = string_column(batch, "query_id")?;
    let sql_queries = string_column(batch, "sql_query")?;
    let tables = string_list_column(batch, "tables_used")?;
    let columns = string_list_column(batch, "columns_used")?;
    let query_types = string_list_column(batch, "query_type")?;
    let returned_rows = batch
        .column_by_name("returned_rows")
        .map(|col| col.as_primitive::<Int64Type>())
        .ok_or_else(|| Error::Internal("Missing column 'returned_rows'".to_string()))?;
    let timestamps = batch
        .column_by_name("timestamp_ms")
        .map(|col| col.as_primitive::<Int64Type>())
        .ok_or_else(|| Error::Internal("Missing column 'timestamp_ms'".to_string()))?;

    let mut records = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        records.push(QueryHistoryRecord {
            user_prompt: user_prompts.value(i).to_string(),
            query_id: query_ids.value(i).to_string(),
            sql_query: sql_queries.value(i).to_string(),
            tables_used: tables[i].clone(),
            columns_used: columns[i].clone(),
            query_type: query_types[i].clone(),
            returned_rows: returned_rows.value(i),
            timestamp: DateTime::<Utc>::from_timestamp_millis(timestamps.value(i))
                .unwrap_or_default(),
        });
    }
    Ok(records)
}

/// Render retrieved records as few-shot exemplars for the agent prompt.
pub fn format_exemplars(records: &[QueryHistoryRecord]) -> String {
    if records.is_empty() {
        return String::new();
    }
    let mut blocks = Vec::with_capacity(records.len());
    for record in records {
        blocks.push(format!(
            "Prompt: {}\nSQL: {}\nTables: {}\nColumns: {}\nReturned rows: {}",
            record.user_prompt,
            record.sql_query,
            record.tables_used.join(", "),
            record.columns_used.join(", "),
            record.returned_rows,
        ));
    }
    blocks.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_bedrockruntime::Client as BedrockClient;

    fn sample_record(query_id: &str, prompt: &str) -> QueryHistoryRecord {
        QueryHistoryRecord {
            user_prompt: prompt.to_string(),
            query_id: query_id.to_string(),
            sql_query: "SELECT reps FROM sets".to_string(),
            tables_used: vec!["sets".to_string()],
            columns_used: vec!["reps".to_string()],
            query_type: vec!["SELECT".to_string()],
            returned_rows: 12,
            timestamp: Utc::now(),
        }
    }

    fn unit_vector(hot: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[hot] = 1.0;
        v
    }

    async fn test_store(uri: &str) -> QueryHistoryStore {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        let embeddings = EmbeddingClient::new(BedrockClient::new(&config));
        QueryHistoryStore::new(uri, embeddings)
    }

    #[test]
    fn test_record_batch_round_trip() {
        let record = sample_record("q1", "total reps in 2023");
        let batch = record_to_batch(&record, &unit_vector(0)).unwrap();
        let decoded = batch_to_records(&batch).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].query_id, "q1");
        assert_eq!(decoded[0].tables_used, vec!["sets"]);
        assert_eq!(decoded[0].returned_rows, 12);
    }

    #[test]
    fn test_record_batch_rejects_wrong_dimension() {
        let record = sample_record("q1", "total reps in 2023");
        assert!(record_to_batch(&record, &[0.0, 1.0]).is_err());
    }

    #[test]
    fn test_format_exemplars() {
        let record = sample_record("q1", "total reps in 2023");
        let rendered = format_exemplars(&[record]);
        assert!(rendered.contains("SELECT reps FROM sets"));
        assert!(rendered.contains("total reps in 2023"));
        assert_eq!(format_exemplars(&[]), "");
    }

    #[tokio::test]
    async fn test_upsert_and_search_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path().to_str().unwrap()).await;

        store
            .upsert(&sample_record("q1", "total reps in 2023"), &unit_vector(0))
            .await
            .unwrap();
        store
            .upsert(&sample_record("q2", "heaviest bench press"), &unit_vector(1))
            .await
            .unwrap();

        let results = store.search_by_vector(&unit_vector(0), 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].query_id, "q1");
    }

    #[tokio::test]
    async fn test_upsert_is_keyed_by_query_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path().to_str().unwrap()).await;

        let mut record = sample_record("q1", "total reps in 2023");
        store.upsert(&record, &unit_vector(0)).await.unwrap();

        record.returned_rows = 99;
        store.upsert(&record, &unit_vector(0)).await.unwrap();

        let results = store.search_by_vector(&unit_vector(0), 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].returned_rows, 99);
    }

    #[tokio::test]
    async fn test_search_caps_neighbors_at_twenty() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path().to_str().unwrap()).await;

        for i in 0..25 {
            let record = sample_record(&format!("q{}", i), "total reps in 2023");
            store.upsert(&record, &unit_vector(i)).await.unwrap();
        }

        let results = store.search_by_vector(&unit_vector(0), 25).await.unwrap();
        assert_eq!(results.len(), MAX_NEIGHBORS);

        let results = store.search_by_vector(&unit_vector(0), 3).await.unwrap();
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn test_search_on_missing_table_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path().to_str().unwrap()).await;
        let results = store.search_by_vector(&unit_vector(0), 5).await.unwrap();
        assert!(results.is_empty());
    }
}
