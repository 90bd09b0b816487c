//! Document repository: simple CRUD over the `documents` table. A
//! document's chart owner never changes and its blob location is
//! immutable once set, so there is deliberately no `update_blob_location`
//! method -- only fields that evolve during extraction are mutable.

use sqlx::postgres::PgPool;

use crate::error::ChartError;
use crate::models::{Document, NewDocument};

pub type DocumentResult<T> = std::result::Result<T, ChartError>;

pub struct DocumentRepository {
    pool: PgPool,
}

impl DocumentRepository {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new_document: &NewDocument) -> DocumentResult<Document> {
        sqlx::query_as(
            r#"
INSERT INTO documents
    (chart_id, mime_type, size_bytes, blob_key, blob_url, blob_bucket,
     transaction_id, transaction_label, is_group_member)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9)
RETURNING *
            "#,
        )
        .bind(new_document.chart_id)
        .bind(&new_document.mime_type)
        .bind(new_document.size_bytes)
        .bind(&new_document.blob_key)
        .bind(&new_document.blob_url)
        .bind(&new_document.blob_bucket)
        .bind(new_document.transaction_id)
        .bind(&new_document.transaction_label)
        .bind(new_document.is_group_member)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| ChartError::query("INSERT", error))
    }

    /// The authoritative document list for a chart, re-read by the worker
    /// on every claimed job rather than trusted from `job_data`.
    pub async fn by_chart_id(&self, chart_id: i64) -> DocumentResult<Vec<Document>> {
        sqlx::query_as("SELECT * FROM documents WHERE chart_id = $1 ORDER BY id ASC")
            .bind(chart_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| ChartError::query("SELECT", error))
    }

    pub async fn get(&self, document_id: i64) -> DocumentResult<Option<Document>> {
        sqlx::query_as("SELECT * FROM documents WHERE id = $1")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| ChartError::query("SELECT", error))
    }

    pub async fn mark_extracted(
        &self,
        document_id: i64,
        text: &str,
        processing_ms: i64,
    ) -> DocumentResult<()> {
        sqlx::query(
            r#"
UPDATE documents
SET ocr_status = 'completed', ocr_text = $2, ocr_processing_ms = $3
WHERE id = $1
            "#,
        )
        .bind(document_id)
        .bind(text)
        .bind(processing_ms)
        .execute(&self.pool)
        .await
        .map_err(|error| ChartError::query("UPDATE", error))?;

        Ok(())
    }

    pub async fn mark_extraction_failed(&self, document_id: i64) -> DocumentResult<()> {
        sqlx::query("UPDATE documents SET ocr_status = 'failed' WHERE id = $1")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(|error| ChartError::query("UPDATE", error))?;

        Ok(())
    }

    pub async fn store_summary(&self, document_id: i64, summary: &str) -> DocumentResult<()> {
        sqlx::query("UPDATE documents SET ai_document_summary = $2 WHERE id = $1")
            .bind(document_id)
            .bind(summary)
            .execute(&self.pool)
            .await
            .map_err(|error| ChartError::query("UPDATE", error))?;

        Ok(())
    }

    pub async fn status_counts(&self, chart_id: i64) -> DocumentResult<(i64, i64, i64)> {
        let row: (i64, i64, i64) = sqlx::query_as(
            r#"
SELECT
    COUNT(*) FILTER (WHERE ocr_status = 'pending'),
    COUNT(*) FILTER (WHERE ocr_status = 'completed'),
    COUNT(*) FILTER (WHERE ocr_status = 'failed')
FROM documents
WHERE chart_id = $1
            "#,
        )
        .bind(chart_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| ChartError::query("SELECT", error))?;

        Ok(row)
    }
}
