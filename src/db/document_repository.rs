use crate::db::models::Document;
use crate::db::task_repository::now_string;
use crate::errors::Error;
use crate::schema::documents;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde_json::Value;

/// Repository for fetched documents, keyed by subject
pub struct DocumentRepository<'a> {
    pub conn: &'a mut SqliteConnection,
}

impl<'a> DocumentRepository<'a> {
    pub fn new(conn: &'a mut SqliteConnection) -> Self {
        DocumentRepository { conn }
    }

    pub fn get(&mut self, subject_id: &str) -> Result<Option<Document>, Error> {
        let found = documents::table
            .filter(documents::subject_id.eq(subject_id))
            .first::<Document>(self.conn)
            .optional()?;
        Ok(found)
    }

    /// Stores freshly fetched content, replacing any earlier copy and its analysis
    pub fn upsert_content(
        &mut self,
        subject_id: &str,
        source_url: Option<&str>,
        content_type: Option<&str>,
        content: &str,
    ) -> Result<Document, Error> {
        let document = Document {
            subject_id: subject_id.to_string(),
            source_url: source_url.map(str::to_string),
            content_type: content_type.map(str::to_string),
            content: content.to_string(),
            fetched_at: now_string(),
            analysis: None,
            analyzed_at: None,
        };

        diesel::replace_into(documents::table)
            .values(&document)
            .execute(self.conn)?;
        Ok(document)
    }

    /// Attaches an analysis to an existing document
    ///
    /// # Returns
    ///
    /// `false` if no document exists for `subject_id`
    pub fn save_analysis(&mut self, subject_id: &str, analysis: &Value) -> Result<bool, Error> {
        let analysis = serde_json::to_string(analysis)?;
        let updated = diesel::update(documents::table.filter(documents::subject_id.eq(subject_id)))
            .set((
                documents::analysis.eq(Some(analysis)),
                documents::analyzed_at.eq(Some(now_string())),
            ))
            .execute(self.conn)?;
        Ok(updated > 0)
    }
}
