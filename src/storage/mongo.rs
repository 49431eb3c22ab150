use anyhow::{Result, Context};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use mongodb::{Client, Database, Collection};
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::options::{
    Acknowledgment, ClientOptions, FindOneOptions, FindOptions, ReplaceOptions, WriteConcern,
};
use std::collections::BTreeMap;
use tracing::debug;

use crate::cli::config::StoreSettings;
use crate::domain::{Job, JobState, ProcessingProfile, TaskResult};
use super::jobs::{JobFilter, JobStore, WriteAck};

impl WriteAck {
    fn write_concern(self) -> WriteConcern {
        let acknowledgment = match self {
            WriteAck::Unacknowledged => Acknowledgment::Nodes(0),
            WriteAck::Acknowledged => Acknowledgment::Nodes(1),
            WriteAck::Majority => Acknowledgment::Majority,
        };
        WriteConcern::builder().w(acknowledgment).build()
    }
}

/// MongoDB implementation of JobStore
pub struct MongoJobStore {
    /// MongoDB database
    database: Database,

    /// Collection prefix
    collection_prefix: String,
}

impl MongoJobStore {
    /// Create a new MongoDB job store; fails when the server cannot be reached
    pub async fn new(settings: &StoreSettings) -> Result<Self> {
        // Parse connection options
        let client_options = ClientOptions::parse(&settings.connection_string)
            .await
            .context(format!("Failed to parse MongoDB connection string: {}", settings.connection_string))?;

        // Create the client
        let client = Client::with_options(client_options)
            .context("Failed to create MongoDB client")?;

        // Get the database
        let database = client.database(&settings.database_name);

        // Test connection
        database.list_collection_names(None)
            .await
            .context("Failed to connect to MongoDB")?;

        debug!("Connected to MongoDB database: {}", settings.database_name);

        Ok(Self {
            database,
            collection_prefix: settings.collection_prefix.clone(),
        })
    }

    fn jobs_collection(&self) -> Collection<Document> {
        self.database.collection(&format!("{}_jobs", self.collection_prefix))
    }

    fn results_collection(&self) -> Collection<Document> {
        self.database.collection(&format!("{}_results", self.collection_prefix))
    }

    fn profiles_collection(&self) -> Collection<Document> {
        self.database.collection(&format!("{}_profiles", self.collection_prefix))
    }

    async fn collect<T: serde::de::DeserializeOwned>(
        mut cursor: mongodb::Cursor<Document>,
        what: &str,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();

        while let Some(doc) = cursor.next().await {
            let doc = doc.context(format!("Failed to read {} from MongoDB", what))?;
            let item: T = bson::from_document(doc)
                .context(format!("Failed to convert BSON document to {}", what))?;
            items.push(item);
        }

        Ok(items)
    }
}

#[async_trait]
impl JobStore for MongoJobStore {
    async fn read_pending_jobs(&self, batch_size: usize, filter: &JobFilter) -> Result<Vec<Job>> {
        let query = doc! {
            "state": JobState::Ready.as_str(),
            "host": { "$nin": filter.excluded_hosts.clone() },
        };

        let options = FindOptions::builder()
            .sort(doc! { "priority": -1, "created_at": 1 })
            .limit(batch_size as i64)
            .build();

        let cursor = self.jobs_collection().find(query, options).await
            .context("Failed to query MongoDB for pending jobs")?;

        let jobs: Vec<Job> = Self::collect(cursor, "Job").await?;
        debug!("Read {} pending jobs", jobs.len());

        Ok(jobs)
    }

    async fn update_job_state(&self, job_id: &str, state: JobState) -> Result<()> {
        let now = bson::to_bson(&Utc::now()).context("Failed to convert timestamp to BSON")?;

        let result = self.jobs_collection()
            .update_one(
                doc! { "id": job_id },
                doc! { "$set": { "state": state.as_str(), "updated_at": now } },
                None,
            )
            .await
            .context(format!("Failed to update state of job {}", job_id))?;

        if result.matched_count == 0 {
            anyhow::bail!("Job not found: {}", job_id);
        }

        debug!("Job {} is now {}", job_id, state.as_str());
        Ok(())
    }

    async fn requeue_loaded_jobs(&self) -> Result<u64> {
        let result = self.jobs_collection()
            .update_many(
                doc! { "state": JobState::Loaded.as_str() },
                doc! { "$set": { "state": JobState::Ready.as_str() } },
                None,
            )
            .await
            .context("Failed to requeue loaded jobs")?;

        Ok(result.modified_count)
    }

    async fn write_result(&self, result: &TaskResult, ack: WriteAck) -> Result<()> {
        // Convert to BSON document
        let doc = bson::to_document(result)
            .context("Failed to convert TaskResult to BSON document")?;

        let options = ReplaceOptions::builder()
            .upsert(true)
            .write_concern(ack.write_concern())
            .build();

        // Upsert keyed by task id so a replayed report overwrites
        self.results_collection()
            .replace_one(doc! { "task_id": &result.task_id }, doc, options)
            .await
            .context("Failed to store task result in MongoDB")?;

        debug!("Stored result for task: {}", result.task_id);

        Ok(())
    }

    async fn read_result(&self, task_id: &str) -> Result<Option<TaskResult>> {
        let result = self.results_collection()
            .find_one(doc! { "task_id": task_id }, None)
            .await
            .context("Failed to query MongoDB for task result")?;

        match result {
            Some(doc) => {
                let task_result: TaskResult = bson::from_document(doc)
                    .context("Failed to convert BSON document to TaskResult")?;
                Ok(Some(task_result))
            }
            None => Ok(None),
        }
    }

    async fn count_by_state(&self) -> Result<BTreeMap<JobState, u64>> {
        let pipeline = vec![doc! { "$group": { "_id": "$state", "count": { "$sum": 1 } } }];

        let mut cursor = self.jobs_collection().aggregate(pipeline, None).await
            .context("Failed to count jobs by state")?;

        let mut counts = BTreeMap::new();

        while let Some(doc) = cursor.next().await {
            let doc = doc.context("Failed to read job counts from MongoDB")?;

            let state: JobState = match doc.get("_id") {
                Some(Bson::String(state)) => bson::from_bson(Bson::String(state.clone()))
                    .context(format!("Unknown job state: {}", state))?,
                _ => continue,
            };

            let count = match doc.get("count") {
                Some(Bson::Int32(n)) => *n as u64,
                Some(Bson::Int64(n)) => *n as u64,
                _ => 0,
            };

            counts.insert(state, count);
        }

        Ok(counts)
    }

    async fn submit_job(&self, job: &Job, ack: WriteAck) -> Result<()> {
        let doc = bson::to_document(job)
            .context("Failed to convert Job to BSON document")?;

        let options = ReplaceOptions::builder()
            .upsert(true)
            .write_concern(ack.write_concern())
            .build();

        self.jobs_collection()
            .replace_one(doc! { "id": &job.id }, doc, options)
            .await
            .context("Failed to store job in MongoDB")?;

        debug!("Stored job: {}", job.id);

        Ok(())
    }

    async fn save_profile(&self, profile: &ProcessingProfile) -> Result<()> {
        let doc = bson::to_document(profile)
            .context("Failed to convert ProcessingProfile to BSON document")?;

        self.profiles_collection()
            .replace_one(
                doc! { "id": &profile.id },
                doc,
                ReplaceOptions::builder().upsert(true).build(),
            )
            .await
            .context("Failed to store processing profile in MongoDB")?;

        debug!("Stored processing profile: {}", profile.id);

        Ok(())
    }

    async fn list_profiles(&self) -> Result<Vec<ProcessingProfile>> {
        let cursor = self.profiles_collection().find(None, None).await
            .context("Failed to query MongoDB for processing profiles")?;

        Self::collect(cursor, "ProcessingProfile").await
    }

    async fn latest_job_for_profile(&self, profile_id: &str) -> Result<Option<Job>> {
        let options = FindOneOptions::builder()
            .sort(doc! { "created_at": -1 })
            .build();

        let result = self.jobs_collection()
            .find_one(doc! { "profile_id": profile_id }, options)
            .await
            .context("Failed to query MongoDB for profile jobs")?;

        match result {
            Some(doc) => {
                let job: Job = bson::from_document(doc)
                    .context("Failed to convert BSON document to Job")?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_concerns() {
        assert_eq!(WriteAck::Unacknowledged.write_concern().w, Some(Acknowledgment::Nodes(0)));
        assert_eq!(WriteAck::Acknowledged.write_concern().w, Some(Acknowledgment::Nodes(1)));
        assert_eq!(WriteAck::Majority.write_concern().w, Some(Acknowledgment::Majority));
    }

    #[tokio::test]
    async fn test_invalid_connection_string_fails() {
        let settings = StoreSettings {
            connection_string: "not-a-mongodb-uri".to_string(),
            ..StoreSettings::default()
        };
        assert!(MongoJobStore::new(&settings).await.is_err());
    }
}
