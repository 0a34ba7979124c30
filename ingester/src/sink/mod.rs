pub mod object_store;
pub mod warehouse;

use crate::model::Record;
use crate::transform::{rows_to_csv, ListingRow};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use listings_core::Result;
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LandingReceipt {
    pub destination: String,
    pub blob_uri: Option<String>,
    pub rows_loaded: u64,
    pub raw_archived: usize,
}

/// Accepts a finished batch for durable storage. Called once per batch, never retried.
#[async_trait]
pub trait IngestionSink: Send + Sync {
    async fn land(&self, records: &[Record], destination: &str) -> Result<LandingReceipt>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Uploads `body` under `key` and returns the object URI.
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<String>;
}

#[async_trait]
pub trait TableLoader: Send + Sync {
    /// Appends the CSV (with header) to `table`, returning the number of rows written.
    async fn load_csv(&self, table: &str, csv: Bytes) -> Result<u64>;
}

pub fn processed_blob_key(prefix: &str, at: DateTime<Utc>) -> String {
    format!("processed/{}_{}.csv", prefix, at.format("%Y-%m-%d_%H-%M-%S"))
}

pub fn raw_blob_key(listing_id: &str, at: DateTime<Utc>) -> String {
    format!("raw/{}_{}.json", at.format("%Y/%-m/%-d/%-H_%-M"), listing_id)
}

/// Transforms records to rows, uploads the CSV, then loads it into the warehouse table.
pub struct LandingSink {
    blobs: Arc<dyn BlobStore>,
    loader: Arc<dyn TableLoader>,
    blob_prefix: String,
    archive_raw: bool,
}

impl LandingSink {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        loader: Arc<dyn TableLoader>,
        blob_prefix: impl Into<String>,
        archive_raw: bool,
    ) -> Self {
        Self {
            blobs,
            loader,
            blob_prefix: blob_prefix.into(),
            archive_raw,
        }
    }

    async fn archive(&self, records: &[Record], at: DateTime<Utc>) -> Result<usize> {
        let mut archived = 0;
        for record in records {
            let id = match record.get("id") {
                Some(serde_json::Value::String(id)) => id.clone(),
                Some(serde_json::Value::Number(id)) => id.to_string(),
                _ => {
                    debug!("Skipping raw archive for record without id");
                    continue;
                }
            };
            let body = serde_json::to_vec(record)?;
            self.blobs
                .put(&raw_blob_key(&id, at), Bytes::from(body), "application/json")
                .await?;
            archived += 1;
        }
        Ok(archived)
    }
}

#[async_trait]
impl IngestionSink for LandingSink {
    #[instrument(skip(self, records), fields(records = records.len()))]
    async fn land(&self, records: &[Record], destination: &str) -> Result<LandingReceipt> {
        if records.is_empty() {
            info!(destination, "Nothing to land");
            return Ok(LandingReceipt {
                destination: destination.to_string(),
                blob_uri: None,
                rows_loaded: 0,
                raw_archived: 0,
            });
        }

        let landed_at = Utc::now();
        let raw_archived = if self.archive_raw {
            self.archive(records, landed_at).await?
        } else {
            0
        };

        let rows: Vec<ListingRow> = records.iter().map(ListingRow::from_record).collect();
        let csv = Bytes::from(rows_to_csv(&rows)?);

        let key = processed_blob_key(&self.blob_prefix, landed_at);
        let blob_uri = self.blobs.put(&key, csv.clone(), "text/csv").await?;
        info!(uri = %blob_uri, rows = rows.len(), "CSV uploaded");

        let rows_loaded = self.loader.load_csv(destination, csv).await?;
        counter!("ingester_records_landed", "destination" => destination.to_string())
            .increment(rows_loaded);
        info!(destination, rows_loaded, "Loaded batch into warehouse table");

        Ok(LandingReceipt {
            destination: destination.to_string(),
            blob_uri: Some(blob_uri),
            rows_loaded,
            raw_archived,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{MemoryBlobStore, MemoryLoader};
    use super::*;
    use chrono::TimeZone;
    use listings_core::Error;
    use serde_json::json;

    fn records() -> Vec<Record> {
        [json!({"id": 1, "name": "Rocky"}), json!({"id": 2, "name": "Luna"})]
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect()
    }

    #[test]
    fn blob_keys_follow_layout() {
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap();

        assert_eq!(
            processed_blob_key("listings", at),
            "processed/listings_2024-03-07_09-05-02.csv"
        );
        assert_eq!(raw_blob_key("42", at), "raw/2024/3/7/9_5_42.json");
    }

    #[tokio::test]
    async fn lands_csv_then_loads_table() {
        let blobs = Arc::new(MemoryBlobStore::default());
        let loader = Arc::new(MemoryLoader::default());
        let sink = LandingSink::new(blobs.clone(), loader.clone(), "listings", false);

        let receipt = sink.land(&records(), "raw_listings").await.expect("land");

        assert_eq!(receipt.rows_loaded, 2);
        assert_eq!(receipt.raw_archived, 0);
        let objects = blobs.objects.lock().expect("lock");
        assert_eq!(objects.len(), 1);
        assert!(objects[0].0.starts_with("processed/listings_"));
        assert_eq!(objects[0].2, "text/csv");
        assert_eq!(receipt.blob_uri, Some(format!("mem://bucket/{}", objects[0].0)));

        let loads = loader.loads.lock().expect("lock");
        assert_eq!(loads[0].0, "raw_listings");
        assert_eq!(loads[0].1, objects[0].1);
    }

    #[tokio::test]
    async fn archives_raw_records_when_enabled() {
        let blobs = Arc::new(MemoryBlobStore::default());
        let sink = LandingSink::new(blobs.clone(), Arc::new(MemoryLoader::default()), "listings", true);

        let receipt = sink.land(&records(), "raw_listings").await.expect("land");

        assert_eq!(receipt.raw_archived, 2);
        let objects = blobs.objects.lock().expect("lock");
        let raw: Vec<_> = objects.iter().filter(|(key, _, _)| key.starts_with("raw/")).collect();
        assert_eq!(raw.len(), 2);
        assert!(raw[0].0.ends_with("_1.json"));
        assert_eq!(raw[0].2, "application/json");
    }

    #[tokio::test]
    async fn empty_batch_is_not_landed() {
        let blobs = Arc::new(MemoryBlobStore::default());
        let loader = Arc::new(MemoryLoader::default());
        let sink = LandingSink::new(blobs.clone(), loader.clone(), "listings", true);

        let receipt = sink.land(&[], "raw_listings").await.expect("land");

        assert_eq!(receipt.blob_uri, None);
        assert!(blobs.objects.lock().expect("lock").is_empty());
        assert!(loader.loads.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn load_failure_propagates() {
        let loader = Arc::new(MemoryLoader {
            fail: true,
            ..MemoryLoader::default()
        });
        let sink = LandingSink::new(Arc::new(MemoryBlobStore::default()), loader, "listings", false);

        let err = sink.land(&records(), "raw_listings").await.expect_err("load fails");
        assert!(matches!(err, Error::Sink { .. }));
    }
}
