use super::BlobStore;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use listings_core::{Error, Result};
use tracing::{debug, instrument};

pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
}

impl S3BlobStore {
    pub async fn new(bucket: String, aws_profile: Option<String>, region: Option<String>) -> Self {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

        if let Some(region) = region {
            config_loader = config_loader.region(aws_config::Region::new(region));
        }

        if let Some(profile) = &aws_profile {
            config_loader = config_loader.profile_name(profile);
        }

        let config = config_loader.load().await;

        Self {
            client: S3Client::new(&config),
            bucket,
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, body), fields(bytes = body.len()))]
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<String> {
        debug!(bucket = %self.bucket, key, "Uploading S3 object");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                let details = match e {
                    aws_sdk_s3::error::SdkError::ServiceError(ref err) => {
                        format!("S3 service error for key '{}': {:?}", key, err)
                    }
                    _ => format!("Failed to upload S3 key '{}': {}", key, e),
                };
                Error::Sink {
                    destination: format!("s3://{}", self.bucket),
                    details,
                }
            })?;

        Ok(format!("s3://{}/{}", self.bucket, key))
    }
}
