use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Credentials;
use bytes::Bytes;
use futures::StreamExt;
use stowage_storage::{ByteRange, ListingOptions, S3Backend, StorageBackend};
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::{ContainerAsync, GenericImage, ImageExt, runners::AsyncRunner};

const MINIO_IMAGE: &str = "minio/minio";
const MINIO_TAG: &str = "RELEASE.2024-02-12T21-36-45Z";

fn should_skip_s3_tests() -> bool {
    std::env::var("SKIP_S3_TESTS").is_ok()
}

struct MinioContext {
    _container: ContainerAsync<GenericImage>,
    endpoint: String,
    access_key: String,
    secret_key: String,
}

impl MinioContext {
    async fn new() -> Result<Self, String> {
        let access_key = "minio-access-key".to_string();
        let secret_key = "minio-secret-key".to_string();

        let container: ContainerAsync<GenericImage> = GenericImage::new(MINIO_IMAGE, MINIO_TAG)
            .with_exposed_port(9000.tcp())
            .with_wait_for(WaitFor::message_on_stdout("API:"))
            .with_env_var("MINIO_ROOT_USER", access_key.clone())
            .with_env_var("MINIO_ROOT_PASSWORD", secret_key.clone())
            .with_cmd(vec!["server", "/data"])
            .start()
            .await
            .map_err(|e| format!("failed to start MinIO container: {e}"))?;

        let host = container
            .get_host()
            .await
            .map_err(|e| format!("failed to get host: {e}"))?;
        let port = container
            .get_host_port_ipv4(9000.tcp())
            .await
            .map_err(|e| format!("failed to get port: {e}"))?;

        let endpoint = format!("http://{host}:{port}");

        Ok(Self {
            _container: container,
            endpoint,
            access_key,
            secret_key,
        })
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), String> {
        let credentials = Credentials::new(
            self.access_key.clone(),
            self.secret_key.clone(),
            None,
            None,
            "test",
        );
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new("us-east-1"))
            .credentials_provider(credentials)
            .http_client(aws_smithy_http_client::Builder::new().build_http())
            .endpoint_url(self.endpoint.clone())
            .force_path_style(true)
            .build();

        let client = Client::from_conf(config);
        client
            .create_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| format!("failed to create bucket: {e}"))?;
        Ok(())
    }
}

struct S3TestHarness {
    _context: MinioContext,
    backend: S3Backend,
}

impl S3TestHarness {
    async fn new(prefix: Option<String>) -> Result<Self, String> {
        let context = MinioContext::new().await?;
        let bucket = "stowage-test";
        context.create_bucket(bucket).await?;

        let backend = S3Backend::new(
            bucket,
            Some(context.endpoint.clone()),
            Some("us-east-1".to_string()),
            prefix,
            Some(context.access_key.clone()),
            Some(context.secret_key.clone()),
            true,
        )
        .await
        .map_err(|e| format!("failed to create S3 backend: {e}"))?;

        Ok(Self {
            _context: context,
            backend,
        })
    }
}

async fn harness_or_skip(prefix: Option<String>) -> Option<S3TestHarness> {
    if should_skip_s3_tests() {
        return None;
    }
    match S3TestHarness::new(prefix).await {
        Ok(harness) => Some(harness),
        Err(err) => {
            eprintln!("Skipping S3 test: {err}");
            None
        }
    }
}

#[tokio::test]
async fn test_s3_put_get_list_pages_with_prefix() {
    let Some(harness) = harness_or_skip(Some("prefix".to_string())).await else {
        return;
    };
    let backend = &harness.backend;

    for name in ["a", "b", "c"] {
        backend
            .put(&format!("items/{name}"), Bytes::from(name.to_string()))
            .await
            .unwrap();
    }

    let mut stream = backend.list_pages("items/", ListingOptions::new(2));
    let mut pages = Vec::new();
    while let Some(page) = stream.next().await {
        pages.push(page.unwrap());
    }
    assert_eq!(pages.len(), 2);
    assert_eq!(pages[0].len(), 2);

    assert_eq!(
        backend.list("items/").await.unwrap(),
        vec!["items/a", "items/b", "items/c"]
    );
    assert_eq!(
        backend.get("items/b").await.unwrap(),
        Some(Bytes::from_static(b"b"))
    );
    assert_eq!(backend.get("items/zzz").await.unwrap(), None);
    assert!(backend.delete("items/a").await.unwrap());
    assert!(!backend.delete("items/a").await.unwrap());
}

#[tokio::test]
async fn test_s3_multipart_stream_and_ranged_read() {
    let Some(harness) = harness_or_skip(None).await else {
        return;
    };
    let backend = &harness.backend;
    let key = "streamed.bin";

    let data = vec![7u8; 10 * 1024 * 1024];
    let split_at = 3 * 1024 * 1024;

    let mut upload = backend.put_stream(key).await.unwrap();
    upload
        .write(Bytes::from(data[..split_at].to_vec()))
        .await
        .unwrap();
    upload
        .write(Bytes::from(data[split_at..].to_vec()))
        .await
        .unwrap();
    let total = upload.finish().await.unwrap();
    assert_eq!(total as usize, data.len());
    assert_eq!(backend.head(key).await.unwrap().size, data.len() as u64);

    let ranged = backend
        .get_stream(key, Some(ByteRange::new(0, 1023)))
        .await
        .unwrap();
    assert_eq!(ranged.size, data.len() as u64);
    let bytes = ranged.collect_bytes().await.unwrap();
    assert_eq!(bytes.len(), 1024);
    assert!(bytes.iter().all(|b| *b == 7));
}

#[tokio::test]
async fn test_s3_range_past_end_is_clamped() {
    let Some(harness) = harness_or_skip(None).await else {
        return;
    };
    let backend = &harness.backend;
    backend
        .put("r", Bytes::from_static(b"abcdefghijkl"))
        .await
        .unwrap();

    let tail = backend
        .get_stream("r", Some(ByteRange::new(10, 500)))
        .await
        .unwrap();
    assert_eq!(tail.size, 12);
    assert_eq!(tail.collect_bytes().await.unwrap(), Bytes::from_static(b"kl"));

    let empty = backend
        .get_stream("r", Some(ByteRange::from(12)))
        .await
        .unwrap();
    assert!(empty.collect_bytes().await.unwrap().is_empty());
}
