// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage device tests: local transfers and S3 uploads against a mock bucket.

use runtara_executor::storage::{
    LocalDevice, S3Config, S3Device, S3Provider, StorageDevice, TRANSFER_CHUNK_SIZE,
};
use wiremock::matchers::{header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn s3_device(server: &MockServer) -> S3Device {
    S3Device::new(
        "builds",
        S3Config {
            provider: S3Provider::S3,
            access_key: "AKIAEXAMPLE".to_string(),
            secret: "secret".to_string(),
            region: "us-east-1".to_string(),
            bucket: "bucket".to_string(),
            endpoint: Some(server.uri()),
        },
    )
}

fn write_source(dir: &tempfile::TempDir, len: usize) -> String {
    let path = dir.path().join("code.tar.gz");
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path.to_string_lossy().into_owned()
}

#[tokio::test]
async fn test_local_transfer_between_roots() {
    let source_dir = tempfile::tempdir().unwrap();
    let target_dir = tempfile::tempdir().unwrap();
    let source = write_source(&source_dir, 1024);

    let from = LocalDevice::new(source_dir.path().to_string_lossy());
    let to = LocalDevice::new(target_dir.path().to_string_lossy());
    let destination = to.get_path("nested/artifact.gz");

    from.transfer(&source, &destination, &to).await.unwrap();

    assert!(to.exists(&destination).await.unwrap());
    assert_eq!(to.file_size(&destination).await.unwrap(), 1024);
    assert_eq!(
        std::fs::read(&destination).unwrap(),
        std::fs::read(&source).unwrap()
    );
}

#[tokio::test]
async fn test_local_transfer_of_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let device = LocalDevice::new(dir.path().to_string_lossy());
    let missing = device.get_path("missing.tar.gz");

    assert!(
        device
            .transfer(&missing, &device.get_path("copy.gz"), &device)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_s3_small_upload_is_single_put() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/bucket/builds/artifact.gz"))
        .and(header_exists("authorization"))
        .and(header_exists("x-amz-date"))
        .and(header_exists("x-amz-content-sha256"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = write_source(&dir, 2048);
    let local = LocalDevice::new(dir.path().to_string_lossy());
    let s3 = s3_device(&server);

    let destination = s3.get_path("artifact.gz");
    assert_eq!(destination, "builds/artifact.gz");
    local.transfer(&source, &destination, &s3).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body.len(), 2048);
    let authorization = requests[0].headers["authorization"].to_str().unwrap();
    assert!(authorization.starts_with("AWS4-HMAC-SHA256 Credential=AKIAEXAMPLE/"));
    assert!(authorization.contains("/us-east-1/s3/aws4_request"));
}

#[tokio::test]
async fn test_s3_large_upload_is_multipart() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bucket/builds/big.gz"))
        .and(query_param("uploads", ""))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<InitiateMultipartUploadResult><UploadId>upload-1</UploadId></InitiateMultipartUploadResult>",
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/bucket/builds/big.gz"))
        .and(query_param("uploadId", "upload-1"))
        .respond_with(ResponseTemplate::new(200).insert_header("etag", "\"part-etag\""))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bucket/builds/big.gz"))
        .and(query_param("uploadId", "upload-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = write_source(&dir, TRANSFER_CHUNK_SIZE as usize + 10);
    let local = LocalDevice::new(dir.path().to_string_lossy());
    let s3 = s3_device(&server);

    local
        .transfer(&source, &s3.get_path("big.gz"), &s3)
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let complete = requests
        .iter()
        .find(|r| r.method.as_str() == "POST" && r.url.query().is_some_and(|q| q.contains("uploadId")))
        .unwrap();
    let body = String::from_utf8_lossy(&complete.body);
    assert!(body.contains("<PartNumber>1</PartNumber>"));
    assert!(body.contains("<PartNumber>2</PartNumber>"));
    assert!(body.contains("part-etag"));
}

#[tokio::test]
async fn test_s3_remote_error_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(403).set_body_string("AccessDenied"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = write_source(&dir, 16);
    let local = LocalDevice::new(dir.path().to_string_lossy());
    let s3 = s3_device(&server);

    let err = local
        .transfer(&source, &s3.get_path("denied.gz"), &s3)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("403"), "error: {err}");
}

#[tokio::test]
async fn test_s3_exists_and_listing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bucket/"))
        .and(query_param("list-type", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<ListBucketResult><Contents><Key>builds/a.gz</Key></Contents>\
             <Contents><Key>builds/b.gz</Key></Contents>\
             <IsTruncated>false</IsTruncated></ListBucketResult>",
        ))
        .mount(&server)
        .await;

    let s3 = s3_device(&server);
    // Unmatched HEAD requests get a 404
    assert!(!s3.exists("builds/missing.gz").await.unwrap());

    let files = s3.get_files("builds/").await.unwrap();
    assert_eq!(files, vec!["builds/a.gz", "builds/b.gz"]);
}
