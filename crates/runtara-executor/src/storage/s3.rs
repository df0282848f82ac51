// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! S3-compatible storage device.
//!
//! One device covers AWS S3 and the S3-compatible providers. Requests are
//! signed with AWS Signature Version 4. Uploads of more than one transfer
//! range use multipart upload.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};

use super::traits::*;

type HmacSha256 = Hmac<Sha256>;

/// S3-compatible provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3Provider {
    /// Amazon S3
    S3,
    /// DigitalOcean Spaces
    DoSpaces,
    /// Backblaze B2
    Backblaze,
    /// Linode Object Storage
    Linode,
    /// Wasabi
    Wasabi,
}

impl S3Provider {
    /// Parse a device name as used in configuration.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "s3" => Some(S3Provider::S3),
            "dospaces" => Some(S3Provider::DoSpaces),
            "backblaze" => Some(S3Provider::Backblaze),
            "linode" => Some(S3Provider::Linode),
            "wasabi" => Some(S3Provider::Wasabi),
            _ => None,
        }
    }

    /// Infix of the provider's discrete environment variables.
    pub fn env_name(self) -> &'static str {
        match self {
            S3Provider::S3 => "S3",
            S3Provider::DoSpaces => "DO_SPACES",
            S3Provider::Backblaze => "BACKBLAZE",
            S3Provider::Linode => "LINODE",
            S3Provider::Wasabi => "WASABI",
        }
    }

    /// Virtual-hosted endpoint of `bucket` in `region`.
    pub fn host(self, bucket: &str, region: &str) -> String {
        match self {
            S3Provider::S3 => format!("{bucket}.s3.{region}.amazonaws.com"),
            S3Provider::DoSpaces => format!("{bucket}.{region}.digitaloceanspaces.com"),
            S3Provider::Backblaze => format!("{bucket}.s3.{region}.backblazeb2.com"),
            S3Provider::Linode => format!("{bucket}.{region}.linodeobjects.com"),
            S3Provider::Wasabi => format!("{bucket}.s3.{region}.wasabisys.com"),
        }
    }
}

/// Connection settings for an S3-compatible bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct S3Config {
    /// Provider
    pub provider: S3Provider,
    /// Access key ID
    pub access_key: String,
    /// Secret access key
    pub secret: String,
    /// Region
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Path-style endpoint override, e.g. `http://127.0.0.1:9000`
    pub endpoint: Option<String>,
}

/// Storage device backed by an S3-compatible bucket. Paths are object keys.
pub struct S3Device {
    root: String,
    config: S3Config,
    client: reqwest::Client,
}

impl S3Device {
    /// Device rooted at key prefix `root`.
    pub fn new(root: impl Into<String>, config: S3Config) -> Self {
        Self {
            root: root.into(),
            config,
            client: reqwest::Client::new(),
        }
    }

    fn base_url(&self) -> String {
        match &self.config.endpoint {
            Some(endpoint) => format!(
                "{}/{}",
                endpoint.trim_end_matches('/'),
                self.config.bucket
            ),
            None => format!(
                "https://{}",
                self.config
                    .provider
                    .host(&self.config.bucket, &self.config.region)
            ),
        }
    }

    async fn send(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, &str)],
        extra_headers: &[(&str, String)],
        body: Bytes,
    ) -> Result<reqwest::Response> {
        let object_path = encode_path(key.trim_start_matches('/'));
        let canonical_query = canonical_query(query);
        let mut url = format!("{}/{}", self.base_url(), object_path);
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }

        let parsed = url::Url::parse(&url)
            .map_err(|e| StorageError::Config(format!("invalid object URL {url}: {e}")))?;
        let host = match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(StorageError::Config(format!("no host in {url}"))),
        };

        let now = chrono::Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex::encode(Sha256::digest(&body));

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), host);
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
        headers.insert("x-amz-date".to_string(), amz_date.clone());
        for (name, value) in extra_headers {
            headers.insert(name.to_ascii_lowercase(), value.clone());
        }

        let authorization = sign_v4(
            &SigningKey {
                access_key: &self.config.access_key,
                secret: &self.config.secret,
                region: &self.config.region,
            },
            method.as_str(),
            parsed.path(),
            &canonical_query,
            &headers,
            &payload_hash,
            &amz_date,
        )?;

        let mut request = self
            .client
            .request(method, parsed)
            .header("authorization", authorization);
        for (name, value) in &headers {
            if name != "host" {
                request = request.header(name.as_str(), value.as_str());
            }
        }
        Ok(request.body(body).send().await?)
    }

    async fn head(&self, key: &str) -> Result<Option<reqwest::Response>> {
        let response = self
            .send(Method::HEAD, key, &[], &[], Bytes::new())
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(response).await?))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let response = self
            .send(Method::DELETE, key, &[], &[], Bytes::new())
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).await.map(|_| ())
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(StorageError::Remote { status, body })
}

fn encode_path(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn canonical_query(query: &[(&str, &str)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| {
            (
                urlencoding::encode(k).into_owned(),
                urlencoding::encode(v).into_owned(),
            )
        })
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Credentials and scope for request signing.
pub struct SigningKey<'a> {
    /// Access key ID
    pub access_key: &'a str,
    /// Secret access key
    pub secret: &'a str,
    /// Region
    pub region: &'a str,
}

fn hmac(key: &[u8], data: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| StorageError::Config(format!("Invalid HMAC key: {e}")))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// AWS Signature Version 4 `Authorization` header value.
///
/// `headers` must hold lower-case names and include `host`.
pub fn sign_v4(
    key: &SigningKey<'_>,
    method: &str,
    canonical_uri: &str,
    canonical_query: &str,
    headers: &BTreeMap<String, String>,
    payload_hash: &str,
    amz_date: &str,
) -> Result<String> {
    let date = amz_date.get(..8).unwrap_or(amz_date);
    let scope = format!("{date}/{}/s3/aws4_request", key.region);

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{}\n", value.trim()))
        .collect();
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac(format!("AWS4{}", key.secret).as_bytes(), date)?;
    let k_region = hmac(&k_date, key.region)?;
    let k_service = hmac(&k_region, "s3")?;
    let k_signing = hmac(&k_service, "aws4_request")?;
    let signature = hex::encode(hmac(&k_signing, &string_to_sign)?);

    Ok(format!(
        "AWS4-HMAC-SHA256 Credential={}/{scope},SignedHeaders={signed_headers},Signature={signature}",
        key.access_key
    ))
}

/// Text of every element named `tag`, matched by local name.
fn xml_values(body: &str, tag: &str) -> Result<Vec<String>> {
    let doc = roxmltree::Document::parse(body)?;
    Ok(doc
        .descendants()
        .filter(|node| node.is_element() && node.tag_name().name() == tag)
        .map(|node| node.text().unwrap_or_default().to_string())
        .collect())
}

#[async_trait]
impl StorageDevice for S3Device {
    fn device_type(&self) -> &'static str {
        "s3"
    }

    fn root(&self) -> &str {
        &self.root
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.head(path).await?.is_some())
    }

    async fn file_size(&self, path: &str) -> Result<u64> {
        let response = self
            .head(path)
            .await?
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| StorageError::Remote {
                status: response.status().as_u16(),
                body: "missing Content-Length".to_string(),
            })
    }

    async fn create_directory(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_path(&self, path: &str) -> Result<()> {
        for key in self.get_files(path).await? {
            self.delete_object(&key).await?;
        }
        self.delete_object(path).await
    }

    async fn get_files(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.trim_start_matches('/');
        let mut files = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut query = vec![("list-type", "2"), ("prefix", prefix)];
            if let Some(token) = &token {
                query.push(("continuation-token", token.as_str()));
            }
            let response = self
                .send(Method::GET, "", &query, &[], Bytes::new())
                .await?;
            let body = check(response).await?.text().await?;

            files.extend(xml_values(&body, "Key")?);
            let truncated = xml_values(&body, "IsTruncated")?
                .first()
                .is_some_and(|v| v == "true");
            token = xml_values(&body, "NextContinuationToken")?.into_iter().next();
            if !truncated || token.is_none() {
                break;
            }
        }
        Ok(files)
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        let range = format!("bytes={}-{}", offset, offset + length - 1);
        let response = self
            .send(Method::GET, path, &[], &[("range", range)], Bytes::new())
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(path.to_string()));
        }
        Ok(check(response).await?.bytes().await?)
    }

    async fn upload_chunk(
        &self,
        path: &str,
        data: Bytes,
        chunk: u32,
        chunks: u32,
        state: &mut UploadState,
    ) -> Result<()> {
        if chunks == 1 {
            let response = self.send(Method::PUT, path, &[], &[], data).await?;
            return check(response).await.map(|_| ());
        }

        let upload_id = match &state.upload_id {
            Some(id) => id.clone(),
            None => {
                let response = self
                    .send(Method::POST, path, &[("uploads", "")], &[], Bytes::new())
                    .await?;
                let body = check(response).await?.text().await?;
                let id = xml_values(&body, "UploadId")?
                    .into_iter()
                    .next()
                    .ok_or_else(|| StorageError::Remote {
                        status: 200,
                        body: "missing UploadId".to_string(),
                    })?;
                state.upload_id = Some(id.clone());
                id
            }
        };

        let part = chunk.to_string();
        let response = self
            .send(
                Method::PUT,
                path,
                &[("partNumber", part.as_str()), ("uploadId", upload_id.as_str())],
                &[],
                data,
            )
            .await?;
        let response = check(response).await?;
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        state.parts.push((chunk, etag));

        if chunk == chunks {
            let mut body = String::from("<CompleteMultipartUpload>");
            for (number, etag) in &state.parts {
                body.push_str(&format!(
                    "<Part><PartNumber>{number}</PartNumber><ETag>{etag}</ETag></Part>"
                ));
            }
            body.push_str("</CompleteMultipartUpload>");
            let response = self
                .send(
                    Method::POST,
                    path,
                    &[("uploadId", upload_id.as_str())],
                    &[("content-type", "application/xml".to_string())],
                    Bytes::from(body),
                )
                .await?;
            check(response).await?;
        }
        Ok(())
    }
}
