//! Storage access broker: turns `(scope, objectKey, method)` requests into
//! short-lived signed URLs against the right location.

use std::collections::HashMap;
use std::sync::Arc;

use appgate_protocol::payloads::{
    AppStorageUrlRequest, ContentUrlRequest, MetadataUrlRequest, StorageMethod,
};
use appgate_protocol::results::SignedUrl;
use appgate_protocol::ProtocolError;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use url::Url;

use crate::store::FolderRecord;

type HmacSha256 = Hmac<Sha256>;

pub const CONTENT_URL_TTL_SECS: i64 = 60 * 60;
pub const METADATA_URL_TTL_SECS: i64 = 24 * 60 * 60;
pub const APP_STORAGE_URL_TTL_SECS: i64 = 60 * 60;
pub const BUNDLE_URL_TTL_SECS: i64 = 60 * 60;

/// Where a class of objects lives and the credentials used to sign for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLocation {
    pub endpoint: String,
    #[serde(default)]
    pub region: String,
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid storage endpoint `{endpoint}`: {reason}")]
    Endpoint { endpoint: String, reason: String },
    #[error("signing key rejected")]
    Key,
}

impl From<SigningError> for ProtocolError {
    fn from(err: SigningError) -> Self {
        ProtocolError::Internal(err.to_string())
    }
}

/// `<prefix>/<key>`, adding the separator only when the prefix lacks one.
pub fn object_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else if prefix.ends_with('/') {
        format!("{prefix}{key}")
    } else {
        format!("{prefix}/{key}")
    }
}

pub trait UrlSigner: Send + Sync {
    fn sign(
        &self,
        location: &StorageLocation,
        object_path: &str,
        method: StorageMethod,
        expires_at: DateTime<Utc>,
    ) -> Result<String, SigningError>;
}

/// Query-string signer: HMAC-SHA256 over method, resource path and expiry,
/// keyed with the location's secret.
#[derive(Debug, Clone, Copy, Default)]
pub struct HmacUrlSigner;

impl HmacUrlSigner {
    fn mac(
        secret: &str,
        method: &str,
        resource: &str,
        expires: i64,
    ) -> Result<HmacSha256, SigningError> {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SigningError::Key)?;
        mac.update(method.as_bytes());
        mac.update(b"\n");
        mac.update(resource.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    fn signature(
        secret: &str,
        method: &str,
        resource: &str,
        expires: i64,
    ) -> Result<String, SigningError> {
        let mac = Self::mac(secret, method, resource, expires)?;
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    /// Checks a URL produced by [`UrlSigner::sign`] against `location`.
    pub fn verify(&self, location: &StorageLocation, url: &str, now: DateTime<Utc>) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let params: HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        let (Some(method), Some(expires), Some(signature)) = (
            params.get("method"),
            params.get("expires").and_then(|raw| raw.parse::<i64>().ok()),
            params.get("signature"),
        ) else {
            return false;
        };
        if expires <= now.timestamp() {
            return false;
        }
        let Ok(signature) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        match Self::mac(&location.secret_access_key, method, parsed.path(), expires) {
            Ok(mac) => mac.verify_slice(&signature).is_ok(),
            Err(_) => false,
        }
    }
}

impl UrlSigner for HmacUrlSigner {
    fn sign(
        &self,
        location: &StorageLocation,
        object_path: &str,
        method: StorageMethod,
        expires_at: DateTime<Utc>,
    ) -> Result<String, SigningError> {
        let endpoint_error = |reason: &str| SigningError::Endpoint {
            endpoint: location.endpoint.clone(),
            reason: reason.to_string(),
        };

        let mut url =
            Url::parse(&location.endpoint).map_err(|err| endpoint_error(&err.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| endpoint_error("endpoint cannot carry a path"))?
            .pop_if_empty()
            .push(&location.bucket)
            .extend(object_path.split('/'));

        let expires = expires_at.timestamp();
        let signature = Self::signature(
            &location.secret_access_key,
            method.as_str(),
            url.path(),
            expires,
        )?;

        url.query_pairs_mut()
            .append_pair("method", method.as_str())
            .append_pair("expires", &expires.to_string())
            .append_pair("credential", &location.access_key_id)
            .append_pair("region", &location.region)
            .append_pair("signature", &signature);
        Ok(url.to_string())
    }
}

/// Resolves and authorizes a folder for a set of methods. The router backs
/// this with the permission engine for the calling app.
#[async_trait]
pub trait FolderAccess: Send + Sync {
    async fn authorize(
        &self,
        folder_id: &str,
        methods: &[StorageMethod],
    ) -> Result<FolderRecord, ProtocolError>;
}

/// Positions of the requests that target one folder, in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderGroup<'a> {
    pub folder_id: &'a str,
    pub positions: Vec<usize>,
}

/// Groups by folder in order of first appearance.
pub fn group_by_folder<'a, I>(folder_ids: I) -> Vec<FolderGroup<'a>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut groups: Vec<FolderGroup<'a>> = Vec::new();
    let mut slots: HashMap<&'a str, usize> = HashMap::new();
    for (position, folder_id) in folder_ids.into_iter().enumerate() {
        let slot = *slots.entry(folder_id).or_insert_with(|| {
            groups.push(FolderGroup {
                folder_id,
                positions: Vec::new(),
            });
            groups.len() - 1
        });
        groups[slot].positions.push(position);
    }
    groups
}

fn distinct_methods(methods: impl Iterator<Item = StorageMethod>) -> Vec<StorageMethod> {
    let mut out = Vec::new();
    for method in methods {
        if !out.contains(&method) {
            out.push(method);
        }
    }
    out
}

pub struct StorageBroker {
    signer: Arc<dyn UrlSigner>,
    app_storage: Option<StorageLocation>,
    bundle_storage: Option<StorageLocation>,
}

impl StorageBroker {
    pub fn new(
        signer: Arc<dyn UrlSigner>,
        app_storage: Option<StorageLocation>,
        bundle_storage: Option<StorageLocation>,
    ) -> Self {
        Self {
            signer,
            app_storage,
            bundle_storage,
        }
    }

    pub async fn content_urls(
        &self,
        requests: &[ContentUrlRequest],
        access: &dyn FolderAccess,
    ) -> Result<Vec<SignedUrl>, ProtocolError> {
        let expires_at = Utc::now() + Duration::seconds(CONTENT_URL_TTL_SECS);
        let mut signed: Vec<Option<SignedUrl>> = vec![None; requests.len()];

        for group in group_by_folder(requests.iter().map(|r| r.folder_id.as_str())) {
            let methods = distinct_methods(group.positions.iter().map(|&i| requests[i].method));
            let folder = access.authorize(group.folder_id, &methods).await?;
            let location = &folder.content_location;
            for &position in &group.positions {
                let request = &requests[position];
                let path = object_path(&location.prefix, &request.object_key);
                let url = self
                    .signer
                    .sign(location, &path, request.method, expires_at)?;
                signed[position] = Some(SignedUrl {
                    folder_id: Some(request.folder_id.clone()),
                    object_key: request.object_key.clone(),
                    url,
                });
            }
        }

        Ok(signed.into_iter().flatten().collect())
    }

    /// Metadata objects are keyed by content and metadata hash so several
    /// versions of one object can coexist.
    pub async fn metadata_urls(
        &self,
        requests: &[MetadataUrlRequest],
        access: &dyn FolderAccess,
    ) -> Result<Vec<SignedUrl>, ProtocolError> {
        let expires_at = Utc::now() + Duration::seconds(METADATA_URL_TTL_SECS);
        let mut signed: Vec<Option<SignedUrl>> = vec![None; requests.len()];

        for group in group_by_folder(requests.iter().map(|r| r.folder_id.as_str())) {
            let methods = distinct_methods(group.positions.iter().map(|&i| requests[i].method));
            let folder = access.authorize(group.folder_id, &methods).await?;
            let location = &folder.metadata_location;
            for &position in &group.positions {
                let request = &requests[position];
                let key = format!(
                    "{}/{}/{}",
                    request.object_key, request.content_hash, request.metadata_hash
                );
                let path = object_path(&location.prefix, &key);
                let url = self
                    .signer
                    .sign(location, &path, request.method, expires_at)?;
                signed[position] = Some(SignedUrl {
                    folder_id: Some(request.folder_id.clone()),
                    object_key: request.object_key.clone(),
                    url,
                });
            }
        }

        Ok(signed.into_iter().flatten().collect())
    }

    pub fn app_storage_urls(
        &self,
        app_identifier: &str,
        requests: &[AppStorageUrlRequest],
    ) -> Result<Vec<SignedUrl>, ProtocolError> {
        let location = self.app_storage.as_ref().ok_or_else(|| {
            ProtocolError::NotFound("app storage location is not configured".to_string())
        })?;
        let expires_at = Utc::now() + Duration::seconds(APP_STORAGE_URL_TTL_SECS);

        requests
            .iter()
            .map(|request| {
                let path = object_path(
                    &location.prefix,
                    &format!("{app_identifier}/{}", request.object_key),
                );
                let url = self
                    .signer
                    .sign(location, &path, request.method, expires_at)?;
                Ok(SignedUrl {
                    folder_id: None,
                    object_key: request.object_key.clone(),
                    url,
                })
            })
            .collect()
    }

    /// Read-only URL for a packaged bundle file.
    pub fn bundle_url(
        &self,
        app_identifier: &str,
        bundle_hash: &str,
        file: &str,
    ) -> Result<String, ProtocolError> {
        let location = self.bundle_storage.as_ref().ok_or_else(|| {
            ProtocolError::NotFound("bundle storage location is not configured".to_string())
        })?;
        let expires_at = Utc::now() + Duration::seconds(BUNDLE_URL_TTL_SECS);
        let path = object_path(
            &location.prefix,
            &format!("{app_identifier}/{bundle_hash}/{file}"),
        );
        Ok(self
            .signer
            .sign(location, &path, StorageMethod::Get, expires_at)?)
    }
}
