//! Blob storage for generated artifacts, with HMAC-signed download urls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret};
use service_core::utils::{hmac_sha256_hex, verify_hmac_sha256_hex};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("invalid blob key '{0}'")]
    InvalidKey(String),

    #[error("blob io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("url signing failed: {0}")]
    Signing(String),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn head_exists(&self, key: &str) -> Result<bool, BlobError>;

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), BlobError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError>;

    /// Time-limited download url that makes the browser save the blob as `filename`.
    fn signed_url(&self, key: &str, expiry_secs: u64, filename: &str) -> Result<String, BlobError>;
}

/// Keys are relative, slash separated and never climb out of the store root.
pub fn validate_key(key: &str) -> Result<(), BlobError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if bad {
        return Err(BlobError::InvalidKey(key.to_string()));
    }
    Ok(())
}

pub fn content_type_for(key: &str) -> &'static str {
    match key.rsplit('.').next() {
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

/// Issues and checks download urls of the form
/// `{base}/billing/blobs/{key}?expires={unix}&filename={name}&signature={hex}`.
#[derive(Clone)]
pub struct UrlSigner {
    base_url: String,
    secret: Secret<String>,
}

impl UrlSigner {
    pub fn new(base_url: &str, secret: Secret<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            secret,
        }
    }

    fn payload(key: &str, expires: i64, filename: &str) -> String {
        format!("{}|{}|{}", key, expires, filename)
    }

    pub fn sign(&self, key: &str, expires: i64, filename: &str) -> Result<String, BlobError> {
        let signature = hmac_sha256_hex(
            self.secret.expose_secret().as_bytes(),
            Self::payload(key, expires, filename).as_bytes(),
        )
        .map_err(|e| BlobError::Signing(e.to_string()))?;
        let query = serde_urlencoded::to_string([
            ("expires", expires.to_string()),
            ("filename", filename.to_string()),
            ("signature", signature),
        ])
        .map_err(|e| BlobError::Signing(e.to_string()))?;
        Ok(format!("{}/billing/blobs/{}?{}", self.base_url, key, query))
    }

    pub fn signed_url(&self, key: &str, expiry_secs: u64, filename: &str, now: DateTime<Utc>) -> Result<String, BlobError> {
        let expires = now.timestamp() + i64::try_from(expiry_secs).unwrap_or(i64::MAX / 2);
        self.sign(key, expires, filename)
    }

    pub fn verify(&self, key: &str, expires: i64, filename: &str, signature: &str, now: DateTime<Utc>) -> bool {
        if now.timestamp() > expires {
            return false;
        }
        verify_hmac_sha256_hex(
            self.secret.expose_secret().as_bytes(),
            Self::payload(key, expires, filename).as_bytes(),
            signature,
        )
        .unwrap_or(false)
    }
}

/// Filesystem-backed store rooted at a directory.
pub struct LocalBlobStore {
    root: PathBuf,
    signer: UrlSigner,
}

impl LocalBlobStore {
    pub async fn new(root: impl Into<PathBuf>, signer: UrlSigner) -> Result<Self, BlobError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root, signer })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BlobError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn head_exists(&self, key: &str) -> Result<bool, BlobError> {
        Ok(fs::try_exists(self.path_for(key)?).await?)
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), BlobError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Write then rename so readers never observe a partial file.
        let partial = path.with_extension("partial");
        fs::write(&partial, &bytes).await?;
        fs::rename(&partial, &path).await?;
        tracing::debug!(key = %key, content_type = %content_type, size = bytes.len(), "Blob stored");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        match fs::read(self.path_for(key)?).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn signed_url(&self, key: &str, expiry_secs: u64, filename: &str) -> Result<String, BlobError> {
        validate_key(key)?;
        self.signer.signed_url(key, expiry_secs, filename, Utc::now())
    }
}

/// In-process store for tests and local runs.
pub struct InMemoryBlobStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    puts: AtomicU64,
    signer: UrlSigner,
}

impl InMemoryBlobStore {
    pub fn new(signer: UrlSigner) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            puts: AtomicU64::new(0),
            signer,
        }
    }

    /// Number of writes so far.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .ok()?
            .get(key)
            .map(|(_, content_type)| content_type.clone())
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Vec<u8>, String)>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn head_exists(&self, key: &str) -> Result<bool, BlobError> {
        validate_key(key)?;
        Ok(self.objects().contains_key(key))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), BlobError> {
        validate_key(key)?;
        self.objects()
            .insert(key.to_string(), (bytes, content_type.to_string()));
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        validate_key(key)?;
        Ok(self.objects().get(key).map(|(bytes, _)| bytes.clone()))
    }

    fn signed_url(&self, key: &str, expiry_secs: u64, filename: &str) -> Result<String, BlobError> {
        validate_key(key)?;
        self.signer.signed_url(key, expiry_secs, filename, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn signer() -> UrlSigner {
        UrlSigner::new("https://api.example.com/", Secret::new("blob_secret".to_string()))
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("invoices/t1/INV-202603-0000AAAA.pdf").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/abs/path").is_err());
        assert!(validate_key("invoices//x.pdf").is_err());
        assert!(validate_key("").is_err());
    }

    #[test]
    fn test_signed_url_roundtrip_and_expiry() {
        let signer = signer();
        let now = Utc::now();
        let url = signer
            .signed_url("invoices/t1/a.pdf", 3600, "Rechnung_A.pdf", now)
            .unwrap();
        assert!(url.starts_with("https://api.example.com/billing/blobs/invoices/t1/a.pdf?expires="));
        assert!(url.contains("filename=Rechnung_A.pdf"));

        let expires = now.timestamp() + 3600;
        let valid = signer.sign("invoices/t1/a.pdf", expires, "Rechnung_A.pdf").unwrap();
        let sig = valid.rsplit("signature=").next().unwrap();
        assert!(signer.verify("invoices/t1/a.pdf", expires, "Rechnung_A.pdf", sig, now));
        assert!(!signer.verify("invoices/t1/b.pdf", expires, "Rechnung_A.pdf", sig, now));
        assert!(!signer.verify("invoices/t1/a.pdf", expires, "other.pdf", sig, now));
        assert!(!signer.verify(
            "invoices/t1/a.pdf",
            expires,
            "Rechnung_A.pdf",
            sig,
            now + Duration::seconds(3601)
        ));
    }

    #[tokio::test]
    async fn test_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path(), signer()).await.unwrap();

        assert!(!store.head_exists("invoices/t1/a.pdf").await.unwrap());
        store
            .put("invoices/t1/a.pdf", b"%PDF-1.3".to_vec(), "application/pdf")
            .await
            .unwrap();
        assert!(store.head_exists("invoices/t1/a.pdf").await.unwrap());
        assert_eq!(
            store.get("invoices/t1/a.pdf").await.unwrap().as_deref(),
            Some(&b"%PDF-1.3"[..])
        );
        assert_eq!(store.get("invoices/t1/missing.pdf").await.unwrap(), None);
        assert!(store.put("../escape.pdf", Vec::new(), "application/pdf").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_counts_puts() {
        let store = InMemoryBlobStore::new(signer());
        store.put("config/billing-config.json", b"{}".to_vec(), "application/json").await.unwrap();
        assert_eq!(store.put_count(), 1);
        assert_eq!(
            store.content_type("config/billing-config.json").as_deref(),
            Some("application/json")
        );
        assert_eq!(content_type_for("invoices/t1/a.pdf"), "application/pdf");
    }
}
