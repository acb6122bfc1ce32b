//! Signed-URL and fluentd uploaders: obtain a destination for a staged
//! file, push the bytes, and let the caller delete on success.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{AnalyticsError, AnalyticsResult};

#[async_trait]
pub trait Uploader: Send + Sync {
    /// Uploads the file at `path` for `tenant` (`org~env`). Does not delete
    /// the file; the staging loop removes it once this returns `Ok`.
    async fn upload(&self, tenant: &str, path: &Path) -> AnalyticsResult<()>;
}

#[derive(Debug, serde::Deserialize)]
struct SignedUrlResponse {
    url: String,
}

fn split_tenant(tenant: &str) -> (&str, &str) {
    tenant.split_once('~').unwrap_or((tenant, ""))
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("upload.gz")
}

/// The legacy Apigee SaaS signed-URL flow: S3-backed, server-side
/// encrypted, `Expect: 100-continue`.
pub struct SaasUploader {
    pub client: Client,
    pub base_url: String,
}

#[async_trait]
impl Uploader for SaasUploader {
    async fn upload(&self, tenant: &str, path: &Path) -> AnalyticsResult<()> {
        let (org, env) = split_tenant(tenant);
        let name = file_name(path);

        let signed = self
            .client
            .get(format!("{}/analytics/organization/{org}/environment/{env}", self.base_url))
            .query(&[
                ("tenant", tenant),
                ("relative_file_path", name),
                ("file_content_type", "application/x-gzip"),
                ("encrypt", "true"),
            ])
            .send()
            .await
            .map_err(|e| AnalyticsError::SignedUrl(e.to_string()))?
            .error_for_status()
            .map_err(|e| AnalyticsError::SignedUrl(e.to_string()))?
            .json::<SignedUrlResponse>()
            .await
            .map_err(|e| AnalyticsError::SignedUrl(e.to_string()))?;

        let bytes = tokio::fs::read(path).await?;
        self.client
            .put(&signed.url)
            .header("Expect", "100-continue")
            .header("Content-Type", "application/x-gzip")
            .header("x-amz-server-side-encryption", "AES256")
            .body(bytes)
            .send()
            .await
            .map_err(|e| AnalyticsError::Upload(e.to_string()))?
            .error_for_status()
            .map_err(|e| AnalyticsError::Upload(e.to_string()))?;

        debug!(tenant, file = name, "uploaded analytics file via legacy signed URL");
        Ok(())
    }
}

/// GCP signed-URL flow: same two-step shape, different endpoint and
/// headers, and a bare client (the configured one carries auth that GCS
/// doesn't expect).
pub struct GcpUploader {
    pub client: Client,
    pub base_url: String,
}

#[async_trait]
impl Uploader for GcpUploader {
    async fn upload(&self, tenant: &str, path: &Path) -> AnalyticsResult<()> {
        let (org, env) = split_tenant(tenant);
        let name = file_name(path);

        let signed = self
            .client
            .get(format!("{}/v1/organizations/{org}/environments/{env}/datalocation", self.base_url))
            .query(&[("repo", "edge"), ("dataset", "api"), ("relative_file_path", name)])
            .send()
            .await
            .map_err(|e| AnalyticsError::SignedUrl(e.to_string()))?
            .error_for_status()
            .map_err(|e| AnalyticsError::SignedUrl(e.to_string()))?
            .json::<SignedUrlResponse>()
            .await
            .map_err(|e| AnalyticsError::SignedUrl(e.to_string()))?;

        let bytes = tokio::fs::read(path).await?;
        let bare = Client::new();
        bare.put(&signed.url)
            .body(bytes)
            .send()
            .await
            .map_err(|e| AnalyticsError::Upload(e.to_string()))?
            .error_for_status()
            .map_err(|e| AnalyticsError::Upload(e.to_string()))?;

        debug!(tenant, file = name, "uploaded analytics file to GCP");
        Ok(())
    }
}

/// Optional TLS for the fluentd forwarder, the one TLS carve-out this
/// library makes for itself (everything else terminates TLS outside it).
/// `None` fields fall back to: system-trusted roots when `ca_file` is
/// unset, and no client certificate when `cert_file`/`key_file` are unset.
#[derive(Debug, Clone, Default)]
pub struct FluentdTlsConfig {
    pub skip_verify: bool,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

fn load_certs(path: &Path) -> AnalyticsResult<Vec<CertificateDer<'static>>> {
    let bytes = std::fs::read(path).map_err(|e| AnalyticsError::Tls(e.to_string()))?;
    rustls_pemfile::certs(&mut bytes.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AnalyticsError::Tls(e.to_string()))
}

fn load_key(path: &Path) -> AnalyticsResult<PrivateKeyDer<'static>> {
    let bytes = std::fs::read(path).map_err(|e| AnalyticsError::Tls(e.to_string()))?;
    rustls_pemfile::private_key(&mut bytes.as_slice())
        .map_err(|e| AnalyticsError::Tls(e.to_string()))?
        .ok_or_else(|| AnalyticsError::Tls(format!("no private key found in {}", path.display())))
}

/// Accepts every certificate. Only reachable via `TLSSkipVerify`, meant
/// for talking to a fluentd sidecar with a self-signed or unpinned cert.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn build_tls_connector(tls: &FluentdTlsConfig) -> AnalyticsResult<TlsConnector> {
    // Pinned explicitly rather than relying on a process-wide installed
    // default, since a library has no `main` to install one in.
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| AnalyticsError::Tls(e.to_string()))?;

    let with_client_cert = if tls.skip_verify {
        builder.dangerous().with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
    } else {
        let mut roots = RootCertStore::empty();
        match &tls.ca_file {
            Some(ca_file) => {
                roots.add_parsable_certificates(load_certs(ca_file)?);
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        builder.with_root_certificates(roots)
    };

    let config = match (&tls.cert_file, &tls.key_file) {
        (Some(cert_file), Some(key_file)) => with_client_cert
            .with_client_auth_cert(load_certs(cert_file)?, load_key(key_file)?)
            .map_err(|e| AnalyticsError::Tls(e.to_string()))?,
        _ => with_client_cert.with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Forwards an already-framed fluentd file verbatim over a fresh
/// connection, plain TCP or TLS (optionally mutual) depending on
/// configuration. Partial-write failures are treated as full failures;
/// the caller retries the whole file.
pub struct FluentdUploader {
    pub addr: String,
    connector: Option<TlsConnector>,
}

impl FluentdUploader {
    pub fn new(addr: String) -> Self {
        Self { addr, connector: None }
    }

    pub fn with_tls(addr: String, tls: &FluentdTlsConfig) -> AnalyticsResult<Self> {
        Ok(Self { addr, connector: Some(build_tls_connector(tls)?) })
    }

    fn server_name(&self) -> AnalyticsResult<ServerName<'static>> {
        let host = self.addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(&self.addr);
        ServerName::try_from(host.to_string()).map_err(|e| AnalyticsError::Tls(e.to_string()))
    }
}

#[async_trait]
impl Uploader for FluentdUploader {
    async fn upload(&self, tenant: &str, path: &Path) -> AnalyticsResult<()> {
        let contents = tokio::fs::read(path).await?;
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| AnalyticsError::Upload(e.to_string()))?;

        match &self.connector {
            Some(connector) => {
                let mut tls_stream = connector
                    .connect(self.server_name()?, stream)
                    .await
                    .map_err(|e| AnalyticsError::Upload(e.to_string()))?;
                tls_stream.write_all(&contents).await.map_err(|e| AnalyticsError::Upload(e.to_string()))?;
                tls_stream.flush().await.map_err(|e| AnalyticsError::Upload(e.to_string()))?;
            }
            None => {
                let mut stream = stream;
                stream.write_all(&contents).await.map_err(|e| AnalyticsError::Upload(e.to_string()))?;
                stream.flush().await.map_err(|e| AnalyticsError::Upload(e.to_string()))?;
            }
        }

        debug!(tenant, "forwarded analytics file to fluentd");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::{GET, PUT};
    use httpmock::MockServer;
    use std::io::Write as _;

    #[tokio::test]
    async fn saas_uploader_fetches_signed_url_then_puts_the_file() {
        let server = MockServer::start();
        let signed_url_mock = server.mock(|when, then| {
            when.method(GET).path("/analytics/organization/org/environment/env");
            then.status(200).json_body(serde_json::json!({"url": server.url("/put-target")}));
        });
        let put_mock = server.mock(|when, then| {
            when.method(PUT).path("/put-target");
            then.status(200);
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1-abc.gz");
        std::fs::File::create(&path).unwrap().write_all(b"gzip bytes").unwrap();

        let uploader = SaasUploader { client: Client::new(), base_url: server.base_url() };
        uploader.upload("org~env", &path).await.unwrap();

        signed_url_mock.assert();
        put_mock.assert();
    }

    #[tokio::test]
    async fn gcp_uploader_hits_the_datalocation_endpoint() {
        let server = MockServer::start();
        let signed_url_mock = server.mock(|when, then| {
            when.method(GET)
                .path("/v1/organizations/org/environments/env/datalocation")
                .query_param("repo", "edge")
                .query_param("dataset", "api");
            then.status(200).json_body(serde_json::json!({"url": server.url("/put-target")}));
        });
        let put_mock = server.mock(|when, then| {
            when.method(PUT).path("/put-target");
            then.status(200);
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1-abc.gz");
        std::fs::File::create(&path).unwrap().write_all(b"gzip bytes").unwrap();

        let uploader = GcpUploader { client: Client::new(), base_url: server.base_url() };
        uploader.upload("org~env", &path).await.unwrap();

        signed_url_mock.assert();
        put_mock.assert();
    }

    #[tokio::test]
    async fn signed_url_failure_surfaces_as_signed_url_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET);
            then.status(500);
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1-abc.gz");
        std::fs::File::create(&path).unwrap().write_all(b"gzip bytes").unwrap();

        let uploader = SaasUploader { client: Client::new(), base_url: server.base_url() };
        let err = uploader.upload("org~env", &path).await.unwrap_err();
        assert!(matches!(err, AnalyticsError::SignedUrl(_)));
    }

    #[tokio::test]
    async fn fluentd_uploader_forwards_the_file_verbatim_over_plain_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut socket, &mut received).await.unwrap();
            received
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1-abc.txt");
        std::fs::File::create(&path).unwrap().write_all(b"[\"api.org.env.client\",1,{}]\n").unwrap();

        let uploader = FluentdUploader::new(addr.to_string());
        uploader.upload("org~env", &path).await.unwrap();
        drop(uploader);

        let received = accept.await.unwrap();
        assert_eq!(received, b"[\"api.org.env.client\",1,{}]\n");
    }
}
