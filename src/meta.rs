use std::collections::HashMap;
use std::convert::TryInto;
use std::env;
use std::fs;
use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use reqwest::{Certificate, Client as HttpClient, Response, Url};
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::json;
use crate::data::{Status, STATUS};

const ACCOUNT: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Reads and patches annotations on this service's own pod.
pub struct Metadata {
    client:   HttpClient,
    endpoint: Url,
}

#[derive(Deserialize)]
struct Pod {
    metadata: ObjectMeta,
}

#[derive(Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    annotations: Option<HashMap<String, String>>,
}

impl Metadata {
    pub fn in_cluster(namespace: &str, pod: &str) -> Result<Self> {
        let host = env::var("KUBERNETES_SERVICE_HOST").context("KUBERNETES_SERVICE_HOST")?;
        let port = env::var("KUBERNETES_SERVICE_PORT").context("KUBERNETES_SERVICE_PORT")?;

        let token = fs::read_to_string(format!("{}/token", ACCOUNT))?;
        let ca    = fs::read(format!("{}/ca.crt", ACCOUNT))?;

        let host = match host.contains(':') {
            true  => format!("[{}]", host),
            false => host,
        };

        let server = Url::parse(&format!("https://{}:{}", host, port))?;
        let cert   = Certificate::from_pem(&ca)?;
        let client = HttpClient::builder().add_root_certificate(cert);

        Self::build(client, server, Some(token.trim()), namespace, pod)
    }

    pub fn new(server: Url, token: Option<&str>, namespace: &str, pod: &str) -> Result<Self> {
        Self::build(HttpClient::builder(), server, token, namespace, pod)
    }

    fn build(
        client:    reqwest::ClientBuilder,
        server:    Url,
        token:     Option<&str>,
        namespace: &str,
        pod:       &str,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, "application/json".try_into()?);
        headers.insert(header::USER_AGENT, env!("CARGO_PKG_NAME").try_into()?);

        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        let path     = format!("api/v1/namespaces/{}/pods/{}", namespace, pod);
        let endpoint = server.join(&path)?;
        let client   = client.default_headers(headers).build()?;

        Ok(Self { client, endpoint })
    }

    pub async fn annotation(&self, key: &str) -> Result<Option<String>> {
        let res = self.client.get(self.endpoint.clone()).send().await;
        let res = check(res.context("getting pod")?).await?;
        let pod = res.json::<Pod>().await.context("decoding pod")?;
        Ok(pod.metadata.annotations.and_then(|mut a| a.remove(key)))
    }

    pub async fn annotate(&self, key: &str, value: &str) -> Result<()> {
        let patch = json!({ "metadata": { "annotations": { key: value } } });

        debug!("annotating {}={:?}", key, value);

        let res = self.client.patch(self.endpoint.clone())
            .header(header::CONTENT_TYPE, "application/merge-patch+json")
            .body(serde_json::to_vec(&patch)?)
            .send()
            .await;

        check(res.with_context(|| format!("patching {}", key))?).await?;

        Ok(())
    }

    pub async fn clear(&self, key: &str) -> Result<()> {
        self.annotate(key, "").await
    }

    pub async fn set_status(&self, status: Status) -> Result<()> {
        self.annotate(STATUS, status.as_str()).await
    }

    /// Status update whose failure is only logged.
    pub async fn report(&self, status: Status) {
        if let Err(e) = self.set_status(status).await {
            warn!("failed to set status {}: {:?}", status, e);
        }
    }
}

async fn check(res: Response) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(anyhow!("{} {}: {}", reason(status), status, body))
}

fn reason(status: reqwest::StatusCode) -> &'static str {
    match status.as_u16() {
        401 | 403 => "unauthorized",
        404       => "not found",
        _         => "request failed",
    }
}
