use std::io::SeekFrom;
use std::path::Path;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{debug, warn};
use reqwest::header::{CONTENT_LENGTH, ETAG};
use reqwest::{Body, Client as HttpClient, Method, Response, Url};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use crate::config::{Config, Credentials};

pub mod sign;

const PART_SIZE: u64 = 64 * 1024 * 1024;

/// Object uploads into one S3 bucket. Bodies are streamed from disk;
/// files larger than one part go through a multipart upload.
pub struct Bucket {
    client: HttpClient,
    base:   String,
    region: String,
    creds:  Credentials,
    part:   u64,
}

impl Bucket {
    pub fn new(cfg: &Config) -> Result<Self> {
        let base = match &cfg.endpoint {
            Some(endpoint) => format!("{}/{}", endpoint.trim_end_matches('/'), cfg.bucket),
            None           => format!("https://{}.s3.{}.amazonaws.com", cfg.bucket, cfg.region),
        };

        let client = HttpClient::builder()
            .user_agent(env!("CARGO_PKG_NAME"))
            .build()?;

        Ok(Self {
            client: client,
            base:   base,
            region: cfg.region.clone(),
            creds:  cfg.credentials.clone(),
            part:   PART_SIZE,
        })
    }

    pub fn with_part_size(mut self, part: u64) -> Self {
        self.part = part.max(1);
        self
    }

    pub fn url(&self, key: &str) -> Result<Url> {
        let url = format!("{}/{}", self.base, sign::encode_key(key.trim_start_matches('/')));
        Ok(Url::parse(&url)?)
    }

    /// Stores the contents of `path` under `key` and returns the object's
    /// location.
    pub async fn upload(&self, path: &Path, key: &str) -> Result<Url> {
        let url  = self.url(key)?;
        let size = tokio::fs::metadata(path).await.with_context(|| {
            format!("reading {:?}", path)
        })?.len();

        debug!("uploading {} bytes from {:?} to {}", size, path, url);

        let sent = match size > self.part {
            true  => self.multipart(path, size, &url).await,
            false => {
                let body = body(path, 0, size).await?;
                self.send(Method::PUT, url.clone(), body, size, sign::UNSIGNED).await.map(|_| ())
            }
        };

        sent.with_context(|| format!("upload of {} failed", key))?;

        Ok(url)
    }

    async fn multipart(&self, path: &Path, size: u64, url: &Url) -> Result<()> {
        let id = self.initiate(url).await?;

        debug!("multipart upload {} of {} bytes to {}", id, size, url);

        match self.parts(path, size, url, &id).await {
            Ok(())  => Ok(()),
            Err(e)  => {
                if let Err(abort) = self.abort(url, &id).await {
                    warn!("failed to abort multipart upload {}: {:?}", id, abort);
                }
                Err(e)
            }
        }
    }

    async fn initiate(&self, url: &Url) -> Result<String> {
        let url  = query(url, &[("uploads", "")]);
        let res  = self.send(Method::POST, url, Body::from(""), 0, &sign::sha256_hex(b"")).await?;
        let text = res.text().await?;

        match element(&text, "UploadId") {
            Some(id) if !id.is_empty() => Ok(id.to_owned()),
            _                          => Err(anyhow!("no upload id in {:?}", text)),
        }
    }

    async fn parts(&self, path: &Path, size: u64, url: &Url, id: &str) -> Result<()> {
        let mut etags  = Vec::new();
        let mut offset = 0;

        while offset < size {
            let len  = self.part.min(size - offset);
            let n    = (etags.len() + 1).to_string();
            let part = query(url, &[("partNumber", n.as_str()), ("uploadId", id)]);
            let body = body(path, offset, len).await?;

            let res  = self.send(Method::PUT, part, body, len, sign::UNSIGNED).await.with_context(|| {
                format!("part {}", n)
            })?;

            let etag = res.headers().get(ETAG).and_then(|v| v.to_str().ok()).ok_or_else(|| {
                anyhow!("part {} returned no etag", n)
            })?;

            etags.push(etag.to_owned());
            offset += len;
        }

        let mut xml = String::from("<CompleteMultipartUpload>");
        for (n, etag) in etags.iter().enumerate() {
            xml.push_str(&format!("<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>", n + 1, etag));
        }
        xml.push_str("</CompleteMultipartUpload>");

        let url     = query(url, &[("uploadId", id)]);
        let payload = sign::sha256_hex(xml.as_bytes());
        let len     = xml.len() as u64;
        let res     = self.send(Method::POST, url, Body::from(xml), len, &payload).await?;

        // completion failures can arrive with a 200 status
        let text = res.text().await?;
        match element(&text, "Code") {
            Some(code) => Err(anyhow!("completing upload {}: {}", id, code)),
            None       => Ok(()),
        }
    }

    async fn abort(&self, url: &Url, id: &str) -> Result<()> {
        let url = query(url, &[("uploadId", id)]);
        self.send(Method::DELETE, url, Body::from(""), 0, &sign::sha256_hex(b"")).await?;
        Ok(())
    }

    async fn send(&self, method: Method, url: Url, body: Body, len: u64, payload: &str) -> Result<Response> {
        let headers = sign::headers(&self.creds, &self.region, method.as_str(), &url, payload, Utc::now())?;

        let mut req = self.client.request(method, url).header(CONTENT_LENGTH, len).body(body);
        for (name, value) in headers {
            req = req.header(name, value);
        }

        let res = req.send().await?;

        if !res.status().is_success() {
            let status = res.status();
            let body   = res.text().await.unwrap_or_default();
            return Err(anyhow!("{}: {}", status, body));
        }

        Ok(res)
    }
}

/// Object key for a file: `<prefix>/<name>`, or just `name` without a prefix.
pub fn key(prefix: &str, name: &str) -> String {
    match prefix.trim_end_matches('/') {
        ""     => name.to_owned(),
        prefix => format!("{}/{}", prefix, name),
    }
}

async fn body(path: &Path, offset: u64, len: u64) -> Result<Body> {
    let mut file = File::open(path).await.with_context(|| format!("opening {:?}", path))?;
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(Body::wrap_stream(ReaderStream::new(file.take(len))))
}

/// `url` with its query replaced by `params`, which must already be in
/// the sorted order the signature expects.
fn query(url: &Url, params: &[(&str, &str)]) -> Url {
    let query = params.iter().map(|(k, v)| {
        format!("{}={}", k, sign::encode_value(v))
    }).collect::<Vec<_>>().join("&");

    let mut url = url.clone();
    url.set_query(Some(&query));
    url
}

fn element<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    let open  = format!("<{}>", name);
    let close = format!("</{}>", name);
    let start = xml.find(&open)? + open.len();
    let end   = xml[start..].find(&close)? + start;
    Some(&xml[start..end])
}
