use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use reqwest::Url;
use tokio::time::interval;
use crate::data::{Recording, Status};
use crate::meta::Metadata;
use crate::s3::{self, Bucket};
use crate::shutdown::Shutdown;

/// Ships finished recordings to the bucket and reports `idle` once the
/// recordings directory has been drained.
pub struct Uploader {
    meta:   Arc<Metadata>,
    bucket: Bucket,
    dir:    PathBuf,
    prefix: String,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Tick {
    pub found:    usize,
    pub uploaded: usize,
}

impl Uploader {
    pub fn new(meta: Arc<Metadata>, bucket: Bucket, dir: PathBuf, prefix: String) -> Self {
        Self { meta, bucket, dir, prefix }
    }

    pub async fn run(&self, period: Duration, mut shutdown: Shutdown) -> Result<()> {
        let mut interval = interval(period);

        info!("uploading recordings from {:?}", self.dir);

        loop {
            tokio::select! {
                _ = interval.tick()  => {},
                _ = shutdown.wait() => break,
            }

            if let Err(e) = self.tick().await {
                warn!("upload scan failed: {:?}", e);
            }
        }

        info!("uploader shutting down");

        Ok(())
    }

    pub async fn tick(&self) -> Result<Tick> {
        let files = self.pending()?;
        let found = files.len();

        if found == 0 {
            return Ok(Tick::default());
        }

        info!("found {} recording(s) to upload", found);

        let mut uploaded = 0;
        for file in files {
            match self.ship(&file).await {
                Ok(url) => {
                    info!("uploaded {:?} to {}", file, url);
                    uploaded += 1;
                }
                Err(e) => warn!("upload of {:?} failed: {:?}", file, e),
            }
        }

        if uploaded == found {
            self.meta.report(Status::Idle).await;
            info!("all recordings uploaded");
        } else {
            info!("uploaded {}/{} recordings, staying busy", uploaded, found);
        }

        Ok(Tick { found, uploaded })
    }

    fn pending(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries)                               => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e)                                    => {
                return Err(e).with_context(|| format!("reading {:?}", self.dir))
            }
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path  = entry.path();
            if entry.file_type()?.is_file() && Recording::is_complete(&path) {
                files.push(path);
            }
        }
        files.sort();

        Ok(files)
    }

    async fn ship(&self, path: &Path) -> Result<Url> {
        let name = path.file_name().and_then(|n| n.to_str()).ok_or_else(|| {
            anyhow!("invalid file name {:?}", path)
        })?;

        let key = s3::key(&self.prefix, name);
        let url = self.bucket.upload(path, &key).await?;

        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("deleted {:?}", path),
            Err(e) => warn!("uploaded but failed to delete {:?}: {}", path, e),
        }

        Ok(url)
    }
}
