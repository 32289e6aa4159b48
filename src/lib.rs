pub mod config;
pub mod control;
pub mod data;
pub mod error;
pub mod meta;
pub mod s3;
pub mod shutdown;
pub mod target;
pub mod upload;

use std::future::Future;
use anyhow::Result;
use log::{debug, error};

pub fn spawn<F: Future<Output = Result<()>> + Send + 'static>(name: &'static str, task: F) {
    tokio::spawn(async move {
        match task.await {
            Ok(()) => debug!("{} finished", name),
            Err(e) => error!("{} failed: {:?}", name, e),
        }
    });
}
