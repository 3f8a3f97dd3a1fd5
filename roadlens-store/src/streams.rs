use crate::{ItsClient, json_file};
use async_trait::async_trait;
use roadlens_common::{CctvStream, Error, Result};
use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing::debug;
use url::Url;

/// Persisted CCTV entries plus on-demand resolution of the current HLS
/// playlist URL through the external directory.
#[async_trait]
pub trait StreamCatalog: Send + Sync {
    fn add(&self, name: &str, coordx: f64, coordy: f64) -> Result<CctvStream>;
    fn remove(&self, name: &str) -> Result<CctvStream>;
    fn get(&self, name: &str) -> Result<CctvStream>;
    fn get_all(&self) -> Vec<CctvStream>;

    /// Resolve the current playlist URL for a named entry. Called at the
    /// moment recording starts, never at submission; results are not
    /// cached.
    async fn resolve_hls(&self, name: &str) -> Result<Url>;
}

pub struct JsonStreamCatalog {
    path: PathBuf,
    streams: Mutex<Vec<CctvStream>>,
    its: ItsClient,
}

impl JsonStreamCatalog {
    pub fn open(path: &Path, its: ItsClient) -> Self {
        let streams: Vec<CctvStream> = json_file::load_or_default(path);
        debug!(
            "Loaded {} stream entries from {}",
            streams.len(),
            path.display()
        );
        Self {
            path: path.to_owned(),
            streams: Mutex::new(streams),
            its,
        }
    }
}

#[async_trait]
impl StreamCatalog for JsonStreamCatalog {
    #[tracing::instrument(skip(self))]
    fn add(&self, name: &str, coordx: f64, coordy: f64) -> Result<CctvStream> {
        let mut streams = self.streams.lock().expect("catalog lock should not be poisoned");

        if streams.iter().any(|s| s.name == name) {
            return Err(Error::Validation(format!(
                "stream \"{name}\" already exists"
            )));
        }

        let stream = CctvStream::new(name, coordx, coordy);
        streams.push(stream.clone());
        json_file::save_atomic(&self.path, &*streams)?;
        Ok(stream)
    }

    #[tracing::instrument(skip(self))]
    fn remove(&self, name: &str) -> Result<CctvStream> {
        let mut streams = self.streams.lock().expect("catalog lock should not be poisoned");

        let index = streams
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| Error::NotFound(format!("stream \"{name}\"")))?;

        let removed = streams.remove(index);
        json_file::save_atomic(&self.path, &*streams)?;
        Ok(removed)
    }

    fn get(&self, name: &str) -> Result<CctvStream> {
        let streams = self.streams.lock().expect("catalog lock should not be poisoned");
        streams
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("stream \"{name}\"")))
    }

    fn get_all(&self) -> Vec<CctvStream> {
        let streams = self.streams.lock().expect("catalog lock should not be poisoned");
        streams.clone()
    }

    #[tracing::instrument(skip(self))]
    async fn resolve_hls(&self, name: &str) -> Result<Url> {
        // Take the coordinate snapshot first; the guard must not be held
        // across the directory request.
        let stream = self.get(name)?;
        self.its.resolve(stream.coordx, stream.coordy).await
    }
}
