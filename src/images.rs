use std::fs;
use std::io::{self, Read};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::blocking::Client;

use crate::domain::ObservationId;
use crate::error::PipelineError;
use crate::http;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedImage {
    Downloaded(Utf8PathBuf),
    /// A file for this id was already on disk; nothing was written.
    AlreadyPresent(Utf8PathBuf),
}

pub trait ImageFetcher {
    fn fetch(&self, url: &str, id: ObservationId) -> Result<FetchedImage, PipelineError>;
}

pub fn image_path(image_dir: &Utf8Path, id: ObservationId) -> Utf8PathBuf {
    image_dir.join(id.image_file_name())
}

#[derive(Clone)]
pub struct HttpImageFetcher {
    client: Client,
    image_dir: Utf8PathBuf,
}

impl HttpImageFetcher {
    pub fn new(image_dir: Utf8PathBuf) -> Result<Self, PipelineError> {
        let client = http::build_client(Duration::from_secs(60)).map_err(|err| {
            PipelineError::Transfer {
                url: String::new(),
                message: err.to_string(),
            }
        })?;
        Ok(Self { client, image_dir })
    }
}

impl ImageFetcher for HttpImageFetcher {
    fn fetch(&self, url: &str, id: ObservationId) -> Result<FetchedImage, PipelineError> {
        let destination = image_path(&self.image_dir, id);
        if destination.as_std_path().exists() {
            return Ok(FetchedImage::AlreadyPresent(destination));
        }
        fs::create_dir_all(self.image_dir.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;

        let mut response = http::send_with_retries(|| self.client.get(url)).map_err(|err| {
            PipelineError::Transfer {
                url: url.to_string(),
                message: err.to_string(),
            }
        })?;
        if !response.status().is_success() {
            return Err(PipelineError::Transfer {
                url: url.to_string(),
                message: format!("status {}", response.status().as_u16()),
            });
        }
        write_image(&self.image_dir, id, url, &mut response)
    }
}

/// Streams `body` into `{id}.jpg` under `image_dir` without overwriting.
///
/// Bytes land in a temp file first; a read error leaves nothing behind.
pub fn write_image<R: Read>(
    image_dir: &Utf8Path,
    id: ObservationId,
    url: &str,
    body: &mut R,
) -> Result<FetchedImage, PipelineError> {
    let destination = image_path(image_dir, id);
    let transfer_error = |message: String| PipelineError::Transfer {
        url: url.to_string(),
        message,
    };

    let mut temp = tempfile::Builder::new()
        .prefix(".monarch-image")
        .tempfile_in(image_dir.as_std_path())
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    io::copy(body, temp.as_file_mut()).map_err(|err| transfer_error(err.to_string()))?;
    match temp.persist_noclobber(destination.as_std_path()) {
        Ok(_) => Ok(FetchedImage::Downloaded(destination)),
        Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
            Ok(FetchedImage::AlreadyPresent(destination))
        }
        Err(err) => Err(transfer_error(err.error.to_string())),
    }
}
