mod common;

use std::io::{self, Read};

use assert_matches::assert_matches;

use monarch_pipeline::error::PipelineError;
use monarch_pipeline::images::{FetchedImage, HttpImageFetcher, ImageFetcher, write_image};

use common::{id, temp_dir};

/// Yields a few bytes, then fails like a dropped connection.
struct BrokenBody {
    sent: bool,
}

impl Read for BrokenBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.sent {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"));
        }
        self.sent = true;
        let chunk = b"\xff\xd8\xff\xe0partial";
        buf[..chunk.len()].copy_from_slice(chunk);
        Ok(chunk.len())
    }
}

#[test]
fn existing_file_is_reported_without_download() {
    let temp = tempfile::tempdir().unwrap();
    let dir = temp_dir(&temp);
    std::fs::write(dir.join("55.jpg"), b"jpeg").unwrap();
    let fetcher = HttpImageFetcher::new(dir.clone()).unwrap();

    // Unroutable URL: any network attempt would fail the test.
    let fetched = fetcher.fetch("http://127.0.0.1:9/55.jpg", id(55)).unwrap();

    assert_matches!(fetched, FetchedImage::AlreadyPresent(path) if path == dir.join("55.jpg"));
    assert_eq!(std::fs::read(dir.join("55.jpg")).unwrap(), b"jpeg");
}

#[test]
fn body_is_written_under_observation_id() {
    let temp = tempfile::tempdir().unwrap();
    let dir = temp_dir(&temp);

    let fetched = write_image(&dir, id(8), "https://img/8.jpg", &mut &b"jpeg bytes"[..]).unwrap();

    assert_matches!(fetched, FetchedImage::Downloaded(path) if path == dir.join("8.jpg"));
    assert_eq!(std::fs::read(dir.join("8.jpg")).unwrap(), b"jpeg bytes");
}

#[test]
fn interrupted_body_leaves_no_file() {
    let temp = tempfile::tempdir().unwrap();
    let dir = temp_dir(&temp);

    let result = write_image(&dir, id(9), "https://img/9.jpg", &mut BrokenBody { sent: false });

    assert_matches!(result, Err(PipelineError::Transfer { url, .. }) if url == "https://img/9.jpg");
    let leftovers: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
}

#[test]
fn existing_file_is_not_overwritten_by_late_writer() {
    let temp = tempfile::tempdir().unwrap();
    let dir = temp_dir(&temp);
    std::fs::write(dir.join("10.jpg"), b"first").unwrap();

    let fetched = write_image(&dir, id(10), "https://img/10.jpg", &mut &b"second"[..]).unwrap();

    assert_matches!(fetched, FetchedImage::AlreadyPresent(_));
    assert_eq!(std::fs::read(dir.join("10.jpg")).unwrap(), b"first");
    assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);
}
