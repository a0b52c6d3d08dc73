use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::{NaiveDate, Utc};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::config::CatalogSettings;
use crate::domain::{Observation, ObservationId};
use crate::error::PipelineError;
use crate::http;

/// iNaturalist rejects offset paging past this many results.
pub const MAX_ACCESSIBLE_RESULTS: u64 = 10_000;
pub const MAX_PER_PAGE: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePosition {
    Page(u32),
    Offset(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub position: PagePosition,
    pub per_page: u32,
}

impl PageRequest {
    pub fn page(page: u32, per_page: u32) -> Self {
        Self {
            position: PagePosition::Page(page),
            per_page,
        }
    }

    pub fn offset(offset: u64, per_page: u32) -> Self {
        Self {
            position: PagePosition::Offset(offset),
            per_page,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogPage {
    pub total_results: u64,
    pub results: Vec<CatalogRecord>,
}

/// One candidate observation as returned by the catalog.
#[derive(Debug, Clone)]
pub struct CatalogRecord {
    pub id: ObservationId,
    pub uri: Option<String>,
    pub observed_on: Option<NaiveDate>,
    pub observer_login: Option<String>,
    pub observer_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub place_guess: Option<String>,
    pub photo_url: Option<String>,
    pub quality_grade: Option<String>,
    pub agreements: i64,
    pub disagreements: i64,
    pub license: Option<String>,
    pub raw: Value,
}

impl CatalogRecord {
    pub fn inat_url(&self) -> String {
        self.uri
            .clone()
            .unwrap_or_else(|| format!("https://www.inaturalist.org/observations/{}", self.id))
    }

    pub fn into_observation(self, image_local_path: Utf8PathBuf) -> Observation {
        Observation {
            id: self.id,
            inat_url: self.inat_url(),
            observed_on: self.observed_on,
            observer_login: self.observer_login,
            observer_name: self.observer_name,
            latitude: self.latitude,
            longitude: self.longitude,
            location: self.place_guess,
            image_url: self.photo_url,
            image_local_path,
            quality_grade: self.quality_grade,
            num_identification_agreements: self.agreements,
            num_identification_disagreements: self.disagreements,
            license: self.license,
            raw_data: Some(self.raw),
            created_at: Utc::now(),
        }
    }
}

pub trait CatalogClient {
    fn fetch_page(&self, request: &PageRequest) -> Result<CatalogPage, PipelineError>;
}

#[derive(Clone)]
pub struct INatHttpClient {
    client: Client,
    settings: CatalogSettings,
}

impl INatHttpClient {
    pub fn new(settings: CatalogSettings) -> Result<Self, PipelineError> {
        let client = http::build_client(Duration::from_secs(30))
            .map_err(|err| PipelineError::TransientFetch(err.to_string()))?;
        Ok(Self { client, settings })
    }

    fn query(&self, request: &PageRequest) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("taxon_id", self.settings.taxon_id.to_string()),
            ("quality_grade", "research".to_string()),
            ("without_term_id", "1".to_string()),
            ("photos", "true".to_string()),
            ("per_page", request.per_page.min(MAX_PER_PAGE).to_string()),
            ("order_by", "observed_on".to_string()),
            ("order", "desc".to_string()),
        ];
        match request.position {
            PagePosition::Page(page) => params.push(("page", page.max(1).to_string())),
            PagePosition::Offset(offset) => params.push(("offset", offset.to_string())),
        }
        params
    }
}

impl CatalogClient for INatHttpClient {
    fn fetch_page(&self, request: &PageRequest) -> Result<CatalogPage, PipelineError> {
        let params = self.query(request);
        let response =
            http::send_with_retries(|| self.client.get(&self.settings.api_url).query(&params))
                .map_err(|err| PipelineError::TransientFetch(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = http::error_message(response, "catalog request failed");
            return Err(PipelineError::CatalogStatus { status, message });
        }
        let body = response
            .text()
            .map_err(|err| PipelineError::TransientFetch(err.to_string()))?;
        parse_page(&body)
    }
}

#[derive(Debug, Deserialize)]
struct RawPage {
    total_results: u64,
    #[serde(default)]
    results: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    id: i64,
    uri: Option<String>,
    observed_on: Option<String>,
    user: Option<RawUser>,
    location: Option<String>,
    place_guess: Option<String>,
    #[serde(default)]
    photos: Vec<RawPhoto>,
    quality_grade: Option<String>,
    #[serde(default)]
    identifications: Vec<RawIdentification>,
    license_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    login: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPhoto {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawIdentification {
    #[serde(default)]
    current: bool,
    category: Option<String>,
}

pub fn parse_page(body: &str) -> Result<CatalogPage, PipelineError> {
    let raw: RawPage =
        serde_json::from_str(body).map_err(|err| PipelineError::MalformedResponse(err.to_string()))?;
    let results = raw
        .results
        .into_iter()
        .map(parse_record)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CatalogPage {
        total_results: raw.total_results,
        results,
    })
}

fn parse_record(value: Value) -> Result<CatalogRecord, PipelineError> {
    let record: RawRecord = serde_json::from_value(value.clone())
        .map_err(|err| PipelineError::MalformedResponse(err.to_string()))?;
    let id = ObservationId::new(record.id)
        .map_err(|err| PipelineError::MalformedResponse(err.to_string()))?;
    let (latitude, longitude) = record
        .location
        .as_deref()
        .map(parse_coordinates)
        .unwrap_or((None, None));
    let observed_on = record
        .observed_on
        .as_deref()
        .and_then(|value| NaiveDate::parse_from_str(value, "%Y-%m-%d").ok());
    let photo_url = record
        .photos
        .iter()
        .find_map(|photo| photo.url.as_deref())
        .map(medium_photo_url);
    let count_current = |category: &str| {
        record
            .identifications
            .iter()
            .filter(|ident| ident.current && ident.category.as_deref() == Some(category))
            .count() as i64
    };
    let (login, name) = match record.user {
        Some(user) => (user.login, user.name),
        None => (None, None),
    };

    Ok(CatalogRecord {
        id,
        uri: record.uri,
        observed_on,
        observer_login: login,
        observer_name: name,
        latitude,
        longitude,
        place_guess: record.place_guess.filter(|value| !value.trim().is_empty()),
        photo_url,
        quality_grade: record.quality_grade,
        agreements: count_current("improving"),
        disagreements: count_current("maverick"),
        license: record.license_code,
        raw: value,
    })
}

/// `"lat,lng"` as sent by the catalog.
pub fn parse_coordinates(value: &str) -> (Option<f64>, Option<f64>) {
    let mut parts = value.split(',').map(|part| part.trim().parse::<f64>().ok());
    let latitude = parts.next().flatten();
    let longitude = parts.next().flatten();
    (latitude, longitude)
}

/// Search results carry the `square` thumbnail; the `medium` rendition is what gets labelled.
pub fn medium_photo_url(url: &str) -> String {
    url.replacen("/square.", "/medium.", 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinates_split_on_comma() {
        assert_eq!(
            parse_coordinates("29.7604,-95.3698"),
            (Some(29.7604), Some(-95.3698))
        );
        assert_eq!(parse_coordinates("garbage"), (None, None));
    }

    #[test]
    fn photo_url_upgraded_to_medium() {
        assert_eq!(
            medium_photo_url("https://static.inaturalist.org/photos/1/square.jpg?1"),
            "https://static.inaturalist.org/photos/1/medium.jpg?1"
        );
    }
}
