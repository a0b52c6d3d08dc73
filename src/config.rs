use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::domain::AuthScheme;
use crate::error::PipelineError;

pub const DEFAULT_INAT_API_URL: &str = "https://api.inaturalist.org/v1/observations";
pub const MONARCH_TAXON_ID: u64 = 48662;
pub const DEFAULT_LABEL_STUDIO_URL: &str = "http://localhost:8080";
pub const DEFAULT_IMAGE_ROOT: &str = "/data/images";
const DEFAULT_DB_PATH: &str = "data/monarch.db";
const DEFAULT_IMAGE_DIR: &str = "data/images";
const DEFAULT_REQUEST_DELAY_MS: u64 = 2000;
const DEFAULT_PROJECT_ID: u64 = 1;

#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub api_url: String,
    pub taxon_id: u64,
}

#[derive(Debug, Clone)]
pub struct AnnotationSettings {
    pub base_url: String,
    pub api_token: String,
    pub project_id: u64,
    /// Prefix the annotation service resolves image references against.
    pub image_root: String,
    pub primary_scheme: AuthScheme,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: Utf8PathBuf,
    pub image_dir: Utf8PathBuf,
    pub request_delay: Duration,
    pub catalog: CatalogSettings,
    pub label_studio_url: String,
    pub label_studio_token: Option<String>,
    pub label_studio_project_id: u64,
    pub label_studio_image_root: String,
    pub label_studio_scheme: AuthScheme,
}

impl Settings {
    /// Annotation-service settings; the credential is only required here.
    pub fn annotation(&self) -> Result<AnnotationSettings, PipelineError> {
        let api_token = self
            .label_studio_token
            .clone()
            .ok_or(PipelineError::MissingConfig("LABEL_STUDIO_API_TOKEN"))?;
        Ok(AnnotationSettings {
            base_url: self.label_studio_url.trim_end_matches('/').to_string(),
            api_token,
            project_id: self.label_studio_project_id,
            image_root: self.label_studio_image_root.trim_end_matches('/').to_string(),
            primary_scheme: self.label_studio_scheme,
        })
    }
}

pub struct SettingsLoader;

impl SettingsLoader {
    /// Reads `.env` (if present) and then the process environment.
    pub fn resolve() -> Result<Settings, PipelineError> {
        let _ = dotenvy::dotenv();
        Self::resolve_with(|key| std::env::var(key).ok())
    }

    pub fn resolve_with<F>(lookup: F) -> Result<Settings, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let delay_ms: u64 = parse_or(
            "MONARCH_REQUEST_DELAY_MS",
            get("MONARCH_REQUEST_DELAY_MS"),
            DEFAULT_REQUEST_DELAY_MS,
        )?;
        let taxon_id = parse_or("INAT_TAXON_ID", get("INAT_TAXON_ID"), MONARCH_TAXON_ID)?;
        let project_id = parse_or(
            "LABEL_STUDIO_PROJECT_ID",
            get("LABEL_STUDIO_PROJECT_ID"),
            DEFAULT_PROJECT_ID,
        )?;
        let scheme = match get("LABEL_STUDIO_AUTH_SCHEME") {
            Some(value) => value
                .parse::<AuthScheme>()
                .map_err(|_| PipelineError::InvalidConfig {
                    key: "LABEL_STUDIO_AUTH_SCHEME",
                    value,
                })?,
            None => AuthScheme::Token,
        };

        Ok(Settings {
            database_path: Utf8PathBuf::from(
                get("MONARCH_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            ),
            image_dir: Utf8PathBuf::from(
                get("MONARCH_IMAGE_DIR").unwrap_or_else(|| DEFAULT_IMAGE_DIR.to_string()),
            ),
            request_delay: Duration::from_millis(delay_ms),
            catalog: CatalogSettings {
                api_url: get("INAT_API_URL").unwrap_or_else(|| DEFAULT_INAT_API_URL.to_string()),
                taxon_id,
            },
            label_studio_url: get("LABEL_STUDIO_URL")
                .unwrap_or_else(|| DEFAULT_LABEL_STUDIO_URL.to_string()),
            label_studio_token: get("LABEL_STUDIO_API_TOKEN"),
            label_studio_project_id: project_id,
            label_studio_image_root: get("LABEL_STUDIO_IMAGE_ROOT")
                .unwrap_or_else(|| DEFAULT_IMAGE_ROOT.to_string()),
            label_studio_scheme: scheme,
        })
    }
}

fn parse_or<T: FromStr>(
    key: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, PipelineError> {
    match value {
        Some(value) => value
            .parse()
            .map_err(|_| PipelineError::InvalidConfig { key, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        let settings = SettingsLoader::resolve_with(|_| None).unwrap();
        assert_eq!(settings.database_path, "data/monarch.db");
        assert_eq!(settings.catalog.taxon_id, MONARCH_TAXON_ID);
        assert_eq!(settings.request_delay, Duration::from_millis(2000));
        assert_eq!(settings.label_studio_scheme, AuthScheme::Token);
    }
}
