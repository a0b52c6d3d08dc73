mod common;

use assert_matches::assert_matches;

use monarch_pipeline::domain::{AuthScheme, LifeStage, ObservationId};
use monarch_pipeline::error::PipelineError;

#[test]
fn parse_observation_id_valid() {
    let id: ObservationId = " 987654 ".parse().unwrap();
    assert_eq!(id.get(), 987654);
    assert_eq!(id.to_string(), "987654");
}

#[test]
fn observation_id_must_be_positive() {
    assert_matches!(
        ObservationId::new(-3),
        Err(PipelineError::InvalidObservationId(_))
    );
}

#[test]
fn parse_life_stage_synonyms() {
    assert_eq!("caterpillar".parse::<LifeStage>().unwrap(), LifeStage::Larva);
    assert_eq!("Chrysalis".parse::<LifeStage>().unwrap(), LifeStage::Pupa);
    assert_eq!("ADULT".parse::<LifeStage>().unwrap(), LifeStage::Adult);
    assert_matches!(
        "imago".parse::<LifeStage>(),
        Err(PipelineError::InvalidLifeStage(_))
    );
}

#[test]
fn life_stage_names_match_schema() {
    let names: Vec<_> = LifeStage::ALL.iter().map(|stage| stage.as_str()).collect();
    assert_eq!(names, ["Egg", "Larva", "Pupa", "Adult", "Unknown"]);
}

#[test]
fn parse_auth_scheme() {
    assert_eq!("bearer".parse::<AuthScheme>().unwrap(), AuthScheme::Bearer);
    assert_eq!("Token".parse::<AuthScheme>().unwrap(), AuthScheme::Token);
    assert_matches!(
        "Basic".parse::<AuthScheme>(),
        Err(PipelineError::InvalidAuthScheme(_))
    );
    assert_eq!(AuthScheme::Token.header_value("s3cret"), "Token s3cret");
}

#[test]
fn observation_serializes_with_image_path() {
    let value = serde_json::to_value(common::observation(31)).unwrap();
    assert_eq!(value["image_local_path"], "data/images/31.jpg");
    assert_eq!(value["inat_url"], "https://www.inaturalist.org/observations/31");
}
