mod common;

use assert_matches::assert_matches;
use serde_json::json;

use monarch_pipeline::error::PipelineError;
use monarch_pipeline::labelstudio::{
    TaskData, observation_id_from_image_ref, observation_id_from_task, parse_task_listing,
};

use common::{id, observation};

#[test]
fn image_refs_yield_observation_ids() {
    assert_eq!(
        observation_id_from_image_ref("/data/local-files/?d=images/123456.jpg"),
        Some(id(123456))
    );
    assert_eq!(
        observation_id_from_image_ref("/data/images/42.jpg?token=abc"),
        Some(id(42))
    );
    assert_eq!(observation_id_from_image_ref("77.jpeg"), Some(id(77)));
    assert_eq!(observation_id_from_image_ref("/data/images/cat123.jpg"), None);
    assert_eq!(observation_id_from_image_ref("/data/images/12.png"), None);
}

#[test]
fn explicit_field_preferred_over_image() {
    let data = json!({ "observation_id": "9", "image": "/data/images/10.jpg" });
    assert_eq!(observation_id_from_task(&data), Some(id(9)));

    let data = json!({ "observation_id": 11 });
    assert_eq!(observation_id_from_task(&data), Some(id(11)));

    let data = json!({ "observation_id": "n/a", "image": "/data/images/10.jpg" });
    assert_eq!(observation_id_from_task(&data), Some(id(10)));

    assert_eq!(observation_id_from_task(&json!({})), None);
}

#[test]
fn listing_accepts_both_shapes() {
    let bare = r#"[{"id": 1, "data": {"image": "/data/images/5.jpg"}}, {"id": 2}]"#;
    let tasks = parse_task_listing(bare).unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].task_id, 1);
    assert_eq!(tasks[0].observation_id, Some(id(5)));
    assert_eq!(tasks[1].observation_id, None);

    let wrapped = r#"{"total": 1, "tasks": [{"id": 3, "data": {"observation_id": "8"}}]}"#;
    let tasks = parse_task_listing(wrapped).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].observation_id, Some(id(8)));
}

#[test]
fn listing_rejects_unknown_shape() {
    assert_matches!(
        parse_task_listing(r#"{"detail": "nope"}"#),
        Err(PipelineError::AnnotationResponse(_))
    );
}

#[test]
fn task_data_defaults_missing_fields() {
    let mut obs = observation(21);
    obs.inat_url = String::new();
    obs.observed_on = None;
    obs.observer_login = None;
    obs.location = None;

    let data = TaskData::from_observation(&obs, "/data/images/");
    assert_eq!(data.image, "/data/images/21.jpg");
    assert_eq!(data.inat_url, "N/A");
    assert_eq!(data.observed_on, "Unknown");
    assert_eq!(data.observer, "Unknown");
    assert_eq!(data.location, "Unknown");
}

#[test]
fn task_data_links_catalog_page() {
    let data = TaskData::from_observation(&observation(21), "/data/images");
    assert_eq!(
        data.inat_url,
        r#"<a href="https://www.inaturalist.org/observations/21" target="_blank">View on iNaturalist</a>"#
    );
    assert_eq!(data.observer, "lepidopterist");
}
