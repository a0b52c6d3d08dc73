mod common;

use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;

use monarch_pipeline::app::{App, Workspace};
use monarch_pipeline::config::SettingsLoader;
use monarch_pipeline::domain::{AuthScheme, LifeStage, NewLabel};
use monarch_pipeline::output::JsonOutput;
use monarch_pipeline::sampler::{FetchRequest, StopReason};
use monarch_pipeline::store::ObservationStore;
use monarch_pipeline::sync::SyncOptions;

use common::{MockCatalog, MockFetcher, MockLabelStudio, id, temp_dir};

fn build_app(temp: &tempfile::TempDir, ids: std::ops::RangeInclusive<i64>) -> App<MockCatalog, MockFetcher> {
    let root = temp_dir(temp);
    let workspace = Workspace {
        database_path: root.join("monarch.db"),
        image_dir: root.join("images"),
        request_delay: Duration::ZERO,
    };
    let store = ObservationStore::open(&workspace.database_path).unwrap();
    let fetcher = MockFetcher::new(workspace.image_dir.clone());
    App::new(store, workspace, MockCatalog::with_ids(ids), fetcher)
}

#[test]
fn fetch_then_sync_then_status() {
    let temp = tempfile::tempdir().unwrap();
    let app = build_app(&temp, 1..=4);

    let fetched = app
        .fetch_with_rng(
            FetchRequest {
                target: 3,
                max_attempts: None,
            },
            &mut StdRng::seed_from_u64(1),
            &JsonOutput,
        )
        .unwrap();
    assert_eq!(fetched.succeeded, 3);
    assert_eq!(fetched.stop, StopReason::Completed);

    let settings = SettingsLoader::resolve_with(|key| {
        (key == "LABEL_STUDIO_API_TOKEN").then(|| "token".to_string())
    })
    .unwrap();
    let annotation = settings.annotation().unwrap();
    let client = MockLabelStudio::accepting(&[AuthScheme::Token]);
    let synced = app
        .sync(&client, &annotation, SyncOptions::default(), &JsonOutput)
        .unwrap();
    assert_eq!(synced.created, 3);

    let status = app.status(&JsonOutput).unwrap();
    assert_eq!(status.observations, 3);
    assert_eq!(status.synced, 3);
    assert_eq!(status.unsynced, 0);
    assert_eq!(status.image_files, 3);
}

#[test]
fn purge_removes_rows_and_images() {
    let temp = tempfile::tempdir().unwrap();
    let app = build_app(&temp, 1..=2);
    app.fetch_with_rng(
        FetchRequest {
            target: 2,
            max_attempts: None,
        },
        &mut StdRng::seed_from_u64(3),
        &JsonOutput,
    )
    .unwrap();
    app.store()
        .insert_label(&NewLabel {
            observation_id: id(1),
            life_stage: LifeStage::Egg,
            annotator: None,
            task_id: None,
            annotation_id: None,
        })
        .unwrap();

    let purged = app.purge(&JsonOutput).unwrap();

    assert_eq!(purged.observations, 2);
    assert_eq!(purged.labels, 1);
    assert_eq!(purged.images_removed, 2);
    let status = app.status(&JsonOutput).unwrap();
    assert_eq!(status.observations, 0);
    assert_eq!(status.image_files, 0);
}

#[test]
fn init_creates_image_directory() {
    let temp = tempfile::tempdir().unwrap();
    let app = build_app(&temp, 1..=1);

    let result = app.init(&JsonOutput).unwrap();

    assert!(temp.path().join("images").is_dir());
    assert!(result.database_path.ends_with("monarch.db"));
}
