use std::fs;

use sps_adapters::{RecordSource, SnapshotSource, SourceError};
use sps_core::RecordKind;
use tempfile::tempdir;

#[tokio::test]
async fn loads_json_and_csv_tables_from_a_directory() {
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join("matches.json"),
        r#"[
            {"match_id": "2526-4-epl-1", "gameweek": 4, "finished": true, "home_score": 2},
            {"match_id": "2526-5-epl-2", "gameweek": 5, "finished": false, "home_score": null}
        ]"#,
    )
    .unwrap();
    fs::write(
        dir.path().join("players.csv"),
        "player_id,web_name\n1,Saka\n2,Rice\n",
    )
    .unwrap();

    let source = SnapshotSource::from_dir(dir.path()).expect("snapshot source");

    let matches = source.fetch_all(RecordKind::Match).await.unwrap();
    assert_eq!(matches.columns(), &["match_id", "gameweek", "finished", "home_score"]);
    assert_eq!(matches.value(0, "finished"), Some("True"));
    assert_eq!(matches.value(1, "home_score"), None);

    let players = source.fetch_all(RecordKind::Player).await.unwrap();
    assert_eq!(players.len(), 2);

    let teams = source.fetch_all(RecordKind::Team).await.unwrap();
    assert!(teams.is_empty());

    let by_id = source
        .fetch_by_parent_ids(RecordKind::Match, "match_id", &["2526-5-epl-2".to_string()])
        .await
        .unwrap();
    assert_eq!(by_id.len(), 1);
    assert_eq!(by_id.value(0, "gameweek"), Some("5"));
}

#[test]
fn malformed_snapshot_is_reported_with_its_path() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("teams.json"), r#"{"not": "an array"}"#).unwrap();

    let err = SnapshotSource::from_dir(dir.path()).unwrap_err();
    match err {
        SourceError::SnapshotParse { path, .. } => {
            assert!(path.ends_with("teams.json"));
        }
        other => panic!("unexpected error: {other}"),
    }
}
