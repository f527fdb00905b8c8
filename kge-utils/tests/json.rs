use serde::{Deserialize, Serialize};
use serde_json::json;
use kge_utils::*;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct Settings {
    name: String,
    lr: f32,
}

#[test]
fn test_jsonify_sorts_keys() {
    let value = json!({"b": 1, "a": {"d": 2, "c": 3}, "e": [{"g": 1, "f": 2}]});
    assert_eq!(
        jsonify(&value),
        r#"{"a":{"c":3,"d":2},"b":1,"e":[{"f":2,"g":1}]}"#
    );
}

#[test]
fn test_load_json_arg_inline() {
    let settings: Settings = load_json_arg(r#"{"name": "entity", "lr": 0.5}"#).unwrap();
    assert_eq!(
        settings,
        Settings {
            name: "entity".to_string(),
            lr: 0.5
        }
    );
}

#[test]
fn test_load_json_arg_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    let settings = Settings {
        name: "relation".to_string(),
        lr: 0.25,
    };
    write_json_file(&path, &settings).unwrap();

    let loaded: Settings = load_json_arg(path.to_str().unwrap()).unwrap();
    assert_eq!(loaded, settings);
    let loaded: Settings = read_json_file(&path).unwrap();
    assert_eq!(loaded, settings);
}

#[test]
fn test_load_json_arg_missing_file() {
    let err = load_json_arg::<Settings>("/definitely/not/here.json").unwrap_err();
    assert!(err.to_string().contains("Failed to read json file"));
}

#[test]
fn test_seed_from_name_is_stable() {
    assert_eq!(seed_from_name("entity"), seed_from_name("entity"));
    assert_ne!(seed_from_name("entity"), seed_from_name("relation"));
    assert_eq!(u8s_from_str("entity"), *blake3::hash(b"entity").as_bytes());
}
