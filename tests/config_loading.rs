//! Building engines from configuration files

mod common;

use std::sync::Arc;

use common::{init_test_logging, OutputSink};
use nano_serve_rs::testing::MockModelLib;
use nano_serve_rs::{DeviceSpec, Engine, EngineConfig, GenerationConfig, Request};
use tempfile::tempdir;

const TOKENIZER_JSON: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": {"type": "WhitespaceSplit"},
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": {"hello": 0, "world": 1, "again": 2, "[UNK]": 3},
    "unk_token": "[UNK]"
  }
}"#;

fn engine_config_json(tokenizer_path: &std::path::Path) -> String {
    serde_json::json!({
        "max_single_sequence_length": 32,
        "tokenizer_path": tokenizer_path,
        "kv_cache": {"page_size": 4, "max_num_sequence": 2, "max_total_sequence_length": 64},
        "models": [{"model_path": "primary"}]
    })
    .to_string()
}

#[test]
fn test_engine_from_config_file() {
    init_test_logging();
    let dir = tempdir().unwrap();
    let tokenizer_path = dir.path().join("tokenizer.json");
    std::fs::write(&tokenizer_path, TOKENIZER_JSON).unwrap();
    let config_path = dir.path().join("engine.json");
    std::fs::write(&config_path, engine_config_json(dir.path())).unwrap();

    let config = EngineConfig::from_file(&config_path).unwrap();
    assert_eq!(config.models[0].device, DeviceSpec::cpu());
    assert_eq!(config.spec_draft_length, 4);

    let lib = MockModelLib::new(4);
    let mut engine = Engine::from_config(&config, Arc::new(lib.clone())).unwrap();
    assert_eq!(lib.loaded_paths(), vec![std::path::PathBuf::from("primary")]);
    assert_eq!(engine.num_models(), 1);
    assert_eq!(engine.kv_cache_config().num_pages(), 16);

    let sink = OutputSink::new();
    engine.add_request(Request::from_text(
        "hello world",
        GenerationConfig::greedy().with_max_tokens(1),
        sink.callback(),
    ));
    while engine.has_pending_work() {
        engine.step().unwrap();
    }

    let output = &sink.outputs()[0];
    assert_eq!(output.num_input_tokens, 2);
    assert_eq!(output.output_token_ids, vec![2]);
    assert_eq!(output.text, "again");
}

#[test]
fn test_missing_tokenizer_loads_no_model() {
    let dir = tempdir().unwrap();
    let config = EngineConfig::new("primary", dir.path().join("missing.json"));
    let lib = MockModelLib::new(4);

    let err = Engine::from_config(&config, Arc::new(lib.clone())).unwrap_err();
    assert!(err.is_configuration());
    assert!(lib.loaded_paths().is_empty());
}

#[test]
fn test_draft_model_from_config() {
    let dir = tempdir().unwrap();
    let tokenizer_path = dir.path().join("tokenizer.json");
    std::fs::write(&tokenizer_path, TOKENIZER_JSON).unwrap();

    let config = EngineConfig::new("primary", &tokenizer_path)
        .with_max_single_sequence_length(32)
        .with_draft_model("draft", DeviceSpec::cpu())
        .with_spec_draft_length(2);
    let lib = MockModelLib::new(4);
    let engine = Engine::from_config(&config, Arc::new(lib.clone())).unwrap();

    assert_eq!(engine.num_models(), 2);
    assert_eq!(
        lib.loaded_paths(),
        vec![std::path::PathBuf::from("primary"), std::path::PathBuf::from("draft")]
    );
}

#[test]
fn test_layered_config_env_override() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("engine.json");
    std::fs::write(&config_path, engine_config_json(dir.path())).unwrap();

    std::env::set_var("SERVE_ENGINE__KV_CACHE__PAGE_SIZE", "8");
    let loaded = EngineConfig::load_layered(Some(config_path.as_path()));
    std::env::remove_var("SERVE_ENGINE__KV_CACHE__PAGE_SIZE");

    let config = loaded.unwrap();
    assert_eq!(config.kv_cache.page_size, 8);
    assert_eq!(config.kv_cache.max_total_sequence_length, 64);
    assert_eq!(config.max_single_sequence_length, 32);
    assert_eq!(config.models.len(), 1);
}

#[test]
fn test_invalid_config_file_rejected() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("engine.json");
    std::fs::write(
        &config_path,
        r#"{"max_single_sequence_length": 128, "models": [{"model_path": "m"}],
            "kv_cache": {"page_size": 4, "max_num_sequence": 2, "max_total_sequence_length": 64}}"#,
    )
    .unwrap();

    let err = EngineConfig::from_file(&config_path).unwrap_err();
    assert!(format!("{:#}", err).contains("kv_cache"));
}
