//! End-to-end scheduling scenarios on a single mock model

mod common;

use common::{assert_consistent, kv_json, run_to_completion, single_model_engine, token_request, OutputSink};
use nano_serve_rs::testing::{fixed_distribution, CharTokenizer, MockModel, ModelCall};
use nano_serve_rs::{EngineBuilder, FinishReason, GenerationConfig, Request, StepOutcome};

fn greedy(max_tokens: usize) -> GenerationConfig {
    GenerationConfig::greedy().with_max_tokens(max_tokens)
}

#[test]
fn test_prefill_then_decode() {
    let mut engine = single_model_engine(32, &kv_json(4, 4, 64), 64);
    let sink = OutputSink::new();
    engine.add_request(token_request("a", (1..=10).collect(), greedy(5), &sink));

    let outcome = engine.step().unwrap();
    assert!(outcome.prefilled);
    assert!(!outcome.decoded);
    assert_eq!(engine.num_running(), 1);
    assert_eq!(engine.num_waiting(), 0);
    assert_eq!(engine.request_state("a").unwrap().model_states[0].committed_token_ids(), vec![11]);

    let outcome = engine.step().unwrap();
    assert!(outcome.decoded);
    assert_eq!(
        engine.request_state("a").unwrap().model_states[0].committed_token_ids(),
        vec![11, 12]
    );
}

#[test]
fn test_admission_waits_for_capacity() {
    let mut engine = single_model_engine(32, &kv_json(4, 4, 48), 64);
    let sink = OutputSink::new();
    engine.add_request(token_request("small", (1..=20).collect(), greedy(4), &sink));
    engine.add_request(token_request("large", (1..=24).collect(), greedy(2), &sink));

    assert!(engine.step().unwrap().prefilled);
    while sink.get("small").is_none() {
        let outcome = engine.step().unwrap();
        assert!(!outcome.prefilled);
        assert_eq!(engine.num_waiting(), 1);
        assert_consistent(&engine);
    }

    let outcome = engine.step().unwrap();
    assert!(outcome.prefilled);
    assert_eq!(engine.num_waiting(), 0);

    run_to_completion(&mut engine, 16);
    assert_eq!(sink.get("large").unwrap().output_token_ids, vec![25, 26]);
}

#[test]
fn test_abort_running_request() {
    let model = MockModel::new(64);
    let handle = model.handle();
    let mut engine = EngineBuilder::new(32)
        .tokenizer(Box::new(CharTokenizer::new()))
        .kv_cache_config_json(kv_json(4, 4, 64))
        .model(Box::new(model))
        .build()
        .unwrap();
    let sink = OutputSink::new();
    engine.add_request(token_request("a", vec![1, 2, 3], greedy(10), &sink));
    engine.add_request(token_request("b", vec![5, 6], greedy(10), &sink));
    for _ in 0..3 {
        engine.step().unwrap();
    }

    handle.clear_calls();
    engine.abort_request("a");
    let outcome = engine.step().unwrap();
    assert!(outcome.aborted);
    assert!(outcome.decoded);

    let aborted = sink.get("a").unwrap();
    assert_eq!(aborted.finish_reason, FinishReason::Aborted);
    assert_eq!(aborted.output_token_ids, vec![4, 5]);
    assert_eq!(aborted.num_input_tokens, 3);

    let b_seq = engine.request_state("b").unwrap().model_states[0].internal_id.unwrap();
    let decodes: Vec<ModelCall> = handle
        .calls()
        .into_iter()
        .filter(|call| matches!(call, ModelCall::Decode { .. }))
        .collect();
    assert_eq!(decodes, vec![ModelCall::Decode { seq_ids: vec![b_seq] }]);
    assert_eq!(engine.num_running(), 1);
    assert_consistent(&engine);
}

#[test]
fn test_abort_is_idempotent() {
    let mut engine = single_model_engine(32, &kv_json(4, 4, 64), 64);
    let sink = OutputSink::new();
    engine.add_request(token_request("a", vec![1, 2, 3], greedy(10), &sink));
    engine.step().unwrap();

    engine.abort_request("a");
    engine.abort_request("a");
    engine.step().unwrap();
    engine.abort_request("a");
    engine.abort_request("unknown");
    engine.step().unwrap();

    assert_eq!(sink.len(), 1);
    assert_eq!(sink.outputs()[0].finish_reason, FinishReason::Aborted);
    assert!(!engine.has_pending_work());
}

#[test]
fn test_abort_waiting_request() {
    let mut engine = single_model_engine(32, &kv_json(4, 4, 64), 64);
    let sink = OutputSink::new();
    engine.add_request(token_request("w", vec![7], greedy(4), &sink));
    engine.abort_request("w");

    let outcome = engine.step().unwrap();
    assert!(outcome.aborted);
    assert!(!outcome.prefilled);

    let output = sink.get("w").unwrap();
    assert_eq!(output.finish_reason, FinishReason::Aborted);
    assert!(output.output_token_ids.is_empty());
    assert_eq!(output.num_input_tokens, 1);
}

#[test]
fn test_idle_step() {
    let mut engine = single_model_engine(32, &kv_json(4, 4, 64), 64);
    let outcome = engine.step().unwrap();
    assert_eq!(outcome, StepOutcome::default());
    assert!(!outcome.did_work());
}

#[test]
fn test_stop_token_and_length_limits() {
    let mut engine = single_model_engine(16, &kv_json(4, 4, 64), 64);
    let sink = OutputSink::new();
    engine.add_request(token_request(
        "stop",
        vec![1],
        greedy(10).with_stop_token_ids(vec![4]),
        &sink,
    ));
    engine.add_request(token_request(
        "ignore",
        vec![1],
        greedy(5).with_stop_token_ids(vec![4]).with_ignore_eos(true),
        &sink,
    ));
    engine.add_request(token_request("window", (1..=10).collect(), greedy(100), &sink));

    run_to_completion(&mut engine, 64);

    let stop = sink.get("stop").unwrap();
    assert_eq!(stop.output_token_ids, vec![2, 3, 4]);
    assert_eq!(stop.finish_reason, FinishReason::Stop);

    let ignore = sink.get("ignore").unwrap();
    assert_eq!(ignore.output_token_ids, vec![2, 3, 4, 5, 6]);
    assert_eq!(ignore.finish_reason, FinishReason::Length);

    let window = sink.get("window").unwrap();
    assert_eq!(window.output_token_ids, (11..=16).collect::<Vec<u32>>());
    assert_eq!(window.finish_reason, FinishReason::Length);
}

#[test]
fn test_text_round_trip() {
    let mut engine = single_model_engine(64, &kv_json(4, 4, 128), 128);
    let sink = OutputSink::new();
    engine.add_request(Request::from_text("ab", greedy(3), sink.callback()));
    run_to_completion(&mut engine, 16);

    let output = &sink.outputs()[0];
    assert_eq!(output.text, "cde");
    assert_eq!(output.num_input_tokens, 2);
}

#[test]
fn test_invariants_hold_under_load() {
    let mut engine = single_model_engine(32, &kv_json(4, 3, 64), 64);
    let sink = OutputSink::new();
    let lengths = [3usize, 9, 1, 14, 6, 11];
    for (i, &len) in lengths.iter().enumerate() {
        let start = (i as u32) * 4;
        let tokens: Vec<u32> = (start..start + len as u32).collect();
        engine.add_request(token_request(&format!("r{}", i), tokens, greedy(3 + i), &sink));
    }

    let mut steps = 0;
    while engine.has_pending_work() {
        assert!(steps < 200, "engine did not drain");
        engine.step().unwrap();
        assert_consistent(&engine);
        steps += 1;
    }

    assert_eq!(sink.len(), lengths.len());
    for (i, &len) in lengths.iter().enumerate() {
        let output = sink.get(&format!("r{}", i)).unwrap();
        let last_input = (i as u32) * 4 + len as u32 - 1;
        let expected: Vec<u32> = (1..=(3 + i) as u32).map(|k| (last_input + k) % 64).collect();
        assert_eq!(output.output_token_ids, expected, "request r{}", i);
    }

    let stats: serde_json::Value = serde_json::from_str(&engine.stats()).unwrap();
    assert_eq!(stats["stats"]["requests_finished"], 6);
    assert_eq!(stats["num_running"], 0);
}

#[test]
fn test_preemption_preserves_output() {
    let mut engine = single_model_engine(16, &kv_json(4, 4, 16), 64);
    let sink = OutputSink::new();
    engine.add_request(token_request("first", vec![1, 2, 3], greedy(10), &sink));
    engine.add_request(token_request("second", vec![20, 21, 22], greedy(10), &sink));

    let mut steps = 0;
    while engine.has_pending_work() {
        assert!(steps < 100, "engine did not drain");
        engine.step().unwrap();
        assert_consistent(&engine);
        steps += 1;
    }

    assert_eq!(sink.get("first").unwrap().output_token_ids, (4..=13).collect::<Vec<u32>>());
    assert_eq!(sink.get("second").unwrap().output_token_ids, (23..=32).collect::<Vec<u32>>());

    let stats: serde_json::Value = serde_json::from_str(&engine.stats()).unwrap();
    assert!(stats["stats"]["requests_preempted"].as_u64().unwrap() >= 1);
}

#[test]
fn test_rejected_requests_finish_immediately() {
    let mut engine = single_model_engine(8, &kv_json(4, 4, 16), 64);
    let sink = OutputSink::new();
    engine.add_request(token_request("empty", vec![], greedy(4), &sink));
    engine.add_request(token_request("long", (0..8).collect(), greedy(4), &sink));
    engine.add_request(token_request("bad", vec![1], greedy(4).with_top_p(0.0), &sink));

    assert_eq!(sink.len(), 3);
    for output in sink.outputs() {
        assert!(matches!(output.finish_reason, FinishReason::Error(_)), "{:?}", output);
    }
    assert!(!engine.has_pending_work());
}

#[test]
fn test_tokenization_failure_finishes_with_error() {
    let mut engine = EngineBuilder::new(16)
        .tokenizer(Box::new(CharTokenizer::rejecting('#')))
        .kv_cache_config_json(kv_json(4, 4, 64))
        .model(Box::new(MockModel::new(128)))
        .build()
        .unwrap();
    let sink = OutputSink::new();
    engine.add_request(Request::from_text("a#b", greedy(4), sink.callback()));

    assert_eq!(sink.len(), 1);
    assert!(matches!(sink.outputs()[0].finish_reason, FinishReason::Error(_)));
    assert_eq!(engine.num_waiting(), 0);
    assert!(!engine.has_pending_work());
}

#[test]
fn test_detokenization_failure_finishes_with_error() {
    // 0xD800 is a surrogate, which no char can hold
    let surrogate = 0xD800u32;
    let vocab_size = surrogate as usize + 1;
    let mut row = vec![0.0; vocab_size];
    row[surrogate as usize] = 1.0;
    let mut engine = EngineBuilder::new(16)
        .tokenizer(Box::new(CharTokenizer::new()))
        .kv_cache_config_json(kv_json(4, 4, 64))
        .model(Box::new(MockModel::new(vocab_size).with_distribution(fixed_distribution(row))))
        .build()
        .unwrap();
    let sink = OutputSink::new();
    engine.add_request(token_request("a", vec![1, 2], greedy(2), &sink));
    run_to_completion(&mut engine, 8);

    let output = sink.get("a").unwrap();
    assert!(matches!(output.finish_reason, FinishReason::Error(_)), "{:?}", output.finish_reason);
    assert_eq!(output.output_token_ids, vec![surrogate, surrogate]);
    assert!(output.text.is_empty());
}
