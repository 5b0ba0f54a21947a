//! Requests and their results
//!
//! A [`Request`] is one generation job: an id, the user input (raw text or
//! token ids), its [`GenerationConfig`] and a completion callback. The input
//! is tokenized exactly once, by the engine, when the request is added.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::engine::generation_config::GenerationConfig;
use crate::error::{EngineError, Result};
use crate::tokenizer::Tokenizer;

/// Global request id counter
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a process-unique request id
pub fn next_request_id() -> String {
    format!("req-{}", REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Callback receiving the final result of a request
pub type RequestCallback = Box<dyn FnOnce(RequestOutput) + Send>;

/// User-supplied input of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestInput {
    /// Raw text, tokenized when the request is added to the engine
    Text(String),
    /// Pre-tokenized input
    TokenIds(Vec<u32>),
}

/// Why a request stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// A stop token was produced
    Stop,
    /// `max_tokens` or the maximum sequence length was reached
    Length,
    /// The request was aborted
    Aborted,
    /// The request could not be served
    Error(String),
}

/// Final result delivered to a request's callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestOutput {
    /// Request identifier
    pub request_id: String,
    /// Generated token ids
    pub output_token_ids: Vec<u32>,
    /// Detokenized output
    pub text: String,
    /// Why generation ended
    pub finish_reason: FinishReason,
    /// Number of input tokens (0 if tokenization never succeeded)
    pub num_input_tokens: usize,
}

impl RequestOutput {
    /// Output for a request that failed before producing anything
    pub fn error(request_id: &str, error: &EngineError) -> Self {
        Self {
            request_id: request_id.to_string(),
            output_token_ids: Vec::new(),
            text: String::new(),
            finish_reason: FinishReason::Error(error.to_string()),
            num_input_tokens: 0,
        }
    }
}

/// A generation request
pub struct Request {
    /// Unique request identifier
    pub id: String,

    /// User input; always `TokenIds` once tokenized
    pub input: RequestInput,

    /// Sampling and stopping parameters
    pub generation_config: GenerationConfig,

    /// Length of the tokenized input, `None` until tokenized
    input_total_length: Option<usize>,

    /// Completion callback, taken when the request finishes
    callback: Option<RequestCallback>,
}

impl Request {
    /// Create a new request
    pub fn new<F>(
        id: impl Into<String>,
        input: RequestInput,
        generation_config: GenerationConfig,
        callback: F,
    ) -> Self
    where
        F: FnOnce(RequestOutput) + Send + 'static,
    {
        Self {
            id: id.into(),
            input,
            generation_config,
            input_total_length: None,
            callback: Some(Box::new(callback)),
        }
    }

    /// Create a text request with a generated id
    pub fn from_text<F>(text: impl Into<String>, generation_config: GenerationConfig, callback: F) -> Self
    where
        F: FnOnce(RequestOutput) + Send + 'static,
    {
        Self::new(next_request_id(), RequestInput::Text(text.into()), generation_config, callback)
    }

    /// Length of the tokenized input, if the request has been tokenized
    pub fn input_total_length(&self) -> Option<usize> {
        self.input_total_length
    }

    /// Whether the request has been tokenized
    pub fn is_tokenized(&self) -> bool {
        self.input_total_length.is_some()
    }

    /// Input token ids, available once tokenized
    pub fn input_token_ids(&self) -> Option<&[u32]> {
        match (&self.input, self.input_total_length) {
            (RequestInput::TokenIds(ids), Some(_)) => Some(ids),
            _ => None,
        }
    }

    /// Tokenize the input in place
    ///
    /// Tokenizing an already tokenized request is a no-op, so the tokenizer
    /// runs at most once per request.
    pub fn tokenize(&mut self, tokenizer: &dyn Tokenizer) -> Result<()> {
        if self.is_tokenized() {
            return Ok(());
        }

        let token_ids = match &self.input {
            RequestInput::Text(text) => tokenizer.encode(text)?,
            RequestInput::TokenIds(ids) => ids.clone(),
        };

        self.input_total_length = Some(token_ids.len());
        self.input = RequestInput::TokenIds(token_ids);
        Ok(())
    }

    /// Deliver the final output; the callback fires at most once
    pub fn finish(&mut self, output: RequestOutput) {
        match self.callback.take() {
            Some(callback) => callback(output),
            None => tracing::warn!("Request {} finished twice, dropping output", self.id),
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("input", &self.input)
            .field("generation_config", &self.generation_config)
            .field("input_total_length", &self.input_total_length)
            .finish()
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.input_total_length {
            Some(len) => write!(f, "Request(id={}, input_tokens={})", self.id, len),
            None => write!(f, "Request(id={}, untokenized)", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CharTokenizer;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_tokenize_text() {
        let mut request = Request::new(
            "a",
            RequestInput::Text("hello".to_string()),
            GenerationConfig::default(),
            |_| {},
        );
        assert!(!request.is_tokenized());
        assert!(request.input_token_ids().is_none());

        request.tokenize(&CharTokenizer::new()).unwrap();

        assert_eq!(request.input_total_length(), Some(5));
        assert_eq!(request.input_token_ids().unwrap()[0], 'h' as u32);
    }

    #[test]
    fn test_tokenize_runs_once() {
        let tokenizer = CharTokenizer::new();
        let mut request = Request::new(
            "a",
            RequestInput::Text("abc".to_string()),
            GenerationConfig::default(),
            |_| {},
        );
        request.tokenize(&tokenizer).unwrap();
        request.tokenize(&tokenizer).unwrap();

        assert_eq!(tokenizer.num_encode_calls(), 1);
        assert_eq!(request.input_total_length(), Some(3));
    }

    #[test]
    fn test_pretokenized_input() {
        let mut request = Request::new(
            "a",
            RequestInput::TokenIds(vec![1, 2, 3, 4]),
            GenerationConfig::default(),
            |_| {},
        );
        let tokenizer = CharTokenizer::new();
        request.tokenize(&tokenizer).unwrap();

        assert_eq!(tokenizer.num_encode_calls(), 0);
        assert_eq!(request.input_token_ids(), Some(&[1, 2, 3, 4][..]));
    }

    #[test]
    fn test_callback_fires_once() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let mut request = Request::new(
            "a",
            RequestInput::TokenIds(vec![1]),
            GenerationConfig::default(),
            move |output| sink.lock().unwrap().push(output),
        );

        let output = RequestOutput {
            request_id: "a".to_string(),
            output_token_ids: vec![7],
            text: String::new(),
            finish_reason: FinishReason::Stop,
            num_input_tokens: 1,
        };
        request.finish(output.clone());
        request.finish(output);

        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = next_request_id();
        let b = next_request_id();
        assert_ne!(a, b);
        assert!(a.starts_with("req-"));
    }
}
