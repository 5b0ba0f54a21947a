//! Background driver for multi-threaded hosts
//!
//! [`ThreadedEngine`] moves an [`Engine`] onto a blocking tokio task and
//! serialises every call into it through one command channel. The task
//! applies all pending commands, steps while there is work, and sleeps on
//! the channel when idle.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::engine::generation_config::GenerationConfig;
use crate::engine::llm_engine::Engine;
use crate::engine::request::{next_request_id, Request, RequestInput, RequestOutput};
use crate::error::{EngineError, Result};

enum Command {
    AddRequest(Request),
    AbortRequest(String),
    Reset(oneshot::Sender<Result<()>>),
    Shutdown,
}

/// Handle to an engine running on a background task
pub struct ThreadedEngine {
    commands: mpsc::UnboundedSender<Command>,
    stats: Arc<Mutex<String>>,
    task: JoinHandle<Result<()>>,
}

impl ThreadedEngine {
    /// Start driving `engine` in the background
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(engine: Engine) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let stats = Arc::new(Mutex::new(engine.stats()));
        let task = {
            let stats = Arc::clone(&stats);
            tokio::task::spawn_blocking(move || run_loop(engine, receiver, stats))
        };
        tracing::info!("Threaded engine started");
        Self { commands, stats, task }
    }

    pub fn add_request(&self, request: Request) -> Result<()> {
        self.send(Command::AddRequest(request))
    }

    pub fn abort_request(&self, request_id: impl Into<String>) -> Result<()> {
        self.send(Command::AbortRequest(request_id.into()))
    }

    /// Submit a request and get a receiver for its output
    pub fn generate(
        &self,
        input: RequestInput,
        generation_config: GenerationConfig,
    ) -> Result<(String, oneshot::Receiver<RequestOutput>)> {
        let (tx, rx) = oneshot::channel();
        let request_id = next_request_id();
        let request = Request::new(request_id.clone(), input, generation_config, move |output| {
            // The caller may have dropped the receiver
            let _ = tx.send(output);
        });
        self.add_request(request)?;
        Ok((request_id, rx))
    }

    /// Submit raw text and wait for the finished output
    pub async fn generate_text(
        &self,
        text: impl Into<String>,
        generation_config: GenerationConfig,
    ) -> Result<RequestOutput> {
        let (_, rx) = self.generate(RequestInput::Text(text.into()), generation_config)?;
        rx.await.map_err(|_| EngineError::Shutdown)
    }

    /// Reset the engine and wait until it is done
    pub async fn reset(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Reset(tx))?;
        rx.await.map_err(|_| EngineError::Shutdown)?
    }

    /// Statistics as of the most recent step
    pub fn stats(&self) -> String {
        self.stats.lock().clone()
    }

    /// Stop the loop and wait for it; pending requests are dropped
    pub async fn shutdown(self) -> Result<()> {
        // The loop may already have exited on an error
        let _ = self.commands.send(Command::Shutdown);
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::Model(format!("engine task failed: {}", e))),
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| EngineError::Shutdown)
    }
}

fn run_loop(
    mut engine: Engine,
    mut commands: mpsc::UnboundedReceiver<Command>,
    stats: Arc<Mutex<String>>,
) -> Result<()> {
    loop {
        // Block only when there is nothing to step
        if !engine.has_pending_work() {
            match commands.blocking_recv() {
                Some(command) => {
                    if !apply(&mut engine, command) {
                        break;
                    }
                }
                None => break,
            }
        }

        let mut open = true;
        while let Ok(command) = commands.try_recv() {
            if !apply(&mut engine, command) {
                open = false;
                break;
            }
        }
        if !open {
            break;
        }

        if engine.has_pending_work() {
            if let Err(e) = engine.step() {
                tracing::error!("Engine step failed: {}", e);
                *stats.lock() = engine.stats();
                return Err(e);
            }
            *stats.lock() = engine.stats();
        }
    }

    tracing::info!("Threaded engine stopped");
    Ok(())
}

/// Apply one command; returns false on shutdown
fn apply(engine: &mut Engine, command: Command) -> bool {
    match command {
        Command::AddRequest(request) => engine.add_request(request),
        Command::AbortRequest(request_id) => engine.abort_request(&request_id),
        Command::Reset(reply) => {
            let _ = reply.send(engine.reset());
        }
        Command::Shutdown => return false,
    }
    true
}
