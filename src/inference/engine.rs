//! Inference worker
//!
//! # Architecture
//!
//! llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) contain raw
//! pointers that are not `Send`, so the generation engine lives on a dedicated
//! worker thread that builds and owns it. HTTP handlers talk to the worker
//! through a command channel. The worker handles one command at a time, which
//! makes it the single slot: requests queue up and never touch the model session
//! concurrently.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tokio::sync::{mpsc as async_mpsc, oneshot};

use crate::inference::backend::{ModelSession, SamplingPolicy, TokenCodec};
use crate::inference::error::{EngineError, GenerationError};
use crate::inference::generation::{Completion, GenerationEngine};
use crate::inference::streaming::{StreamToken, TokenSink};

/// Model information reported once the worker is ready
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    /// Path to the loaded model
    pub path: String,
    /// Context window of the session, in tokens
    pub context_size: u32,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Training context length
    pub training_context: u32,
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Generate {
        prompt: String,
        stream: Option<async_mpsc::UnboundedSender<StreamToken>>,
        reply: oneshot::Sender<Result<Completion, GenerationError>>,
    },
    Shutdown,
}

/// Worker-side end of the command channel, handed to the init closure of
/// [`EngineHandle::spawn`].
pub struct WorkerPort {
    commands: Receiver<WorkerCommand>,
    ready: Sender<Result<ModelInfo, EngineError>>,
}

impl WorkerPort {
    /// Report that the engine could not be built. The worker exits afterwards.
    pub fn fail(self, error: EngineError) {
        tracing::error!("Inference worker failed to start: {error}");
        let _ = self.ready.send(Err(error));
    }

    /// Announce readiness and process commands until shutdown.
    pub fn serve<C, S, P>(self, mut engine: GenerationEngine<C, S, P>, info: ModelInfo)
    where
        C: TokenCodec,
        S: ModelSession,
        P: SamplingPolicy<S>,
    {
        tracing::info!(
            "Inference worker ready: {} ({} ctx)",
            info.path,
            info.context_size
        );
        if self.ready.send(Ok(info)).is_err() {
            return;
        }

        loop {
            match self.commands.recv() {
                Ok(WorkerCommand::Generate {
                    prompt,
                    stream,
                    reply,
                }) => {
                    let result = match stream {
                        Some(mut tx) => {
                            engine.handle_request(&prompt, Some(&mut tx as &mut dyn TokenSink))
                        }
                        None => engine.handle_request(&prompt, None),
                    };
                    let _ = reply.send(result);
                }
                Ok(WorkerCommand::Shutdown) => {
                    tracing::info!("Worker thread shutting down");
                    break;
                }
                Err(_) => {
                    tracing::debug!("Command channel closed, worker exiting");
                    break;
                }
            }
        }
    }
}

/// Handle to the inference worker
///
/// Cheap to share behind an `Arc`; dropping the last handle stops the worker.
pub struct EngineHandle {
    /// Channel to send commands to the worker thread
    command_tx: Sender<WorkerCommand>,
    /// Handle to the worker thread
    worker_handle: Mutex<Option<JoinHandle<()>>>,
    model_info: ModelInfo,
}

impl EngineHandle {
    /// Spawn the worker thread and wait until it is ready.
    ///
    /// `init` runs on the worker thread. It must build the engine there and
    /// finish with either [`WorkerPort::serve`] or [`WorkerPort::fail`].
    pub fn spawn<F>(init: F) -> Result<Self, EngineError>
    where
        F: FnOnce(WorkerPort) + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();

        let port = WorkerPort {
            commands: command_rx,
            ready: ready_tx,
        };
        let handle = thread::Builder::new()
            .name("inference-worker".to_string())
            .spawn(move || init(port))
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let model_info = match ready_rx.recv() {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(EngineError::WorkerError(
                    "worker exited before becoming ready".to_string(),
                ));
            }
        };

        tracing::info!("Inference worker thread started");
        Ok(Self {
            command_tx,
            worker_handle: Mutex::new(Some(handle)),
            model_info,
        })
    }

    pub fn model_info(&self) -> &ModelInfo {
        &self.model_info
    }

    /// Generate a full response
    pub async fn generate(&self, prompt: &str) -> Result<Completion, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(WorkerCommand::Generate {
            prompt: prompt.to_string(),
            stream: None,
            reply: reply_tx,
        })?;

        let result = reply_rx
            .await
            .map_err(|_| EngineError::WorkerError("worker dropped the request".to_string()))?;
        Ok(result?)
    }

    /// Generate with streaming output
    ///
    /// The receiver yields fragments in generation order and ends with exactly
    /// one `Done` or `Error`.
    pub fn generate_stream(
        &self,
        prompt: &str,
    ) -> Result<async_mpsc::UnboundedReceiver<StreamToken>, EngineError> {
        let (token_tx, token_rx) = async_mpsc::unbounded_channel();
        // Streaming clients read the outcome from the stream itself.
        let (reply_tx, _reply_rx) = oneshot::channel();
        self.send(WorkerCommand::Generate {
            prompt: prompt.to_string(),
            stream: Some(token_tx),
            reply: reply_tx,
        })?;
        Ok(token_rx)
    }

    fn send(&self, command: WorkerCommand) -> Result<(), EngineError> {
        self.command_tx
            .send(command)
            .map_err(|e| EngineError::WorkerError(e.to_string()))
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
        let handle = self
            .worker_handle
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        // Wait for worker thread to finish
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::error::ErrorKind;
    use crate::inference::mock;
    use crate::system::metrics;

    #[tokio::test]
    async fn test_generate_through_worker() {
        let metrics = mock::metrics();
        let handle = mock::spawn(512, &["Hello back"], metrics.clone()).unwrap();
        assert_eq!(handle.model_info().context_size, 512);

        let completion = handle.generate("Hello").await.unwrap();
        assert_eq!(completion.text, "Hello back");
        assert_eq!(metrics::read(&metrics).snapshot().total_requests, 1);
    }

    #[tokio::test]
    async fn test_stream_through_worker() {
        let handle = mock::spawn(512, &["abc"], mock::metrics()).unwrap();
        let mut rx = handle.generate_stream("Hello").unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                StreamToken::Token("a".to_string()),
                StreamToken::Token("b".to_string()),
                StreamToken::Token("c".to_string()),
                StreamToken::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_requests_are_serialized() {
        // The scripted sampler hands out replies in processing order, so any
        // overlap inside the session would mix their tokens.
        let replies = [
            "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel",
        ];
        let metrics = mock::metrics();
        let handle = std::sync::Arc::new(mock::spawn(4096, &replies, metrics.clone()).unwrap());
        let tasks: Vec<_> = (0..replies.len())
            .map(|i| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.generate(&format!("q{i}")).await })
            })
            .collect();

        let mut texts = Vec::new();
        let mut bos_prompts = 0;
        for task in tasks {
            let completion = task.await.unwrap().unwrap();
            assert_eq!(completion.generated_tokens as usize, completion.text.len());
            // Only the first request processed sees an empty session.
            let delta = "<|user|>q0\n<|assistant|>".len() as u32;
            if completion.prompt_tokens == delta + 1 {
                bos_prompts += 1;
            } else {
                assert_eq!(completion.prompt_tokens, delta);
            }
            texts.push(completion.text);
        }
        texts.sort();
        assert_eq!(texts, replies.to_vec());
        assert_eq!(bos_prompts, 1);

        let snap = metrics::read(&metrics).snapshot();
        assert_eq!(snap.total_requests, 8);
        assert_eq!(snap.failed_requests, 0);
        assert_eq!(snap.total_decode_calls, snap.total_generated_tokens);
        let reply_bytes: usize = replies.iter().map(|r| r.len()).sum();
        assert_eq!(snap.total_generated_tokens, reply_bytes as u64);
    }

    #[tokio::test]
    async fn test_generation_error_is_returned() {
        let handle = mock::spawn(8, &["x"], mock::metrics()).unwrap();
        match handle.generate("Hello").await {
            Err(EngineError::Generation(e)) => assert_eq!(e.kind, ErrorKind::ContextExceeded),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_failed_init_is_reported() {
        let result = EngineHandle::spawn(|port| {
            port.fail(EngineError::ModelLoad("missing.gguf".to_string()))
        });
        assert!(matches!(result, Err(EngineError::ModelLoad(_))));
    }
}
