//! Shared test utilities for agent tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use toolwright_core::error::ProviderError;
use toolwright_core::provider::{
    ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolCallDelta,
};

/// One scripted provider reply.
pub(crate) enum Reply {
    /// Stream these chunks, then close.
    Chunks(Vec<StreamChunk>),
    /// Fail before streaming anything.
    Fail(ProviderError),
    /// Stream these chunks, then fail.
    FailMidStream(Vec<StreamChunk>, ProviderError),
    /// Stream these chunks, then stay open until the receiver goes away.
    Hang(Vec<StreamChunk>),
}

/// A final text answer in one chunk.
pub(crate) fn text(content: &str) -> Reply {
    Reply::Chunks(vec![StreamChunk {
        content: Some(content.to_string()),
        finish_reason: Some("stop".into()),
        done: true,
        ..Default::default()
    }])
}

/// A single native tool call, with the arguments split across two chunks.
pub(crate) fn tool_call(id: &str, name: &str, arguments: &str) -> Reply {
    let split = arguments.len() / 2;
    let split = (0..=split)
        .rev()
        .find(|i| arguments.is_char_boundary(*i))
        .unwrap_or(0);
    let (head, tail) = arguments.split_at(split);
    Reply::Chunks(vec![
        StreamChunk {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                id: Some(id.to_string()),
                name: Some(name.to_string()),
                arguments: Some(head.to_string()),
            }],
            ..Default::default()
        },
        StreamChunk {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                arguments: Some(tail.to_string()),
                ..Default::default()
            }],
            finish_reason: Some("tool_calls".into()),
            done: true,
            ..Default::default()
        },
    ])
}

/// Several native tool calls in one chunk.
pub(crate) fn tool_calls(calls: &[(&str, &str, &str)]) -> Reply {
    Reply::Chunks(vec![StreamChunk {
        tool_calls: calls
            .iter()
            .enumerate()
            .map(|(i, (id, name, arguments))| ToolCallDelta {
                index: i as u32,
                id: Some(id.to_string()),
                name: Some(name.to_string()),
                arguments: Some(arguments.to_string()),
            })
            .collect(),
        finish_reason: Some("tool_calls".into()),
        done: true,
        ..Default::default()
    }])
}

/// Replays scripted replies in order and records every request.
pub(crate) struct ScriptedProvider {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub(crate) fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::NotConfigured("scripted provider only streams".into()))
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| text("(script exhausted)"));

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let (chunks, failure, hang) = match reply {
            Reply::Fail(err) => return Err(err),
            Reply::Chunks(chunks) => (chunks, None, false),
            Reply::FailMidStream(chunks, err) => (chunks, Some(err), false),
            Reply::Hang(chunks) => (chunks, None, true),
        };
        // Sent from a task so scripts longer than the channel never block.
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            if let Some(err) = failure {
                let _ = tx.send(Err(err)).await;
            }
            if hang {
                tx.closed().await;
            }
        });
        Ok(rx)
    }
}
