//! Canned model responses, streamed in fixed-size chunks.

use crate::llm::{ChatMessage, ModelClient, TextStream};
use anyhow::{anyhow, Context, Result};
use async_stream::try_stream;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// One scripted response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    /// Streams the text, then fails with the message
    Interrupted(String, String),
    /// The request itself fails
    Refused(String),
}

impl From<&str> for Reply {
    fn from(text: &str) -> Self {
        Reply::Text(text.to_string())
    }
}

impl From<String> for Reply {
    fn from(text: String) -> Self {
        Reply::Text(text)
    }
}

/// Replays responses in order. Once exhausted every request gets an empty
/// response.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Reply>>,
    chunk_chars: usize,
    delay: Option<Duration>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn new<I, R>(replies: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Reply>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            chunk_chars: 16,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// One reply per file, in the given order
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut replies = Vec::new();
        for path in paths {
            let path = path.as_ref();
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read response file {}", path.display()))?;
            replies.push(Reply::Text(text));
        }
        Ok(Self::new(replies))
    }

    pub fn with_chunk_chars(mut self, n: usize) -> Self {
        self.chunk_chars = n.max(1);
        self
    }

    /// Pause between chunks, to exercise cancellation mid-stream
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every conversation this model was asked to continue
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().map(|r| r.len()).unwrap_or(0)
    }
}

fn chunks(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<TextStream> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }
        let reply = self
            .replies
            .lock()
            .map_err(|_| anyhow!("scripted model lock poisoned"))?
            .pop_front()
            .unwrap_or_else(|| Reply::Text(String::new()));

        let (text, failure) = match reply {
            Reply::Text(text) => (text, None),
            Reply::Interrupted(text, error) => (text, Some(error)),
            Reply::Refused(error) => return Err(anyhow!(error)),
        };

        let pieces = chunks(&text, self.chunk_chars);
        let delay = self.delay;
        let stream = try_stream! {
            for piece in pieces {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                yield piece;
            }
            if let Some(error) = failure {
                Err(anyhow!(error))?;
            }
        };
        Ok(Box::pin(stream))
    }
}
