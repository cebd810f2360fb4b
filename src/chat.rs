use anyhow::Result;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::api::Backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Streams a completion for `messages`, writing each fragment to `out` as soon as it
/// arrives, and returns the whole reply once the stream ends.
///
/// The first error from either setting up the stream or reading from it is returned
/// as-is; whatever was accumulated up to that point is dropped.
pub async fn stream_reply<B, W>(
    backend: &B,
    messages: &[Message],
    out: &mut W,
) -> Result<String>
where
    B: Backend + ?Sized,
    W: Write,
{
    let mut stream = backend.chat_stream(messages).await?;

    write!(out, "GPT: ")?;
    out.flush()?;

    let mut reply = String::new();
    while let Some(fragment) = stream.next().await {
        let fragment = fragment?;
        write!(out, "{}", fragment)?;
        out.flush()?;
        reply.push_str(&fragment);
    }
    tracing::debug!(chars = reply.len(), "chat stream finished");

    Ok(reply)
}
