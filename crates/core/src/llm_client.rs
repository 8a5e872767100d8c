use anyhow::Result;
use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;

/// Gemini's OpenAI-compatible endpoint.
pub const GEMINI_OPENAI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

/// Represents the events that can be yielded from a streaming text response.
#[derive(Debug, Clone)]
pub enum LLMStreamEvent {
    TextChunk(String),
}

/// A stream of text chunks from the LLM.
pub type LLMStream = Pin<Box<dyn Stream<Item = Result<LLMStreamEvent, OpenAIError>> + Send>>;

/// One entry of the conversation sent to the LLM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTurn {
    System(String),
    User(String),
    Assistant(String),
}

impl ChatTurn {
    fn into_request_message(self) -> Result<ChatCompletionRequestMessage> {
        Ok(match self {
            ChatTurn::System(content) => ChatCompletionRequestSystemMessageArgs::default()
                .content(content)
                .build()?
                .into(),
            ChatTurn::User(content) => ChatCompletionRequestUserMessageArgs::default()
                .content(content)
                .build()?
                .into(),
            ChatTurn::Assistant(content) => ChatCompletionRequestAssistantMessageArgs::default()
                .content(content)
                .build()?
                .into(),
        })
    }
}

/// A generic client for interacting with an LLM.
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Makes a streaming call to the LLM for the next assistant reply.
    async fn stream_reply(&self, conversation: Vec<ChatTurn>) -> Result<LLMStream>;
}

/// Drains a reply stream into the full reply text.
pub async fn collect_reply(mut stream: LLMStream) -> Result<String> {
    let mut reply = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            LLMStreamEvent::TextChunk(chunk) => reply.push_str(&chunk),
        }
    }
    Ok(reply)
}

/// An implementation of `LLMClient` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The specific model identifier to use for chat completions (e.g., "gemini-2.5-flash").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }

    /// Shorthand for a client pointed at `api_base` with `api_key`.
    pub fn with_key(api_base: &str, api_key: &str, model: String) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(api_base);
        Self::new(config, model)
    }
}

#[async_trait]
impl LLMClient for OpenAICompatibleClient {
    async fn stream_reply(&self, conversation: Vec<ChatTurn>) -> Result<LLMStream> {
        let messages = conversation
            .into_iter()
            .map(ChatTurn::into_request_message)
            .collect::<Result<Vec<_>>>()?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .stream(true)
            .build()?;

        let stream = self.client.chat().create_stream(request).await?;

        Ok(Box::pin(stream.filter_map(|result| async {
            match result {
                Ok(response) => {
                    let content = response.choices.first()?.delta.content.as_ref()?;
                    if content.is_empty() {
                        None
                    } else {
                        Some(Ok(LLMStreamEvent::TextChunk(content.clone())))
                    }
                }
                Err(e) => Some(Err(e)),
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&str]) -> LLMStream {
        let events: Vec<Result<LLMStreamEvent, OpenAIError>> = parts
            .iter()
            .map(|p| Ok(LLMStreamEvent::TextChunk(p.to_string())))
            .collect();
        Box::pin(futures::stream::iter(events))
    }

    #[tokio::test]
    async fn test_collect_reply_concatenates_chunks() {
        let reply = collect_reply(chunks(&["Hello", ", ", "world"])).await.unwrap();
        assert_eq!(reply, "Hello, world");
    }

    #[tokio::test]
    async fn test_collect_reply_propagates_errors() {
        let events: Vec<Result<LLMStreamEvent, OpenAIError>> = vec![
            Ok(LLMStreamEvent::TextChunk("partial".into())),
            Err(OpenAIError::InvalidArgument("boom".into())),
        ];
        let result = collect_reply(Box::pin(futures::stream::iter(events))).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_chat_turns_convert() {
        let turns = vec![
            ChatTurn::System("be brief".into()),
            ChatTurn::User("hi".into()),
            ChatTurn::Assistant("hello".into()),
        ];
        let messages = turns
            .into_iter()
            .map(ChatTurn::into_request_message)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert!(matches!(messages[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(messages[1], ChatCompletionRequestMessage::User(_)));
        assert!(matches!(messages[2], ChatCompletionRequestMessage::Assistant(_)));
    }
}
