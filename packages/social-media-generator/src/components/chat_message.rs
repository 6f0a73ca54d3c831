use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use synxio::{Component, ComponentContext, EventEmitter, InitialState, StateMap, StateSlot};

use crate::generator::{ChatTurn, ContentGenerator, PostRequest, PostStreamPart, Site, SocialMediaPost};

pub const USER_MESSAGE: StateSlot<Option<String>> = StateSlot::new("userMessage", || None);
pub const ASSISTANT_MESSAGE: StateSlot<Option<String>> = StateSlot::new("assistantMessage", || None);
pub const POST: StateSlot<Option<SocialMediaPost>> = StateSlot::new("post", || None);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    pub site: Site,
    pub user_message: String,
    /// Conversation so far, ending with `user_message`.
    pub messages: Vec<ChatTurn>,
    #[serde(default)]
    pub force_tool: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatReply {
    /// Turns the reply adds to the conversation.
    pub messages: Vec<ChatTurn>,
    /// The drafted post, if the reply contained one.
    pub post: Option<SocialMediaPost>,
}

/// One exchange of the post conversation.
///
/// The generator's output is recorded as an event stream: text deltas grow
/// `assistantMessage` and a tool call sets `post`, both live and when the
/// recorded events are replayed.
#[derive(Clone)]
pub struct ChatMessage {
    generator: Arc<dyn ContentGenerator>,
}

impl ChatMessage {
    pub fn new(generator: Arc<dyn ContentGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Component for ChatMessage {
    const NAME: &'static str = "ChatMessage";
    type Payload = ChatMessagePayload;
    type Output = ChatReply;

    fn initial_state() -> StateMap {
        InitialState::new()
            .slot(&USER_MESSAGE)
            .slot(&ASSISTANT_MESSAGE)
            .slot(&POST)
            .build()
    }

    async fn run(&self, ctx: ComponentContext, payload: ChatMessagePayload) -> anyhow::Result<ChatReply> {
        ctx.set(&USER_MESSAGE, Some(payload.user_message.clone()))?;

        let generator = self.generator.clone();
        let request = PostRequest {
            site: payload.site,
            messages: payload.messages,
            force_tool: payload.force_tool,
        };

        let mut reply = ctx
            .io_with_events("chat-message", move |emitter: EventEmitter<PostStreamPart>| async move {
                let mut parts = generator.post(&request);
                let mut text = String::new();
                let mut post = None;

                while let Some(part) = parts.next().await {
                    let part = part?;
                    match &part {
                        PostStreamPart::TextDelta { text_delta } => text.push_str(text_delta),
                        PostStreamPart::ToolCall { args } => post = Some(args.content.clone()),
                    }
                    emitter.emit(part)?;
                }

                let mut turns = Vec::new();
                if !text.is_empty() {
                    turns.push(ChatTurn::assistant(text));
                }
                if let Some(content) = post {
                    turns.push(ChatTurn::assistant(content));
                }
                Ok(turns)
            })
            .await?;

        while let Some(part) = reply.next().await {
            match part {
                PostStreamPart::TextDelta { text_delta } => {
                    ctx.update(&ASSISTANT_MESSAGE, |current| {
                        Some(current.unwrap_or_default() + &text_delta)
                    })?;
                }
                PostStreamPart::ToolCall { args } => ctx.set(&POST, Some(args))?,
            }
        }

        let messages = reply.outcome().await?;
        Ok(ChatReply {
            messages,
            post: ctx.get(&POST)?,
        })
    }
}
