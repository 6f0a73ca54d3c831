use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use synxio::{Component, ComponentContext, InitialState, StateMap, StateSlot};
use tracing::debug;

use super::chat_message::{ChatMessage, ChatMessagePayload};
use crate::generator::{initial_user_message, ChatTurn, ContentGenerator, Site};

pub const IS_LOADING: StateSlot<bool> = StateSlot::new("isLoading", || false);
pub const POST_CANDIDATES: StateSlot<Vec<String>> = StateSlot::new("postCandidates", Vec::new);
pub const APPROVED_POST: StateSlot<Option<String>> = StateSlot::new("approvedPost", || None);

/// Endpoint properties, as published in the component's `endpoints` map.
pub const MESSAGE_ENDPOINT: &str = "message";
pub const APPROVAL_ENDPOINT: &str = "approval";

/// List property the conversation is mounted under.
pub const CHAT_MESSAGES: &str = "ChatMessages";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Message,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalKind {
    Approval,
}

/// Body of a call to the `message` endpoint: feedback on the current draft.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInput {
    pub kind: MessageKind,
    pub content: String,
}

/// Body of a call to the `approval` endpoint: the post to publish.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalInput {
    pub kind: ApprovalKind,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostPayload {
    pub site: Site,
    pub key_points: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovedPost {
    pub site: Site,
    pub post: String,
}

enum Decision {
    Feedback(String),
    Approved(String),
}

/// Drafts a post for one site and revises it until an editor approves.
///
/// Each round opens a `message` and an `approval` endpoint keyed by the
/// conversation length. The first one called wins and the other is closed,
/// so exactly one of them is ever recorded per round.
#[derive(Clone)]
pub struct Post {
    generator: Arc<dyn ContentGenerator>,
}

impl Post {
    pub fn new(generator: Arc<dyn ContentGenerator>) -> Self {
        Self { generator }
    }

    async fn chat(
        &self,
        ctx: &ComponentContext,
        site: Site,
        messages: &mut Vec<ChatTurn>,
        user_message: String,
        force_tool: bool,
    ) -> anyhow::Result<()> {
        let payload = ChatMessagePayload {
            site,
            user_message,
            messages: messages.clone(),
            force_tool,
        };
        let reply = ctx
            .mount_list(
                CHAT_MESSAGES,
                format!("chat-message-{}", messages.len()),
                ChatMessage::new(self.generator.clone()),
                payload,
            )
            .await?
            .join()
            .await?;

        messages.extend(reply.messages);
        if let Some(post) = reply.post {
            ctx.update(&POST_CANDIDATES, |mut candidates| {
                candidates.push(post.content);
                candidates
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl Component for Post {
    const NAME: &'static str = "Post";
    type Payload = PostPayload;
    type Output = ApprovedPost;

    fn initial_state() -> StateMap {
        InitialState::new()
            .slot(&IS_LOADING)
            .slot(&POST_CANDIDATES)
            .slot(&APPROVED_POST)
            .build()
    }

    async fn run(&self, ctx: ComponentContext, payload: PostPayload) -> anyhow::Result<ApprovedPost> {
        let site = payload.site;

        ctx.set(&IS_LOADING, true)?;
        let initial = initial_user_message(site, &payload.key_points);
        let mut messages = vec![ChatTurn::user(initial.clone())];
        self.chat(&ctx, site, &mut messages, initial, true).await?;
        ctx.set(&IS_LOADING, false)?;

        loop {
            let round = messages.len();
            let message = ctx
                .endpoint::<MessageInput>(MESSAGE_ENDPOINT, &format!("message-{}", round))
                .await?;
            let approval = ctx
                .endpoint::<ApprovalInput>(APPROVAL_ENDPOINT, &format!("approval-{}", round))
                .await?;
            let message_id = message.id().to_string();
            let approval_id = approval.id().to_string();

            let decision = tokio::select! {
                biased;
                input = message.wait() => {
                    ctx.close_endpoint(&approval_id);
                    Decision::Feedback(input?.content)
                }
                input = approval.wait() => {
                    ctx.close_endpoint(&message_id);
                    Decision::Approved(input?.content)
                }
            };

            match decision {
                Decision::Approved(post) => {
                    debug!(component_id = %ctx.id(), %site, "post approved");
                    ctx.set(&APPROVED_POST, Some(post.clone()))?;
                    return Ok(ApprovedPost { site, post });
                }
                Decision::Feedback(feedback) => {
                    debug!(component_id = %ctx.id(), %site, round, "post feedback received");
                    messages.push(ChatTurn::user(feedback.clone()));
                    self.chat(&ctx, site, &mut messages, feedback, false).await?;
                }
            }
        }
    }
}
