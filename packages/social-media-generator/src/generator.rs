//! Content generation behind the components.
//!
//! The components only see [`ContentGenerator`]. A model-backed
//! implementation streams key points and post drafts from an LLM;
//! [`ScriptedGenerator`] derives them from the input text so the workflow
//! runs offline and deterministically.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

/// Platform a post is written for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Site {
    Twitter,
    Facebook,
    Instagram,
}

impl Site {
    pub fn as_str(&self) -> &'static str {
        match self {
            Site::Twitter => "twitter",
            Site::Facebook => "facebook",
            Site::Instagram => "instagram",
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One message of a post conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A drafted post, as returned by the post tool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialMediaPost {
    /// Why the post is written the way it is.
    pub reasoning: String,
    pub content: String,
}

/// Streamed output of a post generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PostStreamPart {
    TextDelta {
        #[serde(rename = "textDelta")]
        text_delta: String,
    },
    ToolCall {
        args: SocialMediaPost,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRequest {
    pub site: Site,
    pub messages: Vec<ChatTurn>,
    /// Require a drafted post in the reply instead of letting the
    /// generator only answer in text.
    pub force_tool: bool,
}

pub fn system_prompt(site: Site) -> String {
    format!(
        "You are a helpful social media post generator. Your task is to generate a social media \
         post for the given key points. The post should be compelling and engaging, and should \
         follow the platform's guidelines and best practices.\n\nYou will be writing the post for {}",
        site
    )
}

pub fn initial_user_message(site: Site, key_points: &[String]) -> String {
    let points: Vec<String> = key_points.iter().map(|point| format!("- {}", point)).collect();
    format!(
        "Write a {} post for the following key points:\n\n{}",
        site,
        points.join("\n")
    )
}

/// Source of key points and post drafts.
pub trait ContentGenerator: Send + Sync + 'static {
    /// Key points of `article`, one item per point.
    fn key_points(&self, article: &str) -> BoxStream<'static, anyhow::Result<String>>;

    /// Reply to the conversation in `request`.
    fn post(&self, request: &PostRequest) -> BoxStream<'static, anyhow::Result<PostStreamPart>>;
}

/// Offline generator that builds its output from the input text.
///
/// Key points are the article's sentences. A draft lists the key points
/// and appends the latest user feedback, if any. Calls are counted so tests
/// can check that a resumed run does not generate again.
#[derive(Clone, Debug, Default)]
pub struct ScriptedGenerator {
    key_point_calls: Arc<AtomicUsize>,
    post_calls: Arc<AtomicUsize>,
}

const MAX_KEY_POINTS: usize = 5;

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_point_calls(&self) -> usize {
        self.key_point_calls.load(Ordering::SeqCst)
    }

    pub fn post_calls(&self) -> usize {
        self.post_calls.load(Ordering::SeqCst)
    }

    fn draft(request: &PostRequest) -> SocialMediaPost {
        let key_points: Vec<&str> = request
            .messages
            .first()
            .map(|turn| {
                turn.content
                    .lines()
                    .filter_map(|line| line.strip_prefix("- "))
                    .collect()
            })
            .unwrap_or_default();
        let feedback: Vec<&str> = request
            .messages
            .iter()
            .skip(1)
            .filter(|turn| turn.role == ChatRole::User)
            .map(|turn| turn.content.as_str())
            .collect();

        let mut content = format!("{} #{}", key_points.join(" "), request.site);
        let reasoning = match feedback.last() {
            Some(latest) => {
                content.push_str(&format!(" ({})", latest));
                format!("Revision {} applying: {}", feedback.len(), latest)
            }
            None => format!("First draft for {}", request.site),
        };
        SocialMediaPost { reasoning, content }
    }
}

impl ContentGenerator for ScriptedGenerator {
    fn key_points(&self, article: &str) -> BoxStream<'static, anyhow::Result<String>> {
        self.key_point_calls.fetch_add(1, Ordering::SeqCst);
        let points: Vec<anyhow::Result<String>> = article
            .split(['.', '!', '?'])
            .map(str::trim)
            .filter(|sentence| !sentence.is_empty())
            .take(MAX_KEY_POINTS)
            .map(|sentence| Ok(sentence.to_string()))
            .collect();
        stream::iter(points).boxed()
    }

    fn post(&self, request: &PostRequest) -> BoxStream<'static, anyhow::Result<PostStreamPart>> {
        self.post_calls.fetch_add(1, Ordering::SeqCst);
        let post = Self::draft(request);

        let mut parts: Vec<anyhow::Result<PostStreamPart>> = format!("Here is a {} draft.", request.site)
            .split_inclusive(' ')
            .map(|word| {
                Ok(PostStreamPart::TextDelta {
                    text_delta: word.to_string(),
                })
            })
            .collect();
        parts.push(Ok(PostStreamPart::ToolCall { args: post }));
        stream::iter(parts).boxed()
    }
}
