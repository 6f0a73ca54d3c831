//! Component tree of the generator.
//!
//! ```text
//! SocialMediaGenerator
//! ├── KeyPoints                      (io "key-points")
//! ├── TwitterPost   : Post ─┐
//! ├── FacebookPost  : Post  ├── ChatMessages[chat-message-{n}] : ChatMessage
//! └── InstagramPost : Post ─┘        (io "chat-message", event stream)
//! ```

mod chat_message;
mod key_points;
mod post;
mod social_media_generator;

pub use chat_message::{ChatMessage, ChatMessagePayload, ChatReply};
pub use key_points::{KeyPoints, KeyPointsPayload};
pub use post::{
    ApprovalInput, ApprovalKind, ApprovedPost, MessageInput, MessageKind, Post, PostPayload,
    APPROVAL_ENDPOINT, CHAT_MESSAGES, MESSAGE_ENDPOINT,
};
pub use social_media_generator::{GeneratorPayload, SocialMediaGenerator};
