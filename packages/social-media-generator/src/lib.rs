//! # Social Media Generator
//!
//! Reference application for synxio. An editor submits an article; the
//! app extracts key points, drafts a post per requested site, and revises
//! each draft through a chat until the editor approves it.
//!
//! Every model call is a durable operation and every editor action is an
//! endpoint, so a restarted process resumes each conversation where it
//! stopped without generating anything twice.

pub mod authz;
pub mod components;
pub mod generator;

use std::sync::Arc;

use synxio::{App, AppBuilder};

pub use authz::{EditorRole, SiteAuthorizer};
pub use components::{GeneratorPayload, SocialMediaGenerator};
pub use generator::{ContentGenerator, ScriptedGenerator, Site};

/// App builder for the generator with site-based authorization.
pub fn app(generator: Arc<dyn ContentGenerator>) -> AppBuilder<SocialMediaGenerator, SiteAuthorizer> {
    App::builder(SocialMediaGenerator::new(generator)).authorizer(SiteAuthorizer)
}
