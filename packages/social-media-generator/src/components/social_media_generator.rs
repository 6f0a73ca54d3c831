use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use synxio::{Component, ComponentContext, InitialState, StateMap, StateSlot};

use super::key_points::{KeyPoints, KeyPointsPayload};
use super::post::{ApprovedPost, Post, PostPayload};
use crate::generator::{ContentGenerator, Site};

pub const KEY_POINTS: StateSlot<Vec<String>> = StateSlot::new("keyPoints", Vec::new);
pub const ARTICLE: StateSlot<Option<String>> = StateSlot::new("article", || None);

/// Which sites to write for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorPayload {
    pub article: String,
    #[serde(default)]
    pub twitter: bool,
    #[serde(default)]
    pub facebook: bool,
    #[serde(default)]
    pub instagram: bool,
}

impl GeneratorPayload {
    /// Requested sites with the property their post is mounted under.
    pub fn sites(&self) -> Vec<(&'static str, Site)> {
        [
            (self.twitter, "TwitterPost", Site::Twitter),
            (self.facebook, "FacebookPost", Site::Facebook),
            (self.instagram, "InstagramPost", Site::Instagram),
        ]
        .into_iter()
        .filter(|(enabled, _, _)| *enabled)
        .map(|(_, property, site)| (property, site))
        .collect()
    }
}

/// Root component: extracts key points from the article, then runs one
/// post conversation per requested site and waits for all approvals.
#[derive(Clone)]
pub struct SocialMediaGenerator {
    generator: Arc<dyn ContentGenerator>,
}

impl SocialMediaGenerator {
    pub fn new(generator: Arc<dyn ContentGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Component for SocialMediaGenerator {
    const NAME: &'static str = "SocialMediaGenerator";
    type Payload = GeneratorPayload;
    type Output = Vec<ApprovedPost>;

    fn initial_state() -> StateMap {
        InitialState::new().slot(&KEY_POINTS).slot(&ARTICLE).build()
    }

    async fn run(&self, ctx: ComponentContext, payload: GeneratorPayload) -> anyhow::Result<Vec<ApprovedPost>> {
        ctx.set(&ARTICLE, Some(payload.article.clone()))?;

        let key_points = ctx
            .mount(
                KeyPoints::NAME,
                KeyPoints::new(self.generator.clone()),
                KeyPointsPayload {
                    article: payload.article.clone(),
                },
            )
            .await?
            .join()
            .await?;

        if key_points.is_empty() {
            return Ok(Vec::new());
        }
        ctx.set(&KEY_POINTS, key_points.clone())?;

        let mut posts = Vec::new();
        for (property, site) in payload.sites() {
            let handle = ctx
                .mount(
                    property,
                    Post::new(self.generator.clone()),
                    PostPayload {
                        site,
                        key_points: key_points.clone(),
                    },
                )
                .await?;
            posts.push(handle);
        }

        let approved = futures::future::try_join_all(posts.into_iter().map(|post| post.join())).await?;
        Ok(approved)
    }
}
