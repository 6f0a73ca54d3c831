use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use synxio::{Component, ComponentContext, InitialState, StateMap, StateSlot};

use crate::generator::ContentGenerator;

pub const KEY_POINTS: StateSlot<Vec<String>> = StateSlot::new("keyPoints", Vec::new);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPointsPayload {
    pub article: String,
}

/// Extracts the key points of an article.
///
/// Points are published one by one while the generator streams them. The
/// finished list is recorded once, so a resumed run gets it back without
/// generating again.
#[derive(Clone)]
pub struct KeyPoints {
    generator: Arc<dyn ContentGenerator>,
}

impl KeyPoints {
    pub fn new(generator: Arc<dyn ContentGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Component for KeyPoints {
    const NAME: &'static str = "KeyPoints";
    type Payload = KeyPointsPayload;
    type Output = Vec<String>;

    fn initial_state() -> StateMap {
        InitialState::new().slot(&KEY_POINTS).build()
    }

    async fn run(&self, ctx: ComponentContext, payload: KeyPointsPayload) -> anyhow::Result<Vec<String>> {
        let generator = self.generator.clone();
        let live = ctx.clone();

        let key_points: Vec<String> = ctx
            .io("key-points", move || async move {
                let mut points = generator.key_points(&payload.article);
                while let Some(point) = points.next().await {
                    let point = point?;
                    live.update(&KEY_POINTS, |mut current| {
                        current.push(point);
                        current
                    })?;
                }
                Ok(live.get(&KEY_POINTS)?)
            })
            .await?;

        ctx.set(&KEY_POINTS, key_points.clone())?;
        Ok(key_points)
    }
}
