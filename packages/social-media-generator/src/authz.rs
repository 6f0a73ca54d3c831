//! Who sees which post.

use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use synxio::{Authorizer, Component, ComponentInfo};
use thiserror::Error;

use crate::components::Post;
use crate::generator::Site;

/// Role of a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EditorRole {
    /// Sees every post.
    Editor,
    TwitterEditor,
    FacebookEditor,
    InstagramEditor,
}

impl EditorRole {
    /// The only site this role may see, or `None` for all sites.
    pub fn site(&self) -> Option<Site> {
        match self {
            EditorRole::Editor => None,
            EditorRole::TwitterEditor => Some(Site::Twitter),
            EditorRole::FacebookEditor => Some(Site::Facebook),
            EditorRole::InstagramEditor => Some(Site::Instagram),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown role: {0} (expected editor, twitterEditor, facebookEditor or instagramEditor)")]
pub struct UnknownRole(String);

impl FromStr for EditorRole {
    type Err = UnknownRole;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "editor" => Ok(EditorRole::Editor),
            "twitterEditor" => Ok(EditorRole::TwitterEditor),
            "facebookEditor" => Ok(EditorRole::FacebookEditor),
            "instagramEditor" => Ok(EditorRole::InstagramEditor),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Shows a `Post` only to editors of its site. Everything else is public.
#[derive(Clone, Copy, Debug, Default)]
pub struct SiteAuthorizer;

#[async_trait]
impl Authorizer for SiteAuthorizer {
    type Session = EditorRole;

    async fn authorize(&self, role: &EditorRole, component: &ComponentInfo) -> bool {
        if component.name != Post::NAME {
            return true;
        }
        let Some(allowed) = role.site() else {
            return true;
        };
        component.payload.get("site").and_then(|site| site.as_str()) == Some(allowed.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn post(site: &str) -> ComponentInfo {
        ComponentInfo {
            name: "Post".into(),
            payload: json!({"site": site, "keyPoints": []}),
        }
    }

    #[tokio::test]
    async fn test_site_editors_see_their_posts_only() {
        let authorizer = SiteAuthorizer;

        assert!(authorizer.authorize(&EditorRole::TwitterEditor, &post("twitter")).await);
        assert!(!authorizer.authorize(&EditorRole::TwitterEditor, &post("facebook")).await);
        assert!(authorizer.authorize(&EditorRole::Editor, &post("instagram")).await);
    }

    #[tokio::test]
    async fn test_other_components_are_public() {
        let key_points = ComponentInfo {
            name: "KeyPoints".into(),
            payload: json!({"article": "..."}),
        };
        assert!(SiteAuthorizer.authorize(&EditorRole::InstagramEditor, &key_points).await);
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("facebookEditor".parse::<EditorRole>().unwrap(), EditorRole::FacebookEditor);
        assert!("admin".parse::<EditorRole>().is_err());
    }
}
