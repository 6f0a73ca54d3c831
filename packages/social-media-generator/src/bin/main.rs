//! Terminal driver for the social media generator.
//!
//! Prints every state update as one JSON line on stdout. Endpoint calls are
//! read from stdin, one per line: `<endpoint-id> <json>`.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde::Serialize;
use social_media_generator::{EditorRole, GeneratorPayload, ScriptedGenerator};
use synxio::{CallEndpointResult, RuntimeConfig, SqliteLogStore};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "social-media-generator")]
#[command(about = "Turn an article into reviewed social media posts")]
struct Cli {
    /// Role the state subscription is authorized as
    #[arg(long, default_value = "editor")]
    role: EditorRole,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new application instance
    Init {
        /// Article text
        article: String,
        #[arg(long)]
        twitter: bool,
        #[arg(long)]
        facebook: bool,
        #[arg(long)]
        instagram: bool,
        /// Instance id (generated if omitted)
        #[arg(long)]
        app_id: Option<String>,
    },

    /// Resume an instance from its log
    Resume { app_id: String },
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
enum Output<'a> {
    Started { app_id: &'a str },
    Endpoint { id: &'a str, result: CallEndpointResult },
    Finished { posts: serde_json::Value },
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string(value).context("Failed to encode output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,synxio=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = RuntimeConfig::from_env().context("Failed to load configuration")?;

    let store = SqliteLogStore::new(&config.database_url, config.max_connections)
        .await
        .context("Failed to open log database")?;
    let app = social_media_generator::app(Arc::new(ScriptedGenerator::new()))
        .store(store)
        .config(config)
        .build();

    let mut handle = match cli.command {
        Commands::Init {
            article,
            twitter,
            facebook,
            instagram,
            app_id,
        } => {
            let app_id = app_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let payload = GeneratorPayload {
                article,
                twitter,
                facebook,
                instagram,
            };
            app.initialize(&app_id, payload)
                .await
                .context("Failed to initialize application")?
        }
        Commands::Resume { app_id } => app
            .resume(&app_id)
            .await
            .context("Failed to resume application")?,
    };
    print_json(&Output::Started {
        app_id: handle.app_id(),
    })?;

    let mut updates = handle.subscribe(cli.role);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    let posts = loop {
        tokio::select! {
            outcome = handle.join() => break outcome,
            update = updates.next() => match update {
                Some(update) => print_json(&update?)?,
                None => break Err(synxio::SynxioError::Cancelled),
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    let Some((id, body)) = line.trim().split_once(' ') else {
                        tracing::warn!("expected `<endpoint-id> <json>`");
                        continue;
                    };
                    let value = serde_json::from_str(body).context("Endpoint body is not JSON")?;
                    let result = handle.call_endpoint(id, value);
                    print_json(&Output::Endpoint { id, result })?;
                }
                None => stdin_open = false,
            },
        }
    };

    let posts = posts.context("Application did not finish")?;
    print_json(&Output::Finished {
        posts: serde_json::to_value(&posts)?,
    })?;

    handle.shutdown().await.context("Failed to flush log")?;
    Ok(())
}
