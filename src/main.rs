use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nostr::prelude::*;
use nostrzh::{
    comments::{comment_read_relays, CommentFeed, CommentNode},
    config,
    profile::{user_id_to_pubkey, ProfileService},
    relay_pool::{PoolSettings, RelayPool},
    server,
    ws_relay::WsConnector,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "nostrzh",
    version,
    about = "Relay client and community services for nostrzh.org"
)]
struct Args {
    /// Path to config directory
    #[arg(short, long, default_value = "config")]
    config_dir: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the nostr.json proxy, health and metrics
    Serve {
        /// Override listen address
        #[arg(short, long)]
        local_addr: Option<String>,
    },
    /// Print a profile (hex, npub or nprofile)
    Profile { id: String },
    /// Print the comment tree of a page
    Comments {
        url: String,
        /// Article author whose read relays are searched too
        #[arg(long)]
        author: Option<String>,
        #[arg(long, default_value_t = nostrzh::comments::DEFAULT_PAGE_SIZE)]
        limit: usize,
        /// Older pages to fetch after the first one
        #[arg(long, default_value_t = 0)]
        more: usize,
    },
    /// Print a user's relay list
    Relays { pubkey: String },
}

fn setup_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,nostrzh=debug"));

    fmt()
        .with_env_filter(env_filter)
        .with_timer(fmt::time::SystemTime)
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_level(true)
        .init();
}

fn comment_json(node: &CommentNode) -> Value {
    json!({
        "id": node.event.id.to_hex(),
        "pubkey": node.event.pubkey.to_hex(),
        "created_at": node.event.created_at.as_u64(),
        "content": node.event.content,
        "children": node.children.iter().map(comment_json).collect::<Vec<_>>(),
    })
}

fn urls_json(urls: &[RelayUrl]) -> Vec<String> {
    urls.iter().map(|url| url.to_string()).collect()
}

fn client_services(settings: &config::ClientSettings) -> (RelayPool, ProfileService) {
    let pool = RelayPool::new(Arc::new(WsConnector), PoolSettings::from(settings));
    let profiles = ProfileService::new(pool.clone(), settings);
    (pool, profiles)
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let args = Args::parse();
    let config = config::Config::new(&args.config_dir).context("Failed to load configuration")?;
    let mut settings = config.get_settings().context("Failed to get settings")?;

    let output = match args.command {
        Command::Serve { local_addr } => {
            if let Some(local_addr) = local_addr {
                settings.server.local_addr = local_addr;
            }
            let cancellation_token = CancellationToken::new();
            return server::run_server(settings.server, cancellation_token).await;
        }
        Command::Profile { id } => {
            let (_, profiles) = client_services(&settings.client);
            let profile = profiles
                .fetch_profile(&id)
                .await
                .context("Failed to fetch profile")?;
            serde_json::to_value(&profile)?
        }
        Command::Relays { pubkey } => {
            let (_, profiles) = client_services(&settings.client);
            let user = user_id_to_pubkey(&pubkey).context("Invalid pubkey")?;
            let list = profiles.fetch_relay_list(user.pubkey).await;
            json!({
                "pubkey": list.pubkey.to_hex(),
                "read": urls_json(&list.read),
                "write": urls_json(&list.write),
                "published": !list.original.is_empty(),
            })
        }
        Command::Comments {
            url,
            author,
            limit,
            more,
        } => {
            let (pool, profiles) = client_services(&settings.client);
            let author = match author {
                Some(author) => Some(
                    user_id_to_pubkey(&author)
                        .context("Invalid author")?
                        .pubkey,
                ),
                None => None,
            };
            let relays = comment_read_relays(
                &profiles,
                &settings.client.default_relay_urls(),
                author,
            )
            .await;
            info!("Reading comments of {} from {} relays", url, relays.len());

            let mut feed = CommentFeed::new(pool, url, relays).with_limit(limit);
            feed.load().await;
            for _ in 0..more {
                if feed.load_more().await == 0 {
                    break;
                }
            }
            feed.close();

            let tree = feed.tree();
            json!({
                "url": feed.url(),
                "count": tree.count,
                "has_more": feed.has_more(),
                "comments": tree.roots.iter().map(comment_json).collect::<Vec<_>>(),
            })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
