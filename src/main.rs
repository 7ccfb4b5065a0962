use anyhow::{Context, Result};
use chrono::NaiveTime;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dailyfeed::config::Config;
use dailyfeed::feed::HttpTransport;
use dailyfeed::notify::StdoutMessenger;
use dailyfeed::scheduler::{Dispatcher, Scheduler};
use dailyfeed::storage::{Database, DatabaseError};
use dailyfeed::subscriber::{ChatId, Mode, Subscriber, SubscriberError};
use dailyfeed::util::validate_feed_url;

/// Get the config directory path (~/.config/dailyfeed/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("dailyfeed"))
}

#[derive(Parser, Debug)]
#[command(name = "dailyfeed", about = "Deliver new RSS/Atom entries as they appear or in a daily digest")]
struct Args {
    /// Config file (default: ~/.config/dailyfeed/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Subscriber database (overrides `database_path` from the config file)
    #[arg(long, value_name = "FILE", global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler for every started chat until Ctrl-C
    Run,
    /// Start a chat with empty feed lists
    Start { chat: ChatId },
    /// Delete a chat and everything it subscribed to
    Stop { chat: ChatId },
    /// Subscribe a chat to one or more feeds
    Add {
        chat: ChatId,
        /// asap or digest
        #[arg(long, short)]
        mode: Mode,
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Unsubscribe a chat from feeds, in whichever mode they are
    Remove {
        chat: ChatId,
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Show a chat's feeds ('+' marks a custom template)
    List { chat: ChatId },
    /// Set the UTC time of the daily digest
    SetDigestTime {
        chat: ChatId,
        /// HH:MM
        time: String,
    },
    /// Set a feed's message template; omit TEMPLATE to go back to the default
    SetTemplate {
        chat: ChatId,
        url: String,
        template: Option<String>,
    },
    /// Fetch one of a chat's lists now and print what would be delivered
    Poll {
        chat: ChatId,
        #[arg(long, short)]
        mode: Mode,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = match args.db.clone().or_else(|| config.database_path.clone()) {
        Some(path) => path,
        None => {
            ensure_private_dir(&config_dir)?;
            config_dir.join("dailyfeed.db")
        }
    };
    let db = open_database(&db_path).await?;

    match args.command {
        Command::Run => run(db, config).await,
        Command::Start { chat } => start(&db, &config, chat).await,
        Command::Stop { chat } => {
            if db.delete_subscriber(chat).await? {
                println!("Chat {chat} stopped; its feeds were removed.");
            } else {
                println!("Chat {chat} was not started.");
            }
            Ok(())
        }
        Command::Add { chat, mode, urls } => add(&db, chat, mode, &urls).await,
        Command::Remove { chat, urls } => remove(&db, chat, &urls).await,
        Command::List { chat } => list(&db, chat).await,
        Command::SetDigestTime { chat, time } => {
            let time = NaiveTime::parse_from_str(time.trim(), "%H:%M")
                .with_context(|| format!("'{time}' is not a time in HH:MM format"))?;
            edit_started(&db, chat, |subscriber| {
                subscriber.set_digest_time(time);
                Ok(())
            })
            .await?;
            println!("Digest for chat {chat} will be sent daily at {} UTC.", time.format("%H:%M"));
            Ok(())
        }
        Command::SetTemplate { chat, url, template } => {
            let cleared = template.is_none();
            edit_started(&db, chat, |subscriber| {
                Ok(subscriber.set_template(&url, template.clone())?)
            })
            .await?;
            if cleared {
                println!("{url} uses the default template again.");
            } else {
                println!("Template for {url} updated.");
            }
            Ok(())
        }
        Command::Poll { chat, mode } => {
            load_started(&db, chat).await?;
            let dispatcher = dispatcher(db, config)?;
            let sent = dispatcher.run_update(chat, mode).await?.unwrap_or(0);
            println!("{sent} message(s) delivered.");
            Ok(())
        }
    }
}

/// Create `dir` if needed and restrict it to the current user.
fn ensure_private_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).context("Failed to create config directory")?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(dir, perms) {
                    tracing::warn!(
                        path = %dir.display(),
                        error = %e,
                        "Failed to set config directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "Failed to read config directory metadata");
            }
        }
    }
    Ok(())
}

async fn open_database(path: &Path) -> Result<Database> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match Database::open(path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            anyhow::bail!("The database at {} is locked by another process. Please try again.", path.display())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to open database {}", path.display())),
    }
}

fn dispatcher(db: Database, config: Config) -> Result<Arc<Dispatcher>> {
    let transport = HttpTransport::new(&config.user_agent, config.request_timeout())
        .context("Failed to build HTTP client")?;
    Ok(Arc::new(Dispatcher::new(
        db,
        Arc::new(transport),
        Arc::new(StdoutMessenger),
        Arc::new(config),
    )))
}

async fn run(db: Database, config: Config) -> Result<()> {
    let scheduler = Scheduler::new(dispatcher(db, config)?);
    scheduler.run().await.context("Scheduler stopped")?;
    println!("Goodbye!");
    Ok(())
}

async fn load_started(db: &Database, chat: ChatId) -> Result<Subscriber> {
    db.load_subscriber(chat)
        .await?
        .with_context(|| format!("Chat {chat} has not been started; run `dailyfeed start {chat}` first"))
}

/// Apply `edit` to a started chat, retrying on top of any concurrent save.
async fn edit_started<T>(
    db: &Database,
    chat: ChatId,
    edit: impl FnMut(&mut Subscriber) -> Result<T>,
) -> Result<T> {
    db.update_subscriber(chat, edit)
        .await?
        .with_context(|| format!("Chat {chat} has not been started; run `dailyfeed start {chat}` first"))
}

async fn start(db: &Database, config: &Config, chat: ChatId) -> Result<()> {
    if db.load_subscriber(chat).await?.is_some() {
        println!("Chat {chat} is already started.");
        return Ok(());
    }
    db.save_subscriber(&Subscriber::with_workers(chat, config.max_workers))
        .await?;
    println!("Chat {chat} started. Add feeds with `dailyfeed add {chat} --mode asap <url>`.");
    Ok(())
}

async fn add(db: &Database, chat: ChatId, mode: Mode, urls: &[String]) -> Result<()> {
    let mut valid = Vec::new();
    for raw in urls {
        match validate_feed_url(raw) {
            Ok(url) => valid.push(url),
            Err(e) => eprintln!("Skipping {raw}: {e}"),
        }
    }

    let (added, duplicates) = edit_started(db, chat, |subscriber| {
        let mut added = Vec::new();
        let mut duplicates = Vec::new();
        for url in &valid {
            match subscriber.add_feed(mode, url) {
                Ok(()) => added.push(url.clone()),
                Err(SubscriberError::Collection(_)) => duplicates.push(url.clone()),
                Err(e) => return Err(e.into()),
            }
        }
        Ok((added, duplicates))
    })
    .await?;

    if !added.is_empty() {
        println!("Added to {mode}: {}", added.join(", "));
    }
    if !duplicates.is_empty() {
        println!("Already subscribed in {mode}: {}", duplicates.join(", "));
    }
    Ok(())
}

async fn remove(db: &Database, chat: ChatId, urls: &[String]) -> Result<()> {
    let outcomes = edit_started(db, chat, |subscriber| {
        Ok(urls
            .iter()
            .map(|url| {
                let url = url.trim();
                (url.to_string(), subscriber.remove_feed(url))
            })
            .collect::<Vec<_>>())
    })
    .await?;

    for (url, outcome) in outcomes {
        match outcome {
            Ok(modes) => {
                let modes: Vec<String> = modes.iter().map(Mode::to_string).collect();
                println!("Removed {url} ({})", modes.join(", "));
            }
            Err(e) => println!("{e}"),
        }
    }
    Ok(())
}

async fn list(db: &Database, chat: ChatId) -> Result<()> {
    let subscriber = load_started(db, chat).await?;
    let listings: Vec<(Mode, _)> = Mode::ALL
        .into_iter()
        .map(|mode| (mode, subscriber.list_feeds(mode)))
        .collect();

    if listings.iter().all(|(_, feeds)| feeds.is_empty()) {
        println!("Chat {chat} has no feeds yet.");
        return Ok(());
    }

    for (mode, feeds) in listings {
        println!("{mode}:");
        for feed in feeds {
            let mark = if feed.custom_template { '+' } else { '-' };
            println!("{mark} {} <{}>", feed.title, feed.url);
        }
    }
    println!(
        "Digest time: {} UTC",
        subscriber.digest_time().format("%H:%M")
    );
    Ok(())
}
