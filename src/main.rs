use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use terms_scanner::agent::Agent;
use terms_scanner::cache::BadgeUpdate;
use terms_scanner::classify::MatchMode;
use terms_scanner::config::{db_path, env_overrides, PipelineConfig, SettingKey, Settings};
use terms_scanner::db;
use terms_scanner::dom::{tag_histogram, Document};
use terms_scanner::extract::TextExtractor;
use terms_scanner::fetch::{HttpTransport, Transport};
use terms_scanner::page::Page;
use terms_scanner::relay::{ContextId, Relay};
use terms_scanner::scanner::LinkScanner;
use terms_scanner::service::AnalysisClient;
use terms_scanner::worker::Worker;

const TAB: u32 = 1;

#[derive(Parser)]
#[command(name = "terms_scanner", about = "Find, fetch and score the legal documents a page links to")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the policy links on a page
    Scan {
        url: String,
        /// Substring matching on link text and href
        #[arg(long)]
        loose: bool,
    },
    /// Fetch one document and print its text
    Extract {
        url: String,
        /// Skip the tree builder and strip tags with regexes
        #[arg(long)]
        regex: bool,
    },
    /// Scan a page, fetch every policy link and score it
    Run {
        url: String,
        #[arg(long)]
        loose: bool,
    },
    /// Read or change persisted settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Websites saved by a user
    Saved {
        #[arg(short, long)]
        user: String,
    },
    /// Show one analyzed snapshot
    Show { snapshot: i64 },
    /// Save a snapshot for the configured user
    Save {
        snapshot: i64,
        /// Set the user id first
        #[arg(short, long)]
        user: Option<String>,
        /// Also post the save to the save-report webhook
        #[arg(long)]
        report: bool,
    },
    /// Remove a saved snapshot
    Unsave {
        snapshot: i64,
        #[arg(short, long)]
        user: String,
    },
    /// Ask a question about a snapshot
    Chat { snapshot: i64, question: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print one setting, or all of them
    Get { key: Option<String> },
    Set { key: String, value: String },
}

fn mode(loose: bool) -> MatchMode {
    if loose {
        MatchMode::Loose
    } else {
        MatchMode::Strict
    }
}

fn open_settings() -> Result<Settings> {
    let overrides = env_overrides()?;
    let path = db_path(&overrides);
    let conn = db::connect(&path)?;
    Ok(Settings::new(conn, overrides)?)
}

fn pipeline_config(loose: bool) -> Result<PipelineConfig> {
    Ok(PipelineConfig::with_mode(mode(loose)).apply_overrides(&env_overrides()?)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Scan { url, loose } => {
            let transport = HttpTransport::new()?;
            let html = transport.get_text(&url).await?;
            let mut doc = Document::parse(&html);
            let mut scanner = LinkScanner::new(&url, mode(loose)).context("invalid page url")?;
            let found = scanner.scan(&mut doc);
            if found.is_empty() {
                println!("No policy links found.");
                return Ok(());
            }
            println!("{:>3} | {:<20} | {:<32} | {}", "#", "Type", "Text", "URL");
            println!("{}", "-".repeat(100));
            for (i, link) in found.iter().enumerate() {
                println!(
                    "{:>3} | {:<20} | {:<32} | {}",
                    i + 1,
                    link.document_type,
                    truncate(&link.text, 32),
                    link.url
                );
            }
            let anchors = tag_histogram(&doc).get("a").copied().unwrap_or(0);
            println!(
                "\n{} links ({} of {} anchors flagged)",
                found.len(),
                scanner.flagged_count(),
                anchors
            );
            Ok(())
        }
        Commands::Extract { url, regex } => {
            let transport = HttpTransport::new()?;
            let html = transport.get_text(&url).await?;
            let extractor = if regex {
                TextExtractor::regex_only()
            } else {
                TextExtractor::default()
            };
            let text = extractor.extract(&html);
            println!("{}", text);
            eprintln!("\n{} chars from {} bytes of html", text.chars().count(), html.len());
            Ok(())
        }
        Commands::Run { url, loose } => run_pipeline(&url, loose).await,
        Commands::Config { action } => {
            let settings = open_settings()?;
            match action {
                ConfigAction::Get { key: Some(key) } => {
                    let key = SettingKey::parse(&key)?;
                    match settings.get(key)? {
                        Some(value) => println!("{}", value),
                        None => println!("{} is not set", key),
                    }
                }
                ConfigAction::Get { key: None } => {
                    for (key, value) in settings.all()? {
                        println!("{:<16} {}", key.name(), value.as_deref().unwrap_or("-"));
                    }
                }
                ConfigAction::Set { key, value } => {
                    let key = SettingKey::parse(&key)?;
                    let saved = settings.set(key, &value)?;
                    println!("{} = {}", key, saved);
                }
            }
            Ok(())
        }
        Commands::Saved { user } => {
            let settings = open_settings()?;
            let rows = db::saved_websites_for_user(settings.connection(), &user)?;
            if rows.is_empty() {
                println!("Nothing saved for {}.", user);
                return Ok(());
            }
            println!(
                "{:>6} | {:<16} | {:>5} | {:<10} | {}",
                "Snap", "Website", "Score", "Saved", "Summary"
            );
            println!("{}", "-".repeat(90));
            for r in &rows {
                println!(
                    "{:>6} | {:<16} | {:>5} | {:<10} | {}",
                    r.snapshot_id,
                    truncate(&r.website_name, 16),
                    r.score,
                    r.date,
                    truncate(&r.summary, 40)
                );
            }
            println!("\n{} saved websites", rows.len());
            Ok(())
        }
        Commands::Show { snapshot } => {
            let settings = open_settings()?;
            let Some(site) = db::website_by_snapshot(settings.connection(), snapshot)? else {
                bail!("snapshot {} not found", snapshot);
            };
            println!("{} ({})", site.website_name, site.website_url);
            println!("Score:   {}", site.score);
            println!("Date:    {}", site.date);
            println!("Summary: {}", site.summary);
            if !site.alerts.is_empty() {
                println!("\n--- Findings ---");
                for alert in &site.alerts {
                    println!("  [{:<8}] {}: {}", alert.flag.as_str(), alert.title, alert.description);
                }
            }
            Ok(())
        }
        Commands::Save {
            snapshot,
            user,
            report,
        } => {
            let settings = open_settings()?;
            if let Some(user) = user {
                settings.set(SettingKey::UserId, &user)?;
            }
            let user = settings
                .require(SettingKey::UserId)
                .context("pass --user once to set it")?;
            if db::website_by_snapshot(settings.connection(), snapshot)?.is_none() {
                bail!("snapshot {} not found", snapshot);
            }
            db::save_website_for_user(settings.connection(), &user, snapshot)?;
            println!("Saved snapshot {} for {}", snapshot, user);
            if report {
                let endpoint = settings.require(SettingKey::SaveWebhook)?;
                let client = AnalysisClient::new(Arc::new(HttpTransport::new()?));
                let message = client.save_report(&endpoint, &user, snapshot).await?;
                println!("{}", message.as_deref().unwrap_or("Report sent."));
            }
            Ok(())
        }
        Commands::Unsave { snapshot, user } => {
            let settings = open_settings()?;
            if db::remove_website_for_user(settings.connection(), &user, snapshot)? {
                println!("Removed snapshot {} for {}", snapshot, user);
            } else {
                println!("Snapshot {} was not saved for {}", snapshot, user);
            }
            Ok(())
        }
        Commands::Chat { snapshot, question } => {
            let settings = open_settings()?;
            settings.ensure_defaults()?;
            let endpoint = settings.require(SettingKey::ChatWebhook)?;
            let client = AnalysisClient::new(Arc::new(HttpTransport::new()?));
            let answer = client.chat(&endpoint, snapshot, &question).await?;
            println!("{}", answer.answer);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// Drive page, agent and worker over the relay for one real page.
async fn run_pipeline(url: &str, loose: bool) -> Result<()> {
    let config = pipeline_config(loose)?;
    let settings = open_settings()?;
    let transport = Arc::new(HttpTransport::new()?);
    let html = transport.get_text(url).await?;

    let relay = Relay::new();
    let worker = Worker::new(relay.clone(), settings, Arc::clone(&transport), config)?;
    let worker = tokio::spawn(worker.run());
    let page = tokio::spawn(Page::new(TAB, relay.clone()).run());

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("progress template")?
            .progress_chars("#>-"),
    );
    let progress = pb.clone();
    let mut agent = Agent::new(
        TAB,
        url,
        &html,
        relay.clone(),
        &config,
        Some(Box::new(move |update: &BadgeUpdate| {
            progress.inc(1);
            if let BadgeUpdate::Score { score, .. } = update {
                progress.set_message(format!("{} -> {}", update.url(), score));
            }
        })),
    )
    .context("invalid page url")?;

    let found = agent.start();
    if found.is_empty() {
        pb.finish_and_clear();
        println!("No policy links found.");
    } else {
        pb.set_length(found.len() as u64);
        println!(
            "Pipeline: {} policy links, fetching {:.1}s apart...",
            found.len(),
            config.pacing.as_secs_f64()
        );
    }
    let agent = tokio::spawn(agent.run());

    // Each context drains its inbox before the next one is closed.
    relay.unregister(ContextId::Worker);
    worker.await.context("worker task")?;
    relay.unregister(ContextId::Agent(TAB));
    let agent = agent.await.context("agent task")?;
    relay.close_tab(TAB);
    let page = page.await.context("page task")?;
    pb.finish_and_clear();

    if found.is_empty() {
        return Ok(());
    }

    let state = page.get_state();
    println!(
        "{:>3} | {:<20} | {:>5} | {:<8} | {:>7} | {}",
        "#", "Type", "Score", "Tier", "Chars", "URL"
    );
    println!("{}", "-".repeat(100));
    for (i, link) in page.list_candidates().iter().enumerate() {
        let record = agent.cache().get(&link.url);
        let score = record.map(|r| r.score.to_string()).unwrap_or_else(|| "-".into());
        let tier = record.map(|r| r.tier().as_str()).unwrap_or("-");
        let chars = state
            .content
            .get(&link.url)
            .map(|c| c.content.chars().count().to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:>3} | {:<20} | {:>5} | {:<8} | {:>7} | {}",
            i + 1,
            link.document_type,
            score,
            tier,
            chars,
            link.url
        );
    }

    let scored: Vec<_> = agent.cache().records().collect();
    if !scored.is_empty() {
        println!("\n--- Summaries ---");
        for r in &scored {
            println!("  {}: {}", truncate(&r.url, 48), truncate(&r.summary, 80));
        }
    }
    println!(
        "\n{} links | {} fetched | {} scored",
        found.len(),
        state.content.len(),
        scored.len()
    );
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
