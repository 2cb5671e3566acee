mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dispatch_config::{AppConfig, ConfigLoader};
use dispatch_db::newsletter::{self, NewNewsletter, NewsletterPatch, NewsletterStatus};
use dispatch_db::{Database, member, settings};
use serde_json::json;
use tracing::info;

#[derive(Parser)]
#[command(name = "dispatch", version, about = "Newsletter storage and migrations")]
struct Cli {
    /// Path to config.yml / config.toml
    #[arg(long, global = true, env = "DISPATCH_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file (overrides the config)
    #[arg(long, global = true, env = "DISPATCH_DATABASE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending migrations
    Migrate {
        /// Stop after this version
        #[arg(long)]
        to: Option<u32>,
    },
    /// Reverse the most recent migrations
    Rollback {
        #[arg(long, default_value_t = 1)]
        steps: usize,
    },
    /// Show applied and pending migrations
    Status,
    /// Manage site settings
    #[command(subcommand)]
    Settings(SettingsCommand),
    /// Manage members
    #[command(subcommand)]
    Member(MemberCommand),
    /// Manage newsletters
    #[command(subcommand)]
    Newsletter(NewsletterCommand),
}

#[derive(Subcommand)]
enum SettingsCommand {
    Set { key: String, value: String },
    Get { key: String },
}

#[derive(Subcommand)]
enum MemberCommand {
    Add {
        email: String,
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum NewsletterCommand {
    /// List newsletters in display order
    List {
        #[arg(long)]
        status: Option<String>,
    },
    Create(CreateArgs),
    /// Change a newsletter's name and/or slug
    Rename {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        slug: Option<String>,
    },
    /// Subscribe members to a newsletter
    Subscribe {
        newsletter_id: String,
        #[arg(required = true)]
        member_ids: Vec<String>,
    },
    /// Print the sort order a new active newsletter would get
    NextSortOrder,
}

#[derive(Args)]
struct CreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    slug: Option<String>,
    #[arg(long)]
    description: Option<String>,
    /// Create the newsletter archived
    #[arg(long)]
    archived: bool,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(ConfigLoader::default_config_path);
    let mut config = ConfigLoader::load_or_default(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    if let Some(path) = cli.database.clone() {
        config.database.path = Some(path);
    }

    logging::init(&config.logging);
    run(cli.command, &config)
}

fn run(command: Command, config: &AppConfig) -> Result<()> {
    let db_path = ConfigLoader::database_path(config);
    // the migration commands manage the schema themselves
    let db = Database::connect(&db_path, config)
        .with_context(|| format!("failed to open {}", db_path.display()))?;

    match command {
        Command::Migrate { to } => {
            let applied = match to {
                Some(target) => db.migrate_to(target)?,
                None => db.migrate()?,
            };
            info!("{} migration(s) applied", applied.len());
            print_json(&json!({ "applied": applied }))
        }
        Command::Rollback { steps } => {
            let reverted = db.rollback(steps)?;
            print_json(&json!({ "rolled_back": reverted }))
        }
        Command::Status => {
            let conn = db.connection()?;
            let applied = db.migrator().applied(&conn)?;
            let pending = db.migrator().pending(&conn)?;
            print_json(&json!({ "applied": applied, "pending": pending }))
        }
        Command::Settings(cmd) => {
            db.migrate()?;
            let conn = db.connection()?;
            match cmd {
                SettingsCommand::Set { key, value } => {
                    settings::set(&conn, &key, Some(&value))?;
                    print_json(&json!({ "key": key, "value": value }))
                }
                SettingsCommand::Get { key } => {
                    let value = settings::get(&conn, &key)?;
                    print_json(&json!({ "key": key, "value": value }))
                }
            }
        }
        Command::Member(MemberCommand::Add { email, name }) => {
            db.migrate()?;
            let conn = db.connection()?;
            let member = member::create(&conn, &email, name.as_deref())?;
            print_json(&member)
        }
        Command::Newsletter(cmd) => {
            db.migrate()?;
            run_newsletter(&db, cmd)
        }
    }
}

fn run_newsletter(db: &Database, command: NewsletterCommand) -> Result<()> {
    let conn = db.connection()?;
    match command {
        NewsletterCommand::List { status } => {
            let status = status
                .map(|s| s.parse::<NewsletterStatus>())
                .transpose()?;
            print_json(&newsletter::list(&conn, status)?)
        }
        NewsletterCommand::Create(args) => {
            let input = NewNewsletter {
                slug: args.slug,
                description: args.description,
                status: args.archived.then_some(NewsletterStatus::Archived),
                ..NewNewsletter::named(args.name)
            };
            print_json(&newsletter::create(&conn, db.slugs(), input)?)
        }
        NewsletterCommand::Rename { id, name, slug } => {
            let patch = NewsletterPatch {
                name,
                slug,
                ..NewsletterPatch::default()
            };
            print_json(&newsletter::update(&conn, db.slugs(), &id, patch)?)
        }
        NewsletterCommand::Subscribe {
            newsletter_id,
            member_ids,
        } => {
            let subscribed = newsletter::subscribe_members_by_id(&conn, &newsletter_id, &member_ids)?;
            print_json(&json!({ "newsletter_id": newsletter_id, "subscribed": subscribed }))
        }
        NewsletterCommand::NextSortOrder => {
            let next = newsletter::next_available_sort_order(&conn)?;
            print_json(&json!({ "next_sort_order": next }))
        }
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
