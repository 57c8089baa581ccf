//! CLI tool for managing proxy rules
//!
//! Usage:
//!   mountproxy-rules add <name> <path> <target> [--disabled]
//!   mountproxy-rules update <id> [--name <name>] [--path <path>] [--target <url>]
//!   mountproxy-rules enable <id>
//!   mountproxy-rules disable <id>
//!   mountproxy-rules delete <id>
//!   mountproxy-rules list [--enabled] [--json]

use anyhow::Result;
use clap::{Parser, Subcommand};
use mountproxy::{ProxyRule, RuleStore, RuleUpdate};
use std::path::PathBuf;

/// CLI tool for managing MountProxy rules
#[derive(Parser, Debug)]
#[command(name = "mountproxy-rules")]
#[command(author = "MountProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Manage mount rules for MountProxy")]
struct Args {
    /// Rule file path
    #[arg(long, env = "RULES_PATH", default_value = "./data/rules.json")]
    rules_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a new rule
    Add {
        /// Display name
        name: String,

        /// Local mount path (e.g., /docs)
        path: String,

        /// Origin base URL (e.g., https://docs.example.com)
        target: String,

        /// Create the rule disabled
        #[arg(long)]
        disabled: bool,
    },

    /// Update an existing rule
    Update {
        /// Rule ID
        id: String,

        #[arg(short = 'n', long)]
        name: Option<String>,

        #[arg(short = 'p', long)]
        path: Option<String>,

        #[arg(short = 't', long)]
        target: Option<String>,
    },

    /// Enable a rule
    Enable {
        /// Rule ID
        id: String,
    },

    /// Disable a rule
    Disable {
        /// Rule ID
        id: String,
    },

    /// Delete a rule
    Delete {
        /// Rule ID
        id: String,
    },

    /// List rules in routing order
    List {
        /// Only show enabled rules
        #[arg(long)]
        enabled: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let store = RuleStore::open(&args.rules_path)?;

    match args.command {
        Commands::Add {
            name,
            path,
            target,
            disabled,
        } => {
            if url::Url::parse(&target).is_err() {
                eprintln!("Warning: '{}' is not an absolute URL; requests to this rule will fail", target);
            }

            let rule = store.add_rule(&name, &path, &target, !disabled)?;

            println!("Added rule:");
            print_rule(&rule);
        }

        Commands::Update {
            id,
            name,
            path,
            target,
        } => {
            let update = RuleUpdate {
                name,
                path,
                target,
                enabled: None,
            };

            match store.update_rule(&id, update)? {
                Some(rule) => {
                    println!("Updated rule:");
                    print_rule(&rule);
                }
                None => not_found(&id),
            }
        }

        Commands::Enable { id } => match store.set_enabled(&id, true)? {
            Some(rule) => println!("Enabled {} ({})", rule.name, rule.mount_prefix()),
            None => not_found(&id),
        },

        Commands::Disable { id } => match store.set_enabled(&id, false)? {
            Some(rule) => println!("Disabled {} ({})", rule.name, rule.mount_prefix()),
            None => not_found(&id),
        },

        Commands::Delete { id } => {
            if store.delete_rule(&id)? {
                println!("Deleted rule {}", id);
            } else {
                not_found(&id);
            }
        }

        Commands::List { enabled, json } => {
            let rules = if enabled {
                store.list_enabled()
            } else {
                store.list_rules()
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&rules)?);
                return Ok(());
            }

            if rules.is_empty() {
                println!("No rules found");
                return Ok(());
            }

            println!("{:<38} {:<20} {:<20} {:<8} {:<40}",
                "ID", "NAME", "PATH", "ENABLED", "TARGET");
            println!("{}", "-".repeat(130));

            for rule in &rules {
                println!("{:<38} {:<20} {:<20} {:<8} {:<40}",
                    rule.id,
                    rule.name,
                    rule.mount_prefix(),
                    if rule.enabled { "yes" } else { "no" },
                    rule.target
                );
            }

            println!("\nTotal: {} rule(s)", rules.len());
        }
    }

    Ok(())
}

fn not_found(id: &str) -> ! {
    eprintln!("No rule found with ID {}", id);
    std::process::exit(1);
}

fn print_rule(rule: &ProxyRule) {
    println!("  ID:       {}", rule.id);
    println!("  Name:     {}", rule.name);
    println!("  Path:     {}", rule.mount_prefix());
    println!("  Target:   {}", rule.target);
    println!("  Enabled:  {}", rule.enabled);
    println!("  Created:  {}", rule.created_at.to_rfc3339());
    println!("  Updated:  {}", rule.updated_at.to_rfc3339());
}
