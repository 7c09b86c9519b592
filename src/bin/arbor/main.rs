//! arbor CLI tool
//!
//! Inspection and repair of hierarchical trees stored in an arbor SQLite database.
//!
//! ## Commands
//!
//! - `repair`: detach rows caught in stored parent cycles and rebuild every path
//! - `rebuild-paths`: recompute paths from the parent links without touching parents
//! - `show`: build one cache variant and print it as an indented tree
//!
//! Logging follows `RUST_LOG` and defaults to `info`.

use clap::{Parser, Subcommand};
use std::{path::PathBuf, sync::Arc};

use arbor_core::{
    cache::{CacheVariantKey, CacheVariantStore, DimToken, MemoryCacheBackend},
    cancel::Cancel,
    config::{ArborConfig, ConfigProvider, TomlConfigProvider},
    counts::ElementCountResolver,
    db::{db_init, DbConnection},
    paths::TreePathMaintainer,
    provider::TreeProvider,
    tree::MenuItemInfo,
};

#[derive(Parser)]
#[command(name = "arbor")]
#[command(author, version, about = "Inspect and repair materialized-path trees", long_about = None)]
struct Cli {
    /// SQLite database file
    #[arg(short, long, default_value = "arbor.db")]
    db: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Heal stored parent cycles and rebuild paths
    Repair {
        /// Only repair this tree (default: every tree in the database)
        #[arg(short, long)]
        tree: Option<String>,
    },

    /// Recompute every path of a tree from its parent links
    RebuildPaths {
        tree: String,
    },

    /// Print one variant of a tree
    Show {
        tree: String,

        #[arg(short, long, default_value_t = 1)]
        lang: u32,

        /// Comma separated store ids, or 0 for store-agnostic
        #[arg(long, default_value = "0")]
        store: DimToken,

        /// Comma separated customer role ids, or 0 for role-agnostic
        #[arg(long, default_value = "0")]
        roles: DimToken,

        /// Annotate each node with its element count (including descendants)
        #[arg(long)]
        counts: bool,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<ArborConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(TomlConfigProvider::new(path).get_config()?),
        None => Ok(ArborConfig::default()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let db = DbConnection(db_init(cli.db).await?);
        let cancel = Cancel::never();
        let maintainer = TreePathMaintainer::new(&config.paths);

        match cli.command {
            Commands::Repair { tree } => {
                let trees = match tree {
                    Some(tree) => vec![tree],
                    None => db.trees().await?,
                };
                for tree in trees {
                    let report = maintainer.reconcile(&tree, &db, &cancel).await?;
                    println!("{tree}: {}", serde_json::to_string(&report)?);
                    if !report.failed.is_empty() {
                        eprintln!(
                            "Warning: {} row(s) in '{}' could not be detached: {:?}",
                            report.failed.len(),
                            tree,
                            report.failed
                        );
                    }
                }
            }

            Commands::RebuildPaths { tree } => {
                let rewritten = maintainer.rebuild_paths(&tree, &db, &cancel).await?;
                println!("{tree}: rewrote {rewritten} path(s)");
            }

            Commands::Show {
                tree,
                lang,
                store,
                roles,
                counts,
            } => {
                let key = CacheVariantKey::new(&tree, lang, store, roles);
                let db = Arc::new(db);
                let cache = Arc::new(CacheVariantStore::<MenuItemInfo, _>::new(
                    MemoryCacheBackend::new(),
                ));
                let provider = TreeProvider::new(db.clone(), cache, config);
                let variant = provider.get_tree(&key, &cancel).await?;
                if variant.is_empty() {
                    println!("{key}: no visible nodes");
                    return Ok(());
                }

                if counts {
                    let resolver = ElementCountResolver::new(db.as_ref().clone());
                    let ids = variant.iter().map(|node| node.id()).collect::<Vec<_>>();
                    for id in ids {
                        resolver.resolve_counts(&key, &*variant, id, true).await?;
                    }
                }
                println!("{key}");
                print!(
                    "{}",
                    variant.render(|item| match variant
                        .get(item.id)
                        .and_then(|node| node.element_count())
                    {
                        Some(count) if counts => format!("{} ({count})", item.name),
                        _ => item.name.clone(),
                    })
                );
            }
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    Ok(())
}
