use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use lockcache::Context;

/// Inspect and flush the stores used by lockcache.
#[derive(Debug, Parser)]
#[command(name = "lockcache", version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Commands,

    #[command(flatten)]
    pub(crate) verbose: Verbosity<WarnLevel>,

    /// Configuration file describing the lock and cache stores. Without one,
    /// in-memory stores are used.
    #[arg(short, long, global = true, env = "LOCKCACHE_CONFIG")]
    pub(crate) config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Commands {
    /// Show whether a key is locked and whether a value is cached for it
    Status(KeyArgs),
    /// Remove the cached value of a key, leaving its lock alone
    Clear(KeyArgs),
    /// Remove every entry from the cache store
    FlushCache(FlushArgs),
    /// Remove every lock record from the lock store
    FlushLocks(FlushArgs),
}

#[derive(Debug, Args)]
pub(crate) struct KeyArgs {
    /// Key parts; each is parsed as JSON if possible and used as a string
    /// otherwise
    pub(crate) parts: Vec<String>,

    /// Namespace the key by type and method, written `Type::method`
    #[arg(long, requires = "id", value_parser = parse_context)]
    pub(crate) context: Option<Context>,

    /// Identifier of the object the value belongs to
    #[arg(long, requires = "context")]
    pub(crate) id: Option<String>,
}

#[derive(Debug, Args)]
pub(crate) struct FlushArgs {
    /// Confirm flushing; other data in a shared store is removed too
    #[arg(long)]
    pub(crate) yes: bool,
}

fn parse_context(value: &str) -> Result<Context, String> {
    match value.rsplit_once("::") {
        Some((type_name, method)) if !type_name.is_empty() && !method.is_empty() => {
            Ok(Context::new(type_name.to_owned(), method.to_owned()))
        }
        _ => Err(format!("expected `Type::method`, got `{value}`")),
    }
}
