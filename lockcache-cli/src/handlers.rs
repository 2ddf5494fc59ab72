use std::path::Path;

use anyhow::{Context as _, bail};
use lockcache::config::LockAndCacheConfig;
use lockcache::{Key, LockAndCache};
use serde_json::Value;
use tracing::debug;

use crate::args::{FlushArgs, KeyArgs};
use crate::utils::{StatusType, print_status_msg};

pub(crate) fn load_config(path: Option<&Path>) -> anyhow::Result<LockAndCacheConfig> {
    let Some(path) = path else {
        debug!("no configuration file given; using in-memory stores");
        return Ok(LockAndCacheConfig::default());
    };

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read config file `{}`", path.display()))?;
    LockAndCacheConfig::from_toml(&content)
        .with_context(|| format!("failed to parse config file `{}`", path.display()))
}

pub(crate) async fn handle_status(
    lock_and_cache: &LockAndCache,
    args: &KeyArgs,
) -> anyhow::Result<()> {
    let key = build_key(lock_and_cache, args)?;
    let locked = lock_and_cache.is_key_locked(&key).await?;
    let cached = lock_and_cache.is_key_cached(&key).await?;

    print_status_msg(StatusType::Key, key.storage_key());
    if locked {
        print_status_msg(StatusType::Locked, key.lock_key());
    } else {
        print_status_msg(StatusType::Unlocked, "not locked");
    }
    if cached {
        print_status_msg(StatusType::Cached, "value is cached");
    } else {
        print_status_msg(StatusType::Missing, "not cached");
    }
    Ok(())
}

pub(crate) async fn handle_clear(
    lock_and_cache: &LockAndCache,
    args: &KeyArgs,
) -> anyhow::Result<()> {
    let key = build_key(lock_and_cache, args)?;
    lock_and_cache.clear_key(&key).await?;

    print_status_msg(StatusType::Cleared, key.storage_key());
    if lock_and_cache.is_key_locked(&key).await? {
        print_status_msg(
            StatusType::Warning,
            "the key is locked; the holder will cache a new value when it finishes",
        );
    }
    Ok(())
}

pub(crate) async fn handle_flush_cache(
    lock_and_cache: &LockAndCache,
    args: &FlushArgs,
) -> anyhow::Result<()> {
    confirm(args, "cache")?;
    lock_and_cache.flush_cache().await?;
    print_status_msg(StatusType::Flushed, "cache store");
    Ok(())
}

pub(crate) async fn handle_flush_locks(
    lock_and_cache: &LockAndCache,
    args: &FlushArgs,
) -> anyhow::Result<()> {
    confirm(args, "lock")?;
    lock_and_cache.flush_locks().await?;
    print_status_msg(StatusType::Flushed, "lock store");
    Ok(())
}

fn confirm(args: &FlushArgs, store: &str) -> anyhow::Result<()> {
    if !args.yes {
        bail!("refusing to flush the {store} store without --yes");
    }
    Ok(())
}

fn build_key(lock_and_cache: &LockAndCache, args: &KeyArgs) -> anyhow::Result<Key> {
    let parts: Vec<Value> = args.parts.iter().map(|part| parse_part(part)).collect();

    let key = match (&args.context, &args.id) {
        (Some(context), Some(id)) => lock_and_cache
            .subject(context.clone(), parse_part(id))?
            .key(parts)?,
        _ => Key::new(parts)?,
    };
    debug!(%key, lock_key = key.lock_key(), "derived key");
    Ok(key)
}

fn parse_part(part: &str) -> Value {
    serde_json::from_str(part).unwrap_or_else(|_| Value::String(part.to_owned()))
}
