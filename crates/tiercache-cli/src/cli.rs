//! Exposes the command line application.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tiercache::caching::{BytesSerializer, CleanupStats, DiskCache, TMP_DIR};
use tiercache::config::Config;
use tiercache::{logging, metrics};

/// Tiercache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Clean up caches based on the configured retention.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,

        /// Names of the caches to clean up, defaults to all caches.
        caches: Vec<String>,
    },

    /// Remove all entries from caches.
    Clear {
        /// Names of the caches to clear, defaults to all caches.
        caches: Vec<String>,
    },

    /// Print the size of caches.
    Size {
        /// Names of the caches to inspect, defaults to all caches.
        caches: Vec<String>,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(bin_name = "tiercache", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: Nothing else runs yet, so modifying the environment is fine.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Cleanup { dry_run, caches } => {
            for_each_cache(&config, &caches, |cache| {
                let stats = cache.cleanup(dry_run)?;
                print_stats(cache, &stats, dry_run);
                Ok(())
            })
            .context("failed to clean up caches")?;
        }
        Command::Clear { caches } => {
            for_each_cache(&config, &caches, |cache| {
                cache.clear()?;
                println!("{}: cleared", cache.name());
                Ok(())
            })
            .context("failed to clear caches")?;
        }
        Command::Size { caches } => {
            let max_unused_for = match config.caches.disk.max_unused_for {
                Some(duration) => humantime::format_duration(duration).to_string(),
                None => "forever".to_owned(),
            };
            println!(
                "capacity: {} bytes, entries kept for: {}",
                config.caches.disk.max_capacity, max_unused_for
            );
            for_each_cache(&config, &caches, |cache| {
                println!("{}: {} bytes", cache.name(), cache.size());
                Ok(())
            })?;
        }
    }

    Ok(())
}

fn print_stats(cache: &DiskCache<Vec<u8>>, stats: &CleanupStats, dry_run: bool) {
    let removed = if dry_run { "would remove" } else { "removed" };
    println!(
        "{}: {} {} files ({} bytes), retained {} files ({} bytes)",
        cache.name(),
        removed,
        stats.removed_files,
        stats.removed_bytes,
        stats.retained_files,
        stats.retained_bytes,
    );
}

/// Runs `f` on every cache in `names`, or on all caches in the cache directory if `names` is
/// empty.
///
/// A failing cache does not stop the others, the first error is returned at the end.
fn for_each_cache<F>(config: &Config, names: &[String], mut f: F) -> Result<()>
where
    F: FnMut(&DiskCache<Vec<u8>>) -> Result<()>,
{
    let cache_dir = config.cache_dir.as_deref().ok_or_else(|| {
        anyhow!("no caching configured! Did you provide a path to your config file?")
    })?;

    let names = if names.is_empty() {
        cache_names(cache_dir)?
    } else {
        names.to_vec()
    };

    let mut first_error = None;
    for name in names {
        let result = DiskCache::open(&name, cache_dir, config.caches.disk, BytesSerializer)
            .with_context(|| format!("failed to open cache `{name}`"))
            .and_then(|cache| f(&cache));

        if let Err(err) = result {
            let stderr: &dyn std::error::Error = &*err;
            tracing::error!(stderr, "Failed to process cache `{}`", name);
            if first_error.is_none() {
                first_error = Some(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Lists the names of all caches in `cache_dir`, in alphabetical order.
fn cache_names(cache_dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = fs::read_dir(cache_dir)
        .with_context(|| format!("failed to read `{}`", cache_dir.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) if name != TMP_DIR && !name.starts_with('.') => names.push(name),
            _ => continue,
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from(["tiercache", "cleanup", "--dry-run", "images"]).unwrap();
        assert!(cli.config().is_none());
        match cli.command {
            Command::Cleanup { dry_run, caches } => {
                assert!(dry_run);
                assert_eq!(caches, ["images"]);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from(["tiercache", "size", "-c", "config.yml"]).unwrap();
        assert_eq!(cli.config(), Some(Path::new("config.yml")));
    }

    #[test]
    fn test_cache_names() {
        let dir = tiercache_test::tempdir();
        for name in ["thumbnails", "images", TMP_DIR] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("README"), b"").unwrap();

        assert_eq!(cache_names(dir.path()).unwrap(), ["images", "thumbnails"]);
    }

    #[test]
    fn test_for_each_cache() {
        let dir = tiercache_test::tempdir();
        let config = Config {
            cache_dir: Some(dir.path().to_owned()),
            ..Default::default()
        };

        let cache =
            DiskCache::<Vec<u8>>::open("images", dir.path(), config.caches.disk, BytesSerializer)
                .unwrap();
        cache.set_bytes("a", b"hello").unwrap();

        let mut sizes = Vec::new();
        for_each_cache(&config, &[], |cache| {
            sizes.push((cache.name().to_owned(), cache.size()));
            Ok(())
        })
        .unwrap();
        assert_eq!(sizes, [("images".to_owned(), 5)]);

        // an invalid name does not stop the others
        let names = ["tmp".to_owned(), "images".to_owned()];
        let mut visited = 0;
        let result = for_each_cache(&config, &names, |_| {
            visited += 1;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(visited, 1);

        assert!(for_each_cache(&Config::default(), &[], |_| Ok(())).is_err());
    }
}
