//! festivus daemon entry point

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use festivus::attr::Owner;
use festivus::config::{Config, IndexConfig, Overrides};
use festivus::fs::BucketFs;
use festivus::index::{MemoryIndex, MetadataIndex, RedisIndex};
use festivus::mount;
use festivus::store::S3Store;

/// Print usage information
fn print_usage() {
    eprintln!("Usage: festivus <config.yaml> [--init] [--debug]");
    eprintln!();
    eprintln!("festivus - mount an object storage bucket with a Redis metadata index");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  config.yaml    Path to configuration file");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --init         Index the whole bucket before mounting");
    eprintln!("  --debug        Log at debug level");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  festivus /etc/festivus/photos.yaml --init");
}

/// Parsed command line
#[derive(Debug, PartialEq, Eq)]
struct Args {
    config_path: PathBuf,
    overrides: Overrides,
}

fn parse_args(args: &[String]) -> Option<Args> {
    let mut config_path = None;
    let mut overrides = Overrides::default();

    for arg in args {
        match arg.as_str() {
            "--init" => overrides.init = true,
            "--debug" => overrides.debug = true,
            flag if flag.starts_with('-') => return None,
            path if config_path.is_none() => config_path = Some(PathBuf::from(path)),
            _ => return None,
        }
    }

    config_path.map(|config_path| Args {
        config_path,
        overrides,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&argv) {
        Some(a) => a,
        None => {
            print_usage();
            std::process::exit(1);
        }
    };

    // Load configuration
    let mut config = match Config::from_file(&args.config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    config.apply(args.overrides);

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level()));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("festivus starting");
    info!("Loaded configuration from {:?}", args.config_path);

    let index: Arc<dyn MetadataIndex> = match &config.index {
        IndexConfig::Redis { url, .. } => {
            Arc::new(RedisIndex::connect(url, config.retry.clone()).await?)
        }
        IndexConfig::Memory { .. } => {
            if !config.mount.init {
                warn!("Memory index starts empty; indexing the bucket before mounting");
                config.mount.init = true;
            }
            Arc::new(MemoryIndex::new())
        }
    };

    let store = Arc::new(S3Store::new(&config.bucket, config.retry.clone()).await?);
    let owner = Owner::current(config.mount.uid, config.mount.gid);
    let fs = Arc::new(BucketFs::new(
        index,
        store,
        config.index.key_space(),
        owner,
        config.mount.read_only,
    ));

    if config.mount.init {
        match fs.reindex().await {
            Ok(report) => info!(
                "Indexed {} objects ({} skipped)",
                report.indexed, report.skipped
            ),
            Err(e) => {
                error!("Indexing failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    let path = config.mount.path.clone();
    if !path.exists() {
        debug!("Creating mount point directory {:?}", path);
        std::fs::create_dir_all(&path)?;
    }
    let options = mount::mount_options(&config.bucket.name, config.mount.read_only);
    let log_requests = config.mount.debug;

    if config.mount.foreground {
        // The session loop blocks; keep it off the async workers
        tokio::task::spawn_blocking(move || {
            mount::mount_foreground(fs, &path, &options, log_requests)
        })
        .await??;
        info!("Exiting");
        return Ok(());
    }

    let mut active = mount::mount_background(fs, &path, &options, log_requests)?;

    // Set up signal handling for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })?;

    info!("Press Ctrl+C to unmount and exit");

    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
    }

    info!("Shutting down");
    active.unmount();
    info!("Unmounted, exiting");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        let parsed = parse_args(&argv(&["cfg.yaml", "--init"])).unwrap();
        assert_eq!(parsed.config_path, PathBuf::from("cfg.yaml"));
        assert!(parsed.overrides.init);
        assert!(!parsed.overrides.debug);

        let parsed = parse_args(&argv(&["--debug", "cfg.yaml"])).unwrap();
        assert!(parsed.overrides.debug);
    }

    #[test]
    fn test_parse_args_rejects_bad_input() {
        assert_eq!(parse_args(&argv(&[])), None);
        assert_eq!(parse_args(&argv(&["a.yaml", "b.yaml"])), None);
        assert_eq!(parse_args(&argv(&["a.yaml", "--bogus"])), None);
    }
}
