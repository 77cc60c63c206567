mod cli;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{debug, info, warn};

use cli::{Cli, Command};
use songsearch::backends::acoustid::AcoustIdClient;
use songsearch::backends::musicbrainz::MusicBrainzClient;
use songsearch::config::{default_config_path, load_or_create_config, Config, EnrichmentCredentials};
use songsearch::db_manager::DbManager;
use songsearch::library::duplicate_clustering::find_duplicates;
use songsearch::library::duplicate_resolution::{pick_keeper, resolve_move_others};
use songsearch::library::library_enrichment_manager::{
    EnrichOptions, LibraryEnrichmentManager, ServiceIntervals,
};
use songsearch::protocol::TrackRecord;

fn init_logging(verbose: bool) {
    let mut clog = colog::default_builder();
    clog.filter(
        None,
        if verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        },
    );
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

fn install_cancel_handler(cancel_flag: Arc<AtomicBool>) {
    if let Err(error) = ctrlc::set_handler(move || {
        info!("Interrupt received, stopping after the current item");
        cancel_flag.store(true, Ordering::Relaxed);
    }) {
        warn!("Cannot install Ctrl-C handler: {}", error);
    }
}

fn describe_track(track: &TrackRecord) -> String {
    let show = |value: Option<String>| value.unwrap_or_else(|| "?".to_string());
    format!(
        "{} [{} {}kbps {}B {}s]",
        track.path,
        show(track.format.clone()),
        show(track.bitrate.map(|bitrate| bitrate.to_string())),
        show(track.file_size.map(|size| size.to_string())),
        show(track.duration.map(|duration| format!("{duration:.1}"))),
    )
}

fn run_enrich(
    db_manager: DbManager,
    config: &Config,
    limit: Option<usize>,
    min_confidence: Option<f64>,
    write_tags: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let credentials = EnrichmentCredentials::from_env()?;
    let mut options = EnrichOptions::from(&config.enrichment);
    if let Some(min_confidence) = min_confidence {
        options.min_confidence = min_confidence.clamp(0.0, 1.0);
    }
    options.write_tags |= write_tags;
    let limit = limit.unwrap_or(config.enrichment.limit);

    let timeout = Duration::from_secs(config.enrichment.request_timeout_secs);
    let manager = LibraryEnrichmentManager::new(
        db_manager,
        Box::new(AcoustIdClient::new(&config.enrichment.fpcalc_path, timeout)),
        Box::new(MusicBrainzClient::new(timeout)),
        ServiceIntervals::from(&config.enrichment),
    );
    install_cancel_handler(manager.cancel_handle());

    let enriched = manager.enrich_library_with(&credentials, limit, &options)?;
    for track in &enriched {
        info!(
            "{} -> {} / {} ({:.2}{})",
            track.path,
            track.candidate.artist.as_deref().unwrap_or("?"),
            track.candidate.title.as_deref().unwrap_or("?"),
            track.candidate.confidence,
            if track.from_cache { ", cached" } else { "" }
        );
    }
    info!("Updated {} track(s)", enriched.len());
    Ok(())
}

fn run_dupes(
    db_manager: DbManager,
    config: &Config,
    move_to: Option<PathBuf>,
    no_preview: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let clusters = find_duplicates(db_manager.duplicate_scan_rows()?);
    info!("{} group(s) of possible duplicates", clusters.len());

    if !no_preview {
        for (index, cluster) in clusters
            .iter()
            .take(config.duplicates.preview_limit)
            .enumerate()
        {
            let keeper_path = pick_keeper(cluster).map(|keeper| keeper.path.as_str());
            info!("Group {}:", index + 1);
            for track in cluster {
                let marker = if Some(track.path.as_str()) == keeper_path {
                    "*"
                } else {
                    " "
                };
                info!("  {} {}", marker, describe_track(track));
            }
        }
        if clusters.len() > config.duplicates.preview_limit {
            info!(
                "... {} more group(s) not shown",
                clusters.len() - config.duplicates.preview_limit
            );
        }
    }

    let Some(dest) = move_to.or_else(|| config.duplicates.move_to.as_ref().map(PathBuf::from))
    else {
        debug!("No destination configured, leaving duplicates in place");
        return Ok(());
    };
    let dest = expand_home(&dest);

    let cancel_flag = Arc::new(AtomicBool::new(false));
    install_cancel_handler(Arc::clone(&cancel_flag));
    let (mut moved, mut failed, mut skipped) = (0usize, 0usize, 0usize);
    for cluster in &clusters {
        if cancel_flag.load(Ordering::Relaxed) {
            info!("Interrupted, remaining groups left in place");
            break;
        }
        let resolution = resolve_move_others(&db_manager, cluster, &dest)?;
        moved += resolution.applied.len();
        failed += resolution.failed.len();
        skipped += resolution.skipped.len();
    }
    info!(
        "Moved {} duplicate(s) to {} ({} failed, {} already gone)",
        moved,
        dest.display(),
        failed,
        skipped
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli
        .config
        .clone()
        .or_else(default_config_path)
        .ok_or("cannot determine a config directory; pass --config")?;
    let config = load_or_create_config(&config_path)?;

    let db_path = cli
        .db
        .clone()
        .or_else(|| config.database.path.as_deref().map(|path| expand_home(Path::new(path))))
        .or_else(DbManager::default_path)
        .ok_or("cannot determine a data directory; pass --db")?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    debug!("Using database {}", db_path.display());
    let db_manager = DbManager::open(&db_path)?;

    match cli.command {
        Command::Enrich {
            limit,
            min_confidence,
            write_tags,
        } => run_enrich(db_manager, &config, limit, min_confidence, write_tags),
        Command::Dupes {
            move_to,
            no_preview,
        } => run_dupes(db_manager, &config, move_to, no_preview),
    }
}
