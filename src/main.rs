//! Headless host: wires the core together and runs downloads from argv.

use std::sync::Arc;

use anyhow::{Context, Result, bail};

use mediagrab::USER_AGENT;
use mediagrab::events::{AppEvent, EventBus, JobEvent};
use mediagrab::jobs::DownloadQueue;
use mediagrab::jobs::thumbnails::ThumbnailCache;
use mediagrab::net::{HttpClient, HttpClientOptions};
use mediagrab::process::SystemProcessTree;
use mediagrab::settings::{SettingsStore, default_data_dir};

fn print_usage() {
    eprintln!("usage: mediagrab [--audio] <url>...");
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut audio_only = false;
    let mut urls = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--audio" | "-a" => audio_only = true,
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            _ => urls.push(arg),
        }
    }

    if urls.is_empty() {
        print_usage();
        bail!("no URLs given");
    }

    let data_dir = default_data_dir();
    let settings = Arc::new(
        SettingsStore::load(data_dir.join("settings.json")).context("loading settings")?,
    );

    let events = EventBus::default();
    let mut receiver = events.subscribe();

    let thumbnail_http = HttpClient::new(HttpClientOptions::new("Thumbnails", USER_AGENT))
        .context("building HTTP client")?;
    let thumbnails = ThumbnailCache::new(thumbnail_http, data_dir.join("thumbnail_cache"));

    let queue = DownloadQueue::new(
        settings,
        events,
        Arc::new(SystemProcessTree),
        Some(thumbnails),
    );

    let total = urls.len();
    for url in urls {
        queue.enqueue(url, audio_only);
    }

    let mut finished = 0usize;
    while finished < total {
        match receiver.recv().await {
            Ok(AppEvent::Job(event)) => match event {
                JobEvent::Output { line, .. } => println!("{line}"),
                JobEvent::Progress { id, percent } => log::info!("job {id}: {percent}%"),
                JobEvent::Finished { session } => {
                    finished += 1;
                    log::info!(
                        "job {} for {} finished: {:?}",
                        session.id,
                        session.url,
                        session.state
                    );
                }
                _ => {}
            },
            Ok(_) => {}
            Err(err) => bail!("event stream closed unexpectedly: {err}"),
        }
    }

    Ok(())
}
