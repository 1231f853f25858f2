mod config;
mod ingest;

use std::io;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rtsp::{EventLoop, MediaChannelId, RtspServer};

use crate::config::{Args, Settings};
use crate::ingest::Ingest;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let settings = Settings::load(&args)?;

    let event_loop =
        Arc::new(EventLoop::with_config(settings.event_loop.clone()).context("starting event loop")?);
    let server = Arc::new(RtspServer::new(event_loop, settings.server.clone()));

    let mut ingests = Vec::new();
    for stream in &settings.streams {
        let session = stream.media_session();
        if stream.multicast {
            session
                .start_multicast()
                .with_context(|| format!("starting multicast for '{}'", stream.name))?;
        }
        let video = session
            .source(MediaChannelId::Channel0)
            .zip(stream.video)
            .map(|(source, codec)| (codec, source.payload_type));
        let id = server.add_session(session);
        if let Some(addr) = stream.ingest {
            ingests.push(Ingest::spawn(Arc::clone(&server), id, addr, video)?);
        }
    }

    let addr = server
        .start(&settings.host, settings.port)
        .with_context(|| format!("listening on {}:{}", settings.host, settings.port))?;
    for stream in &settings.streams {
        tracing::info!(url = %format!("rtsp://{addr}/{}", stream.name), "serving");
    }

    println!("RTSP server on {addr}, press Enter to stop");
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    drop(ingests);
    server.stop();
    Ok(())
}
