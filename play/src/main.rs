use std::path::Path;

use anyhow::{Context, bail};

use play::config::{Action, Config};
use play::pipeline::{self, DrainHandler};
use stream::Session;

fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env();
    let level = match cfg.verbosity {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 | 3 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let file = std::env::args().nth(1).context("usage: play <stream-file>")?;
    let session = Session::new();

    match cfg.action {
        Action::Info => pipeline::info_file(&session, &cfg, Path::new(&file))?,
        Action::Play => {
            let handler = DrainHandler::new();
            let monitor = handler.monitor();
            let (info, name, _date) =
                pipeline::play_file(&session, &cfg, Path::new(&file), Box::new(handler))?;
            for ((kind, id), totals) in monitor.finish() {
                println!(
                    "{kind:?} stream {id}: {} messages, {} data bytes ({} fps nominal)",
                    totals.data_messages, totals.data_bytes, info.fps
                );
            }
            log::info!("play: \"{name}\" done");
        }
        other => bail!("action {other:?} is handled by an external exporter"),
    }
    Ok(())
}
