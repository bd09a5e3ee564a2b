use std::{fs, path::PathBuf};

use anyhow::{bail, Context};
use arena_runner::prelude::*;

fn usage() -> String {
    "usage: arena-runner <bot_directory> <matches.json>".to_string()
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let (Some(bot_directory), Some(matches_file)) = (args.next(), args.next()) else {
        bail!(usage());
    };
    let bot_directory = PathBuf::from(bot_directory);
    if !bot_directory.is_dir() {
        bail!("'{}' is not a directory\n{}", bot_directory.display(), usage());
    }

    let text = fs::read_to_string(&matches_file)
        .with_context(|| format!("could not read '{matches_file}'"))?;
    let matches: Vec<MatchConfig> = serde_json::from_str(&text)
        .with_context(|| format!("'{matches_file}' is not a list of matches"))?;

    let config = Configuration::from_env()?;
    let scheduler = MatchScheduler::new(bot_directory, config);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("could not start the async runtime")?;

    let results = runtime.block_on(async {
        tokio::select! {
            results = scheduler.run(matches) => results.map(Some),
            _ = tokio::signal::ctrl_c() => Ok(None),
        }
    })?;

    let Some(results) = results else {
        let killed = scheduler.shutdown();
        eprintln!("interrupted, {killed} processes killed");
        std::process::exit(130);
    };

    let exported = results.iter().map(MatchResult::to_json).collect::<Vec<_>>();
    println!("{}", serde_json::to_string_pretty(&exported)?);
    Ok(())
}
