#![forbid(unsafe_code)]

use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;

use wikiserv::cache::Lookup;
use wikiserv::config;
use wikiserv::output::{self, OutputArgs};
use wikiserv::prelude::*;
use wikiserv::search::Filter;
use wikiserv::server::Server;

#[derive(Parser)]
#[command(name = "wikiserv", version, about = "Read-only wiki/document server tools")]
struct Cli {
    /// Configuration file.
    #[arg(short, long, value_name = "CONFIG.TOML")]
    config: PathBuf,
    #[command(flatten)]
    output: OutputArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scrub the caches and exit without serving.
    Scrub,
    /// Transform one document and write the result to stdout.
    Render {
        /// Source-relative document path.
        path: String,
    },
    /// List documents matching the given terms.
    Search {
        /// Whitespace-separated path terms.
        #[arg(long)]
        path: Option<String>,
        /// Whitespace-separated content terms.
        #[arg(long)]
        content: Option<String>,
        #[arg(long, default_value_t = 0)]
        start: usize,
        #[arg(long, default_value_t = 100)]
        count: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    output::init(&cli.output);
    let mut config = config::load(&cli.config)?;

    match cli.command {
        Command::Scrub => {
            config.cache_options.auto_scrub = false;
            config.search_options.auto_scrub = false;
            config.dispatcher_thread = false;
            let server = Server::new(&config)?;
            server.scrub()?;
            server.close();
        }
        Command::Render { path } => {
            let server = Server::new(&config)?;
            let stdout = io::stdout();
            match server.lookup(&path)? {
                Lookup::Cached(mut entry) => {
                    io::copy(&mut entry, &mut stdout.lock())?;
                }
                Lookup::Bypass(auto) => {
                    let mut stream = server.stream(auto)?;
                    io::copy(&mut stream, &mut stdout.lock())?;
                    stream.finish()?;
                }
            }
            server.close();
        }
        Command::Search {
            path,
            content,
            start,
            count,
        } => {
            let server = Server::new(&config)?;
            let filter = Filter::compose(path.as_deref(), content.as_deref())?;
            let (files, _, has_more) =
                server.search(start, start + count, filter.as_ref())?;
            for info in &files {
                println!("{}\t{}\t{}", info.name, info.modified, info.size);
            }
            if has_more {
                info!(next_start = start + count, "more results available");
            }
            server.close();
        }
    }
    Ok(())
}
