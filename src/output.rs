use clap::Args;
use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Args)]
pub struct OutputArgs {
    /// Increase verbosity. (Can be repeated.)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Reduce verbosity. (Can be repeated.)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    quiet: u8,
}

pub fn init(args: &OutputArgs) {
    let verbosity = i16::from(args.verbose) - i16::from(args.quiet);
    let level = match verbosity {
        2.. => LevelFilter::TRACE,
        1 => LevelFilter::DEBUG,
        0 => LevelFilter::INFO,
        -1 => LevelFilter::WARN,
        _ => LevelFilter::ERROR,
    };

    // Some dependencies still emit through `log`.
    let _ = tracing_log::LogTracer::init();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .with_env_var("WIKISERV_DEBUG")
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
