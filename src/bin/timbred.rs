//! timbred - the audio server daemon.

use clap::Parser;
use timbre::config::EngineConfigBuilder;
use timbre::driver::DummyDriver;
use timbre::engine::Engine;
use timbre::factory;

#[derive(Parser)]
#[command(name = "timbred")]
#[command(author, version, about = "Low-latency audio server", long_about = None)]
struct Cli {
    /// Run the cycle thread under SCHED_FIFO and start the watchdog.
    #[arg(short = 'R', long)]
    realtime: bool,

    /// Realtime priority for the cycle thread (1-98).
    #[arg(short = 'P', long, default_value_t = 10)]
    priority: i32,

    /// Emit per-cycle diagnostics.
    #[arg(short, long)]
    verbose: bool,

    /// Non-realtime client timeout in milliseconds.
    #[arg(short = 't', long, default_value_t = 500)]
    timeout: u32,

    /// Capacity of the port table.
    #[arg(short = 'p', long, default_value_t = 128)]
    port_max: u32,

    /// Directory for sockets and FIFOs.
    #[arg(long)]
    server_dir: Option<std::path::PathBuf>,

    /// Driver to load from the factory table.
    #[arg(short, long, default_value = "dummy")]
    driver: String,

    /// Argument string handed to the driver factory.
    #[arg(long, default_value = "")]
    driver_args: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    factory::register_driver("dummy", DummyDriver::from_args);

    let mut builder = EngineConfigBuilder::default();
    builder
        .realtime(cli.realtime)
        .rtpriority(cli.priority)
        .verbose(cli.verbose)
        .client_timeout_msecs(cli.timeout)
        .port_max(cli.port_max);
    if let Some(dir) = cli.server_dir {
        builder.server_dir(dir);
    }
    let cfg = builder.build()?;

    let engine = Engine::new(cfg)?;
    let mut driver = factory::make_driver(&cli.driver, &cli.driver_args)?;
    engine.attach_driver(&cli.driver, driver.as_mut())?;

    let result = timbre::driver::run(&engine, driver);
    engine.shutdown();
    result?;
    Ok(())
}
