use bpsync::{
    config::ProgramConfig, BehaviorError, Declaration, Error, Event, EventSet, Program, Termination,
};
use clap::{command, Parser};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const VISCOSITY: &str = "VISCOSITY";
const ADD_DRY: &str = "ADD_DRY";
const ADD_WET: &str = "ADD_WET";

/// Runs the viscosity-control program: a sensor reports readings, a mixer
/// proposes additions, and a limiter blocks the addition that would push the
/// mix further out of bounds.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file; defaults are used when it does not exist
    #[arg(short, long, default_value = "bpsync.json")]
    config: PathBuf,

    /// Viscosity bound enforced by the limiter
    #[arg(short, long, default_value_t = 2)]
    bound: i64,

    /// Sensor readings, in order
    #[arg(
        short,
        long,
        value_delimiter = ',',
        allow_hyphen_values = true,
        default_values_t = [3, -1, 2]
    )]
    readings: Vec<i64>,

    /// Block at the bound itself (>=) instead of strictly above it (>)
    #[arg(long)]
    inclusive_bound: bool,

    /// Enable debug mode
    #[arg(short, long)]
    verbose: bool,
}

fn additions() -> EventSet {
    EventSet::names([ADD_DRY, ADD_WET])
}

fn build_program(cli: &Cli, config: &ProgramConfig) -> Result<Program, Error> {
    let mut program = Program::new(config);

    let readings = cli.readings.clone();
    program.register_behavior("Sensor", move |mut ctx| async move {
        for reading in readings {
            ctx.request(Event::with_payload(VISCOSITY, reading)).await?;
            ctx.wait_for(additions()).await?;
        }
        Ok(())
    })?;

    program.register_behavior("Mixer", |mut ctx| async move {
        loop {
            ctx.wait_for(VISCOSITY).await?;
            ctx.sync(
                Declaration::new().requests([Event::new(ADD_DRY), Event::new(ADD_WET)]),
            )
            .await?;
        }
    })?;

    let bound = cli.bound;
    let inclusive = cli.inclusive_bound;
    program.register_behavior("ViscosityLimiter", move |mut ctx| async move {
        loop {
            let reading = ctx.wait_for(VISCOSITY).await?;
            let value = reading
                .payload()
                .as_i64()
                .ok_or_else(|| BehaviorError::failed(format!("{} without a reading", reading)))?;
            let (too_thick, too_thin) = if inclusive {
                (value >= bound, value <= -bound)
            } else {
                (value > bound, value < -bound)
            };
            let mut blocked = Vec::new();
            if too_thick {
                blocked.push(ADD_DRY);
            }
            if too_thin {
                blocked.push(ADD_WET);
            }
            ctx.sync(
                Declaration::new()
                    .wait_for(additions())
                    .block(EventSet::names(blocked)),
            )
            .await?;
        }
    })?;

    Ok(program)
}

async fn run(cli: &Cli) -> Result<(), Error> {
    let config = if cli.config.exists() {
        ProgramConfig::from_file(&cli.config)?
    } else {
        ProgramConfig::default()
    };

    info!("config loaded.");

    debug!("config: {:?}", config);

    let program = build_program(cli, &config)?;
    let summary = program.run().await?;

    for (round, event) in summary.trace.iter().enumerate() {
        println!("{:>4}  {}", round + 1, event);
    }
    match &summary.termination {
        Termination::Deadlock(report) if report.has_blocked_requests() => {
            println!("deadlock:\n{}", report)
        }
        Termination::Deadlock(_) => println!("quiescent after {} rounds", summary.rounds),
        other => println!("{} after {} rounds", other.kind(), summary.rounds),
    }
    for fault in &summary.faults {
        println!("fault: {}", fault);
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("bpsync=debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
