use anyhow::{Result, bail};
use clap::Parser;
use evnet::{EventLoop, TimerId};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;
use tracing::{Level, info};

/// Walks through one-shot, repeating and reset timers, then stops.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Delay before the configurable timer first fires [default: 2]
    init: Option<u64>,

    /// Repeat interval of the configurable timer; 0 fires once [default: 0
    /// with INIT, 1 without]
    #[arg(requires = "init")]
    interval: Option<u64>,

    /// Milliseconds per time unit
    #[arg(long, default_value_t = 1000)]
    unit_ms: u64,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Without arguments the timer repeats; a lone INIT makes it one-shot.
fn schedule(args: &Args) -> (u64, u64) {
    match (args.init, args.interval) {
        (None, _) => (2, 1),
        (Some(init), interval) => (init, interval.unwrap_or(0)),
    }
}

fn scaled(units: u64, unit_ms: u64) -> Result<Duration> {
    match units.checked_mul(unit_ms) {
        Some(ms) => Ok(Duration::from_millis(ms)),
        None => bail!("{units} units of {unit_ms}ms overflow"),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.unit_ms == 0 {
        bail!("--unit-ms must be positive");
    }

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let (init, interval) = schedule(&args);
    let unit = |n: u64| scaled(n, args.unit_ms);
    info!(init, interval, "starting");

    let mut lp = EventLoop::new(1024)?;

    let mut repeats = 0;
    lp.add_timer(unit(init)?, unit(interval)?, move |lp, id| {
        repeats += 1;
        info!("repeat timer: {repeats}");
        if repeats == 6 {
            info!("repeat timer is good");
            lp.reset_timer(id, Duration::ZERO, Duration::ZERO);
        }
    });

    let mut normal = 0;
    let normal_timer = lp.add_timer(unit(12)?, unit(2)?, move |lp, id| {
        normal += 1;
        info!("normal timer trigger: {normal}");
        if normal == 5 {
            info!("reset timer is good");
            lp.reset_timer(id, Duration::ZERO, Duration::ZERO);
            lp.stop();
        }
    });

    // Fires between the normal timer's 3rd and 4th firings and pushes the
    // 4th out to a fresh 2-unit period.
    let resets = Rc::new(Cell::new(0));
    let counter = resets.clone();
    let period = unit(2)?;
    lp.add_timer(unit(12 + 2 + 2 + 1)?, Duration::ZERO, move |lp, _: TimerId| {
        counter.set(counter.get() + 1);
        lp.reset_timer(normal_timer, period, period);
    });

    lp.run()?;
    info!(resets = resets.get(), "done");

    Ok(())
}
