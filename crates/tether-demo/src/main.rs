//! Tether demo CLI: drives the runtime primitives from the command line.
//!
//! ```text
//! tether timers --count 3 --delay 50
//! tether abort --timeout 100
//! tether events
//! tether fetch https://example.com/ --timeout 5000
//! ```

use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tether_runtime::{
    AbortController, AbortSignal, AddEventListenerOptions, Event, EventInit, FetchRequest,
    Listener, Runtime, RuntimeConfig, ScriptFunction, Value, fetch,
};
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(
    name = "tether",
    version,
    about = "Exercise the tether runtime from the command line"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Runtime config file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Worker threads (overrides config)
    #[arg(long, global = true)]
    workers: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an interval that clears itself after N ticks
    Timers {
        #[arg(long, default_value = "3")]
        count: u32,
        /// Interval in milliseconds
        #[arg(long, default_value = "50")]
        delay: f64,
    },

    /// Abort a long timer with AbortSignal.timeout
    Abort {
        /// Signal timeout in milliseconds
        #[arg(long, default_value = "100")]
        timeout: f64,
    },

    /// Dispatch a bubbling event through a three-level target chain
    Events,

    /// Fetch a URL and print the status and body size
    Fetch {
        url: String,
        #[arg(long, short = 'X', default_value = "GET")]
        method: String,
        /// Abort after this many milliseconds
        #[arg(long)]
        timeout: Option<f64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.parse()?))
        .init();

    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.worker_threads = workers.max(1);
    }

    let rt = Runtime::with_config(config)?;
    match cli.command {
        Commands::Timers { count, delay } => run_timers(&rt, count, delay)?,
        Commands::Abort { timeout } => run_abort(&rt, timeout)?,
        Commands::Events => run_events(&rt)?,
        Commands::Fetch {
            url,
            method,
            timeout,
        } => run_fetch(&rt, url, method, timeout)?,
    }

    let stats = rt.stats();
    info!(
        jobs = stats.jobs.jobs_completed,
        failed = stats.jobs.jobs_failed,
        "Done"
    );
    rt.dispose();
    Ok(())
}

fn run_timers(rt: &Runtime, count: u32, delay: f64) -> Result<()> {
    let ticks = Rc::new(Cell::new(0u32));
    let seen = ticks.clone();
    let tick = ScriptFunction::new("tick", move |_| {
        seen.set(seen.get() + 1);
        println!("tick {}", seen.get());
        Ok(Value::Undefined)
    });

    let id = rt.set_interval(&Value::Function(tick), &Value::from(delay), Vec::new())?;
    while ticks.get() < count {
        rt.run_until_idle_timeout(Duration::from_millis(1))?;
    }
    rt.clear_interval(&id.to_value());
    rt.run_until_idle()?;
    println!("interval {} cleared after {} ticks", id, ticks.get());
    Ok(())
}

fn run_abort(rt: &Runtime, timeout: f64) -> Result<()> {
    let deadline = AbortSignal::timeout(rt, timeout);
    let controller = AbortController::new(rt);
    let combined = AbortSignal::any(rt, &[deadline, controller.signal().clone()]);

    let fired = Rc::new(Cell::new(false));
    let flag = fired.clone();
    let long = ScriptFunction::new("long", move |_| {
        flag.set(true);
        Ok(Value::Undefined)
    });
    let id = rt.set_timeout(&Value::Function(long), &Value::from(timeout * 10.0), Vec::new())?;

    combined.target().add_event_listener(
        "abort",
        Listener::native(|event| {
            println!("{} event delivered", event.event_type());
            Ok(())
        }),
        AddEventListenerOptions::once(),
    );
    // Runs at once if the signal was aborted before this point.
    let delivered = Rc::new(Cell::new(false));
    let seen = delivered.clone();
    combined.on_abort(move |reason| {
        println!("signal aborted: {} ({:?})", reason, reason.kind());
        seen.set(true);
    });

    // The abort happens on a worker; the event arrives through a job.
    while !delivered.get() {
        rt.run_until_idle_timeout(Duration::from_millis(5))?;
    }
    rt.clear_timeout(&id.to_value());
    rt.run_until_idle()?;

    if fired.get() {
        bail!("long timer fired despite the abort");
    }
    println!("long timer {} cancelled", id);
    Ok(())
}

fn run_events(rt: &Runtime) -> Result<()> {
    let root = rt.event_target();
    let middle = rt.event_target();
    let leaf = rt.event_target();
    middle.set_parent(Some(&root));
    leaf.set_parent(Some(&middle));

    for (name, target) in [("root", &root), ("middle", &middle)] {
        target.add_event_listener(
            "ping",
            Listener::native(move |_| {
                println!("{name}: capture");
                Ok(())
            }),
            AddEventListenerOptions::capture(),
        );
        target.add_event_listener(
            "ping",
            Listener::native(move |_| {
                println!("{name}: bubble");
                Ok(())
            }),
            AddEventListenerOptions::default(),
        );
    }
    leaf.add_event_listener(
        "ping",
        Listener::native(|event| {
            println!("leaf: target (phase {:?})", event.event_phase());
            event.prevent_default();
            Ok(())
        }),
        AddEventListenerOptions::default(),
    );

    let event = Event::new(
        "ping",
        EventInit {
            bubbles: true,
            cancelable: true,
        },
    );
    let not_canceled = leaf.dispatch_event(&event)?;
    println!("dispatch returned {not_canceled}");
    Ok(())
}

fn run_fetch(rt: &Runtime, url: String, method: String, timeout: Option<f64>) -> Result<()> {
    let mut request = FetchRequest::get(url).method(method);
    if let Some(ms) = timeout {
        request = request.signal(AbortSignal::timeout(rt, ms));
    }

    let response = rt.block_on(&fetch(rt, request)?)?;
    println!("{} {}", response.status(), response.status_text());
    for (name, value) in response.headers() {
        println!("{name}: {value}");
    }

    let body = rt.block_on(&response.bytes(rt))?;
    match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(json) => println!("\n{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("\n<{} bytes>", body.len()),
    }
    if !response.ok() {
        bail!("request failed with status {}", response.status());
    }
    Ok(())
}
