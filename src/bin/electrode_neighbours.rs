//! Prints the neighbour table of a device layout.
//!
//! Examples:
//!   electrode-neighbours device.json
//!   electrode-neighbours --max-distance 1.0 device.json
//!   cat device.json | electrode-neighbours --electrode electrode042
//!
//! The input is the device model's `three-object` payload: a JSON array of
//! `{id, shape, translation, channel}` records.

use std::io::Read as _;
use std::path::PathBuf;
use std::process;

use electrode_nav::config::NavConfig;
use electrode_nav::layout::Layout;
use electrode_nav::neighbours::NeighbourResolver;
use tracing::{info, warn};

fn usage() -> ! {
    eprintln!("Usage: electrode-neighbours [options] [layout.json]\n");
    eprintln!("Reads stdin when no layout file is given.\n");
    eprintln!("Options:");
    eprintln!("  --config <file>          JSON config (resolver/controller/press sections)");
    eprintln!("  --max-distance <units>   Search reach (default 0.5)");
    eprintln!("  --steps <n>              Rays per direction (min 16, default 20)");
    eprintln!("  --electrode <id>         Only print this electrode's neighbours");
    process::exit(1);
}

struct Args {
    config: Option<PathBuf>,
    max_distance: Option<f64>,
    steps: Option<usize>,
    electrode: Option<String>,
    input: Option<PathBuf>,
}

fn parse_args() -> Args {
    let mut out = Args {
        config: None,
        max_distance: None,
        steps: None,
        electrode: None,
        input: None,
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = || args.next().unwrap_or_else(|| usage());
        match arg.as_str() {
            "--config" => out.config = Some(PathBuf::from(value())),
            "--max-distance" => {
                out.max_distance = Some(value().parse().unwrap_or_else(|_| usage()));
            }
            "--steps" => out.steps = Some(value().parse().unwrap_or_else(|_| usage())),
            "--electrode" => out.electrode = Some(value()),
            "-h" | "--help" => usage(),
            _ if arg.starts_with("--") => usage(),
            _ => out.input = Some(PathBuf::from(arg)),
        }
    }
    out
}

fn read_input(path: Option<&PathBuf>) -> Result<String, String> {
    match path {
        Some(p) => std::fs::read_to_string(p).map_err(|e| format!("read {}: {e}", p.display())),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| format!("read stdin: {e}"))?;
            Ok(buf)
        }
    }
}

fn run(args: Args) -> Result<(), String> {
    let mut cfg = match &args.config {
        Some(p) => NavConfig::load(p).map_err(|e| e.to_string())?,
        None => NavConfig::default(),
    };
    if let Some(d) = args.max_distance {
        cfg.resolver.max_distance = d;
    }
    if let Some(n) = args.steps {
        cfg.resolver.num_steps = n;
    }

    let layout = Layout::from_json(&read_input(args.input.as_ref())?).map_err(|e| e.to_string())?;
    info!("Loaded layout with {} electrodes", layout.len());
    for (id, err) in layout.malformed() {
        warn!("Skipping {}: {}", id, err);
    }

    let resolver = NeighbourResolver::new(cfg.resolver);
    let reach = resolver.max_distance();

    let out = match &args.electrode {
        Some(id) => {
            if !layout.contains(id) {
                return Err(format!("unknown electrode `{}`", id));
            }
            let map = resolver
                .find_all_neighbours(&layout, id, reach)
                .map_err(|e| format!("{id}: {e}"))?;
            serde_json::to_string_pretty(&map)
        }
        None => serde_json::to_string_pretty(&resolver.neighbour_table(&layout, reach)),
    }
    .map_err(|e| format!("serialize: {e}"))?;

    println!("{}", out);
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(parse_args()) {
        eprintln!("{}", e);
        process::exit(1);
    }
}
