//! Command-line driver for the engine.
//!
//! Examples:
//!   singularity-cli demo
//!   singularity-cli demo --steps 500 --state-size 256 --categories 5,3 --save run.dsng
//!   singularity-cli inspect run.dsng --state-size 256 --categories 5,3
//!   singularity-cli config > tuned.json
//!   singularity-cli demo --config tuned.json --tier simd
//!
//! Logging goes to stderr through `tracing`; reports go to stdout as JSON.

use std::fs;
use std::process;

use singularity::observer::EngineAdapter;
use singularity::prng::Prng;
use singularity::{ExecutionTier, Singularity, SingularityConfig, SingularityError};

fn usage() -> ! {
    eprintln!("singularity-cli: drive and inspect a wave-state decision engine\n");
    eprintln!("Usage: singularity-cli <command> [options]\n");
    eprintln!("Commands:");
    eprintln!("  demo                        Run a synthetic contextual task and print a report");
    eprintln!("  inspect <snapshot>          Load a snapshot and print its report");
    eprintln!("  config                      Print the default configuration as JSON");
    eprintln!("  help                        Show this message\n");
    eprintln!("Options:");
    eprintln!("  --state-size <n>            State vector length (default 128)");
    eprintln!("  --categories <a,b,..>       Action category sizes (default 5,3)");
    eprintln!("  --steps <n>                 Demo steps (default 300)");
    eprintln!("  --seed <n>                  Exploration seed (default 42)");
    eprintln!("  --tier <scalar|simd|parallel>  Projection tier");
    eprintln!("  --config <file.json>        Load tunables from JSON");
    eprintln!("  --save <file>               Write a snapshot after the demo");
    process::exit(1);
}

struct Options {
    state_size: usize,
    categories: Vec<usize>,
    steps: usize,
    seed: u64,
    tier: ExecutionTier,
    config: Option<String>,
    save: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            state_size: 128,
            categories: vec![5, 3],
            steps: 300,
            seed: 42,
            tier: ExecutionTier::Scalar,
            config: None,
            save: None,
        }
    }
}

fn parse_options(args: &[String]) -> (Options, Vec<String>) {
    let mut opts = Options::default();
    let mut positional = Vec::new();
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        let mut value = || it.next().cloned().unwrap_or_else(|| usage());
        match arg.as_str() {
            "--state-size" => opts.state_size = parse_num(&value()),
            "--steps" => opts.steps = parse_num(&value()),
            "--seed" => opts.seed = parse_num(&value()),
            "--categories" => {
                opts.categories = value().split(',').map(|s| parse_num(s.trim())).collect()
            }
            "--tier" => {
                let v = value();
                opts.tier = ExecutionTier::parse(&v).unwrap_or_else(|| {
                    eprintln!("unknown tier: {v}");
                    usage()
                });
            }
            "--config" => opts.config = Some(value()),
            "--save" => opts.save = Some(value()),
            s if s.starts_with("--") => {
                eprintln!("unknown option: {s}");
                usage();
            }
            _ => positional.push(arg.clone()),
        }
    }
    (opts, positional)
}

fn parse_num<T: std::str::FromStr>(s: &str) -> T {
    s.parse().unwrap_or_else(|_| {
        eprintln!("not a number: {s}");
        usage()
    })
}

fn load_config(opts: &Options) -> Result<SingularityConfig, String> {
    let cfg = match &opts.config {
        Some(path) => {
            let json = fs::read_to_string(path).map_err(|e| format!("{path}: {e}"))?;
            SingularityConfig::from_json_str(&json).map_err(|e| format!("{path}: {e}"))?
        }
        None => SingularityConfig::default(),
    };
    Ok(cfg.with_seed(opts.seed))
}

fn build(opts: &Options) -> Result<Singularity, String> {
    let cfg = load_config(opts)?;
    let mut engine = Singularity::with_config(opts.state_size, &opts.categories, cfg)
        .map_err(|e| e.to_string())?;
    engine.set_execution_tier(opts.tier);
    if engine.execution_tier().effective() != opts.tier {
        tracing::warn!(
            requested = opts.tier.as_str(),
            effective = engine.execution_tier().effective().as_str(),
            "execution tier not compiled in, falling back"
        );
    }
    Ok(engine)
}

/// Contextual task: one of `contexts` cues is shown per step and each
/// category has one correct action per cue. Condition id = cue, so a rule for
/// cue 0 can be registered up front.
fn run_demo(opts: &Options) -> Result<(), String> {
    let mut engine = build(opts)?;
    let contexts = opts.categories[0];
    let obs_len = contexts + 2;
    let mut env = Prng::new(opts.seed ^ 0xD1CE);

    let hint = correct_action(0, opts.categories[0]);
    engine
        .register_rule(0, hint, 0.5)
        .map_err(|e| e.to_string())?;

    let mut window_hits = 0usize;
    let window = 50;
    for step in 0..opts.steps {
        let cue = env.gen_range_usize(0, contexts);
        let mut obs = vec![0.0f32; obs_len];
        obs[cue] = 1.0;
        obs[contexts] = env.next_f32_01() * 0.1;
        obs[contexts + 1] = (step as f32 * 0.1).sin() * 0.05;

        engine.set_active_conditions(&[cue as i32]);
        let actions = engine.select_actions(&obs).map_err(|e| e.to_string())?;

        let correct = actions
            .iter()
            .zip(&opts.categories)
            .filter(|&(&a, &size)| a == correct_action(cue, size))
            .count();
        let reward = if correct == actions.len() {
            1.0
        } else {
            correct as f32 / actions.len() as f32 - 0.5
        };
        engine.learn(reward).map_err(|e| e.to_string())?;
        engine.decay_tick();

        if correct == actions.len() {
            window_hits += 1;
        }
        if (step + 1) % window == 0 {
            let status = engine.status();
            tracing::info!(
                step = step + 1,
                accuracy = window_hits as f32 / window as f32,
                temperature = status.temperature,
                phase = status.phase.as_str(),
                attractors = status.attractors,
                "demo progress"
            );
            window_hits = 0;
        }
    }

    if let Some(path) = &opts.save {
        engine.save_to_file(path).map_err(|e| e.to_string())?;
        tracing::info!(
            path = path.as_str(),
            bytes = engine.snapshot_size_bytes().unwrap_or(0),
            "snapshot written"
        );
    }
    print_report(&engine)
}

fn correct_action(cue: usize, size: usize) -> usize {
    (cue * 7 + 3) % size
}

fn run_inspect(opts: &Options, path: &str) -> Result<(), String> {
    let mut engine = build(opts)?;
    match engine.load_from_file(path) {
        Ok(()) => print_report(&engine),
        Err(SingularityError::IncompatibleConfiguration(msg)) => Err(format!(
            "{msg}; pass the matching --state-size and --categories"
        )),
        Err(e) => Err(format!("{path}: {e}")),
    }
}

fn print_report(engine: &Singularity) -> Result<(), String> {
    let report = EngineAdapter::new(engine).report();
    let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(())
}

fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        usage();
    };
    let (opts, positional) = parse_options(rest);

    let result = match command.as_str() {
        "demo" => run_demo(&opts),
        "inspect" => match positional.first() {
            Some(path) => run_inspect(&opts, path),
            None => usage(),
        },
        "config" => serde_json::to_string_pretty(&SingularityConfig::default())
            .map(|json| println!("{json}"))
            .map_err(|e| e.to_string()),
        "help" | "--help" | "-h" => usage(),
        other => {
            eprintln!("unknown command: {other}");
            usage()
        }
    };

    if let Err(msg) = result {
        tracing::error!("{msg}");
        process::exit(2);
    }
}
