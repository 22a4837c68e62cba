//! Scenario driver for the spindle runtime.
//!
//! Runs the end-to-end scenarios from `spindle_harness::scenarios`, logs
//! progress, and reports results as text or JSON.
//!
//! ```text
//! stress --scenario all
//! stress --scenario heap-fuzz --heap-iterations 10000 --json
//! RUST_LOG=debug stress --scenario prio-inherit
//! ```

use clap::{Parser, ValueEnum};

use spindle_harness::error::ScenarioError;
use spindle_harness::report::ScenarioReport;
use spindle_harness::scenarios;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    HeapFuzz,
    MutexConformance,
    JoinStates,
    CancelModes,
    PrioInherit,
    CondvarBroadcast,
    All,
}

#[derive(Parser, Debug)]
#[command(name = "stress", about = "Drive the spindle runtime end to end")]
struct Cli {
    /// Which scenario to run.
    #[arg(long, value_enum, default_value_t = Scenario::All)]
    scenario: Scenario,

    /// Iteration count for the heap fuzz.
    #[arg(long, default_value_t = 10_000)]
    heap_iterations: usize,

    /// Seed for the heap fuzz PRNG.
    #[arg(long, default_value_t = 0xdead_beef)]
    heap_seed: u32,

    /// Emit the reports as a JSON array on stdout.
    #[arg(long)]
    json: bool,
}

fn run_one(scenario: Scenario, cli: &Cli) -> Result<ScenarioReport, ScenarioError> {
    match scenario {
        Scenario::HeapFuzz => scenarios::heap_fuzz::run(cli.heap_iterations, cli.heap_seed),
        Scenario::MutexConformance => scenarios::mutex_conformance::run(),
        Scenario::JoinStates => scenarios::join_states::run(),
        Scenario::CancelModes => scenarios::cancel_modes::run(),
        Scenario::PrioInherit => scenarios::prio_inherit::run(),
        Scenario::CondvarBroadcast => scenarios::condvar_broadcast::run(),
        Scenario::All => unreachable!("expanded by the caller"),
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    spindle_harness::ensure_runtime();

    let selected: Vec<Scenario> = match cli.scenario {
        Scenario::All => vec![
            Scenario::HeapFuzz,
            Scenario::MutexConformance,
            Scenario::JoinStates,
            Scenario::CancelModes,
            Scenario::PrioInherit,
            Scenario::CondvarBroadcast,
        ],
        one => vec![one],
    };

    let mut reports = Vec::new();
    let mut failures = 0usize;
    for scenario in selected {
        log::info!("running {scenario:?}");
        match run_one(scenario, &cli) {
            Ok(report) => {
                log::info!("{}: ok", report.name);
                reports.push(report);
            }
            Err(e) => {
                log::error!("{scenario:?}: {e}");
                let mut report = ScenarioReport::new("failed");
                report.passed = false;
                report.note(format!("{scenario:?}: {e}"));
                reports.push(report);
                failures += 1;
            }
        }
    }

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&reports).expect("reports serialize")
        );
    } else {
        for report in &reports {
            println!(
                "[{}] {}",
                if report.passed { "PASS" } else { "FAIL" },
                report.name
            );
            for detail in &report.details {
                println!("    {detail}");
            }
        }
    }

    spindle_core::runtime::finit();
    if failures > 0 {
        std::process::exit(1);
    }
}
