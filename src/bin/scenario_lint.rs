use clap::{App, Arg};
use nspwheel::registers;
use nspwheel::scenario::{EventAction, Scenario};
use std::process;

fn describe(action: &EventAction) -> String {
    match *action {
        EventAction::CorruptCrc { count }
        | EventAction::DropFrames { count }
        | EventAction::DuplicateFrames { count } => format!("count={count}"),
        EventAction::DelayFrames { count, delay_ms } => {
            format!("count={count} delay={delay_ms}ms")
        }
        EventAction::StuckRegister {
            address,
            value,
            duration_ms,
        } => {
            let name = registers::lookup(address).map_or("?", |(_, def)| def.name);
            format!("{name} (0x{address:04X}) raw=0x{value:X} for {duration_ms}ms")
        }
        EventAction::ForceTrip { fault } => format!("fault={}", fault.name()),
        EventAction::ClampPhysics { clamp, duration_ms } => format!(
            "{}={} for {duration_ms}ms",
            clamp.quantity.name(),
            clamp.value
        ),
    }
}

fn lint(path: &str, quiet: bool) -> Result<(), String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("{path}: {e}"))?;
    let scenario = Scenario::from_json(&text).map_err(|e| format!("{path}: {e}"))?;
    if quiet {
        return Ok(());
    }

    println!("{path}: `{}` ok, {} events", scenario.name, scenario.events.len());
    if !scenario.description.is_empty() {
        println!("  {}", scenario.description);
    }
    for event in &scenario.events {
        println!(
            "  +{:>7}ms  {:<10} {:<9} {}",
            event.offset_ms,
            event.action.target().name(),
            event.action.action_name(),
            describe(&event.action)
        );
    }
    Ok(())
}

fn main() {
    let matches = App::new("scenario-lint")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Validate fault-injection scenario files and print their timelines")
        .arg(
            Arg::with_name("quiet")
                .short("q")
                .long("quiet")
                .help("Only report errors"),
        )
        .arg(
            Arg::with_name("FILE")
                .help("Scenario files to check")
                .required(true)
                .multiple(true),
        )
        .get_matches();

    let quiet = matches.is_present("quiet");
    let mut failures = 0;
    for path in matches.values_of("FILE").into_iter().flatten() {
        if let Err(message) = lint(path, quiet) {
            eprintln!("error: {message}");
            failures += 1;
        }
    }
    if failures > 0 {
        process::exit(1);
    }
}
