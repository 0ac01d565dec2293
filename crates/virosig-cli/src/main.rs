//! # Virosig CLI
//!
//! Command-line interface for cellularized IFN / virus models.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use virosig_boxplot::{render_all, PlotOptions, SweepLayout, SweepMetrics};
use virosig_core::StepClock;
use virosig_network::{
    models, time_course, FixedStepIntegrator, IntegrationMethod, IntegratorConfig, ModelInstance,
};
use virosig_tissue::{Scenario, Simulation, SimulationConfig, Tissue, Traces};

#[derive(Parser)]
#[command(name = "virosig")]
#[command(version)]
#[command(about = "Cellularized interferon / viral replication models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScenarioArg {
    Coupled,
    Lumped,
}

impl From<ScenarioArg> for Scenario {
    fn from(arg: ScenarioArg) -> Self {
        match arg {
            ScenarioArg::Coupled => Scenario::Coupled,
            ScenarioArg::Lumped => Scenario::Lumped,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum MethodArg {
    Euler,
    Heun,
    Rk4,
}

impl From<MethodArg> for IntegrationMethod {
    fn from(arg: MethodArg) -> Self {
        match arg {
            MethodArg::Euler => IntegrationMethod::Euler,
            MethodArg::Heun => IntegrationMethod::Heun,
            MethodArg::Rk4 => IntegrationMethod::Rk4,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a tissue simulation on the built-in well-mixed host
    Run {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum)]
        scenario: Option<ScenarioArg>,
        /// Simulated hours
        #[arg(long)]
        hours: Option<f64>,
        #[arg(long)]
        seed: Option<u64>,
        /// Total cells in the tissue
        #[arg(long, default_value_t = 100)]
        cells: usize,
        /// Initially infected cells
        #[arg(long, default_value_t = 100)]
        infected: usize,
        /// Volume of every cell
        #[arg(long, default_value_t = 1.0)]
        volume: f64,
        /// Couple cells to the reference model instead of the field
        #[arg(long)]
        no_feedback: bool,
        /// Parameter override, NAME=VALUE (repeatable)
        #[arg(long = "set", value_parser = parse_assignment)]
        overrides: Vec<(String, f64)>,
        /// Parameter multiplier, NAME=FACTOR (repeatable)
        #[arg(long = "scale", value_parser = parse_assignment)]
        multipliers: Vec<(String, f64)>,
        /// Output directory
        #[arg(short, long, default_value = "output")]
        output: PathBuf,
    },

    /// Integrate one built-in network on its own
    Ode {
        #[arg(short, long, default_value = models::IFN_MODEL)]
        model: String,
        #[arg(long, default_value_t = 240.0)]
        hours: f64,
        /// Minutes per output step
        #[arg(long, default_value_t = 10.0)]
        minutes: f64,
        #[arg(long, value_enum, default_value_t = MethodArg::Rk4)]
        method: MethodArg,
        #[arg(long, default_value_t = 4)]
        substeps: usize,
        /// Parameter override, NAME=VALUE (repeatable)
        #[arg(long = "set", value_parser = parse_assignment)]
        overrides: Vec<(String, f64)>,
        /// Output CSV
        #[arg(short, long, default_value = "ode.csv")]
        output: PathBuf,
    },

    /// Box plots of a replicate parameter sweep
    Boxplot {
        /// Directory holding the replicate tables
        #[arg(short, long, default_value = "Data")]
        data: PathBuf,
        /// Swept parameter (k31 and beta have built-in multiplier lists)
        #[arg(short, long, default_value = "k31")]
        parameter: String,
        /// Multipliers, comma separated
        #[arg(long, value_delimiter = ',')]
        multipliers: Vec<f64>,
        #[arg(long)]
        replicates: Option<usize>,
        /// Data rows read per table
        #[arg(long)]
        rows: Option<usize>,
        /// Output directory for SVG figures
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// List built-in networks
    List,
}

fn parse_assignment(s: &str) -> Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {:?}", s))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("{}: {}", value, e))?;
    Ok((name.trim().to_string(), value))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            scenario,
            hours,
            seed,
            cells,
            infected,
            volume,
            no_feedback,
            overrides,
            multipliers,
            output,
        } => {
            let mut config = match (config, scenario) {
                (Some(path), _) => SimulationConfig::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                (None, Some(ScenarioArg::Lumped)) => SimulationConfig::lumped(),
                (None, _) => SimulationConfig::coupled(),
            };
            if let Some(scenario) = scenario {
                config.scenario = scenario.into();
            }
            if let Some(hours) = hours {
                config.duration_hours = hours;
            }
            if let Some(seed) = seed {
                config.seed = seed;
            }
            if no_feedback {
                config.feedback_enabled = false;
            }
            config.parameter_overrides.extend(overrides);
            config.parameter_multipliers.extend(multipliers);
            config.validate()?;

            if infected > cells {
                bail!("--infected ({}) exceeds --cells ({})", infected, cells);
            }
            run_tissue(config, Tissue::monolayer(cells, infected, volume), &output)?;
        }

        Commands::Ode {
            model,
            hours,
            minutes,
            method,
            substeps,
            overrides,
            output,
        } => {
            if !(minutes.is_finite() && minutes > 0.0) {
                bail!("--minutes must be a positive number, got {}", minutes);
            }
            if !(hours.is_finite() && hours >= 0.0) {
                bail!("--hours must be a non-negative number, got {}", hours);
            }
            if substeps == 0 {
                bail!("--substeps must be at least 1");
            }
            let network = models::by_name(&model)?;
            let mut instance = ModelInstance::new(Arc::new(network));
            for (name, value) in &overrides {
                instance.set(name, *value)?;
            }
            let clock = StepClock::new(minutes);
            let integrator = FixedStepIntegrator::new(IntegratorConfig {
                method: method.into(),
                substeps,
            });
            let steps = clock.steps_for_hours(hours) as usize;

            println!("{} {} for {} h", "Integrating".green().bold(), model.cyan(), hours);
            let result = time_course(&mut instance, &integrator, clock.hours_per_step(), steps)?;

            let mut writer = csv::Writer::from_path(&output)
                .with_context(|| format!("creating {}", output.display()))?;
            let mut header = vec!["hours".to_string()];
            header.extend(result.species.iter().cloned());
            writer.write_record(&header)?;
            for (i, t) in result.time.iter().enumerate() {
                let mut row = vec![t.to_string()];
                for name in &result.species {
                    row.push(result.concentrations[name][i].to_string());
                }
                writer.write_record(&row)?;
            }
            writer.flush()?;
            println!("  {} {}", "Wrote".green(), output.display());
        }

        Commands::Boxplot {
            data,
            parameter,
            multipliers,
            replicates,
            rows,
            output,
        } => {
            let mut layout = match parameter.as_str() {
                "k31" if multipliers.is_empty() => SweepLayout::k31(&data),
                "beta" if multipliers.is_empty() => SweepLayout::beta(&data),
                _ if multipliers.is_empty() => {
                    bail!("no built-in multipliers for {}; pass --multipliers", parameter)
                }
                _ => SweepLayout::new(&data, &parameter, multipliers),
            };
            if let Some(replicates) = replicates {
                layout.replicates = replicates;
            }
            if let Some(rows) = rows {
                layout.rows = rows;
            }
            let options = if parameter == "beta" {
                PlotOptions::beta()
            } else {
                PlotOptions::default()
            };

            println!(
                "{} {} sweep in {}",
                "Reading".green().bold(),
                parameter.cyan(),
                data.display()
            );
            let metrics = SweepMetrics::collect(&layout)?;
            for path in render_all(&metrics, &output, &options)? {
                println!("  {} {}", "Wrote".green(), path.display());
            }
        }

        Commands::List => {
            println!("{}", "Built-in networks:".green().bold());
            println!();
            for name in models::ALL {
                let network = models::by_name(name)?;
                let inputs = network.inputs();
                println!(
                    "  {:<9} {} species, {} reactions{}",
                    name.cyan(),
                    network.species().len(),
                    network.reactions().len(),
                    if inputs.is_empty() {
                        String::new()
                    } else {
                        format!(", inputs: {}", inputs.join(", "))
                    }
                );
            }
        }
    }

    Ok(())
}

fn run_tissue(config: SimulationConfig, tissue: Tissue, output: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(output).with_context(|| format!("creating {}", output.display()))?;

    let mut sim = Simulation::new(config.clone(), tissue)?;
    println!(
        "{} {:?} scenario, {} steps of {} min",
        "Running".green().bold(),
        config.scenario,
        sim.steps(),
        config.minutes_per_step
    );

    let pb = ProgressBar::new(sim.steps());
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg}\n{bar:40.cyan/blue} {pos}/{len} ({eta})")?
            .progress_chars("##-"),
    );

    let steps_path = output.join("steps.csv");
    let mut steps = csv::Writer::from_path(&steps_path)
        .with_context(|| format!("creating {}", steps_path.display()))?;
    let mut write_error = None;
    let summary = sim.run(|report| {
        if write_error.is_none() {
            if let Err(e) = steps.serialize(report) {
                write_error = Some(e);
            }
        }
        pb.set_message(format!("{:.1} h, {} infected", report.hours, report.infected));
        pb.inc(1);
    })?;
    pb.finish_and_clear();
    log::info!(
        "run finished after {} steps ({:.1} h), ledger residual {:.3e}",
        summary.steps,
        summary.hours,
        summary.field_balance
    );
    if let Some(e) = write_error {
        return Err(e).context("writing step reports");
    }
    steps.flush()?;

    let traces_path = output.join("traces.csv");
    write_traces(sim.traces(), &traces_path)?;

    let summary_path = output.join("summary.json");
    let mut json = serde_json::to_value(&summary)?;
    if let Some(map) = json.as_object_mut() {
        map.remove("reports");
        map.insert("config".into(), serde_json::to_value(&config)?);
    }
    serde_json::to_writer_pretty(File::create(&summary_path)?, &json)?;

    println!(
        "  {} deaths, final field total {:.4e}",
        summary.deaths.to_string().yellow(),
        summary.final_field_total
    );
    for path in [&steps_path, &traces_path, &summary_path] {
        println!("  {} {}", "Wrote".green(), path.display());
    }
    Ok(())
}

fn write_traces(traces: &Traces, path: &Path) -> anyhow::Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    let names = traces.names();
    if names.is_empty() {
        writer.write_record(["hours"])?;
        writer.flush()?;
        return Ok(());
    }

    let mut header = vec!["hours"];
    header.extend(names.iter().copied());
    writer.write_record(&header)?;

    let columns: Vec<_> = names.iter().filter_map(|n| traces.get(n)).collect();
    let rows = columns.iter().map(|s| s.len()).max().unwrap_or(0);
    for i in 0..rows {
        let t = columns.iter().find_map(|s| s.time.get(i)).copied().unwrap_or(f64::NAN);
        let mut row = vec![t.to_string()];
        for series in &columns {
            row.push(series.values.get(i).map(f64::to_string).unwrap_or_default());
        }
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}
