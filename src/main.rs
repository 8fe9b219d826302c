// ETS Harmonizer - command line entry point
//
// Exit codes: 0 on success, 1 on any configuration or data error.

use anyhow::{Context, Result};
use ets_harmonize::cli::{
    AggregateArgs, AlphaArgs, CaliforniaArgs, Cli, Command, EuEtsArgs, MapCodesArgs, RunArgs, UkEtsArgs,
    WashingtonArgs,
};
use ets_harmonize::config::{CaliforniaSource, Config, EuEtsSource, UkEtsSource, WashingtonSource};
use ets_harmonize::harmonizers::UkEtsColumns;
use ets_harmonize::output::{read_facility_csv, write_csv};
use ets_harmonize::schema::{AllocationMetric, FACILITY_COLUMNS, SECTOR_COLUMNS};
use ets_harmonize::{aggregate, pipeline, Concordance, RawTable};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::FmtSubscriber;

fn main() {
    let cli = Cli::parse_args();

    if let Err(e) = init_logging(&cli) {
        eprintln!("⚠️  Logging disabled: {:#}", e);
    }
    debug!("Arguments: {:?}", cli);

    if let Err(e) = dispatch(cli.command) {
        eprintln!("\n❌ Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Initialize logging based on verbosity flags
fn init_logging(cli: &Cli) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Run(args) => run_pipeline(&args),
        Command::Euets(args) => run_euets(args),
        Command::Ukets(args) => run_ukets(args),
        Command::California(args) => run_california(args),
        Command::Washington(args) => run_washington(args),
        Command::Aggregate(args) => run_aggregate(&args),
        Command::MapCodes(args) => run_map_codes(&args),
        Command::InitConfig { output } => init_config(output.as_deref()),
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

fn run_pipeline(args: &RunArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.merge_with_args(args);

    println!("🌍 ETS Harmonizer v{}", ets_harmonize::VERSION);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let output = pipeline::run(&config)?;
    let written = pipeline::write_outputs(&config, &output)?;

    println!("\n📋 Systems: {}", pipeline::system_names(&output.stats).join(", "));
    for (system, rows) in &output.stats.systems {
        println!("   {:<16} {:>8} facility-years", system, rows);
    }
    let c = &output.stats.conservation;
    println!(
        "\n⚖️  Cohorts: {} balanced, {} zero-weight, {} discrepancies",
        c.balanced, c.zero_weight, c.discrepancies
    );
    println!("🔍 Quality: {}", output.stats.quality.summary());

    println!("\n💾 Outputs:");
    for file in &written {
        println!("   ✓ {} ({} rows)", file.path.display(), file.rows);
    }
    if let Some(manifest) = &config.output.manifest {
        println!("   ✓ {}", manifest.display());
    }
    Ok(())
}

// ============================================================================
// SINGLE HARMONIZERS
// ============================================================================

fn single_source_config(alphas: &AlphaArgs, naics: Option<PathBuf>) -> Config {
    let mut config = Config::default();
    if let Some(alpha) = alphas.alpha {
        config.allocation.hybrid_alpha = alpha;
    }
    if let Some(alpha) = alphas.counterfactual_alpha {
        config.allocation.counterfactual_alpha = alpha;
    }
    config.concordance.naics = naics;
    config
}

fn harmonize_to(config: &Config, output: &Path) -> Result<()> {
    config.validate()?;
    let sources = pipeline::harmonize(config)?;
    let rows = write_csv(output, &sources.facility, FACILITY_COLUMNS)?;
    info!(rows, "facility-years written");

    let c = &sources.stats.conservation;
    println!("✓ {} facility-years → {}", rows, output.display());
    println!("✓ {} cohorts allocated, {} discrepancies", c.cohorts, c.discrepancies);
    println!("✓ {}", sources.stats.quality.summary());
    Ok(())
}

fn run_euets(args: EuEtsArgs) -> Result<()> {
    println!("🇪🇺 EU ETS: {}", args.dir.display());
    let mut config = single_source_config(&args.alphas, None);
    config.sources.euets = Some(EuEtsSource {
        dir: args.dir,
        system_filter: args.system_filter,
    });
    harmonize_to(&config, &args.output)
}

fn run_ukets(args: UkEtsArgs) -> Result<()> {
    println!("🇬🇧 UK ETS: {}", args.allocation.display());
    let mut config = single_source_config(&args.alphas, None);
    let mut columns = UkEtsColumns::default();
    for (field, name) in &args.columns {
        columns.set(field, name)?;
    }
    config.sources.ukets = Some(UkEtsSource {
        allocation: args.allocation,
        compliance: args.compliance,
        crosswalk: args.crosswalk,
        columns,
    });
    harmonize_to(&config, &args.output)
}

fn run_california(args: CaliforniaArgs) -> Result<()> {
    println!("🌉 California: {}", args.mrr.display());
    let mut config = single_source_config(&args.alphas, args.naics_concordance);
    let mut source = CaliforniaSource::new(args.mrr, args.sector_totals);
    source.rules = args.rules;
    source.benchmarks = args.benchmarks;
    source.assistance_factors = args.assistance_factors;
    source.obligation_fanout = args.obligation_fanout;
    source.intensity_column = args.intensity_column;
    config.sources.california = Some(source);
    harmonize_to(&config, &args.output)
}

fn run_washington(args: WashingtonArgs) -> Result<()> {
    println!("🌲 Washington: {}", args.emissions.display());
    let mut config = single_source_config(&args.alphas, args.naics_concordance);
    config.concordance.wa_subsectors = args.subsector_concordance;
    config.sources.washington = Some(WashingtonSource {
        emissions: args.emissions,
        subsector_totals: args.subsector_totals,
        keep_only_covered: !args.include_uncovered,
    });
    harmonize_to(&config, &args.output)
}

// ============================================================================
// COMPONENTS
// ============================================================================

fn run_aggregate(args: &AggregateArgs) -> Result<()> {
    let metric: AllocationMetric = args.metric.parse().map_err(anyhow::Error::msg)?;
    let facility = read_facility_csv(&args.facility)?;
    println!("📂 Loaded {} facility-years from {}", facility.len(), args.facility.display());

    let sector = aggregate(&facility, metric);
    let rows = write_csv(&args.output, &sector, SECTOR_COLUMNS)?;
    println!("✓ {} sector-years ({}) → {}", rows, metric, args.output.display());
    Ok(())
}

fn run_map_codes(args: &MapCodesArgs) -> Result<()> {
    let concordance = match &args.concordance {
        Some(path) => Concordance::from_csv_path(path, None)?,
        None => Concordance::naics_default()?,
    };
    let table = RawTable::from_csv_path(&args.input)?;
    let mapped = concordance.map_column(&table, &args.column, &args.taxonomy)?;

    let matched = mapped.iter().filter(|m| m.target_code.is_some()).count();
    write_csv(
        &args.output,
        &mapped,
        &["source_code", "target_code", "target_description", "secondary_code"],
    )?;
    println!(
        "✓ {}/{} codes mapped with {} → {}",
        matched,
        mapped.len(),
        concordance.version(),
        args.output.display()
    );
    Ok(())
}

fn init_config(output: Option<&Path>) -> Result<()> {
    let content = Config::default_toml();
    match output {
        Some(path) => {
            if path.exists() {
                anyhow::bail!("{} already exists. Remove it first or edit it manually.", path.display());
            }
            std::fs::write(path, &content)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✅ Created {} with default settings.", path.display());
        }
        None => print!("{}", content),
    }
    Ok(())
}
