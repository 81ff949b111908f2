use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use ct_core::{
    ChainKey, Config, ListedRule, LoggingConfig, Position, PresetLoader, RuleEntry, RuleForm, Table,
};
use ct_ipt::elevation::Launcher;
use ct_ipt::{ChainStatusCollector, CommandExecutor, ProcessBackend, to_command_args};
use ct_session::{
    ChainSnapshot, Confirmation, ConfirmationGuard, MutationOutcome, SessionController,
    enter_pressed,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

type Executor = CommandExecutor<ProcessBackend>;
type Session = SessionController<ProcessBackend>;

#[derive(Parser)]
#[command(name = "cocotap")]
#[command(version, about = "iptables rule console", long_about = None)]
struct Cli {
    /// Config file (default: ./cocotap.yaml, then /etc/cocotap/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    /// Log mutations instead of running them
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the rules of a chain, or of every chain in a table
    List {
        #[arg(short, long, default_value = "filter")]
        table: String,
        chain: Option<String>,
    },
    /// Append or insert a rule
    Add(AddArgs),
    /// Delete the rule at a position
    Delete {
        #[arg(short, long, default_value = "filter")]
        table: String,
        chain: String,
        position: u32,
        /// Refuse unless the rule at POSITION reads exactly like this
        #[arg(long)]
        expect: Option<String>,
        /// Undo the change unless ENTER is pressed within SECS seconds
        #[arg(long, value_name = "SECS", default_value = "0")]
        confirm: u64,
    },
    /// Summarise every chain
    Status,
    /// List available rule presets
    Presets,
    /// Metrics server
    Metrics {
        #[command(subcommand)]
        action: MetricsAction,
    },
    /// Troubleshooting and diagnostics
    Doctor {
        #[command(subcommand)]
        action: Option<DoctorAction>,
    },
}

#[derive(Args)]
struct AddArgs {
    #[arg(short, long, default_value = "filter")]
    table: String,
    /// Target chain; taken from the preset when one is given
    chain: Option<String>,
    /// Insert at this position instead of appending
    #[arg(long)]
    at: Option<u32>,
    /// Start from a named preset; other flags override its fields
    #[arg(long)]
    preset: Option<String>,
    #[arg(short, long)]
    protocol: Option<String>,
    #[arg(short, long)]
    source: Option<String>,
    #[arg(short, long)]
    destination: Option<String>,
    #[arg(long)]
    sport: Option<String>,
    #[arg(long)]
    dport: Option<String>,
    #[arg(short = 'i', long = "in-interface")]
    in_interface: Option<String>,
    #[arg(short = 'o', long = "out-interface")]
    out_interface: Option<String>,
    /// ACCEPT, DROP, REJECT, DNAT, SNAT or MASQUERADE
    #[arg(short = 'j', long = "jump")]
    action: Option<String>,
    /// DNAT/SNAT address, IP or IP:PORT
    #[arg(long)]
    to: Option<String>,
    #[arg(long)]
    comment: Option<String>,
    /// Undo the change unless ENTER is pressed within SECS seconds
    #[arg(long, value_name = "SECS", default_value = "0")]
    confirm: u64,
}

impl AddArgs {
    fn form(&self) -> RuleForm {
        RuleForm {
            protocol: self.protocol.clone(),
            source: self.source.clone(),
            destination: self.destination.clone(),
            source_port: self.sport.clone(),
            destination_port: self.dport.clone(),
            in_interface: self.in_interface.clone(),
            out_interface: self.out_interface.clone(),
            action: self.action.clone(),
            nat_to: self.to.clone(),
            comment: self.comment.clone(),
        }
    }
}

#[derive(Subcommand)]
enum MetricsAction {
    /// Start metrics server
    Serve {
        /// Listen address (default from config)
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
}

#[derive(Subcommand)]
enum DoctorAction {
    /// Check the iptables binary, privileges and competing firewall managers
    Iptables,
    /// Check kernel modules and forwarding
    Kernel,
    /// Check the live chains
    Rules,
    /// Run all diagnostics
    All,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config.backend.dry_run |= cli.dry_run;
    init_tracing(&config.logging);

    block_on_detached(run(cli, config))?
}

/// Runs `future` to completion without waiting for blocking tasks left
/// behind, such as a stdin read for a confirmation that timed out.
fn block_on_detached<F: Future>(future: F) -> anyhow::Result<F::Output> {
    let runtime = tokio::runtime::Runtime::new()?;
    let output = runtime.block_on(future);
    runtime.shutdown_background();
    Ok(output)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if logging.compact {
        builder.compact().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    let json = cli.json;

    match cli.command {
        Commands::Presets => list_presets(&config, json),
        Commands::Doctor { action } => handle_doctor_action(action, &config, json).await,
        Commands::Metrics { action } => handle_metrics_action(action, &config).await,
        Commands::Status => show_status(executor(&config)?, json).await,
        Commands::List { table, chain } => {
            let session = session(&config)?;
            list_rules(&session, &table, chain.as_deref(), json).await
        }
        Commands::Add(args) => {
            let session = session(&config)?;
            add_rule(&session, &config, args, json).await
        }
        Commands::Delete {
            table,
            chain,
            position,
            expect,
            confirm,
        } => {
            let session = session(&config)?;
            let key = ChainKey::parse(&table, &chain)?;
            delete_rule(&session, key, position, expect.as_deref(), confirm, json).await
        }
    }
}

fn executor(config: &Config) -> anyhow::Result<Arc<Executor>> {
    let backend = ProcessBackend::from_config(&config.backend)
        .context("Cannot run iptables with the required privileges")?;
    Ok(Arc::new(build_executor(backend, config)))
}

fn build_executor(backend: ProcessBackend, config: &Config) -> Executor {
    CommandExecutor::new(backend)
        .with_lock_wait(config.backend.lock_wait_secs)
        .with_dry_run(config.backend.dry_run)
}

fn session(config: &Config) -> anyhow::Result<Session> {
    Ok(SessionController::new(executor(config)?).with_undo_depth(config.undo_depth))
}

async fn list_rules(
    session: &Session,
    table: &str,
    chain: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let keys = match chain {
        Some(chain) => vec![ChainKey::parse(table, chain)?],
        None => {
            let table: Table = table.parse()?;
            table
                .chains()
                .iter()
                .map(|chain| ChainKey::new(table, *chain))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    let mut views = Vec::with_capacity(keys.len());
    for key in keys {
        let view = session
            .refresh(key)
            .await
            .with_context(|| format!("Failed to list {}", key))?;
        views.push(view);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&views)?);
    } else {
        for view in &views {
            print_view(view);
        }
    }
    Ok(())
}

async fn add_rule(
    session: &Session,
    config: &Config,
    args: AddArgs,
    json: bool,
) -> anyhow::Result<()> {
    let overrides = args.form();

    let rule = match &args.preset {
        Some(name) => {
            let preset = PresetLoader::new()
                .find(&config.presets_dir, name)
                .with_context(|| format!("Failed to load preset from {:?}", config.presets_dir))?;
            let rule = preset.build(&overrides)?;
            if let Some(chain) = &args.chain {
                let requested = ChainKey::parse(&args.table, chain)?;
                if requested != rule.key() {
                    bail!(
                        "preset '{}' targets {}, not {}",
                        preset.name,
                        rule.key(),
                        requested
                    );
                }
            }
            rule
        }
        None => {
            let Some(chain) = &args.chain else {
                bail!("a chain is required unless --preset is given");
            };
            overrides.into_rule(ChainKey::parse(&args.table, chain)?)?
        }
    };

    let at = args
        .at
        .map(|n| Position::new(n).context("positions start at 1"))
        .transpose()?;

    // Mutations need a freshly loaded view.
    let listed = session
        .refresh(rule.key())
        .await
        .with_context(|| format!("Failed to list {}", rule.key()))?;

    let at = at.map(|position| listed.reference(position));
    let outcome = session.insert(rule, at).await?;
    report_outcome(&outcome, json)?;
    confirm_or_undo(session, &outcome, args.confirm, json).await
}

async fn delete_rule(
    session: &Session,
    key: ChainKey,
    position: u32,
    expect: Option<&str>,
    confirm: u64,
    json: bool,
) -> anyhow::Result<()> {
    let position = Position::new(position).context("positions start at 1")?;
    let view = session
        .refresh(key)
        .await
        .with_context(|| format!("Failed to list {}", key))?;

    if let Some(expected) = expect {
        let Some(row) = view.row(position) else {
            bail!("{} has no rule {}", key, position);
        };
        let actual = rule_text(row);
        if actual != expected.trim() {
            bail!(
                "rule {} in {} is '{}', not '{}'; nothing deleted",
                position,
                key,
                actual,
                expected.trim()
            );
        }
    }

    let outcome = session.delete(view.reference(position)).await?;
    report_outcome(&outcome, json)?;
    confirm_or_undo(session, &outcome, confirm, json).await
}

async fn confirm_or_undo(
    session: &Session,
    outcome: &MutationOutcome,
    secs: u64,
    json: bool,
) -> anyhow::Result<()> {
    if secs == 0 || !outcome.is_applied() {
        return Ok(());
    }

    let guard = ConfirmationGuard::new(Duration::from_secs(secs));
    eprintln!("\n⏰ Auto-undo armed for {}s", secs);
    eprintln!("   Press ENTER to keep the change, or wait for it to be undone...");

    match session.confirm_or_undo(&guard, enter_pressed()).await? {
        Confirmation::Kept => eprintln!("✅ Change kept"),
        Confirmation::RolledBack(undo) => {
            eprintln!("\n⚠️  No confirmation, change undone");
            report_outcome(&undo, json)?;
        }
    }
    Ok(())
}

fn report_outcome(outcome: &MutationOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    match outcome {
        MutationOutcome::Applied { view, changes } => {
            println!("✅ Applied to {}", view.key);
            for line in changes.unified.lines().filter(|l| !l.starts_with(' ')) {
                println!("   {}", line);
            }
            print_view(view);
        }
        MutationOutcome::AppliedStale {
            view,
            refresh_error,
        } => {
            println!("⚠️  Applied to {}, but it could not be listed again:", view.key);
            println!("   {}", refresh_error);
            println!("   Run 'cocotap list -t {} {}' to retry", view.key.table, view.key.chain);
        }
        MutationOutcome::DryRun { args } => {
            println!("[DRY RUN] iptables {}", args.join(" "));
        }
    }
    Ok(())
}

/// The rule as `iptables` arguments, or the raw row when it was not understood.
fn rule_text(row: &ListedRule) -> String {
    match &row.entry {
        RuleEntry::Parsed { rule } => to_command_args(rule).join(" "),
        RuleEntry::Opaque { .. } => row.raw.trim().to_string(),
    }
}

fn print_view(view: &ChainSnapshot) {
    println!(
        "\n📋 {} (policy {})",
        view.key,
        view.policy.as_deref().unwrap_or("-")
    );
    if view.rules.is_empty() {
        println!("   (no rules)");
        return;
    }

    println!("  {:>4} {:>10} {:>12}  rule", "num", "pkts", "bytes");
    for row in &view.rules {
        print!(
            "  {:>4} {:>10} {:>12}  {}",
            row.position.get(),
            row.counters.packets,
            row.counters.bytes,
            rule_text(row)
        );
        match &row.entry {
            RuleEntry::Opaque { reason } => println!("   ⚠️  {}", reason),
            RuleEntry::Parsed { .. } => println!(),
        }
    }
}

async fn show_status(executor: Arc<Executor>, json: bool) -> anyhow::Result<()> {
    let status = ChainStatusCollector::new(executor).collect().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        status.display();
    }
    Ok(())
}

fn list_presets(config: &Config, json: bool) -> anyhow::Result<()> {
    let presets = PresetLoader::new()
        .load_presets_from_dir(&config.presets_dir)
        .with_context(|| format!("Failed to read presets from {:?}", config.presets_dir))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&presets)?);
        return Ok(());
    }

    if presets.is_empty() {
        println!("No presets found");
        println!("Add YAML presets to {}", config.presets_dir.display());
        return Ok(());
    }

    println!("Available presets ({}):\n", presets.len());
    for (name, preset) in &presets {
        println!("  • {} - {}", name, preset.description);
        println!("    Chain: {}/{}", preset.table, preset.chain);
        match preset.build(&RuleForm::default()) {
            Ok(rule) => println!("    Rule: {}", to_command_args(&rule).join(" ")),
            Err(e) => println!("    ⚠️  {}", e),
        }
    }
    Ok(())
}

async fn handle_metrics_action(action: MetricsAction, config: &Config) -> anyhow::Result<()> {
    match action {
        MetricsAction::Serve { listen } => {
            use ct_metrics::{MetricsCollector, MetricsServer};

            let addr = listen.unwrap_or(config.metrics.listen);
            let interval = Duration::from_secs(config.metrics.interval_secs);
            println!("🚀 Starting metrics server on {}...", addr);

            let server = MetricsServer::new(MetricsCollector::new()?, addr);
            let scraper =
                server.spawn_scraper(ChainStatusCollector::new(executor(config)?), interval);

            let result = server.serve().await;
            scraper.abort();
            result?;
        }
    }
    Ok(())
}

async fn handle_doctor_action(
    action: Option<DoctorAction>,
    config: &Config,
    json: bool,
) -> anyhow::Result<()> {
    use ct_troubleshoot::{DiagnosticReport, Troubleshooter};

    // Diagnostics still run when no elevation method is available.
    let backend = ProcessBackend::from_config(&config.backend).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "falling back to running iptables directly");
        ProcessBackend::new(
            Launcher::direct(&config.backend.binary),
            config.backend.binary.clone(),
            config.backend.timeout(),
        )
    });
    let troubleshooter =
        Troubleshooter::new(config.backend.clone(), Arc::new(build_executor(backend, config)));

    let mut report = DiagnosticReport::new();
    match action {
        Some(DoctorAction::Iptables) => {
            report.add_section("iptables", troubleshooter.check_iptables().await?);
        }
        Some(DoctorAction::Kernel) => {
            report.add_section("Kernel", troubleshooter.check_kernel().await?);
        }
        Some(DoctorAction::Rules) => {
            report.add_section("Rules", troubleshooter.check_rules().await?);
        }
        Some(DoctorAction::All) | None => {
            if !json {
                println!("🩺 Running firewall diagnostics...\n");
            }
            report = troubleshooter.run_all().await?;
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.display();
    }

    if report.has_errors() {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_add_flags_map_to_form() {
        let cli = Cli::try_parse_from([
            "cocotap", "add", "-t", "nat", "PREROUTING", "-p", "tcp", "--dport", "8080", "-i",
            "eth0", "-j", "DNAT", "--to", "10.0.0.5:80", "--confirm", "30",
        ])
        .unwrap();

        let Commands::Add(args) = cli.command else {
            panic!("expected add");
        };
        assert_eq!(args.confirm, 30);
        let rule = args
            .form()
            .into_rule(ChainKey::parse(&args.table, args.chain.as_deref().unwrap()).unwrap())
            .unwrap();
        assert_eq!(
            to_command_args(&rule).join(" "),
            "-p tcp --dport 8080 -i eth0 -j DNAT --to-destination 10.0.0.5:80"
        );
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["cocotap", "delete", "INPUT", "3", "--json", "--dry-run"])
            .unwrap();
        assert!(cli.json && cli.dry_run);
        assert!(matches!(
            cli.command,
            Commands::Delete { position: 3, .. }
        ));
    }

    #[test]
    fn test_unconfirmed_exit_does_not_wait_for_stdin() {
        let started = std::time::Instant::now();
        let kept = block_on_detached(async {
            // Stands in for a stdin read nobody answers.
            tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_secs(10)));
            ConfirmationGuard::new(Duration::from_millis(50))
                .wait(std::future::pending())
                .await
        })
        .unwrap();

        assert!(!kept);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
