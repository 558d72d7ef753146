use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use ggd_manager::app::{
    App, InstallOptions, InstallResult, ListResult, ProgressSinkKind, UninstallOptions,
    UninstallResult,
};
use ggd_manager::catalog::{CatalogClient, CatalogHttpClient};
use ggd_manager::config::ConfigLoader;
use ggd_manager::domain::{RecipeName, RequestedVersion};
use ggd_manager::error::GgdError;
use ggd_manager::output::{JsonOutput, OutputMode};
use ggd_manager::package_manager::{CondaCli, PackageManager};
use ggd_manager::shutdown;
use ggd_manager::tui::Tui;
use ggd_manager::uninstall::UninstallStatus;

#[derive(Parser)]
#[command(name = "ggd")]
#[command(about = "Install and uninstall genomic data recipes into conda environments")]
#[command(version, author)]
struct Cli {
    /// Print JSON results instead of the interactive progress view.
    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Install a data recipe")]
    Install(InstallArgs),
    #[command(about = "Uninstall a data recipe and everything it left behind")]
    Uninstall(UninstallArgs),
    #[command(about = "List data recipes installed in an environment")]
    List(ListArgs),
}

#[derive(Args)]
struct InstallArgs {
    name: String,

    /// Exact version to install; `latest` or `-1` mean the catalog's current one.
    #[arg(long)]
    version: Option<String>,

    #[arg(long)]
    prefix: Option<String>,

    #[arg(long, short)]
    channel: Option<String>,

    /// Identifier for a meta-recipe, such as a GEO accession.
    #[arg(long)]
    id: Option<String>,
}

#[derive(Args)]
struct UninstallArgs {
    name: String,

    #[arg(long)]
    prefix: Option<String>,

    #[arg(long, short)]
    channel: Option<String>,
}

#[derive(Args)]
struct ListArgs {
    #[arg(long)]
    prefix: Option<String>,

    /// Rebuild the local metadata from the package manager and catalog first.
    #[arg(long)]
    refresh: bool,

    #[arg(long, short)]
    channel: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(ggd) = report.downcast_ref::<GgdError>() {
            return ExitCode::from(map_exit_code(ggd));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &GgdError) -> u8 {
    match error {
        GgdError::AlreadyInstalled { .. } => 0,
        GgdError::RecipeNotFound { .. }
        | GgdError::InvalidRecipeName(_)
        | GgdError::InvalidMetaRecipeId(_)
        | GgdError::InvalidChannel(_) => 2,
        GgdError::CatalogUnavailable { .. }
        | GgdError::CatalogHttp(_)
        | GgdError::CatalogStatus { .. }
        | GgdError::CatalogParse { .. } => 3,
        GgdError::FileIntegrity { .. } => 4,
        GgdError::InconsistentState { .. } => 5,
        GgdError::InvalidPrefix(_) => 6,
        GgdError::Interrupted => shutdown::INTERRUPTED_EXIT_CODE as u8,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    shutdown::register_signal_handlers().into_diagnostic()?;
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let catalog = CatalogHttpClient::new(&config)?;
    let conda = CondaCli::new(&config.package_manager)?;
    let app = App::new(config, catalog, conda);

    match cli.command {
        Commands::Install(args) => run_install(args, app, output_mode),
        Commands::Uninstall(args) => run_uninstall(args, app, output_mode),
        Commands::List(args) => run_list(args, app, output_mode),
    }
}

fn run_install<C: CatalogClient + 'static, P: PackageManager + 'static>(
    args: InstallArgs,
    app: App<C, P>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let options = InstallOptions {
        name: args.name.parse::<RecipeName>()?,
        version: args
            .version
            .as_deref()
            .unwrap_or_default()
            .parse::<RequestedVersion>()?,
        prefix: args.prefix.map(Utf8PathBuf::from),
        channel: args.channel,
        meta_recipe_id: args.id,
    };

    let result = match output_mode {
        OutputMode::NonInteractive => app
            .install(options, &JsonOutput)
            .map_err(miette::Report::new),
        OutputMode::Interactive => {
            let mut tui = Tui::new(ProgressSinkKind::Install)
                .with_detail("Recipe", options.name.to_string())
                .with_detail("Version", options.version.to_string())
                .with_detail(
                    "Prefix",
                    options
                        .prefix
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "active environment".to_string()),
                );
            tui.run(move |sink| app.install(options, sink))
        }
    };

    match result {
        Ok(result) => match output_mode {
            OutputMode::NonInteractive => JsonOutput::print_install(&result).into_diagnostic(),
            OutputMode::Interactive => {
                print_install_summary(&result);
                Ok(())
            }
        },
        Err(report) => settle_informational(report, output_mode),
    }
}

fn run_uninstall<C: CatalogClient + 'static, P: PackageManager + 'static>(
    args: UninstallArgs,
    app: App<C, P>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let options = UninstallOptions {
        name: args.name.parse::<RecipeName>()?,
        prefix: args.prefix.map(Utf8PathBuf::from),
        channel: args.channel,
    };

    match output_mode {
        OutputMode::NonInteractive => {
            let result = app.uninstall(options, &JsonOutput)?;
            JsonOutput::print_uninstall(&result).into_diagnostic()?;
            Ok(())
        }
        OutputMode::Interactive => {
            let mut tui = Tui::new(ProgressSinkKind::Uninstall)
                .with_detail("Recipe", options.name.to_string());
            let result = tui.run(move |sink| app.uninstall(options, sink))?;
            print_uninstall_summary(&result);
            Ok(())
        }
    }
}

fn run_list<C: CatalogClient + 'static, P: PackageManager + 'static>(
    args: ListArgs,
    app: App<C, P>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let prefix = args.prefix.map(Utf8PathBuf::from);
    let refresh = args.refresh;
    let channel = args.channel;
    let list = move |sink: &dyn ggd_manager::app::ProgressSink| {
        if refresh {
            app.refresh_and_list(prefix, channel.as_deref(), sink)
        } else {
            app.list(prefix, sink)
        }
    };

    match output_mode {
        OutputMode::NonInteractive => {
            let result = list(&JsonOutput)?;
            JsonOutput::print_list(&result).into_diagnostic()?;
            Ok(())
        }
        OutputMode::Interactive => {
            let mut tui = Tui::new(ProgressSinkKind::List);
            let result = tui.run(list)?;
            print_list_summary(&result);
            Ok(())
        }
    }
}

/// "Already installed" ends the command successfully with a notice.
fn settle_informational(report: miette::Report, output_mode: OutputMode) -> miette::Result<()> {
    match report.downcast_ref::<GgdError>() {
        Some(err) if err.is_informational() => {
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_notice(err).into_diagnostic()?,
                OutputMode::Interactive => println!("\x1b[33m{err}\x1b[0m"),
            }
            Ok(())
        }
        _ => Err(report),
    }
}

fn print_install_summary(result: &InstallResult) {
    let green = "\x1b[32m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!(
        "{green}Installed {} {} ({} install){reset}",
        result.storage_name, result.version, result.strategy
    );
    if let Some(kept) = &result.kept_version {
        println!("{cyan}   version {kept} remains installed alongside{reset}");
    }
    println!("{cyan}   files: {}{reset}", result.directory);
    for file in &result.files {
        println!("     {file}");
    }
    if !result.env_vars.is_empty() {
        println!("{cyan}   environment variables (active after `conda activate`):{reset}");
        for entry in &result.env_vars {
            println!("     ${} = {}", entry.name, entry.value);
        }
    }
}

fn print_uninstall_summary(result: &UninstallResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let reset = "\x1b[0m";

    match result.status {
        UninstallStatus::Removed => {
            println!("{green}Uninstalled {} from {}{reset}", result.name, result.prefix)
        }
        UninstallStatus::NotInstalled => {
            println!("{yellow}{} is not installed in {}{reset}", result.name, result.prefix)
        }
    }
    for path in &result.removed_paths {
        println!("   removed {path}");
    }
    for name in &result.removed_env_vars {
        println!("   unset ${name}");
    }
    for warning in &result.warnings {
        println!("{yellow}   warning: {warning}{reset}");
    }
}

fn print_list_summary(result: &ListResult) {
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    if result.packages.is_empty() {
        println!("No ggd data recipes recorded in {}", result.prefix);
        return;
    }
    println!("{cyan}ggd data recipes in {}{reset}", result.prefix);
    for entry in &result.packages {
        println!(
            "   {} {} [{}]",
            entry.name,
            entry.version.as_deref().unwrap_or("-"),
            entry.channel.as_deref().unwrap_or("-"),
        );
    }
    for entry in result.inconsistent() {
        println!(
            "{yellow}   warning: {} is {:?}; uninstall and reinstall it{reset}",
            entry.name, entry.status
        );
    }
}
