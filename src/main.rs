use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{ArgAction, CommandFactory, Parser};
use owo_colors::OwoColorize;

use conjure::config::{ConfigError, ConjureConfig};
use conjure::delegation::{DelegationExecutor, DelegationRequest};
use conjure::error::{
    DelegationError, EXIT_CONFIG_ERROR, EXIT_DISPATCH_FAILURE, EXIT_OK, EXIT_PREFLIGHT_REJECTED,
};

/// Route analysis tasks to LLM command-line tools under per-provider quotas.
#[derive(Parser, Debug)]
#[command(name = "conjure", version, about, long_about = None)]
struct Cli {
    /// Provider id or alias, or `auto` to pick one
    provider: Option<String>,

    /// Task prompt
    prompt: Option<String>,

    /// Files, directories or glob patterns to include
    #[arg(long, num_args = 1.., action = ArgAction::Append, value_name = "PATH")]
    files: Vec<String>,

    /// Routing hint for `auto` (large_context, fast, cheap)
    #[arg(long)]
    requirement: Option<String>,

    /// Model name or alias
    #[arg(long)]
    model: Option<String>,

    /// Dispatch timeout in milliseconds
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Run the provider's auth check before dispatching
    #[arg(long)]
    check_auth: bool,

    /// Show the command and estimate without running anything
    #[arg(long)]
    dry_run: bool,

    /// List configured providers
    #[arg(long)]
    list_services: bool,

    /// Run a provider's auth check
    #[arg(long, value_name = "ID")]
    verify: Option<String>,

    /// Show quota status for every provider
    #[arg(long)]
    status: bool,

    /// Summarize the usage log
    #[arg(long)]
    report: bool,

    /// Only include attempts after this time (RFC 3339, or relative like 24h, 7d)
    #[arg(long, requires = "report", value_parser = parse_since)]
    since: Option<DateTime<Utc>>,

    /// Check the usage log for malformed lines
    #[arg(long)]
    validate_log: bool,

    /// Drop quota entries older than HOURS (default 24)
    #[arg(long, value_name = "HOURS", num_args = 0..=1, default_missing_value = "24")]
    cleanup: Option<u64>,

    /// Print machine-readable JSON
    #[arg(long)]
    json: bool,

    /// Path to conjure.toml
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose output (debug logging)
    #[arg(short, long)]
    verbose: bool,
}

fn parse_since(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Ok(timestamp.with_timezone(&Utc));
    }

    let seconds = [('m', 60i64), ('h', 3_600), ('d', 86_400)]
        .iter()
        .find_map(|(suffix, unit)| {
            value
                .strip_suffix(*suffix)
                .and_then(|n| n.parse::<i64>().ok())
                .map(|n| n.saturating_mul(*unit))
        })
        .ok_or_else(|| format!("expected RFC 3339 or a relative time like 24h, got '{}'", value))?;

    chrono::Duration::try_seconds(seconds)
        .and_then(|ago| Utc::now().checked_sub_signed(ago))
        .ok_or_else(|| format!("'{}' is out of range", value))
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn paint(line: &str) -> String {
    if !std::io::stderr().is_terminal() {
        return line.to_string();
    }
    if line == "OK" {
        line.green().to_string()
    } else if line.starts_with("BLOCKED") {
        line.yellow().to_string()
    } else {
        line.red().to_string()
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(err) = err.downcast_ref::<DelegationError>() {
        return err.exit_code();
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return EXIT_CONFIG_ERROR;
    }
    EXIT_DISPATCH_FAILURE
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = ConjureConfig::load(cli.config.as_deref())?;
    let executor = DelegationExecutor::from_config(&config)?;

    if cli.list_services {
        return list_services(&executor, cli.json);
    }
    if let Some(provider) = &cli.verify {
        return verify(&executor, provider, cli.json).await;
    }
    if cli.status {
        let status = executor.status();
        if cli.json {
            print_json(&status)?;
        } else {
            for provider in &status {
                print!("{}", provider.format());
            }
        }
        return Ok(EXIT_OK);
    }
    if cli.report {
        let summary = executor.report(cli.since)?;
        if cli.json {
            print_json(&summary)?;
        } else {
            print!("{}", summary.format());
        }
        return Ok(EXIT_OK);
    }
    if cli.validate_log {
        return validate_log(&executor, cli.json);
    }
    if let Some(hours) = cli.cleanup {
        let removed = executor.cleanup(hours);
        if cli.json {
            print_json(&removed)?;
        } else {
            for (provider, count) in removed {
                println!("{}: removed {} entries older than {}h", provider, count, hours);
            }
        }
        return Ok(EXIT_OK);
    }

    let (Some(provider), Some(prompt)) = (cli.provider.clone(), cli.prompt.clone()) else {
        Cli::command()
            .error(
                clap::error::ErrorKind::MissingRequiredArgument,
                "expected `auto|<provider> <prompt>` or one of --list-services, --verify, --status, --report, --validate-log, --cleanup",
            )
            .exit();
    };

    let mut request = DelegationRequest::new(prompt)
        .with_provider(provider)
        .with_files(cli.files.clone());
    if let Some(requirement) = &cli.requirement {
        request = request.with_requirement(requirement.clone());
    }
    if let Some(model) = &cli.model {
        request = request.with_model(model.clone());
    }
    if let Some(ms) = cli.timeout_ms {
        request = request.with_timeout(Duration::from_millis(ms));
    }
    if cli.check_auth {
        request = request.with_auth_check();
    }

    if cli.dry_run {
        return dry_run(&executor, &request, cli.json);
    }
    dispatch(&executor, request, cli.json).await
}

fn list_services(executor: &DelegationExecutor, json: bool) -> anyhow::Result<i32> {
    let services = executor.registry().list_available();
    if json {
        let services: Vec<_> = services.iter().map(|s| s.as_ref()).collect();
        print_json(&services)?;
        return Ok(EXIT_OK);
    }
    for service in services {
        let aliases = if service.aliases.is_empty() {
            String::new()
        } else {
            format!("  aliases: {}", service.aliases.join(", "))
        };
        println!(
            "{:<12} {:>9} tokens  model: {}{}",
            service.id,
            service.context_window_tokens,
            if service.default_model.is_empty() { "-" } else { &service.default_model },
            aliases
        );
    }
    Ok(EXIT_OK)
}

async fn verify(executor: &DelegationExecutor, provider: &str, json: bool) -> anyhow::Result<i32> {
    let verification = executor.verify(provider).await?;
    if json {
        print_json(&verification)?;
    } else {
        let state = if verification.available { "available" } else { "unavailable" };
        println!("{}: {} ({})", verification.provider_id, state, verification.detail);
    }
    Ok(if verification.available {
        EXIT_OK
    } else {
        EXIT_PREFLIGHT_REJECTED
    })
}

fn validate_log(executor: &DelegationExecutor, json: bool) -> anyhow::Result<i32> {
    let issues = executor.validate_log()?;
    let path = executor.usage_log().path().display().to_string();
    if json {
        print_json(&issues)?;
    } else if issues.is_empty() {
        println!("{}: ok", path);
    } else {
        for issue in &issues {
            println!("{}:{}: {}", path, issue.line, issue.message);
        }
    }
    Ok(if issues.is_empty() {
        EXIT_OK
    } else {
        EXIT_DISPATCH_FAILURE
    })
}

fn dry_run(
    executor: &DelegationExecutor,
    request: &DelegationRequest,
    json: bool,
) -> anyhow::Result<i32> {
    let plan = match executor.dry_run(request) {
        Ok(plan) => plan,
        Err(err) => return report_dispatch_error(err),
    };
    if json {
        print_json(&plan)?;
    } else {
        println!("provider: {} ({})", plan.provider_id, plan.model);
        println!("command:  {}", plan.argv.join(" "));
        println!(
            "estimate: {} tokens ({} prompt, {} from {} files, {} overhead)",
            plan.estimate.total(),
            plan.estimate.prompt_tokens,
            plan.estimate.file_tokens,
            plan.estimate.files_counted,
            plan.estimate.overhead_tokens
        );
        for skipped in &plan.estimate.skipped {
            println!("skipped:  {} ({})", skipped.path.display(), skipped.reason);
        }
        match &plan.reason {
            None => println!("quota:    ok"),
            Some(reason) => println!("quota:    would block ({})", reason),
        }
    }
    Ok(if plan.allowed {
        EXIT_OK
    } else {
        EXIT_PREFLIGHT_REJECTED
    })
}

async fn dispatch(
    executor: &DelegationExecutor,
    request: DelegationRequest,
    json: bool,
) -> anyhow::Result<i32> {
    let result = match executor.dispatch(request).await {
        Ok(result) => result,
        Err(err) => return report_dispatch_error(err),
    };

    if json {
        print_json(&result)?;
    } else {
        print!("{}", result.stdout);
        if !result.success && !result.stderr.is_empty() {
            eprint!("{}", result.stderr);
        }
        eprintln!("{}", paint(&result.status_line()));
    }
    Ok(result.process_exit_code())
}

fn report_dispatch_error(err: DelegationError) -> anyhow::Result<i32> {
    let line = match &err {
        DelegationError::UnknownProvider(name) => format!("BLOCKED: unknown provider ({})", name),
        DelegationError::NoEligibleProvider { .. } => format!("BLOCKED: no eligible provider ({})", err),
        DelegationError::CommandTemplate { .. } | DelegationError::Config(_) => {
            return Err(err).context("invalid provider configuration")
        }
        other => format!("FAILED: {}", other),
    };
    eprintln!("{}", paint(&line));
    Ok(err.exit_code())
}
