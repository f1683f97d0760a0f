use std::path::PathBuf;
use std::time::Duration;

use is_terminal::IsTerminal;
use tabled::{Table, Tabled, settings::Style};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use cli::apply::ApplyOptions;
use cli::build::{RenderRequest, Rendered};
use cli::cluster::KubeCluster;
use cli::config::CliConfig;
use cli::delete::DeleteOptions;
use cli::diff::DiffState;
use cli::status::{StatusOptions, StatusReport};
use cli::{Error, exit};

fn main() {
    use clap::{
        Arg, ArgAction, Command, crate_description, crate_name, crate_version, value_parser,
    };
    use std::process;

    let module_args = [
        Arg::new("path")
            .help("module directory")
            .default_value(".")
            .value_parser(value_parser!(PathBuf)),
        Arg::new("values")
            .short('f')
            .long("values")
            .help("values overlay file; repeatable, last wins")
            .action(ArgAction::Append)
            .value_parser(value_parser!(PathBuf)),
        Arg::new("namespace")
            .short('n')
            .long("namespace")
            .help("target namespace"),
        Arg::new("release_name")
            .long("release-name")
            .help("release name; defaults to the module name"),
        Arg::new("provider")
            .long("provider")
            .help("provider to use when several are configured"),
        Arg::new("strict")
            .long("strict")
            .help("treat unhandled traits as errors")
            .action(ArgAction::SetTrue),
    ];
    let release_ref_args = [
        Arg::new("release_name")
            .long("release-name")
            .help("release name"),
        Arg::new("release_id")
            .long("release-id")
            .help("release identity UUID")
            .value_parser(value_parser!(Uuid)),
        Arg::new("namespace")
            .short('n')
            .long("namespace")
            .help("release namespace")
            .default_value("default"),
    ];

    let cmd = Command::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .help("CLI configuration file")
                .value_parser(value_parser!(PathBuf)),
        )
        .subcommand(
            Command::new("mod")
                .about("work with modules and releases")
                .subcommand_required(true)
                .subcommands([
                    Command::new("build")
                        .about("render a module to concrete resources")
                        .args(module_args.clone())
                        .args([
                            Arg::new("output")
                                .short('o')
                                .long("output")
                                .value_parser(["yaml", "json", "dir"])
                                .default_value("yaml"),
                            Arg::new("out_dir")
                                .long("out-dir")
                                .help("output directory for -o dir")
                                .value_parser(value_parser!(PathBuf)),
                        ]),
                    Command::new("apply")
                        .about("render and apply a module release")
                        .args(module_args.clone())
                        .args([
                            Arg::new("dry_run")
                                .long("dry-run")
                                .action(ArgAction::SetTrue),
                            Arg::new("diff")
                                .long("diff")
                                .help("show the diff before applying")
                                .action(ArgAction::SetTrue),
                            Arg::new("wait")
                                .short('w')
                                .long("wait")
                                .help("wait for readiness")
                                .action(ArgAction::SetTrue),
                            Arg::new("force_apply")
                                .long("force-apply")
                                .help("apply even when the inventory digest matches")
                                .action(ArgAction::SetTrue),
                            Arg::new("timeout")
                                .long("timeout")
                                .default_value("5m")
                                .value_parser(humantime::parse_duration),
                        ]),
                    Command::new("diff")
                        .about("diff a rendered release against the cluster")
                        .args(module_args.clone()),
                    Command::new("delete")
                        .about("delete a release and its resources")
                        .args(release_ref_args.clone())
                        .args([
                            Arg::new("force")
                                .long("force")
                                .help("strip finalizers before deleting")
                                .action(ArgAction::SetTrue),
                            Arg::new("dry_run")
                                .long("dry-run")
                                .action(ArgAction::SetTrue),
                            Arg::new("ignore_not_found")
                                .long("ignore-not-found")
                                .action(ArgAction::SetTrue),
                            Arg::new("timeout")
                                .long("timeout")
                                .default_value("5m")
                                .value_parser(humantime::parse_duration),
                        ]),
                    Command::new("status")
                        .about("report release health from the inventory")
                        .args(release_ref_args.clone())
                        .args([
                            Arg::new("output")
                                .short('o')
                                .long("output")
                                .value_parser(["table", "wide", "yaml", "json"])
                                .default_value("table"),
                            Arg::new("watch")
                                .long("watch")
                                .action(ArgAction::SetTrue),
                            Arg::new("verbose")
                                .long("verbose")
                                .action(ArgAction::SetTrue),
                            Arg::new("ignore_not_found")
                                .long("ignore-not-found")
                                .action(ArgAction::SetTrue),
                        ]),
                ]),
        );

    process::exit(startup(&cmd.get_matches()));
}

fn startup(matches: &clap::ArgMatches) -> i32 {
    use tokio::{runtime, signal};
    use tracing_subscriber::{filter::EnvFilter, prelude::*};

    let env_filter = match EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("{e}");
            return exit::GENERAL;
        }
    };
    let collector = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(if std::io::stderr().is_terminal() {
            Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        } else {
            None
        })
        .with(if std::io::stderr().is_terminal() {
            None
        } else {
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
        });
    if let Err(e) = tracing::subscriber::set_global_default(collector) {
        eprintln!("{e}");
        return exit::GENERAL;
    }

    let rt = match runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{e}");
            return exit::GENERAL;
        }
    };
    let token = CancellationToken::new();
    let cancel = token.clone();
    rt.spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            error!("error reading SIGINT: {err}");
        }
        cancel.cancel();
    });

    match rt.block_on(run(matches, token)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e}");
            if let Error::RenderFailed(errors) = &e {
                for err in errors {
                    eprintln!("  {err}");
                }
            }
            e.exit_code()
        }
    }
}

async fn run(matches: &clap::ArgMatches, cancel: CancellationToken) -> cli::Result<i32> {
    let cfg = CliConfig::load(matches.get_one::<PathBuf>("config").map(|p| p.as_path()))?;
    let Some(("mod", m)) = matches.subcommand() else {
        unreachable!("subcommand required");
    };
    match m.subcommand() {
        Some(("build", m)) => cmd_build(&cfg, m),
        Some(("apply", m)) => cmd_apply(&cfg, m, &cancel).await,
        Some(("diff", m)) => cmd_diff(&cfg, m).await,
        Some(("delete", m)) => cmd_delete(m, &cancel).await,
        Some(("status", m)) => cmd_status(m, &cancel).await,
        _ => unreachable!("subcommand required"),
    }
}

fn render_request(m: &clap::ArgMatches) -> RenderRequest {
    RenderRequest {
        path: m.get_one::<PathBuf>("path").expect("has default").clone(),
        values: m
            .get_many::<PathBuf>("values")
            .into_iter()
            .flatten()
            .cloned()
            .collect(),
        release_name: m.get_one::<String>("release_name").cloned(),
        namespace: m.get_one::<String>("namespace").cloned(),
        provider: m.get_one::<String>("provider").cloned(),
        strict: m.get_flag("strict"),
    }
}

fn render_with_warnings(cfg: &CliConfig, m: &clap::ArgMatches) -> cli::Result<Rendered> {
    let rendered = cli::build::render(cfg, &render_request(m))?;
    for w in &rendered.warnings {
        warn!("{w}");
    }
    Ok(rendered)
}

fn cmd_build(cfg: &CliConfig, m: &clap::ArgMatches) -> cli::Result<i32> {
    let rendered = render_with_warnings(cfg, m)?;
    match m.get_one::<String>("output").expect("has default").as_str() {
        "yaml" => print!("{}", cli::build::to_yaml(&rendered)?),
        "json" => println!("{}", cli::build::to_json(&rendered)?),
        "dir" => {
            let out = m
                .get_one::<PathBuf>("out_dir")
                .cloned()
                .unwrap_or_else(|| PathBuf::from("./out"));
            cli::build::write_dir(&rendered, &out)?;
            info!(dir = %out.display(), resources = rendered.resources.len(), "wrote manifests");
        }
        _ => unreachable!("values are constrained"),
    }
    Ok(exit::OK)
}

async fn cmd_apply(
    cfg: &CliConfig,
    m: &clap::ArgMatches,
    cancel: &CancellationToken,
) -> cli::Result<i32> {
    let rendered = render_with_warnings(cfg, m)?;
    let cluster = KubeCluster::connect().await?;

    if m.get_flag("diff") {
        let store = cli::inventory::InventoryStore::new(&cluster);
        let prior = store
            .get(
                &rendered.release.name,
                &rendered.release.namespace,
                Some(&rendered.release.identity),
            )
            .await?;
        let report = cli::diff::diff(&cluster, &rendered.resources, prior.as_ref()).await?;
        print_diff(&report);
    }

    let opts = ApplyOptions {
        dry_run: m.get_flag("dry_run"),
        force_apply: m.get_flag("force_apply"),
        wait: m.get_flag("wait"),
        timeout: *m.get_one::<Duration>("timeout").expect("has default"),
    };
    let summary =
        cli::apply::apply(&cluster, rendered.resources, &rendered.release, &opts, cancel).await?;

    if summary.short_circuited {
        println!(
            "release {} unchanged (digest match); use --force-apply to reapply",
            rendered.release.name
        );
        return Ok(exit::OK);
    }
    for o in &summary.outcomes {
        let action = match &o.action {
            cli::apply::Action::Created => "created".to_string(),
            cli::apply::Action::Configured => "configured".to_string(),
            cli::apply::Action::Planned => "planned (dry run)".to_string(),
            cli::apply::Action::Failed(msg) => format!("failed: {msg}"),
        };
        println!("{}/{} {}", o.gvk.kind, o.name, action);
    }
    for (old, new) in &summary.renames {
        println!("component renamed from {old} to {new}");
    }
    for w in &summary.warnings {
        warn!("{w}");
    }
    println!(
        "Created: {}, Configured: {}, Stale removed: {}, Errors: {}",
        summary.created,
        summary.configured,
        summary.stale_deleted,
        summary.errors.len()
    );
    if summary.failed() {
        return Ok(exit::GENERAL);
    }
    Ok(exit::OK)
}

async fn cmd_diff(cfg: &CliConfig, m: &clap::ArgMatches) -> cli::Result<i32> {
    let rendered = render_with_warnings(cfg, m)?;
    let cluster = KubeCluster::connect().await?;
    let store = cli::inventory::InventoryStore::new(&cluster);
    let prior = store
        .get(
            &rendered.release.name,
            &rendered.release.namespace,
            Some(&rendered.release.identity),
        )
        .await?;
    let report = cli::diff::diff(&cluster, &rendered.resources, prior.as_ref()).await?;
    print_diff(&report);
    Ok(exit::OK)
}

fn print_diff(report: &[cli::diff::DiffEntry]) {
    for e in report {
        println!("{} {}/{} ({})", e.state.word(), e.gvk.kind, e.name, e.component);
        if let DiffState::Modified(text) = &e.state {
            print!("{text}");
        }
    }
}

async fn cmd_delete(m: &clap::ArgMatches, cancel: &CancellationToken) -> cli::Result<i32> {
    let cluster = KubeCluster::connect().await?;
    let opts = DeleteOptions {
        force: m.get_flag("force"),
        dry_run: m.get_flag("dry_run"),
        ignore_not_found: m.get_flag("ignore_not_found"),
    };
    let timeout = *m.get_one::<Duration>("timeout").expect("has default");
    let summary = tokio::time::timeout(
        timeout,
        cli::delete::delete(
            &cluster,
            m.get_one::<String>("release_name").map(String::as_str),
            m.get_one::<Uuid>("release_id"),
            m.get_one::<String>("namespace").expect("has default"),
            &opts,
            cancel,
        ),
    )
    .await
    .map_err(|_| Error::WaitTimeout("delete did not complete".into()))??;
    for r in &summary.records {
        println!("{}/{} {}", r.entry.kind, r.entry.name, r.outcome);
    }
    for (what, msg) in &summary.errors {
        error!("{what}: {msg}");
    }
    println!(
        "Deleted: {}, Already gone: {}, Errors: {}",
        summary.deleted,
        summary.already_gone,
        summary.errors.len()
    );
    if summary.errors.is_empty() {
        Ok(exit::OK)
    } else {
        Ok(exit::GENERAL)
    }
}

async fn cmd_status(m: &clap::ArgMatches, cancel: &CancellationToken) -> cli::Result<i32> {
    let cluster = KubeCluster::connect().await?;
    let opts = StatusOptions {
        verbose: m.get_flag("verbose"),
    };
    let watch = m.get_flag("watch");
    let output = m.get_one::<String>("output").expect("has default").clone();
    loop {
        let report = cli::status::status(
            &cluster,
            m.get_one::<String>("release_name").map(String::as_str),
            m.get_one::<Uuid>("release_id"),
            m.get_one::<String>("namespace").expect("has default"),
            &opts,
        )
        .await;
        let code = match report {
            Ok(report) => {
                print_status(&report, &output)?;
                if report.ready {
                    exit::OK
                } else {
                    exit::NOT_READY
                }
            }
            Err(Error::ReleaseNotFound(what)) => {
                if m.get_flag("ignore_not_found") {
                    info!(release = what, "release not found");
                    exit::OK
                } else {
                    eprintln!("release not found: {what}");
                    exit::NOT_FOUND
                }
            }
            Err(e) => return Err(e),
        };
        if !watch {
            return Ok(code);
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
            _ = cancel.cancelled() => return Ok(code),
        }
    }
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "RESOURCE")]
    resource: String,
    #[tabled(rename = "COMPONENT")]
    component: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "REASON")]
    reason: String,
}

fn print_status(report: &StatusReport, output: &str) -> cli::Result<()> {
    match output {
        "yaml" | "json" => {
            let v = status_json(report);
            if output == "yaml" {
                print!("{}", serde_yaml::to_string(&v)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&v)?);
            }
        }
        mode => {
            let rows: Vec<StatusRow> = report
                .resources
                .iter()
                .map(|r| StatusRow {
                    resource: format!("{}/{}", r.entry.kind, r.entry.name),
                    component: r.entry.component.clone(),
                    status: r.health.word().to_string(),
                    reason: match (&r.health, mode) {
                        (cli::status::Health::NotReady(reason), "wide") => reason.clone(),
                        _ => String::new(),
                    },
                })
                .collect();
            let mut table = Table::new(rows);
            table.with(Style::blank());
            println!("{table}");
            for r in &report.resources {
                for p in &r.pods {
                    println!(
                        "  pod {} phase={} ready={} restarts={}{}",
                        p.name,
                        p.phase,
                        p.ready,
                        p.restarts,
                        p.reason
                            .as_ref()
                            .map(|r| format!(" reason={r}"))
                            .unwrap_or_default()
                    );
                }
            }
            println!(
                "release {} is {}",
                report.release.name,
                if report.ready { "Ready" } else { "NotReady" }
            );
        }
    }
    Ok(())
}

fn status_json(report: &StatusReport) -> serde_json::Value {
    serde_json::json!({
        "release": report.release,
        "ready": report.ready,
        "resources": report.resources.iter().map(|r| {
            serde_json::json!({
                "group": r.entry.group,
                "kind": r.entry.kind,
                "namespace": r.entry.namespace,
                "name": r.entry.name,
                "component": r.entry.component,
                "status": r.health.word(),
                "reason": match &r.health {
                    cli::status::Health::NotReady(reason) => Some(reason.clone()),
                    _ => None,
                },
                "pods": r.pods.iter().map(|p| serde_json::json!({
                    "name": p.name,
                    "phase": p.phase,
                    "ready": p.ready,
                    "reason": p.reason,
                    "restarts": p.restarts,
                })).collect::<Vec<_>>(),
            })
        }).collect::<Vec<_>>(),
    })
}
