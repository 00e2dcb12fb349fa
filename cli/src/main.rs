use std::process::ExitCode;

use sluice::err;
use sluice::error::Result;
use sluice::deploy::{self, Credentials, Target};
use sluice::devserver::DevServer;
use sluice::graph::Policy;
use sluice::watch::WatchEngine;

use crate::config::Settings;
use crate::tasks::{Tasks, WATCH};

mod config;
mod tasks;
mod telemetry;

mod flags {
    use std::path::PathBuf;

    xflags::xflags! {
        /// Runs named asset-pipeline tasks.
        cmd sluice {
            /// Config file. Defaults to `sluice.toml` if present.
            optional -c, --config path: PathBuf
            /// Use the production profile.
            optional --production

            /// Runs a task: `build`, `sprite`, `webp`, a configured task or
            /// `watch`, the default.
            default cmd run {
                optional task: String
            }

            /// Pushes the output directory to the configured deploy target.
            cmd deploy {}

            /// Lists the available tasks.
            cmd tasks {}
        }
    }
}

pub fn main() -> ExitCode {
    telemetry::init_tracing();

    let flags = flags::Sluice::from_env_or_exit();
    match run(flags) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(flags: flags::Sluice) -> Result<bool> {
    let mut settings = Settings::load(flags.config.as_deref())?;
    if flags.production {
        settings.profile = config::Profile::Production;
    }

    match flags.subcommand {
        flags::SluiceCmd::Run(run) => {
            let tasks = Tasks::new(&settings)?;
            match run.task.as_deref().unwrap_or(WATCH) {
                WATCH => watch(&settings, &tasks),
                task => {
                    let report = tasks.graph.run(task, Policy::Continue)?;
                    println!("{report}");
                    Ok(report.success())
                }
            }
        }
        flags::SluiceCmd::Deploy(_) => push(&settings),
        flags::SluiceCmd::Tasks(_) => {
            let tasks = Tasks::new(&settings)?;
            for node in tasks.graph.nodes() {
                let pipelines = node.pipeline_names().join(", ");
                match node.dependencies() {
                    [] => println!("{}: {pipelines}", node.name()),
                    deps => println!("{}: {pipelines} (after {})", node.name(), deps.join(", ")),
                }
            }

            println!("{WATCH}: build, then serve and rebuild on change");
            Ok(true)
        }
    }
}

fn watch(settings: &Settings, tasks: &Tasks) -> Result<bool> {
    let report = tasks.graph.run("build", Policy::Continue)?;
    println!("{report}");

    let session = WatchEngine::new(settings.server.debounce()).start(tasks.watch_bindings())?;
    for error in session.errors() {
        tracing::warn!(%error, "pipeline will not be rebuilt on change");
    }

    let server = DevServer::new(settings.output_dir(), settings.server.addr()?, settings.server.send_timeout());
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let served = runtime.block_on(server.serve(&tasks.bus, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }

        tracing::info!("shutting down");
    }));

    session.shutdown();
    served.map(|_| true)
}

fn push(settings: &Settings) -> Result<bool> {
    let Some(target) = &settings.deploy.target else {
        return err!("no deploy target configured", "hint" => "set `deploy.target` in sluice.toml");
    };

    let target: Target = target.parse()?;
    let credentials = match target {
        Target::Ftp { .. } => {
            let deploy = &settings.deploy;
            Some(Credentials::from_env(&deploy.user_env, &deploy.password_env)?)
        }
        Target::Dir(_) => None,
    };

    let mut remote = deploy::connect(&target, credentials.as_ref())?;
    let result = deploy::deploy(&settings.output_dir(), remote.as_mut());
    for error in &result.errors {
        eprintln!("error: {error}");
    }

    println!("{} file(s) transferred to {target}", result.transferred);
    Ok(result.success())
}
