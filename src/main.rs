use std::io::stdout;

use anyhow::{Context, Result};
use clap::{App, AppSettings, Arg, ArgMatches, Shell, SubCommand};
use tracing_subscriber::EnvFilter;

mod subcommands;
pub use subcommands::IdiomClozeApp;

static DEFAULT_CLAP_SETTINGS: &[AppSettings] = &[
    AppSettings::DontCollapseArgsInUsage,
    AppSettings::UnifiedHelpMessage,
    AppSettings::SubcommandRequiredElseHelp,
];

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Known subapplications.
    let apps = vec![
        subcommands::PreprocessApp::app(),
        subcommands::TrainApp::app(),
        subcommands::VocabApp::app(),
    ];

    let cli = App::new("idiomcloze")
        .settings(DEFAULT_CLAP_SETTINGS)
        .subcommands(apps)
        .subcommand(
            SubCommand::with_name("completions")
                .about("Generate completion scripts for your shell")
                .setting(AppSettings::ArgRequiredElseHelp)
                .arg(Arg::with_name("shell").possible_values(&Shell::variants())),
        );
    let matches = cli.clone().get_matches();
    match matches.subcommand() {
        ("completions", Some(matches)) => {
            let shell = matches
                .value_of("shell")
                .context("No shell")?
                .parse::<Shell>()
                .map_err(anyhow::Error::msg)?;
            write_completion_script(cli, shell);
            Ok(())
        }
        ("preprocess", Some(matches)) => run::<subcommands::PreprocessApp>(matches),
        ("train", Some(matches)) => run::<subcommands::TrainApp>(matches),
        ("vocab", Some(matches)) => run::<subcommands::VocabApp>(matches),
        _unknown => unreachable!(),
    }
}

fn run<A>(matches: &ArgMatches) -> Result<()>
where
    A: IdiomClozeApp,
{
    A::parse(matches)?.run()
}

fn write_completion_script(mut cli: App, shell: Shell) {
    cli.gen_completions_to("idiomcloze", shell, &mut stdout());
}
