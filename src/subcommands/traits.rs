use std::cmp;

use anyhow::{Context, Result};
use clap::{App, AppSettings, Arg, ArgMatches};

static DEFAULT_CLAP_SETTINGS: &[AppSettings] = &[
    AppSettings::DontCollapseArgsInUsage,
    AppSettings::UnifiedHelpMessage,
];

pub trait IdiomClozeApp
where
    Self: Sized,
{
    const THREADS: &'static str = "THREADS";

    fn app() -> App<'static, 'static>;

    fn parse(matches: &ArgMatches) -> Result<Self>;

    fn run(&self) -> Result<()>;

    fn common_opts<'a, 'b>(name: &str) -> App<'a, 'b> {
        let version = if let Some(git_desc) = option_env!("MAYBE_IDIOMCLOZE_GIT_DESC") {
            git_desc
        } else {
            env!("CARGO_PKG_VERSION")
        };
        App::new(name)
            .settings(DEFAULT_CLAP_SETTINGS)
            .version(version)
    }

    /// Add the thread count option.
    fn threads_opt<'a, 'b>(app: App<'a, 'b>) -> App<'a, 'b> {
        app.arg(
            Arg::with_name(Self::THREADS)
                .long("threads")
                .value_name("N")
                .help("Number of threads (default: min(logical_cpus / 2, 20))")
                .takes_value(true),
        )
    }

    /// Parse the thread count, defaults to half of the logical CPUs.
    fn parse_threads(matches: &ArgMatches) -> Result<usize> {
        Ok(matches
            .value_of(Self::THREADS)
            .map(|v| v.parse().context("Cannot parse number of threads"))
            .transpose()?
            .unwrap_or_else(|| cmp::max(1, cmp::min(num_cpus::get() / 2, 20))))
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    fn simd_features() -> Vec<&'static str> {
        let mut features = vec![];

        if is_x86_feature_detected!("sse") {
            features.push("+sse");
        } else {
            features.push("-sse");
        }

        if is_x86_feature_detected!("avx") {
            features.push("+avx");
        } else {
            features.push("-avx");
        }

        if is_x86_feature_detected!("fma") {
            features.push("+fma");
        } else {
            features.push("-fma");
        }

        features
    }
}
