use git2::{DescribeFormatOptions, DescribeOptions, Repository};

fn git_description() -> Option<String> {
    let repo = Repository::open_from_env().ok()?;
    let describe = repo
        .describe(
            DescribeOptions::new()
                .describe_tags()
                .show_commit_oid_as_fallback(true),
        )
        .ok()?;
    describe
        .format(Some(DescribeFormatOptions::new().dirty_suffix("-dirty")))
        .ok()
}

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");

    if let Some(desc) = git_description() {
        println!(
            "cargo:rustc-env=MAYBE_IDIOMCLOZE_GIT_DESC={} {}",
            env!("CARGO_PKG_VERSION"),
            desc
        );
    }
}
