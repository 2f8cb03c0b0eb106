//! `strata lint` command: report cache-hostile ordering in a build file.

use std::path::PathBuf;

use clap::Args;
use strata_runtime::build::DEFAULT_BUILD_FILES;
use strata_runtime::{lint, plan, BuildFile};

#[derive(Args)]
pub struct LintArgs {
    /// Build context directory
    #[arg(default_value = ".")]
    pub path: String,

    /// Path to the build file (default: <PATH>/Stratafile, then <PATH>/Dockerfile)
    #[arg(short = 'f', long = "file")]
    pub file: Option<String>,

    /// Exit with an error when any warning is reported
    #[arg(long)]
    pub strict: bool,
}

pub async fn execute(args: LintArgs) -> Result<(), Box<dyn std::error::Error>> {
    let context_dir = PathBuf::from(&args.path);
    let build_file = match &args.file {
        Some(f) => super::resolve_path(&context_dir, f),
        None => DEFAULT_BUILD_FILES
            .iter()
            .map(|name| context_dir.join(name))
            .find(|p| p.is_file())
            .ok_or_else(|| format!("No build file found in {}", context_dir.display()))?,
    };

    let file = BuildFile::from_file(&build_file)?;
    let plan = plan(&file, &Default::default())?;
    let warnings = lint(&plan, Some(&context_dir));

    if warnings.is_empty() {
        println!("{}: no issues found", build_file.display());
        return Ok(());
    }

    for warning in &warnings {
        println!("{}: {}", build_file.display(), warning);
    }

    if args.strict {
        return Err(format!("{} lint warning(s)", warnings.len()).into());
    }
    Ok(())
}
