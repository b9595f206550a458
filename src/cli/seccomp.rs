use anyhow::{Context, Result};

use awf_core::SeccompProfile;

use super::args::ValidateSeccompArgs;
use super::{error_indicator, success_indicator};

pub fn handle_validate_seccomp_command(args: ValidateSeccompArgs) -> Result<i32> {
    let (profile, source) = match &args.path {
        Some(path) => (
            SeccompProfile::load_file(path)
                .with_context(|| format!("failed to load seccomp profile {}", path.display()))?,
            path.display().to_string(),
        ),
        None => (
            SeccompProfile::builtin().context("built-in seccomp profile is unreadable")?,
            "built-in profile".to_string(),
        ),
    };

    if args.print {
        println!("{}", profile.to_json_pretty()?);
    }

    let report = profile.validate();
    if report.is_valid() {
        println!(
            "{}",
            success_indicator(&format!(
                "{source} is valid: {} allowed, {} denied syscalls",
                report.allowed, report.denied
            ))
        );
        return Ok(0);
    }

    println!(
        "{}",
        error_indicator(&format!(
            "{source} has {} violation(s)",
            report.violations.len()
        ))
    );
    for violation in &report.violations {
        println!("  - {violation}");
    }
    Ok(1)
}
