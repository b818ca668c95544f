//! `repos status TARGET`

use repos_cache::{result_file, state_file, TaskResult};
use repos_core::Repo;
use repos_engine::Result;

use crate::commands::match_one_target;
use crate::printer::format_nanos;

pub fn execute(repo: &Repo, pattern: &str) -> Result<()> {
    let target = match_one_target(repo, pattern)?;
    let name = target.global_name();
    let cache_dir = repo.cache_dir();

    let result = TaskResult::load_or_default(&result_file(&cache_dir, &name));
    println!("{name}");
    if result.start_time == 0 {
        println!("  last run: never");
    } else {
        let verdict = if result.skipped {
            " (skipped)".to_string()
        } else if let Some(error) = &result.error {
            format!(" (failed: {error})")
        } else {
            String::new()
        };
        println!(
            "  last run: {} .. {}{verdict}",
            format_nanos(result.start_time),
            format_nanos(result.end_time)
        );
    }
    println!(
        "  last success: {} .. {}",
        format_nanos(result.success_build_start_time),
        format_nanos(result.success_build_end_time)
    );

    let outputs = repos_cache::load_state(&state_file(&cache_dir, &name))
        .ok()
        .map(|state| state.task_outputs);
    if let Some(outputs) = outputs {
        if !outputs.primary.is_empty() {
            println!("  output: {}", outputs.primary);
        }
        for (key, path) in &outputs.extra {
            println!("  output[{key}]: {path}");
        }
        for generated in &outputs.generated_files {
            println!("  generated: {generated}");
        }
    }
    Ok(())
}
