//! `repos log TARGET` — stream the last-run tool output of a target.

use std::io::Write;

use repos_core::Repo;
use repos_engine::{Error, Result};

use crate::commands::match_one_target;

pub fn execute(repo: &Repo, pattern: &str) -> Result<()> {
    let target = match_one_target(repo, pattern)?;
    let path = repo
        .log_dir()
        .join(format!("{}.out", target.global_name()));
    let mut file = std::fs::File::open(&path)
        .map_err(|e| Error::io(e, path.clone(), "open"))?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    std::io::copy(&mut file, &mut out).map_err(|e| Error::io(e, path, "stream"))?;
    out.flush().ok();
    Ok(())
}
