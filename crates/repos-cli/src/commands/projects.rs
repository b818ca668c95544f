//! `repos projects`

use repos_core::Repo;
use repos_engine::Result;

pub fn execute(repo: &Repo) -> Result<()> {
    for project in repo.projects() {
        if project.description.is_empty() {
            println!("{}\t{}", project.name, project.dir.display());
        } else {
            println!(
                "{}\t{}\t{}",
                project.name,
                project.dir.display(),
                project.description
            );
        }
    }
    Ok(())
}
