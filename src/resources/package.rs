//! Local packaging step
//!
//! Archives the project tree into a gzip tar. Exclude patterns match whole
//! path components at any depth (`.bundle` drops every `.bundle` directory),
//! the same way `tar --exclude=<name>` treats a plain name.

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{Properties, Resource, RunContext};
use crate::DeployError;
use crate::exec::CommandSpec;
use crate::graph::Freshness;
use crate::template::CommandTemplate;

/// What went into an archive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub files: usize,
    pub directories: usize,
}

/// Write `source` into a gzip tar at `archive`, skipping excluded names
/// and the archive itself
pub fn write_archive(
    source: &Path,
    archive: &Path,
    excludes: &[String],
) -> Result<ArchiveSummary, DeployError> {
    if !source.is_dir() {
        return Err(DeployError::Package(format!(
            "source {} is not a directory",
            source.display()
        )));
    }

    if let Some(parent) = archive.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(archive)?;
    // Resolved after creation so the archive can be recognised while walking.
    let archive_abs = archive.canonicalize()?;

    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);

    let mut summary = ArchiveSummary::default();
    append_tree(
        &mut builder,
        source,
        Path::new(""),
        excludes,
        &archive_abs,
        &mut summary,
    )?;

    builder.into_inner()?.finish()?;
    Ok(summary)
}

fn append_tree<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    prefix: &Path,
    excludes: &[String],
    archive: &Path,
    summary: &mut ArchiveSummary,
) -> Result<(), DeployError> {
    let mut entries = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let file_name = entry.file_name();
        if excludes.iter().any(|x| file_name.as_os_str() == x.as_str()) {
            debug!("Excluding {}", prefix.join(&file_name).display());
            continue;
        }

        let path = entry.path();
        let name = prefix.join(&file_name);
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            builder.append_dir(&name, &path)?;
            summary.directories += 1;
            append_tree(builder, &path, &name, excludes, archive, summary)?;
        } else {
            if path.canonicalize().is_ok_and(|p| p == archive) {
                continue;
            }
            builder.append_path_with_name(&path, &name)?;
            summary.files += 1;
        }
    }

    Ok(())
}

/// Packages the project tree on the operator's machine
#[derive(Debug, Clone)]
pub struct Package {
    pub name: String,
    /// Step that must exist before packaging starts
    pub after: String,
    pub source_dir: PathBuf,
    pub archive: PathBuf,
    pub excludes: Vec<String>,
    /// Shell command replacing the built-in archiver
    pub command: Option<String>,
}

impl Package {
    /// Runs `template` through `sh -c` inside the source tree; `archive`
    /// must be absolute since the shell does not start in our cwd
    async fn run_command(
        &self,
        ctx: &RunContext,
        template: &str,
        archive: &Path,
    ) -> Result<(), DeployError> {
        let excludes = self
            .excludes
            .iter()
            .map(|x| format!("--exclude='{x}'"))
            .collect::<Vec<_>>()
            .join(" ");
        let command = CommandTemplate::new()
            .var("archive", archive.to_string_lossy().into_owned())
            .var("source_dir", self.source_dir.to_string_lossy().into_owned())
            .var("excludes", excludes)
            .render(template)?;

        info!("Packaging with: {}", command);
        let spec = CommandSpec::new("sh", ["-c".to_string(), command]).in_dir(&self.source_dir);
        let output = ctx.runner.run(&spec).await?.check("sh")?;
        if !output.stdout.is_empty() {
            debug!("packaging stdout: {}", output.stdout);
        }
        Ok(())
    }
}

#[async_trait]
impl Resource for Package {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "command:local:Command"
    }

    fn dependencies(&self) -> Vec<String> {
        vec![self.after.clone()]
    }

    fn freshness(&self) -> Freshness {
        Freshness::Always
    }

    async fn create(&self, ctx: &RunContext) -> Result<Properties, DeployError> {
        // Relative archive paths are anchored at our cwd, not the source tree.
        let archive = std::path::absolute(&self.archive)?;
        if archive.exists() {
            tokio::fs::remove_file(&archive).await?;
        }

        let mut props = Properties::new();
        match &self.command {
            Some(template) => self.run_command(ctx, template, &archive).await?,
            None => {
                info!(
                    "Packaging {} into {}",
                    self.source_dir.display(),
                    archive.display()
                );
                let source = self.source_dir.clone();
                let target = archive.clone();
                let excludes = self.excludes.clone();
                let summary = tokio::task::spawn_blocking(move || {
                    write_archive(&source, &target, &excludes)
                })
                .await
                .map_err(|e| DeployError::Package(format!("archiver task failed: {e}")))??;
                info!(
                    "Archived {} files in {} directories",
                    summary.files, summary.directories
                );
                props.insert("files", summary.files.to_string());
            }
        }

        if !archive.exists() {
            return Err(DeployError::Package(format!(
                "{} was not produced",
                archive.display()
            )));
        }
        let bytes = tokio::fs::metadata(&archive).await?.len();
        props.insert("archive", archive.to_string_lossy().into_owned());
        props.insert("bytes", bytes.to_string());
        Ok(props)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::mock::ScriptedRunner;
    use crate::graph::TriggerToken;
    use crate::provider::mock::MockEc2;
    use flate2::read::GzDecoder;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn project(root: &Path) -> PathBuf {
        let tree = root.join("server");
        std::fs::create_dir_all(tree.join("lib")).unwrap();
        std::fs::create_dir_all(tree.join(".bundle")).unwrap();
        std::fs::create_dir_all(tree.join("infrastructure")).unwrap();
        std::fs::create_dir_all(tree.join("vendor/.bundle")).unwrap();
        std::fs::write(tree.join("install.sh"), "#!/bin/bash\necho install\n").unwrap();
        std::fs::write(tree.join("lib/app.rb"), "puts 1\n").unwrap();
        std::fs::write(tree.join(".bundle/config"), "BUNDLE_PATH: x\n").unwrap();
        std::fs::write(tree.join("infrastructure/main.rs"), "fn main() {}\n").unwrap();
        std::fs::write(tree.join("vendor/.bundle/x"), "x\n").unwrap();
        tree
    }

    fn entries(archive: &Path) -> Vec<String> {
        let file = File::open(archive).unwrap();
        let mut tar = tar::Archive::new(GzDecoder::new(file));
        let mut names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_string()
            })
            .collect();
        names.sort();
        names
    }

    fn excludes() -> Vec<String> {
        vec![".bundle".to_string(), "infrastructure".to_string()]
    }

    #[test]
    fn test_archive_skips_excluded_components() {
        let temp = TempDir::new().unwrap();
        let tree = project(temp.path());
        let archive = temp.path().join("out/server.tar.gz");

        let summary = write_archive(&tree, &archive, &excludes()).unwrap();

        assert_eq!(
            entries(&archive),
            vec!["install.sh", "lib", "lib/app.rb", "vendor"]
        );
        assert_eq!(summary.files, 2);
        assert_eq!(summary.directories, 2);
    }

    #[test]
    fn test_archive_inside_tree_is_not_archived() {
        let temp = TempDir::new().unwrap();
        let tree = project(temp.path());
        let archive = tree.join("server.tar.gz");

        write_archive(&tree, &archive, &excludes()).unwrap();
        assert!(!entries(&archive).contains(&"server.tar.gz".to_string()));
    }

    #[test]
    fn test_missing_source_is_error() {
        let temp = TempDir::new().unwrap();
        let result = write_archive(
            &temp.path().join("nope"),
            &temp.path().join("a.tar.gz"),
            &[],
        );
        assert!(matches!(result, Err(DeployError::Package(_))));
    }

    fn ctx(runner: ScriptedRunner) -> RunContext {
        RunContext::new(
            Arc::new(MockEc2::new()),
            Arc::new(runner),
            TriggerToken::fresh(),
        )
    }

    #[tokio::test]
    async fn test_create_replaces_previous_archive() {
        let temp = TempDir::new().unwrap();
        let tree = project(temp.path());
        let archive = temp.path().join("server.tar.gz");
        std::fs::write(&archive, "stale").unwrap();

        let step = Package {
            name: "tar-cmd".to_string(),
            after: "ec2-runner".to_string(),
            source_dir: tree,
            archive: archive.clone(),
            excludes: excludes(),
            command: None,
        };
        let props = step.create(&ctx(ScriptedRunner::new())).await.unwrap();

        assert_eq!(props.get("files"), Some("2"));
        assert_ne!(std::fs::read(&archive).unwrap(), b"stale");
        assert_eq!(step.freshness(), Freshness::Always);
    }

    #[tokio::test]
    async fn test_custom_command_runs_in_source_dir() {
        let temp = TempDir::new().unwrap();
        let tree = project(temp.path());
        let archive = temp.path().join("server.tar.gz");

        let runner = Arc::new(ScriptedRunner::new());
        let ctx = RunContext::new(
            Arc::new(MockEc2::new()),
            runner.clone(),
            TriggerToken::fresh(),
        );
        let step = Package {
            name: "tar-cmd".to_string(),
            after: "ec2-runner".to_string(),
            source_dir: tree.clone(),
            archive: archive.clone(),
            excludes: excludes(),
            command: Some("tar zcf {{ archive }} {{ excludes }} .".to_string()),
        };

        // The scripted shell writes nothing, so the step reports a missing archive.
        let result = step.create(&ctx).await;
        assert!(matches!(result, Err(DeployError::Package(_))));

        let calls = runner.calls_to("sh");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].current_dir.as_deref(), Some(tree.as_path()));
        assert_eq!(
            calls[0].args[1],
            format!(
                "tar zcf {} --exclude='.bundle' --exclude='infrastructure' .",
                archive.display()
            )
        );
    }

    #[tokio::test]
    async fn test_relative_archive_is_anchored_at_cwd() {
        let temp = TempDir::new().unwrap();
        let tree = project(temp.path());
        let relative = PathBuf::from("target/package-test/relative-server.tar.gz");
        let expected = std::env::current_dir().unwrap().join(&relative);

        let runner = Arc::new(ScriptedRunner::new());
        let ctx = RunContext::new(
            Arc::new(MockEc2::new()),
            runner.clone(),
            TriggerToken::fresh(),
        );
        let step = Package {
            name: "tar-cmd".to_string(),
            after: "ec2-runner".to_string(),
            source_dir: tree.clone(),
            archive: relative,
            excludes: Vec::new(),
            command: Some("tar zcf {{ archive }} .".to_string()),
        };

        let err = step.create(&ctx).await.unwrap_err();
        assert!(err.to_string().contains(&expected.display().to_string()));

        let calls = runner.calls_to("sh");
        assert_eq!(calls[0].current_dir.as_deref(), Some(tree.as_path()));
        assert_eq!(calls[0].args[1], format!("tar zcf {} .", expected.display()));
    }

    #[tokio::test]
    async fn test_custom_command_failure_aborts() {
        let temp = TempDir::new().unwrap();
        let tree = project(temp.path());
        let step = Package {
            name: "tar-cmd".to_string(),
            after: "ec2-runner".to_string(),
            source_dir: tree,
            archive: temp.path().join("server.tar.gz"),
            excludes: excludes(),
            command: Some("tar zcf {{ archive }} .".to_string()),
        };

        let err = step
            .create(&ctx(ScriptedRunner::new().fail("sh", None, 2, "tar: write error")))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::CommandFailed { .. }));
    }
}
