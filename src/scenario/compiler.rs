use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::{CompilerConfig, OUTPUT_PLACEHOLDER, SOURCE_PLACEHOLDER};
use crate::error::{PilotError, Result};
use crate::scenario::{CompiledPlan, Scenario};

/// A built scenario on disk. The file is removed when the artifact is dropped,
/// so each artifact is consumed by exactly one execution.
#[derive(Debug)]
pub struct CompiledArtifact {
    path: PathBuf,
}

impl CompiledArtifact {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CompiledArtifact {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove artifact");
            }
        }
    }
}

/// Turns scenario source into a [`CompiledArtifact`] by running the configured
/// build program once.
#[derive(Debug, Clone)]
pub struct Compiler {
    config: CompilerConfig,
}

impl Compiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    /// Compile `source`. The build process is killed if `cancel` fires.
    pub async fn compile(
        &self,
        source: &str,
        cancel: &CancellationToken,
    ) -> Result<CompiledArtifact> {
        // Removed on drop, whichever way this function returns.
        let mut source_file = tempfile::Builder::new()
            .prefix("loadpilot-scenario-")
            .suffix(".toml")
            .tempfile()
            .map_err(|e| PilotError::Compile(format!("create temp scenario file: {}", e)))?;
        source_file
            .write_all(source.as_bytes())
            .and_then(|_| source_file.flush())
            .map_err(|e| PilotError::Compile(format!("write scenario file: {}", e)))?;

        let source_path = source_file.path().to_path_buf();
        let output_path = PathBuf::from(format!("{}.plan", source_path.display()));
        let args = self.expand_args(&source_path, &output_path);

        tracing::debug!(
            program = %self.config.program.display(),
            args = ?args,
            "Running scenario build"
        );

        let child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PilotError::Compile(format!(
                    "start build program {}: {}",
                    self.config.program.display(),
                    e
                ))
            })?;

        let output = tokio::select! {
            output = child.wait_with_output() => output
                .map_err(|e| PilotError::Compile(format!("wait for build program: {}", e)))?,
            _ = cancel.cancelled() => {
                remove_partial(&output_path);
                return Err(PilotError::Canceled);
            }
        };

        if !output.status.success() {
            remove_partial(&output_path);
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let diagnostic = if !stderr.is_empty() {
                stderr
            } else if !stdout.is_empty() {
                stdout
            } else {
                format!("build program exited with {}", output.status)
            };
            return Err(PilotError::Compile(diagnostic));
        }

        if !output_path.exists() {
            return Err(PilotError::Compile(format!(
                "build program produced no artifact at {}",
                output_path.display()
            )));
        }

        drop(source_file);
        Ok(CompiledArtifact::new(output_path))
    }

    fn expand_args(&self, source: &Path, output: &Path) -> Vec<String> {
        let source = source.display().to_string();
        let output = output.display().to_string();
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace(SOURCE_PLACEHOLDER, &source)
                    .replace(OUTPUT_PLACEHOLDER, &output)
            })
            .collect()
    }
}

fn remove_partial(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// The build step itself: validate scenario source and write the plan.
pub fn build(source: &Path, output: &Path) -> Result<()> {
    let text = std::fs::read_to_string(source)?;
    let scenario = Scenario::parse(&text)?;
    CompiledPlan::from_scenario(scenario).write(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_args_substitutes_placeholders() {
        let compiler = Compiler::new(
            CompilerConfig::new("tool").with_args(["-i", "{source}", "-o={output}", "fixed"]),
        );
        let args = compiler.expand_args(Path::new("/tmp/a.toml"), Path::new("/tmp/a.toml.plan"));
        assert_eq!(args, vec!["-i", "/tmp/a.toml", "-o=/tmp/a.toml.plan", "fixed"]);
    }

    #[test]
    fn build_writes_a_loadable_plan() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("s.toml");
        let output = dir.path().join("s.plan");
        std::fs::write(&source, "[[group]]\nname = \"a\"\nconcurrency = 2\n").unwrap();

        build(&source, &output).unwrap();
        let plan = CompiledPlan::load(&output).unwrap();
        assert_eq!(plan.groups[0].concurrency, 2);
        assert_eq!(plan.name, "unnamed");
    }

    #[test]
    fn build_rejects_invalid_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("s.toml");
        let output = dir.path().join("s.plan");
        std::fs::write(&source, "not a scenario").unwrap();

        assert!(build(&source, &output).is_err());
        assert!(!output.exists());
    }

    #[test]
    fn dropping_an_artifact_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.plan");
        std::fs::write(&path, "{}").unwrap();

        let artifact = CompiledArtifact::new(path.clone());
        assert!(artifact.path().exists());
        drop(artifact);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn failing_build_program_reports_its_stderr() {
        let compiler = Compiler::new(
            CompilerConfig::new("sh").with_args(["-c", "echo 'syntax error near line 3' >&2; exit 2"]),
        );
        let err = compiler
            .compile("whatever", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            PilotError::Compile(msg) => assert!(msg.contains("syntax error near line 3")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_build_program_is_a_compile_error() {
        let compiler = Compiler::new(CompilerConfig::new("/nonexistent/loadpilot-build"));
        let err = compiler
            .compile("whatever", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PilotError::Compile(_)));
    }

    #[tokio::test]
    async fn cancel_stops_a_running_build() {
        let compiler = Compiler::new(CompilerConfig::new("sleep").with_args(["10"]));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = compiler.compile("whatever", &cancel).await.unwrap_err();
        assert!(matches!(err, PilotError::Canceled));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
