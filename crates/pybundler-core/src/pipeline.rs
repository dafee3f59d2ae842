//! End-to-end build: discovery, recipes, emission and the final audit.

use pybundler_schema::{BuildConfig, BuildMode, ConfigError};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::{AuditReport, audit};
use crate::compile::{ByteCompiler, HostCompiler, SourceCompiler};
use crate::emitter::{EmitSummary, Emitter};
use crate::error::{BuildError, Result};
use crate::finder::{FinderOptions, ModuleFinder};
use crate::graph::ModuleGraph;
use crate::interpreter::Interpreter;
use crate::layout::BundleLayout;
use crate::recipes::{RecipeEngine, Verdict};
use crate::relinker::{InstallNameTool, MachoEditor};
use crate::report::{MissingReport, ReportOptions};
use crate::reporter::Reporter;

/// Result of module discovery with recipes applied.
#[derive(Debug, Serialize)]
pub struct Discovery {
    #[serde(skip)]
    pub interpreter: Interpreter,
    pub graph: ModuleGraph,
    pub verdict: Verdict,
    pub report: MissingReport,
}

#[derive(Debug, Serialize)]
pub struct BuildSummary {
    pub bundle: PathBuf,
    pub mode: String,
    pub modules: usize,
    pub warnings: usize,
    pub emit: EmitSummary,
    pub audit: Option<AuditReport>,
}

/// A configured build. Collaborators default to the real tools and can be
/// swapped out for tests.
pub struct Pipeline<'a> {
    config: &'a BuildConfig,
    reporter: &'a dyn Reporter,
    interpreter: Option<Interpreter>,
    compiler: Option<Box<dyn ByteCompiler>>,
    editor: Option<Box<dyn MachoEditor>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a BuildConfig, reporter: &'a dyn Reporter) -> Self {
        Self {
            config,
            reporter,
            interpreter: None,
            compiler: None,
            editor: None,
        }
    }

    /// Use an already described interpreter instead of probing one.
    #[must_use]
    pub fn with_interpreter(mut self, interpreter: Interpreter) -> Self {
        self.interpreter = Some(interpreter);
        self
    }

    #[must_use]
    pub fn with_compiler(mut self, compiler: Box<dyn ByteCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    #[must_use]
    pub fn with_editor(mut self, editor: Box<dyn MachoEditor>) -> Self {
        self.editor = Some(editor);
        self
    }

    fn scripts(&self) -> Vec<PathBuf> {
        self.config
            .scripts()
            .iter()
            .chain(&self.config.extra_scripts)
            .map(|s| self.config.resolve(s))
            .collect()
    }

    /// Configuration checks that need the filesystem but write nothing.
    fn preflight(&self) -> Result<()> {
        self.config.validate()?;
        for script in self.scripts() {
            if !script.is_file() {
                return Err(ConfigError::invalid(format!("Script not found: {}", script.display())).into());
            }
        }
        Ok(())
    }

    fn launcher(&self) -> Result<PathBuf> {
        let Some(launcher) = &self.config.launcher else {
            return Err(ConfigError::invalid(
                "No launcher template configured (set `launcher` or PYBUNDLER_LAUNCHER)",
            )
            .into());
        };
        let path = self.config.resolve(launcher);
        if !path.is_file() {
            return Err(ConfigError::invalid(format!("Launcher not found: {}", path.display())).into());
        }
        Ok(path)
    }

    fn interpreter(&mut self) -> Result<Interpreter> {
        if let Some(interp) = self.interpreter.take() {
            return Ok(interp);
        }
        let executable = match &self.config.interpreter {
            Some(path) => self.config.resolve(path),
            None => Interpreter::find_default()?,
        };
        debug!("Probing {}", executable.display());
        Interpreter::probe(&executable)
    }

    /// Discover the module graph and apply recipes.
    pub fn discover(&mut self) -> Result<Discovery> {
        self.preflight()?;
        let interpreter = self.interpreter()?;
        let mode = self.config.mode();

        self.reporter.section("Discovering modules");
        let mut includes = self.config.includes.clone();
        if self.config.use_faulthandler && !includes.iter().any(|i| i == "faulthandler") {
            includes.push("faulthandler".to_string());
        }
        let options = FinderOptions {
            includes,
            excludes: self.config.excludes.clone(),
            packages: self.config.packages.clone(),
        };
        let (graph, verdict) = {
            let mut finder = ModuleFinder::discover(&interpreter, &self.scripts(), &options)?;
            let verdict = RecipeEngine::builtin().run(&mut finder, mode)?;
            (finder.into_graph(), verdict)
        };

        let expected: BTreeSet<String> = self
            .config
            .expected_missing
            .iter()
            .chain(&verdict.expected_missing)
            .cloned()
            .collect();
        let report = MissingReport::build(&graph, &expected).restricted(ReportOptions {
            from_imports: self.config.report_missing_from_imports,
            conditional: self.config.report_missing_conditional_imports,
        });
        info!("{} modules, {} missing warning(s)", graph.len(), report.warning_count());

        Ok(Discovery {
            interpreter,
            graph,
            verdict,
            report,
        })
    }

    /// Run the whole build and audit the result.
    pub fn build(mut self) -> Result<BuildSummary> {
        let start = Instant::now();
        self.preflight()?;
        let launcher = self.launcher()?;
        let discovery = self.discover()?;
        let mode = self.config.mode();

        let fatal = discovery.report.fatal();
        if !fatal.is_empty() {
            self.reporter.error(&discovery.report.render());
            return Err(BuildError::Discovery(fatal));
        }
        if !discovery.report.is_clean() {
            self.reporter.warning(&discovery.report.render());
        }

        let interpreter = &discovery.interpreter;
        let layout = BundleLayout::new(
            self.config.bundle_path(),
            &self.config.bundle_name(),
            interpreter.version,
        );
        let compiler: Box<dyn ByteCompiler> = match self.compiler.take() {
            Some(c) => c,
            None if self.config.byte_compile => Box::new(HostCompiler {
                interpreter: interpreter.executable.clone(),
                optimize: self.config.optimize,
            }),
            None => Box::new(SourceCompiler),
        };
        let editor: Box<dyn MachoEditor> = self.editor.take().unwrap_or_else(|| Box::new(InstallNameTool));

        let emit = Emitter {
            config: self.config,
            layout: &layout,
            launcher: &launcher,
            interpreter,
            graph: &discovery.graph,
            verdict: &discovery.verdict,
            compiler: compiler.as_ref(),
            editor: editor.as_ref(),
            reporter: self.reporter,
        }
        .emit()?;

        let audit = if mode == BuildMode::Alias {
            None
        } else {
            self.reporter.section("Auditing bundle");
            let mut allowed = allowed_external(mode, interpreter);
            allowed.extend(emit.relocation.excluded.iter().map(PathBuf::from));
            let report = audit(&layout, &allowed)?;
            if !report.is_clean() {
                let mut problems = report.external.clone();
                problems.extend(report.unresolved.iter().cloned());
                if let Err(e) = fs::remove_dir_all(layout.root()) {
                    warn!("Failed to remove {}: {e}", layout.root().display());
                }
                return Err(BuildError::Relocation(format!(
                    "bundle still references libraries it does not contain: {}",
                    problems.join(", ")
                )));
            }
            let partial = report.partial_archs();
            if !partial.is_empty() {
                self.reporter.warning(&format!(
                    "Not every binary supports {}",
                    partial.into_iter().collect::<Vec<_>>().join(", ")
                ));
            }
            Some(report)
        };

        let modules = discovery.graph.len();
        self.reporter.success(&format!("Built {}", layout.root().display()));
        self.reporter
            .summary(modules, "Bundled", start.elapsed().as_secs_f64());

        Ok(BuildSummary {
            bundle: layout.root().to_path_buf(),
            mode: mode.to_string(),
            modules,
            warnings: discovery.report.warning_count() + emit.relocation.warnings.len(),
            emit,
            audit,
        })
    }
}

/// Host locations a non-standalone bundle may link against.
fn allowed_external(mode: BuildMode, interpreter: &Interpreter) -> Vec<PathBuf> {
    if mode == BuildMode::Standalone {
        return Vec::new();
    }
    let mut allowed: Vec<PathBuf> = interpreter
        .runtime_library
        .iter()
        .filter_map(|lib| framework_root(lib).or_else(|| lib.parent().map(Path::to_path_buf)))
        .collect();
    allowed.push(interpreter.prefix.clone());
    allowed
}

/// `/x/Python.framework/Versions/3.12/Python` -> `/x/Python.framework`
fn framework_root(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|p| p.extension().is_some_and(|e| e == "framework"))
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_external() {
        let mut interp = Interpreter::from_layout(
            (3, 12),
            Path::new("/opt/py/lib/python3.12"),
            Path::new("/opt/py/lib/python3.12/site-packages"),
        );
        interp.runtime_library =
            Some(PathBuf::from("/Library/Frameworks/Python.framework/Versions/3.12/Python"));
        assert!(allowed_external(BuildMode::Standalone, &interp).is_empty());
        let allowed = allowed_external(BuildMode::SemiStandalone, &interp);
        assert!(allowed.contains(&PathBuf::from("/Library/Frameworks/Python.framework")));
        assert!(allowed.contains(&PathBuf::from("/opt/py/lib")));
    }
}
