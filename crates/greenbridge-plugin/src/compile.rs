//! Compile step
//!
//! Every module a descriptor lists is compiled from `<src>/<module>.c` with
//! the descriptor's compiler flags. The first failure aborts the build.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::descriptor::PluginDescriptor;
use crate::error::{PluginError, PluginResult};
use crate::Probe;

/// Compiles one C source into object files
pub trait CompileStep {
    fn compile(
        &mut self,
        desc: &PluginDescriptor,
        module: &str,
        source: &Path,
        out_dir: &Path,
    ) -> PluginResult<Vec<PathBuf>>;
}

/// [`CompileStep`] backed by the `cc` crate
#[derive(Debug, Clone)]
pub struct CcCompiler {
    target: String,
    host: String,
    opt_level: String,
}

impl Default for CcCompiler {
    /// Same target and optimization level as this binary was built with
    fn default() -> Self {
        Self {
            target: env!("GB_BUILD_TARGET").to_string(),
            host: env!("GB_BUILD_HOST").to_string(),
            opt_level: env!("GB_BUILD_OPT_LEVEL").to_string(),
        }
    }
}

impl CcCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(mut self, triple: &str) -> Self {
        self.target = triple.to_string();
        self
    }

    pub fn opt_level(mut self, level: &str) -> Self {
        self.opt_level = level.to_string();
        self
    }
}

impl CompileStep for CcCompiler {
    fn compile(
        &mut self,
        desc: &PluginDescriptor,
        module: &str,
        source: &Path,
        out_dir: &Path,
    ) -> PluginResult<Vec<PathBuf>> {
        let mut build = cc::Build::new();
        build
            .file(source)
            .out_dir(out_dir)
            .target(&self.target)
            .host(&self.host)
            .opt_level_str(&self.opt_level)
            .cargo_metadata(false)
            .cargo_warnings(false)
            .warnings(false);
        for arg in desc.compiler_args() {
            build.flag(&arg);
        }
        build
            .try_compile_intermediates()
            .map_err(|err| PluginError::Compile {
                module: module.to_string(),
                reason: err.to_string(),
            })
    }
}

/// Compile every module of `desc`; returns the object files
pub fn build_plugin(
    desc: &PluginDescriptor,
    src_dir: &Path,
    out_dir: &Path,
    step: &mut dyn CompileStep,
) -> PluginResult<Vec<PathBuf>> {
    fs::create_dir_all(out_dir)?;
    let mut objects = Vec::new();
    for module in &desc.modules {
        let source = src_dir.join(format!("{}.c", module));
        if !source.is_file() {
            return Err(PluginError::MissingSource(source));
        }
        info!(plugin = %desc.name, module = %module, "compiling");
        objects.extend(step.compile(desc, module, &source, out_dir)?);
    }
    Ok(objects)
}

/// Describe, then compile; nothing is compiled if describing fails
pub fn configure_and_build(
    probe: &dyn Probe,
    step: &mut dyn CompileStep,
    src_dir: &Path,
    out_dir: &Path,
) -> PluginResult<(PluginDescriptor, Vec<PathBuf>)> {
    let desc = probe.describe()?;
    let objects = build_plugin(&desc, src_dir, out_dir, step)?;
    Ok((desc, objects))
}
