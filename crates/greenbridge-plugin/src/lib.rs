//! # greenbridge-plugin
//!
//! Build configuration for optional native extensions. Each plugin is
//! described by a [`PluginDescriptor`]: compiler and linker flags, libraries,
//! modules to compile, environment changes and an optional post-build step.
//!
//! ## Modules
//!
//! - `descriptor` - the descriptor and its environment requests
//! - `jvm` - JDK autodetection, overrides, `uwsgi.jar` packaging
//! - `pyuwsgi` - Python embedding flags
//! - `compile` - `cc`-backed compile step
//! - `error` - `PluginError`

pub mod compile;
pub mod descriptor;
pub mod error;
pub mod jvm;
pub mod pyuwsgi;

pub use compile::{build_plugin, configure_and_build, CcCompiler, CompileStep};
pub use descriptor::{EnvMode, EnvRequest, PluginDescriptor, PostBuild};
pub use error::{PluginError, PluginResult};
pub use jvm::{JavaTools, JvmDetector, JvmOverrides};
pub use pyuwsgi::{PythonInfo, PythonProbe};

/// Source of a plugin's descriptor
pub trait Probe {
    fn describe(&self) -> PluginResult<PluginDescriptor>;
}

/// Names accepted by [`probe_for`]
pub const PLUGINS: &[&str] = &["jvm", "pyuwsgi"];

/// Probe configured from the environment for the named plugin
pub fn probe_for(name: &str) -> PluginResult<Box<dyn Probe>> {
    match name {
        "jvm" => Ok(Box::new(JvmDetector::from_env())),
        "pyuwsgi" => Ok(Box::new(PythonProbe::from_env())),
        other => Err(PluginError::UnknownPlugin(other.to_string())),
    }
}
