//! pyuwsgi plugin: Python embedding flags from the interpreter itself

use std::process::Command;

use greenbridge_core::env::env_get_str;
use tracing::debug;

use crate::descriptor::{EnvRequest, PluginDescriptor};
use crate::error::{PluginError, PluginResult};
use crate::Probe;

const QUERY: &str = "import sys, sysconfig\n\
                     print(sysconfig.get_path('include'))\n\
                     print(sysconfig.get_path('platinclude'))\n\
                     print(sys.version_info[0])";

/// What the build needs to know about the interpreter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PythonInfo {
    pub include: String,
    pub platinclude: String,
    pub major: u32,
}

impl PythonInfo {
    /// Parse the three lines printed by the query script
    pub fn parse(output: &str) -> Option<Self> {
        let mut lines = output.lines().map(str::trim);
        let include = lines.next().filter(|l| !l.is_empty())?.to_string();
        let platinclude = lines.next().filter(|l| !l.is_empty())?.to_string();
        let major = lines.next()?.parse().ok()?;
        Some(Self {
            include,
            platinclude,
            major,
        })
    }

    pub fn descriptor(&self) -> PluginDescriptor {
        let mut desc = PluginDescriptor::new("pyuwsgi");
        desc.cflags = vec![format!("-I{}", self.include), format!("-I{}", self.platinclude)];
        // Python 3 builds the module through its own extension machinery
        if self.major < 3 {
            desc.modules = vec!["pyuwsgi".to_string()];
        }
        desc.env.push(EnvRequest::set("UWSGI_PYTHON_NOLIB", "1"));
        desc
    }
}

#[derive(Debug, Clone)]
pub struct PythonProbe {
    interpreter: String,
}

impl PythonProbe {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }

    /// Interpreter from `PYTHON`, default `python3`
    pub fn from_env() -> Self {
        Self::new(env_get_str("PYTHON", "python3"))
    }

    pub fn probe(&self) -> PluginResult<PythonInfo> {
        let fail = |reason: String| PluginError::Probe {
            interpreter: self.interpreter.clone(),
            reason,
        };
        let output = Command::new(&self.interpreter)
            .args(["-c", QUERY])
            .output()
            .map_err(|err| fail(err.to_string()))?;
        if !output.status.success() {
            return Err(fail(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(interpreter = %self.interpreter, output = %stdout.trim(), "python probed");
        PythonInfo::parse(&stdout).ok_or_else(|| fail("unexpected query output".to_string()))
    }
}

impl Probe for PythonProbe {
    fn describe(&self) -> PluginResult<PluginDescriptor> {
        Ok(self.probe()?.descriptor())
    }
}
