//! Plugin build descriptor

use std::fmt;

/// How a descriptor wants an environment variable changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvMode {
    /// Replace any current value
    Set,
    /// Append to a `:`-separated path list, or set if unset
    AppendPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvRequest {
    pub key: String,
    pub value: String,
    pub mode: EnvMode,
}

impl EnvRequest {
    pub fn set(key: &str, value: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            value: value.into(),
            mode: EnvMode::Set,
        }
    }

    pub fn append_path(key: &str, value: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            value: value.into(),
            mode: EnvMode::AppendPath,
        }
    }

    /// Value the variable should have, given its current value
    pub fn resolve(&self, current: Option<&str>) -> String {
        match (&self.mode, current) {
            (EnvMode::AppendPath, Some(cur)) if !cur.is_empty() => format!("{}:{}", cur, self.value),
            _ => self.value.clone(),
        }
    }

    /// Apply to this process's environment
    pub fn apply(&self) {
        let current = std::env::var(&self.key).ok();
        std::env::set_var(&self.key, self.resolve(current.as_deref()));
    }
}

/// Step to run after the modules are compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostBuild {
    /// Compile `uwsgi.java` and package the classes into `uwsgi.jar`
    JvmJar,
}

/// What a native extension needs from the build
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PluginDescriptor {
    pub name: String,
    pub cflags: Vec<String>,
    pub ldflags: Vec<String>,
    pub libs: Vec<String>,
    /// Modules to compile, by stem (`<src>/<module>.c`)
    pub modules: Vec<String>,
    pub env: Vec<EnvRequest>,
    pub post_build: Option<PostBuild>,
}

impl PluginDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Compiler arguments, with whitespace-separated flag strings split up
    pub fn compiler_args(&self) -> Vec<String> {
        self.cflags
            .iter()
            .flat_map(|f| f.split_whitespace())
            .map(str::to_string)
            .collect()
    }

    pub fn apply_env(&self) {
        for req in &self.env {
            req.apply();
        }
    }
}

impl fmt::Display for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "NAME = {}", self.name)?;
        writeln!(f, "CFLAGS = {}", self.cflags.join(" "))?;
        writeln!(f, "LDFLAGS = {}", self.ldflags.join(" "))?;
        writeln!(f, "LIBS = {}", self.libs.join(" "))?;
        write!(f, "GCC_LIST = {}", self.modules.join(" "))?;
        for req in &self.env {
            let op = match req.mode {
                EnvMode::Set => "=",
                EnvMode::AppendPath => "+=",
            };
            write!(f, "\n{} {} {}", req.key, op, req.value)?;
        }
        Ok(())
    }
}
