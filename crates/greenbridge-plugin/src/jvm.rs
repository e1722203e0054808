//! JVM plugin: JDK autodetection and the `uwsgi.jar` post-build step
//!
//! Detection walks a fixed list of install locations. The
//! `UWSGICONFIG_JVM_INCPATH` / `UWSGICONFIG_JVM_LIBPATH` overrides replace
//! the detected compiler and linker flags with their values, unmodified.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use greenbridge_core::env::env_get_str;
use tracing::{debug, info};

use crate::descriptor::{EnvRequest, PluginDescriptor, PostBuild};
use crate::error::{PluginError, PluginResult};
use crate::Probe;

pub const INCPATH_VAR: &str = "UWSGICONFIG_JVM_INCPATH";
pub const LIBPATH_VAR: &str = "UWSGICONFIG_JVM_LIBPATH";

/// Searched in order on everything but macOS
pub const KNOWN_JVMS: &[&str] = &[
    "/usr/lib/jvm/java-7-openjdk",
    "/usr/local/openjdk7",
    "/usr/lib/jvm/java-6-openjdk",
    "/usr/local/openjdk",
    "/usr/java",
    "/usr/lib/jvm/java/",
];

pub const DARWIN_HEADERS: &str = "/System/Library/Frameworks/JavaVM.framework/Headers";

const DARWIN_FRAMEWORK: &str = "-framework JavaVM";

/// OS and architecture names as JDK directory layouts spell them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub os: String,
    pub arch: String,
}

impl HostInfo {
    pub fn new(os: &str, arch: &str) -> Self {
        Self {
            os: os.to_ascii_lowercase(),
            arch: jdk_arch(arch).to_string(),
        }
    }

    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        Self::new(os, std::env::consts::ARCH)
    }
}

fn jdk_arch(arch: &str) -> &str {
    match arch {
        "i686" | "x86" | "x86_32" => "i386",
        "x86_64" => "amd64",
        other => other,
    }
}

/// Values of the override variables; empty counts as unset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JvmOverrides {
    pub incpath: Option<String>,
    pub libpath: Option<String>,
}

impl JvmOverrides {
    pub fn from_env() -> Self {
        let get = |key| Some(env_get_str(key, "")).filter(|v| !v.is_empty());
        Self {
            incpath: get(INCPATH_VAR),
            libpath: get(LIBPATH_VAR),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JvmDetector {
    root: PathBuf,
    host: HostInfo,
    overrides: JvmOverrides,
}

impl JvmDetector {
    pub fn new(host: HostInfo, overrides: JvmOverrides) -> Self {
        Self {
            root: PathBuf::from("/"),
            host,
            overrides,
        }
    }

    /// Detector for this machine with overrides from the environment
    pub fn from_env() -> Self {
        Self::new(HostInfo::current(), JvmOverrides::from_env())
    }

    /// Resolve install locations under `root` instead of `/`
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    fn locate(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// Compiler and linker flags of the first JDK found
    pub fn autodetect(&self) -> Option<(Vec<String>, Vec<String>)> {
        if self.host.os == "darwin" {
            let headers = self.locate(DARWIN_HEADERS);
            if !headers.exists() {
                return None;
            }
            return Some((
                vec![
                    "-Wno-deprecated-declarations".to_string(),
                    format!("-I{}", headers.display()),
                ],
                vec![DARWIN_FRAMEWORK.to_string()],
            ));
        }

        for jvm in KNOWN_JVMS {
            let base = self.locate(jvm).display().to_string();
            let arch_base = format!("{}-{}", base, self.host.arch);
            for candidate in [base, arch_base] {
                if Path::new(&format!("{}/include", candidate)).exists() {
                    debug!(jvm = %candidate, "found JDK");
                    return Some(self.flags_for(&candidate));
                }
            }
        }
        None
    }

    fn flags_for(&self, jvm: &str) -> (Vec<String>, Vec<String>) {
        (
            vec![
                format!("-I{}/include/", jvm),
                format!("-I{}/include/{}", jvm, self.host.os),
            ],
            vec![format!("-L{}/jre/lib/{}/server", jvm, self.host.arch)],
        )
    }
}

impl Probe for JvmDetector {
    fn describe(&self) -> PluginResult<PluginDescriptor> {
        let (mut cflags, mut ldflags) = match self.autodetect() {
            Some((c, l)) => (Some(c), Some(l)),
            None => (None, None),
        };
        if let Some(inc) = &self.overrides.incpath {
            cflags = Some(vec![inc.clone()]);
        }
        if let Some(lib) = &self.overrides.libpath {
            ldflags = Some(vec![lib.clone()]);
        }
        let (Some(cflags), Some(ldflags)) = (cflags, ldflags) else {
            return Err(PluginError::JvmNotFound);
        };

        let framework = ldflags.iter().any(|f| f == DARWIN_FRAMEWORK);
        let mut desc = PluginDescriptor::new("jvm");
        desc.libs = if framework { Vec::new() } else { vec!["-ljvm".to_string()] };
        desc.modules = vec!["jvm_plugin".to_string()];
        desc.post_build = Some(PostBuild::JvmJar);
        if !framework {
            if let Some(first) = ldflags.first() {
                let dir = first.strip_prefix("-L").unwrap_or(first);
                desc.env.push(EnvRequest::append_path("LD_RUN_PATH", dir));
            }
        }
        desc.cflags = cflags;
        desc.ldflags = ldflags;
        Ok(desc)
    }
}

/// External tools used by the post-build step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JavaTools {
    pub javac: String,
    pub jar: String,
}

impl Default for JavaTools {
    fn default() -> Self {
        Self {
            javac: "javac".to_string(),
            jar: "jar".to_string(),
        }
    }
}

impl JavaTools {
    /// `JAVAC` and `JAR` override the tool names
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            javac: env_get_str("JAVAC", &d.javac),
            jar: env_get_str("JAR", &d.jar),
        }
    }
}

/// Compile `<root>/plugins/jvm/uwsgi.java` and package it as `uwsgi.jar`
///
/// Returns the jar's path. Either tool exiting non-zero aborts.
pub fn build_jar(root: &Path, tools: &JavaTools) -> PluginResult<PathBuf> {
    let dir = root.join("plugins").join("jvm");

    let status = Command::new(&tools.javac)
        .arg(dir.join("uwsgi.java"))
        .status()?;
    if !status.success() {
        return Err(PluginError::PostBuild {
            step: tools.javac.clone(),
            status: status.code(),
        });
    }

    let mut classes: Vec<PathBuf> = fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "class"))
        .filter_map(|p| p.file_name().map(PathBuf::from))
        .collect();
    classes.sort();

    let status = Command::new(&tools.jar)
        .current_dir(&dir)
        .args(["cvf", "uwsgi.jar"])
        .args(&classes)
        .status()?;
    if !status.success() {
        return Err(PluginError::PostBuild {
            step: tools.jar.clone(),
            status: status.code(),
        });
    }

    let jar = dir.join("uwsgi.jar");
    info!(jar = %jar.display(), "jar packaged");
    Ok(jar)
}
