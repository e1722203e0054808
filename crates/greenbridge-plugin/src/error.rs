//! Plugin configuration and build errors

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error(
        "unable to autodetect the JVM path, please specify UWSGICONFIG_JVM_INCPATH and \
         UWSGICONFIG_JVM_LIBPATH environment vars"
    )]
    JvmNotFound,

    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("cannot query {interpreter}: {reason}")]
    Probe { interpreter: String, reason: String },

    #[error("module source not found: {}", .0.display())]
    MissingSource(PathBuf),

    #[error("compiling {module} failed: {reason}")]
    Compile { module: String, reason: String },

    #[error("{step} failed with {}", exit_label(.status))]
    PostBuild { step: String, status: Option<i32> },

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

fn exit_label(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit status {}", code),
        None => "a signal".to_string(),
    }
}

pub type PluginResult<T> = Result<T, PluginError>;
