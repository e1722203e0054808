//! plugin-config
//!
//! ```text
//! plugin-config <jvm|pyuwsgi> [--build <src> <out>] [--post-build <root>]
//! ```
//!
//! Prints the plugin's build descriptor. With `--build`, compiles its
//! modules from `<src>` into `<out>`; with `--post-build`, runs the plugin's
//! post-build step against the source tree at `<root>`. Any failure prints a
//! diagnostic to stdout and exits with status 1 before later steps run.

use std::path::PathBuf;
use std::process::ExitCode;

use greenbridge_plugin::jvm::{self, JavaTools};
use greenbridge_plugin::{build_plugin, probe_for, CcCompiler, PluginError, PostBuild, PLUGINS};
use greenbridge_runtime::logging;
use tracing::debug;

struct Args {
    plugin: String,
    build: Option<(PathBuf, PathBuf)>,
    post_build: Option<PathBuf>,
}

fn usage() -> String {
    format!(
        "usage: plugin-config <{}> [--build <src> <out>] [--post-build <root>]",
        PLUGINS.join("|")
    )
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let plugin = args.get(1).cloned().ok_or_else(usage)?;
    let mut parsed = Args {
        plugin,
        build: None,
        post_build: None,
    };
    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--build" => match (args.get(i + 1), args.get(i + 2)) {
                (Some(src), Some(out)) => {
                    parsed.build = Some((PathBuf::from(src), PathBuf::from(out)));
                    i += 2;
                }
                _ => return Err(usage()),
            },
            "--post-build" => match args.get(i + 1) {
                Some(root) => {
                    parsed.post_build = Some(PathBuf::from(root));
                    i += 1;
                }
                None => return Err(usage()),
            },
            _ => return Err(usage()),
        }
        i += 1;
    }
    Ok(parsed)
}

fn run(args: &Args) -> Result<(), PluginError> {
    let desc = probe_for(&args.plugin)?.describe()?;
    println!("{}", desc);
    desc.apply_env();

    if let Some((src, out)) = &args.build {
        let objects = build_plugin(&desc, src, out, &mut CcCompiler::new())?;
        for obj in &objects {
            println!("compiled {}", obj.display());
        }
    }

    if let Some(root) = &args.post_build {
        match desc.post_build {
            Some(PostBuild::JvmJar) => {
                let jar = jvm::build_jar(root, &JavaTools::from_env())?;
                println!("*** uwsgi.jar available in {} ***", jar.display());
            }
            None => debug!(plugin = %desc.name, "no post-build step"),
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    logging::init();
    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            println!("{}", msg);
            return ExitCode::FAILURE;
        }
    };
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            println!("{}", err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_parse_full() {
        let a = parse_args(&argv("plugin-config jvm --build src out --post-build /tree")).unwrap();
        assert_eq!(a.plugin, "jvm");
        assert_eq!(a.build, Some((PathBuf::from("src"), PathBuf::from("out"))));
        assert_eq!(a.post_build, Some(PathBuf::from("/tree")));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&argv("plugin-config")).is_err());
        assert!(parse_args(&argv("plugin-config jvm --build src")).is_err());
        assert!(parse_args(&argv("plugin-config jvm --post-build")).is_err());
        assert!(parse_args(&argv("plugin-config jvm --bogus")).is_err());
    }
}
