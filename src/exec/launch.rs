// src/exec/launch.rs

//! Structured process launch descriptions.
//!
//! A [`LaunchSpec`] is an explicit argument vector plus an explicit
//! environment map, handed straight to `tokio::process::Command`. No shell is
//! involved, so paths with spaces or quotes in them need no escaping.
//!
//! Environment activation that used to be done by `conda activate` and
//! `export FOO=$BAR` shell snippets is reproduced here:
//! - [`activation_env`] yields the variables a conda activation sets;
//! - [`expand_env_with`] expands `$VAR` / `${VAR}` references between the
//!   configured overrides, the activation layer and the inherited
//!   environment.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::config::LauncherConfig;
use crate::errors::{Result, SplatError};

/// Program, arguments, environment overrides and working directory for one
/// external process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Short name used in logs and errors (e.g. `"training"`).
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Variables set on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Files that must exist before launching (e.g. the script an
    /// interpreter will run).
    pub required_files: Vec<PathBuf>,
}

impl LaunchSpec {
    pub fn new(label: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            required_files: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: BTreeMap<String, String>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn require_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.required_files.push(path.into());
        self
    }

    /// Build a spec from a `[training]` / `[viewer]` style launcher section.
    ///
    /// - `program` set: run it with `args`.
    /// - `script` set: run `interpreter script args...`. The interpreter is
    ///   `interpreter`, else `<conda_prefix>/bin/python`, else `python3`.
    ///   The script must exist and the working directory defaults to its
    ///   parent directory.
    /// - neither: `LaunchError`.
    pub fn from_launcher(
        label: impl Into<String>,
        launcher: &LauncherConfig,
        args: Vec<String>,
    ) -> Result<Self> {
        let label = label.into();
        let env = resolve_env(launcher.conda_prefix.as_deref(), &launcher.env);

        let mut spec = if let Some(program) = &launcher.program {
            LaunchSpec::new(label, program).args(args)
        } else if let Some(script) = &launcher.script {
            let mut spec = LaunchSpec::new(label, script_interpreter(launcher))
                .arg(script.to_string_lossy())
                .args(args)
                .require_file(script);
            if let Some(parent) = script.parent().filter(|p| !p.as_os_str().is_empty()) {
                spec = spec.current_dir(parent);
            }
            spec
        } else {
            return Err(SplatError::Launch {
                program: label,
                reason: "no program or script configured".to_string(),
            });
        };

        if let Some(dir) = &launcher.working_dir {
            spec = spec.current_dir(dir);
        }
        Ok(spec.envs(env))
    }

    /// Human-readable command line, for logs only.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Fail early with a `LaunchError` when something the process needs is
    /// missing.
    pub(crate) fn check_launchable(&self) -> Result<()> {
        for file in &self.required_files {
            if !file.is_file() {
                return Err(SplatError::Launch {
                    program: self.label.clone(),
                    reason: format!("required file {} not found", file.display()),
                });
            }
        }

        // Bare names are resolved through PATH by the OS at spawn time.
        if self.program.components().count() > 1 && !self.program.exists() {
            return Err(SplatError::Launch {
                program: self.label.clone(),
                reason: format!("executable {} not found", self.program.display()),
            });
        }

        if let Some(dir) = &self.working_dir {
            if !dir.is_dir() {
                return Err(SplatError::Launch {
                    program: self.label.clone(),
                    reason: format!("working directory {} not found", dir.display()),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(&self.env);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Interpreter a launcher's `script` runs under: `interpreter`, else
/// `<conda_prefix>/bin/python`, else `python3`.
pub fn script_interpreter(launcher: &LauncherConfig) -> PathBuf {
    launcher
        .interpreter
        .as_ref()
        .map(PathBuf::from)
        .or_else(|| {
            launcher
                .conda_prefix
                .as_ref()
                .map(|prefix| prefix.join("bin").join("python"))
        })
        .unwrap_or_else(|| PathBuf::from("python3"))
}

/// Variables set by activating the conda environment at `prefix`.
pub fn activation_env(prefix: Option<&Path>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let Some(prefix) = prefix else {
        return env;
    };

    let prefix_str = prefix.to_string_lossy().into_owned();
    let bin = prefix.join("bin");
    let path = match std::env::var_os("PATH") {
        Some(existing) => {
            let mut parts = vec![bin];
            parts.extend(std::env::split_paths(&existing));
            std::env::join_paths(parts).unwrap_or_else(|_| OsString::from(&prefix_str))
        }
        None => bin.into_os_string(),
    };

    if let Some(name) = prefix.file_name() {
        env.insert(
            "CONDA_DEFAULT_ENV".to_string(),
            name.to_string_lossy().into_owned(),
        );
    }
    env.insert("CONDA_PREFIX".to_string(), prefix_str);
    env.insert("PATH".to_string(), path.to_string_lossy().into_owned());
    env
}

/// Activation layer plus expanded overrides (overrides win).
pub fn resolve_env(
    conda_prefix: Option<&Path>,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let activation = activation_env(conda_prefix);
    let expanded = expand_env_with(overrides, |name| {
        activation
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
    });

    let mut env = activation.clone();
    env.extend(expanded);
    env
}

/// Expand `$VAR` / `${VAR}` references inside `overrides`.
///
/// A reference to another override resolves to that override's expanded
/// value. A reference to the variable being defined (or to one already being
/// resolved, i.e. a cycle) resolves through `inherited`, so
/// `PATH = "$CUDA_HOME/bin:$PATH"` extends the inherited `PATH`. Unknown
/// variables expand to the empty string.
pub fn expand_env_with<F>(overrides: &BTreeMap<String, String>, inherited: F) -> BTreeMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut resolved: HashMap<String, String> = HashMap::new();
    let mut stack: Vec<String> = Vec::new();

    overrides
        .keys()
        .map(|key| {
            let value = resolve_var(key, overrides, &inherited, &mut resolved, &mut stack);
            (key.clone(), value)
        })
        .collect()
}

fn resolve_var<F>(
    key: &str,
    overrides: &BTreeMap<String, String>,
    inherited: &F,
    resolved: &mut HashMap<String, String>,
    stack: &mut Vec<String>,
) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(done) = resolved.get(key) {
        return done.clone();
    }
    let Some(raw) = overrides.get(key) else {
        return inherited(key).unwrap_or_default();
    };

    stack.push(key.to_string());
    let mut out = String::new();
    for token in tokenize(raw) {
        match token {
            Token::Literal(text) => out.push_str(&text),
            Token::Var(name) => {
                let in_progress = stack.iter().any(|s| s == &name);
                if !in_progress && overrides.contains_key(&name) {
                    out.push_str(&resolve_var(&name, overrides, inherited, resolved, stack));
                } else {
                    out.push_str(&inherited(&name).unwrap_or_default());
                }
            }
        }
    }
    stack.pop();

    resolved.insert(key.to_string(), out.clone());
    out
}

#[derive(Debug, PartialEq)]
enum Token {
    Literal(String),
    Var(String),
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '$' {
            literal.push(chars[i]);
            i += 1;
            continue;
        }

        // `${NAME}`
        if chars.get(i + 1) == Some(&'{') {
            if let Some(close) = chars[i + 2..].iter().position(|c| *c == '}') {
                let name: String = chars[i + 2..i + 2 + close].iter().collect();
                if is_var_name(&name) {
                    flush_literal(&mut literal, &mut tokens);
                    tokens.push(Token::Var(name));
                    i += close + 3;
                    continue;
                }
            }
            literal.push('$');
            i += 1;
            continue;
        }

        // `$NAME`
        let start = i + 1;
        let mut end = start;
        while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
            end += 1;
        }
        let name: String = chars[start..end].iter().collect();
        if is_var_name(&name) {
            flush_literal(&mut literal, &mut tokens);
            tokens.push(Token::Var(name));
            i = end;
        } else {
            literal.push('$');
            i += 1;
        }
    }

    flush_literal(&mut literal, &mut tokens);
    tokens
}

fn flush_literal(literal: &mut String, tokens: &mut Vec<Token>) {
    if !literal.is_empty() {
        tokens.push(Token::Literal(std::mem::take(literal)));
    }
}

fn is_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Substitute `{name}` placeholders in an argument template.
///
/// Unknown placeholders are left untouched.
pub fn render_args(template: &[String], vars: &[(&str, String)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{name}}}"), value)
            })
        })
        .collect()
}
