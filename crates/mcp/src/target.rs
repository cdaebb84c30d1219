//! Backend process descriptors.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;

use tokio::process::Command;

use crate::error::{Error, Result};

/// Identifies a backend process: what to run, with which arguments, and
/// which environment variables to layer over the inherited environment.
///
/// Two equal targets share a session under the persistent policy.
/// `Debug` and `Display` never print environment values or arguments that
/// carry a secret.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BackendTarget {
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    secret_args: Vec<usize>,
}

impl BackendTarget {
    /// Run `program` directly.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            secret_args: Vec::new(),
        }
    }

    /// Run a script through the interpreter its extension implies.
    pub fn script(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let interpreter =
            interpreter_for(&path).ok_or_else(|| Error::UnsupportedScript(path.clone()))?;
        Ok(Self::script_with(interpreter, path))
    }

    /// Run a script through an explicitly chosen interpreter.
    pub fn script_with(interpreter: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        let path: PathBuf = path.into();
        Self::new(interpreter).arg(path.to_string_lossy())
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one overlay variable, replacing any earlier value.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(
        mut self,
        vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Inject a secret the way the backend expects it.
    pub fn secret(self, secret: Secret) -> Self {
        match secret.injection {
            SecretInjection::Env => self.env(secret.name, secret.value),
            SecretInjection::Argument => {
                let mut target = self.arg(secret.value);
                target.secret_args.push(target.args.len() - 1);
                target
            }
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn overlay(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Build the spawn command: stdio piped, overlay merged over the
    /// inherited environment, child killed if the handle is dropped.
    pub(crate) fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn redacted_args(&self) -> Vec<&str> {
        self.args
            .iter()
            .enumerate()
            .map(|(i, arg)| {
                if self.secret_args.contains(&i) {
                    "***"
                } else {
                    arg.as_str()
                }
            })
            .collect()
    }
}

impl fmt::Debug for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendTarget")
            .field("program", &self.program)
            .field("args", &self.redacted_args())
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("cwd", &self.cwd)
            .finish()
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in self.redacted_args() {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Interpreter for a script, chosen by file extension.
pub fn interpreter_for(path: &Path) -> Option<&'static str> {
    match path.extension()?.to_str()? {
        "py" => Some("python"),
        "js" | "mjs" | "cjs" => Some("node"),
        _ => None,
    }
}

/// How a secret reaches the backend process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SecretInjection {
    /// As an environment variable; never appears in argv.
    #[default]
    Env,
    /// As a positional argument after the script path.
    Argument,
}

/// A credential handed to one backend.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    pub value: String,
    pub injection: SecretInjection,
}

impl Secret {
    pub fn env(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            injection: SecretInjection::Env,
        }
    }

    pub fn argument(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            injection: SecretInjection::Argument,
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("value", &"***")
            .field("injection", &self.injection)
            .finish()
    }
}

/// Well-known backend services and the variable their servers read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Github,
    Postgres,
    Redis,
    Sentry,
}

impl ServiceKind {
    pub fn env_name(self) -> &'static str {
        match self {
            Self::Github => "GITHUB_PAT",
            Self::Postgres => "POSTGRES_URL",
            Self::Redis => "REDIS_URL",
            Self::Sentry => "SENTRY_AUTH_TOKEN",
        }
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "github" => Ok(Self::Github),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "redis" => Ok(Self::Redis),
            "sentry" => Ok(Self::Sentry),
            other => Err(format!("unknown service: {other}")),
        }
    }
}
