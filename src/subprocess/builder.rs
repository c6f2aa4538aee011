use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::subprocess::ProcessCommand;

/// Environment handed to a child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Environment {
    /// The child sees the parent's environment as it is at launch.
    #[default]
    Inherit,
    /// The child sees exactly these `KEY=VALUE` pairs and nothing else.
    Replace(Vec<(String, String)>),
}

impl Environment {
    /// Snapshot of the parent's current environment as an explicit list, for
    /// callers that want to extend rather than replace it. Variables whose
    /// name or value is not UTF-8 are left out.
    pub fn from_current() -> Self {
        Self::from_os_vars(std::env::vars_os())
    }

    fn from_os_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let vars = vars
            .into_iter()
            .filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
                (Ok(key), Ok(value)) => Some((key, value)),
                (key, _) => {
                    tracing::debug!("Skipping non UTF-8 environment variable {:?}", key);
                    None
                }
            })
            .collect();
        Environment::Replace(vars)
    }

    pub fn is_inherited(&self) -> bool {
        matches!(self, Environment::Inherit)
    }

    /// Set `key`, switching to an explicit list if the environment was
    /// inherited. An existing entry for `key` is overwritten in place.
    pub fn set(&mut self, key: &str, value: &str) {
        if self.is_inherited() {
            *self = Environment::Replace(Vec::new());
        }
        if let Environment::Replace(vars) = self {
            match vars.iter_mut().find(|(k, _)| k == key) {
                Some(entry) => entry.1 = value.to_string(),
                None => vars.push((key.to_string(), value.to_string())),
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        match self {
            Environment::Inherit => None,
            Environment::Replace(vars) => vars
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
        }
    }

    /// `KEY=VALUE` entries, or `None` when inherited.
    pub fn entries(&self) -> Option<Vec<String>> {
        match self {
            Environment::Inherit => None,
            Environment::Replace(vars) => Some(
                vars.iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            ),
        }
    }
}

/// What to launch and how. Read once at launch; later edits only affect
/// launches that have not happened yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Environment,
    pub detached: bool,
}

impl ProcessConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Program and arguments joined with spaces, for logs and errors.
    pub fn display_command(&self) -> String {
        let mut command = self.program.display().to_string();
        for arg in &self.args {
            command.push(' ');
            command.push_str(arg);
        }
        command
    }
}

pub struct ProcessCommandBuilder {
    command: ProcessCommand,
}

impl ProcessCommandBuilder {
    pub fn new(program: &str) -> Self {
        Self {
            command: ProcessCommand {
                config: ProcessConfig::new(program),
                stdin: None,
                timeout: None,
            },
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.command.config.args.push(arg.to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.command
            .config
            .args
            .extend(args.into_iter().map(|s| s.as_ref().to_string()));
        self
    }

    /// Add a variable. The first call switches the child from the inherited
    /// environment to an explicit list.
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.command.config.env.set(key, value);
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            self.command.config.env.set(key.as_ref(), value.as_ref());
        }
        self
    }

    pub fn env_clear(mut self) -> Self {
        self.command.config.env = Environment::Replace(Vec::new());
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.command.config.working_dir = Some(dir.to_path_buf());
        self
    }

    pub fn detached(mut self, detached: bool) -> Self {
        self.command.config.detached = detached;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.command.timeout = Some(timeout);
        self
    }

    pub fn stdin(mut self, input: String) -> Self {
        self.command.stdin = Some(input);
        self
    }

    pub fn build(self) -> ProcessCommand {
        self.command
    }

    pub fn build_config(self) -> ProcessConfig {
        self.command.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_set_switches_to_explicit_list() {
        let mut env = Environment::default();
        assert!(env.is_inherited());
        assert_eq!(env.entries(), None);

        env.set("A", "1");
        env.set("B", "2");
        env.set("A", "3");

        assert!(!env.is_inherited());
        assert_eq!(env.get("A"), Some("3"));
        assert_eq!(
            env.entries(),
            Some(vec!["A=3".to_string(), "B=2".to_string()])
        );
    }

    #[test]
    fn test_from_current_contains_parent_vars() {
        std::env::var("PATH").expect("PATH set in test environment");
        let env = Environment::from_current();
        assert!(env.get("PATH").is_some());
    }

    #[test]
    fn test_from_os_vars_skips_non_utf8_entries() {
        use std::os::unix::ffi::OsStringExt;

        let env = Environment::from_os_vars(vec![
            (OsString::from("GOOD"), OsString::from("yes")),
            (OsString::from("BAD_VALUE"), OsString::from_vec(b"\xff\xfe".to_vec())),
            (OsString::from_vec(b"BAD\xffKEY".to_vec()), OsString::from("x")),
        ]);

        assert_eq!(
            env,
            Environment::Replace(vec![("GOOD".to_string(), "yes".to_string())])
        );
    }

    #[test]
    fn test_display_command() {
        let config = ProcessCommandBuilder::new("/bin/echo")
            .args(["a", "b c"])
            .build_config();
        assert_eq!(config.display_command(), "/bin/echo a b c");
    }

    #[test]
    fn test_env_clear_then_env() {
        let config = ProcessCommandBuilder::new("env")
            .env_clear()
            .env("ONLY", "this")
            .build_config();
        assert_eq!(
            config.env,
            Environment::Replace(vec![("ONLY".to_string(), "this".to_string())])
        );
    }
}
