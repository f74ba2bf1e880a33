//! Log source providers
//!
//! A `LogSource` only describes which external command to run for each
//! request shape. Spawning, reading and teardown live in `process`.

use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use logtide_types::SinceSpec;

/// An external program invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl SourceCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
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

    /// Build the tokio command with piped output
    ///
    /// The child is killed if its handle is dropped, so no exit path can
    /// leak the process.
    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl fmt::Display for SourceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Provider of raw log text for a named unit
pub trait LogSource: Send + Sync + fmt::Debug {
    /// Short name for logging
    fn name(&self) -> &'static str;

    /// Bounded query: at most `max_lines` most recent lines, not older than `since`
    fn query_command(
        &self,
        unit: &str,
        max_lines: Option<NonZeroUsize>,
        since: Option<&SinceSpec>,
    ) -> SourceCommand;

    /// Unbounded follow of newly appended lines
    fn follow_command(&self, unit: &str) -> SourceCommand;

    /// List available units
    fn units_command(&self) -> SourceCommand;

    /// Extract unit names from the units command's output
    fn parse_units(&self, stdout: &str) -> Vec<String>;
}

// ============================================================================
// journald
// ============================================================================

/// systemd journal, read through `journalctl`
#[derive(Clone, Debug)]
pub struct JournaldSource {
    journalctl: String,
    systemctl: String,
}

impl JournaldSource {
    pub fn new() -> Self {
        Self {
            journalctl: "journalctl".to_string(),
            systemctl: "systemctl".to_string(),
        }
    }

    /// Override the binaries (for non-standard installs)
    pub fn with_binaries(journalctl: impl Into<String>, systemctl: impl Into<String>) -> Self {
        Self {
            journalctl: journalctl.into(),
            systemctl: systemctl.into(),
        }
    }

    fn base(&self, unit: &str) -> SourceCommand {
        SourceCommand::new(&self.journalctl).args(["-u", unit, "-o", "cat", "--no-pager"])
    }
}

impl Default for JournaldSource {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSource for JournaldSource {
    fn name(&self) -> &'static str {
        "journald"
    }

    fn query_command(
        &self,
        unit: &str,
        max_lines: Option<NonZeroUsize>,
        since: Option<&SinceSpec>,
    ) -> SourceCommand {
        let mut cmd = self.base(unit);
        if let Some(since) = since {
            cmd = cmd.arg("--since").arg(since.to_source_syntax());
        }
        if let Some(lines) = max_lines {
            cmd = cmd.arg("-n").arg(lines.to_string());
        }
        cmd
    }

    fn follow_command(&self, unit: &str) -> SourceCommand {
        // -n 0: start from now, history is the query's job
        self.base(unit).args(["-f", "-n", "0"])
    }

    fn units_command(&self) -> SourceCommand {
        SourceCommand::new(&self.systemctl).args([
            "list-units",
            "--type=service",
            "--no-pager",
            "--all",
            "--plain",
            "--no-legend",
        ])
    }

    fn parse_units(&self, stdout: &str) -> Vec<String> {
        stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .filter_map(|name| name.strip_suffix(".service"))
            .map(str::to_string)
            .collect()
    }
}

// ============================================================================
// Plain files
// ============================================================================

/// `<dir>/<unit>.log` files, read through `tail`
///
/// `tail` has no notion of time, so `since` is only applied after parsing.
#[derive(Clone, Debug)]
pub struct FileSource {
    dir: PathBuf,
}

impl FileSource {
    pub const EXTENSION: &'static str = ".log";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, unit: &str) -> String {
        self.dir
            .join(format!("{unit}{}", Self::EXTENSION))
            .to_string_lossy()
            .into_owned()
    }
}

impl LogSource for FileSource {
    fn name(&self) -> &'static str {
        "file"
    }

    fn query_command(
        &self,
        unit: &str,
        max_lines: Option<NonZeroUsize>,
        _since: Option<&SinceSpec>,
    ) -> SourceCommand {
        let count = match max_lines {
            Some(lines) => lines.to_string(),
            None => "+1".to_string(),
        };
        SourceCommand::new("tail").args(["-n".to_string(), count, "--".to_string(), self.path(unit)])
    }

    fn follow_command(&self, unit: &str) -> SourceCommand {
        SourceCommand::new("tail").args(["-F", "-n", "0", "--"]).arg(self.path(unit))
    }

    fn units_command(&self) -> SourceCommand {
        SourceCommand::new("ls").arg("-1").arg("--").arg(self.dir.to_string_lossy().into_owned())
    }

    fn parse_units(&self, stdout: &str) -> Vec<String> {
        let mut units: Vec<String> = stdout
            .lines()
            .filter_map(|name| name.trim().strip_suffix(Self::EXTENSION))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        units.sort();
        units
    }
}

// ============================================================================
// Shell templates
// ============================================================================

/// User-supplied shell templates run through `sh -c`
///
/// Placeholders `{unit}`, `{lines}` and `{since}` are substituted
/// shell-quoted; an absent value becomes an empty quoted string.
#[derive(Clone, Debug)]
pub struct ShellSource {
    query: String,
    follow: String,
    units: String,
}

impl ShellSource {
    pub fn new(
        query: impl Into<String>,
        follow: impl Into<String>,
        units: impl Into<String>,
    ) -> Self {
        Self {
            query: query.into(),
            follow: follow.into(),
            units: units.into(),
        }
    }

    fn render(template: &str, unit: &str, lines: &str, since: &str) -> SourceCommand {
        let script = template
            .replace("{unit}", &shell_quote(unit))
            .replace("{lines}", &shell_quote(lines))
            .replace("{since}", &shell_quote(since));
        SourceCommand::new("sh").arg("-c").arg(script)
    }
}

impl LogSource for ShellSource {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn query_command(
        &self,
        unit: &str,
        max_lines: Option<NonZeroUsize>,
        since: Option<&SinceSpec>,
    ) -> SourceCommand {
        let lines = max_lines.map(|n| n.to_string()).unwrap_or_default();
        let since = since.map(SinceSpec::to_source_syntax).unwrap_or_default();
        Self::render(&self.query, unit, &lines, &since)
    }

    fn follow_command(&self, unit: &str) -> SourceCommand {
        Self::render(&self.follow, unit, "", "")
    }

    fn units_command(&self) -> SourceCommand {
        Self::render(&self.units, "", "", "")
    }

    fn parse_units(&self, stdout: &str) -> Vec<String> {
        stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Single-quote a value for `sh`
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
