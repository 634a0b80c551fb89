//! Vendor Registry: loads immutable vendor profiles (prompt regexes, setup
//! commands, session kind) from an in-process default table and/or a JSON
//! document, file-provided entries winning on name collision.

use crate::error::{FcrError, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// Which transport subsystem a vendor's sessions use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    SshCli,
    SshNetconf,
}

/// A single compiled, anchored prompt pattern. Wrapping `Regex` keeps the
/// "must be anchored to end-of-buffer" invariant visible at the type that
/// constructs it rather than re-validated by every caller.
#[derive(Debug, Clone)]
pub struct PromptPattern(pub Regex);

impl PromptPattern {
    /// Compile `pattern`, appending `$` if the author did not already anchor
    /// it, since vendor prompt regexes are required to match only at
    /// end-of-buffer.
    pub fn compile(pattern: &str) -> Result<Self> {
        let anchored = if pattern.ends_with('$') {
            pattern.to_string()
        } else {
            format!("{}$", pattern)
        };
        Ok(Self(Regex::new(&anchored)?))
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        self.0.is_match(haystack)
    }
}

/// Immutable, compiled-once description of one device family's CLI dialect.
#[derive(Debug, Clone)]
pub struct VendorProfile {
    pub name: String,
    pub session_kind: SessionKind,
    pub prompt_regex: Vec<PromptPattern>,
    pub cli_setup: Vec<String>,
    pub shell_prompts: Vec<PromptPattern>,
    pub error_patterns: Vec<Regex>,
    pub clear_command: Vec<u8>,
    pub default_timeout_secs: u64,
}

const DEFAULT_CLEAR_COMMAND: u8 = 0x15; // Ctrl-U / NAK

/// Raw shape of one vendor entry in the vendor profile JSON document.
#[derive(Debug, Deserialize)]
struct RawVendorProfile {
    #[serde(default)]
    vendor_name: Option<String>,
    #[serde(default = "default_session_type")]
    session_type: String,
    #[serde(default)]
    supported_sessions: Vec<String>,
    prompt_regex: Vec<String>,
    #[serde(default)]
    cli_setup: Vec<String>,
    #[serde(default)]
    shell_prompts: Vec<String>,
    #[serde(default)]
    error_patterns: Vec<String>,
    #[serde(default)]
    clear_command: Option<String>,
    #[serde(default)]
    default_timeout_secs: Option<u64>,
}

fn default_session_type() -> String {
    "ssh".to_string()
}

#[derive(Debug, Deserialize)]
struct VendorConfigFile {
    vendor_config: HashMap<String, RawVendorProfile>,
}

impl VendorProfile {
    fn from_raw(name: &str, raw: RawVendorProfile) -> Result<Self> {
        if raw.prompt_regex.is_empty() {
            return Err(FcrError::Config(format!(
                "vendor profile '{}' must declare at least one prompt_regex",
                name
            )));
        }

        let session_kind = if raw
            .supported_sessions
            .iter()
            .any(|s| s.eq_ignore_ascii_case("netconf"))
            && !raw
                .supported_sessions
                .iter()
                .any(|s| s.eq_ignore_ascii_case("ssh"))
        {
            SessionKind::SshNetconf
        } else {
            SessionKind::SshCli
        };

        let prompt_regex = raw
            .prompt_regex
            .iter()
            .map(|p| PromptPattern::compile(p))
            .collect::<Result<Vec<_>>>()?;

        let shell_prompts = raw
            .shell_prompts
            .iter()
            .map(|p| PromptPattern::compile(p))
            .collect::<Result<Vec<_>>>()?;

        let error_patterns = raw
            .error_patterns
            .iter()
            .map(|p| Regex::new(p).map_err(FcrError::from))
            .collect::<Result<Vec<_>>>()?;

        let clear_command = match raw.clear_command {
            Some(s) if s.is_empty() => Vec::new(),
            Some(s) => s.into_bytes(),
            None => vec![DEFAULT_CLEAR_COMMAND],
        };

        Ok(VendorProfile {
            name: raw.vendor_name.unwrap_or_else(|| name.to_string()),
            session_kind,
            prompt_regex,
            cli_setup: raw.cli_setup,
            shell_prompts,
            error_patterns,
            clear_command,
            default_timeout_secs: raw.default_timeout_secs.unwrap_or(30),
        })
    }

    /// Build a profile programmatically (used by the default table and tests).
    pub fn builder(name: impl Into<String>) -> VendorProfileBuilder {
        VendorProfileBuilder::new(name)
    }
}

pub struct VendorProfileBuilder {
    name: String,
    session_kind: SessionKind,
    prompt_regex: Vec<String>,
    cli_setup: Vec<String>,
    shell_prompts: Vec<String>,
    error_patterns: Vec<String>,
    clear_command: Vec<u8>,
    default_timeout_secs: u64,
}

impl VendorProfileBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            session_kind: SessionKind::SshCli,
            prompt_regex: Vec::new(),
            cli_setup: Vec::new(),
            shell_prompts: Vec::new(),
            error_patterns: Vec::new(),
            clear_command: vec![DEFAULT_CLEAR_COMMAND],
            default_timeout_secs: 30,
        }
    }

    pub fn session_kind(mut self, kind: SessionKind) -> Self {
        self.session_kind = kind;
        self
    }

    pub fn prompt(mut self, pattern: impl Into<String>) -> Self {
        self.prompt_regex.push(pattern.into());
        self
    }

    pub fn setup(mut self, command: impl Into<String>) -> Self {
        self.cli_setup.push(command.into());
        self
    }

    pub fn shell_prompt(mut self, pattern: impl Into<String>) -> Self {
        self.shell_prompts.push(pattern.into());
        self
    }

    pub fn error_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.error_patterns.push(pattern.into());
        self
    }

    pub fn clear_command(mut self, bytes: Vec<u8>) -> Self {
        self.clear_command = bytes;
        self
    }

    pub fn default_timeout_secs(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    pub fn build(self) -> Result<VendorProfile> {
        if self.prompt_regex.is_empty() {
            return Err(FcrError::Config(format!(
                "vendor profile '{}' must declare at least one prompt_regex",
                self.name
            )));
        }
        Ok(VendorProfile {
            name: self.name,
            session_kind: self.session_kind,
            prompt_regex: self
                .prompt_regex
                .iter()
                .map(|p| PromptPattern::compile(p))
                .collect::<Result<Vec<_>>>()?,
            cli_setup: self.cli_setup,
            shell_prompts: self
                .shell_prompts
                .iter()
                .map(|p| PromptPattern::compile(p))
                .collect::<Result<Vec<_>>>()?,
            error_patterns: self
                .error_patterns
                .iter()
                .map(|p| Regex::new(p).map_err(FcrError::from))
                .collect::<Result<Vec<_>>>()?,
            clear_command: self.clear_command,
            default_timeout_secs: self.default_timeout_secs,
        })
    }
}

/// Holds every loaded vendor profile, keyed by name. Compiled once at
/// startup; no hot reload.
#[derive(Debug, Clone)]
pub struct VendorRegistry {
    profiles: HashMap<String, VendorProfile>,
}

impl VendorRegistry {
    /// The in-process default table: four profiles mirroring this codebase's
    /// existing vendor coverage (`cisco_ios`, `cisco_nxos`, `cisco_xr`,
    /// `juniper_junos`), each with a prompt-regex set derived from how those
    /// vendors' CLI prompts actually look.
    pub fn default_table() -> Result<HashMap<String, VendorProfile>> {
        let mut table = HashMap::new();

        table.insert(
            "cisco_ios".to_string(),
            VendorProfile::builder("cisco_ios")
                .prompt(r"\S+>")
                .prompt(r"\S+#")
                .prompt(r"\S+\(config[^\)]*\)#")
                .setup("terminal length 0")
                .setup("terminal width 511")
                .error_pattern(r"% (?:Invalid|Incomplete|Ambiguous) (?:input|command)")
                .error_pattern(r"% Unknown command")
                .build()?,
        );

        table.insert(
            "cisco_nxos".to_string(),
            VendorProfile::builder("cisco_nxos")
                .prompt(r"\S+>")
                .prompt(r"\S+#")
                .prompt(r"\S+\(config[^\)]*\)#")
                .setup("terminal length 0")
                .setup("terminal width 511")
                .error_pattern(r"% (?:Invalid|Incomplete|Ambiguous) (?:input|command)")
                .error_pattern(r"% Permission denied")
                .build()?,
        );

        table.insert(
            "cisco_xr".to_string(),
            VendorProfile::builder("cisco_xr")
                .prompt(r"\S+>")
                .prompt(r"\S+#")
                .prompt(r"\S+\(config[^\)]*\)#")
                .setup("terminal length 0")
                .setup("terminal width 511")
                .error_pattern(r"% (?:Invalid|Incomplete|Ambiguous) (?:input|command)")
                .error_pattern(r"error: .*")
                .build()?,
        );

        table.insert(
            "juniper_junos".to_string(),
            VendorProfile::builder("juniper_junos")
                .prompt(r"\S+@\S+>")
                .prompt(r"\S+@\S+#")
                .setup("set cli screen-length 0")
                .setup("set cli screen-width 511")
                .error_pattern(r"(?:error|warning):")
                .error_pattern(r"syntax error")
                .build()?,
        );

        Ok(table)
    }

    /// Load, applying `default_table()` first and then letting a
    /// file-provided profile with the same name replace the default entry
    /// entirely (Open Question resolved file-wins; see DESIGN.md).
    #[instrument(skip_all, fields(path = ?file_path.as_ref().map(|p| p.as_ref().display().to_string())))]
    pub fn load(file_path: Option<impl AsRef<Path>>) -> Result<Self> {
        let mut profiles = Self::default_table()?;
        debug!(count = profiles.len(), "loaded default vendor profiles");

        if let Some(path) = file_path {
            let path = path.as_ref();
            if path.exists() {
                let contents = std::fs::read_to_string(path)?;
                let file: VendorConfigFile = serde_json::from_str(&contents)
                    .map_err(|e| FcrError::Config(format!("invalid vendor config file: {}", e)))?;
                for (name, raw) in file.vendor_config {
                    let profile = VendorProfile::from_raw(&name, raw)?;
                    info!(vendor = %name, "vendor profile file overrides default/adds entry");
                    profiles.insert(name, profile);
                }
            } else {
                warn!(path = %path.display(), "vendor config path does not exist, using defaults only");
            }
        }

        Ok(Self { profiles })
    }

    pub fn from_profiles(profiles: HashMap<String, VendorProfile>) -> Self {
        Self { profiles }
    }

    pub fn get(&self, name: &str) -> Option<&VendorProfile> {
        self.profiles.get(name)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
