//! Mount-related types and configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Name the adapter registers under; also names the private base directory.
pub const ADAPTER_NAME: &str = "stackfs";

/// Name of the data directory inside the base work directory.
pub const WORK_DATADIR_NAME: &str = "data";

/// Name of the metadata directory inside the base work directory.
pub const WORK_METADIR_NAME: &str = "meta";

/// Configuration options for mounting a stackfs adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Adapter name; the base work directory is `._<adapter_name>`
    pub adapter_name: String,

    /// Refuse lower filesystems that are not overlay-style
    pub require_overlay: bool,

    /// Mode the work directories are reset to after creation
    pub workdir_mode: u32,

    /// Whether the mount should be read-only
    pub read_only: bool,

    /// Suppress the informational mount banner
    pub silent: bool,

    /// Lifetime the kernel may cache entries and attributes
    #[serde(with = "duration_millis")]
    pub attr_ttl: Duration,

    /// Allow users other than the mounter to access the mount
    pub allow_other: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            adapter_name: ADAPTER_NAME.to_string(),
            require_overlay: false,
            workdir_mode: 0o700,
            read_only: false,
            silent: false,
            attr_ttl: Duration::from_secs(1),
            allow_other: false,
        }
    }
}

impl MountOptions {
    /// Creates a new MountOptions with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new builder for MountOptions.
    pub fn builder() -> MountOptionsBuilder {
        MountOptionsBuilder::new()
    }

    /// Name of the base work directory, e.g. `._stackfs`.
    pub fn base_dir_name(&self) -> String {
        format!("._{}", self.adapter_name)
    }

    /// Renders the options that differ from the defaults, comma separated.
    pub fn non_default_options(&self) -> Vec<String> {
        let defaults = MountOptions::default();
        let mut out = Vec::new();
        if self.adapter_name != defaults.adapter_name {
            out.push(format!("name={}", self.adapter_name));
        }
        if self.require_overlay {
            out.push("require_overlay".to_string());
        }
        if self.workdir_mode != defaults.workdir_mode {
            out.push(format!("workdir_mode={:o}", self.workdir_mode));
        }
        if self.read_only {
            out.push("ro".to_string());
        }
        if self.allow_other {
            out.push("allow_other".to_string());
        }
        out
    }
}

/// Builder for MountOptions with a fluent interface.
#[derive(Debug, Default)]
pub struct MountOptionsBuilder {
    options: MountOptions,
}

impl MountOptionsBuilder {
    /// Creates a new builder with default options.
    pub fn new() -> Self {
        Self {
            options: MountOptions::default(),
        }
    }

    pub fn adapter_name(mut self, name: impl Into<String>) -> Self {
        self.options.adapter_name = name.into();
        self
    }

    pub fn require_overlay(mut self, required: bool) -> Self {
        self.options.require_overlay = required;
        self
    }

    /// Sets the mode the work directories are reset to.
    pub fn workdir_mode(mut self, mode: u32) -> Self {
        self.options.workdir_mode = mode & 0o7777;
        self
    }

    /// Sets the mount as read-only.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.options.read_only = read_only;
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.options.silent = silent;
        self
    }

    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.options.attr_ttl = ttl;
        self
    }

    pub fn allow_other(mut self, allow: bool) -> Self {
        self.options.allow_other = allow;
        self
    }

    /// Builds the final MountOptions.
    pub fn build(self) -> MountOptions {
        self.options
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
