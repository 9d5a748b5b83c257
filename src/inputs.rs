//! Typed stack inputs and their validation.
//!
//! Inputs merge defaults, configuration files, environment variables, and CLI
//! flags via `ortho-config`. Validation runs every rule and collects all
//! failures in a single pass, so a caller sees the complete problem list
//! before any provider interaction, then freezes the result into an immutable
//! [`StackSnapshot`].

use std::collections::BTreeMap;
use std::fmt;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Volume types accepted for the root volume and additional volumes.
pub const VOLUME_TYPES: [&str; 7] = ["gp2", "gp3", "io1", "io2", "sc1", "st1", "standard"];

/// Protocols recognised in ingress and egress rules. `"-1"` means all
/// protocols, matching the conventional provider wildcard.
pub const RULE_PROTOCOLS: [&str; 4] = ["tcp", "udp", "icmp", "-1"];

/// Inclusive bounds for the stack name length.
pub const NAME_LENGTH_RANGE: (usize, usize) = (1, 200);

/// Minimum root volume size in GiB.
pub const MIN_ROOT_VOLUME_SIZE: u32 = 8;

/// Inclusive bounds for the instance metadata hop limit.
pub const METADATA_HOP_LIMIT_RANGE: (u32, u32) = (1, 64);

/// Minimum alarm period in seconds; periods must also be a multiple of it.
pub const MIN_ALARM_PERIOD: u32 = 60;

/// A single ingress or egress rule for the security group.
///
/// Rules form an ordered sequence; order is preserved into the provider
/// payload for determinism but carries no semantic priority.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AccessRule {
    /// First port of the range. Ignored by providers for `"-1"`/`icmp`.
    pub from_port: u16,
    /// Last port of the range, inclusive.
    pub to_port: u16,
    /// Protocol name: one of [`RULE_PROTOCOLS`].
    pub protocol: String,
    /// CIDR blocks the rule applies to.
    pub cidr_blocks: Vec<String>,
    /// Optional human-readable description forwarded to the provider.
    #[serde(default)]
    pub description: Option<String>,
}

/// An additional data volume attached to the instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeSpec {
    /// Device name the volume is exposed under (for example `/dev/sdb`).
    pub device_name: String,
    /// Volume type: one of [`VOLUME_TYPES`].
    pub volume_type: String,
    /// Volume size in GiB.
    pub volume_size: u32,
    /// Whether the volume is encrypted at rest.
    #[serde(default)]
    pub encrypted: bool,
    /// Whether the volume is deleted with the instance. Defaults to `true`
    /// during plan resolution when unset.
    #[serde(default)]
    pub delete_on_termination: Option<bool>,
    /// Provisioned IOPS. Left unset when absent.
    #[serde(default)]
    pub iops: Option<u32>,
    /// Provisioned throughput in MiB/s. Left unset when absent.
    #[serde(default)]
    pub throughput: Option<u32>,
}

/// Declared stack inputs loaded via `ortho-config`.
///
/// Every field carries a default except `name` and `image_id`, which default
/// to empty strings precisely so that [`StackInputs::validate`] can report
/// their absence together with every other problem instead of failing the
/// load early. The `ssh_public_key` value is treated as sensitive: validation
/// messages never echo it.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq)]
#[ortho_config(prefix = "STRATUS")]
pub struct StackInputs {
    /// Stack name used to derive per-resource names and the `Name` tag.
    #[ortho_config(default = String::new())]
    pub name: String,
    /// Machine image the instance boots from.
    #[ortho_config(default = String::new())]
    pub image_id: String,
    /// Commercial instance type.
    #[ortho_config(default = "t3.micro".to_owned())]
    pub instance_type: String,
    /// Subnet to place the instance in, when the provider requires one.
    pub subnet_id: Option<String>,
    /// Whether to associate a public IP address with the instance.
    #[ortho_config(default = false, skip_cli)]
    pub associate_public_ip: bool,
    /// Boot-time user data script. Changes after creation are ignored by the
    /// instance lifecycle policy.
    pub user_data: Option<String>,
    /// Whether detailed (one-minute) monitoring is enabled for the instance.
    #[ortho_config(default = false, skip_cli)]
    pub enable_monitoring: bool,
    /// Instance metadata service hop limit.
    #[ortho_config(default = 1)]
    pub metadata_hop_limit: u32,
    /// Whether the stack manages its own SSH key pair.
    #[ortho_config(default = false, skip_cli)]
    pub create_key_pair: bool,
    /// Name of a pre-existing key pair used when `create_key_pair` is false.
    pub key_name: Option<String>,
    /// Public key material registered when `create_key_pair` is true.
    #[ortho_config(default = String::new())]
    pub ssh_public_key: String,
    /// Ordered ingress rules for the security group.
    #[serde(default)]
    #[ortho_config(skip_cli)]
    pub ingress_rules: Vec<AccessRule>,
    /// Ordered egress rules for the security group. Defaults to allow-all.
    #[serde(default = "default_egress_rules")]
    #[ortho_config(skip_cli)]
    pub egress_rules: Vec<AccessRule>,
    /// Root volume type: one of [`VOLUME_TYPES`].
    #[ortho_config(default = "gp3".to_owned())]
    pub root_volume_type: String,
    /// Root volume size in GiB; at least [`MIN_ROOT_VOLUME_SIZE`].
    #[ortho_config(default = 20)]
    pub root_volume_size: u32,
    /// Additional data volumes attached to the instance, in order.
    #[serde(default)]
    #[ortho_config(skip_cli)]
    pub additional_volumes: Vec<VolumeSpec>,
    /// Whether the stack manages a CPU utilisation alarm for the instance.
    #[ortho_config(default = false, skip_cli)]
    pub create_cpu_alarm: bool,
    /// Alarm threshold as a CPU utilisation percentage.
    #[ortho_config(default = 80.0)]
    pub alarm_cpu_threshold: f64,
    /// Alarm evaluation period in seconds; a multiple of
    /// [`MIN_ALARM_PERIOD`].
    #[ortho_config(default = 300)]
    pub alarm_period: u32,
    /// Number of consecutive periods that must breach before alarming.
    #[ortho_config(default = 2)]
    pub alarm_evaluation_periods: u32,
    /// Tags applied to every resource in the stack.
    #[serde(default)]
    #[ortho_config(skip_cli)]
    pub tags: BTreeMap<String, String>,
}

fn default_egress_rules() -> Vec<AccessRule> {
    vec![AccessRule {
        from_port: 0,
        to_port: 0,
        protocol: String::from("-1"),
        cidr_blocks: vec![String::from("0.0.0.0/0")],
        description: Some(String::from("allow all outbound")),
    }]
}

impl Default for StackInputs {
    fn default() -> Self {
        Self {
            name: String::new(),
            image_id: String::new(),
            instance_type: String::from("t3.micro"),
            subnet_id: None,
            associate_public_ip: false,
            user_data: None,
            enable_monitoring: false,
            metadata_hop_limit: 1,
            create_key_pair: false,
            key_name: None,
            ssh_public_key: String::new(),
            ingress_rules: Vec::new(),
            egress_rules: default_egress_rules(),
            root_volume_type: String::from("gp3"),
            root_volume_size: 20,
            additional_volumes: Vec::new(),
            create_cpu_alarm: false,
            alarm_cpu_threshold: 80.0,
            alarm_period: 300,
            alarm_evaluation_periods: 2,
            tags: BTreeMap::new(),
        }
    }
}

/// A single validation failure, naming the offending field.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Input field (dotted path for sub-record entries).
    pub field: String,
    /// Human-readable description of the failure.
    pub message: String,
}

impl ValidationError {
    /// Builds a validation error for the given field.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Aggregate of every validation failure found in one pass.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationErrors {
    errors: Vec<ValidationError>,
}

impl ValidationErrors {
    /// Returns the individual failures in field declaration order.
    #[must_use]
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Number of failures collected.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// True when no failures were collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid stack inputs: ")?;
        let mut first = true;
        for error in &self.errors {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Errors raised while loading inputs from layered sources.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum InputLoadError {
    /// Surfaces errors from the `ortho-config` loader.
    #[error("stack input parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for InputLoadError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

/// Immutable, validated view of the stack inputs for one evaluation run.
///
/// Constructed exclusively by [`StackInputs::validate`], so holding a
/// snapshot is proof the inputs passed every declared rule.
#[derive(Clone, Debug, PartialEq)]
pub struct StackSnapshot {
    inputs: StackInputs,
}

impl StackSnapshot {
    /// Returns the validated inputs.
    #[must_use]
    pub const fn inputs(&self) -> &StackInputs {
        &self.inputs
    }
}

impl StackInputs {
    /// Loads inputs using defaults, configuration files, and environment
    /// variables, without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`InputLoadError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, InputLoadError> {
        Self::load_from_iter([std::ffi::OsString::from("stratus")])
            .map_err(|err| InputLoadError::Parse(err.to_string()))
    }

    /// Validates every declared rule, collecting all failures, and freezes
    /// the result into an immutable [`StackSnapshot`].
    ///
    /// Cross-field conditions that gate individual resources (key material
    /// presence, alarm granularity) are deliberately *not* checked here; they
    /// are apply-time preconditions re-evaluated on every run.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationErrors`] listing every failed rule.
    pub fn validate(self) -> Result<StackSnapshot, ValidationErrors> {
        let mut errors = Vec::new();
        self.check_identity(&mut errors);
        self.check_instance(&mut errors);
        self.check_rules(&mut errors);
        self.check_volumes(&mut errors);
        self.check_alarm(&mut errors);

        if errors.is_empty() {
            Ok(StackSnapshot { inputs: self })
        } else {
            Err(ValidationErrors { errors })
        }
    }

    fn check_identity(&self, errors: &mut Vec<ValidationError>) {
        let (min, max) = NAME_LENGTH_RANGE;
        let name_len = self.name.trim().len();
        if name_len < min || name_len > max {
            errors.push(ValidationError::new(
                "name",
                format!("length must be between {min} and {max} characters"),
            ));
        }
        if self.image_id.trim().is_empty() {
            errors.push(ValidationError::new("image_id", "must not be empty"));
        }
        if self.instance_type.trim().is_empty() {
            errors.push(ValidationError::new("instance_type", "must not be empty"));
        }
    }

    fn check_instance(&self, errors: &mut Vec<ValidationError>) {
        let (min, max) = METADATA_HOP_LIMIT_RANGE;
        if self.metadata_hop_limit < min || self.metadata_hop_limit > max {
            errors.push(ValidationError::new(
                "metadata_hop_limit",
                format!("must be between {min} and {max}"),
            ));
        }
        if !VOLUME_TYPES.contains(&self.root_volume_type.as_str()) {
            errors.push(ValidationError::new(
                "root_volume_type",
                format!(
                    "'{}' is not one of {}",
                    self.root_volume_type,
                    VOLUME_TYPES.join(", ")
                ),
            ));
        }
        if self.root_volume_size < MIN_ROOT_VOLUME_SIZE {
            errors.push(ValidationError::new(
                "root_volume_size",
                format!("must be at least {MIN_ROOT_VOLUME_SIZE} GiB"),
            ));
        }
    }

    fn check_rules(&self, errors: &mut Vec<ValidationError>) {
        check_rule_list("ingress_rules", &self.ingress_rules, errors);
        check_rule_list("egress_rules", &self.egress_rules, errors);
    }

    fn check_volumes(&self, errors: &mut Vec<ValidationError>) {
        for (index, volume) in self.additional_volumes.iter().enumerate() {
            if volume.device_name.trim().is_empty() {
                errors.push(ValidationError::new(
                    format!("additional_volumes[{index}].device_name"),
                    "must not be empty",
                ));
            }
            if !VOLUME_TYPES.contains(&volume.volume_type.as_str()) {
                errors.push(ValidationError::new(
                    format!("additional_volumes[{index}].volume_type"),
                    format!(
                        "'{}' is not one of {}",
                        volume.volume_type,
                        VOLUME_TYPES.join(", ")
                    ),
                ));
            }
            if volume.volume_size == 0 {
                errors.push(ValidationError::new(
                    format!("additional_volumes[{index}].volume_size"),
                    "must be at least 1 GiB",
                ));
            }
        }
    }

    fn check_alarm(&self, errors: &mut Vec<ValidationError>) {
        if !(0.0..=100.0).contains(&self.alarm_cpu_threshold) {
            errors.push(ValidationError::new(
                "alarm_cpu_threshold",
                "must be between 0 and 100",
            ));
        }
        if self.alarm_period < MIN_ALARM_PERIOD
            || !self.alarm_period.is_multiple_of(MIN_ALARM_PERIOD)
        {
            errors.push(ValidationError::new(
                "alarm_period",
                format!("must be a multiple of {MIN_ALARM_PERIOD} seconds"),
            ));
        }
        if self.alarm_evaluation_periods == 0 {
            errors.push(ValidationError::new(
                "alarm_evaluation_periods",
                "must be at least 1",
            ));
        }
    }
}

fn check_rule_list(field: &str, rules: &[AccessRule], errors: &mut Vec<ValidationError>) {
    for (index, rule) in rules.iter().enumerate() {
        if rule.from_port > rule.to_port {
            errors.push(ValidationError::new(
                format!("{field}[{index}]"),
                format!(
                    "from_port {} exceeds to_port {}",
                    rule.from_port, rule.to_port
                ),
            ));
        }
        if !RULE_PROTOCOLS.contains(&rule.protocol.as_str()) {
            errors.push(ValidationError::new(
                format!("{field}[{index}].protocol"),
                format!("'{}' is not one of {}", rule.protocol, RULE_PROTOCOLS.join(", ")),
            ));
        }
        if rule.cidr_blocks.is_empty() {
            errors.push(ValidationError::new(
                format!("{field}[{index}].cidr_blocks"),
                "must list at least one CIDR block",
            ));
        }
    }
}
