//! `throttle.*` directive parsing.
//!
//! Shares the line-oriented config file with the other components;
//! directives outside the `throttle.` prefix are skipped.

use std::time::Duration;

use thiserror::Error;

/// Why the throttle configuration was rejected.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum ThrottleConfigError {
    /// A directive had the wrong shape or value.
    #[error("line {line}: {directive}: {detail}")]
    Invalid {
        /// 1-based line number.
        line: usize,
        /// Offending directive.
        directive: String,
        /// What was wrong.
        detail: String,
    },
}

/// Load-shed policy: redirect a fraction of new requests while throttled.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoadShed {
    /// `host:port` of the backup endpoint.
    pub host: String,
    /// Percentage of new requests to redirect, 1..=100.
    pub frequency: u32,
}

/// Throttle parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct ThrottleConfig {
    /// Byte budget per second across all identities; `None` is unlimited.
    pub bytes_per_second: Option<u64>,
    /// Operation budget per second; `None` is unlimited.
    pub ops_per_second: Option<u64>,
    /// Concurrent-operation ceiling; `None` is unlimited.
    pub concurrency_limit: Option<u32>,
    /// Share re-deal cadence.
    pub interval: Duration,
    /// Optional load-shed policy.
    pub loadshed: Option<LoadShed>,
    /// Per-entity open-file cap; `None` is unlimited.
    pub max_open_files: Option<u32>,
    /// Per-entity connection cap; `None` is unlimited.
    pub max_connections: Option<u32>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            bytes_per_second: None,
            ops_per_second: None,
            concurrency_limit: None,
            interval: Duration::from_secs(1),
            loadshed: None,
            max_open_files: None,
            max_connections: None,
        }
    }
}

impl ThrottleConfig {
    /// Bytes granted to one active slot per interval. At least one byte
    /// when a rate is configured, so progress is always possible.
    #[must_use]
    pub fn byte_grant(&self, active_users: usize) -> u64 {
        match self.bytes_per_second {
            Some(rate) => {
                let grant =
                    (rate as f64 * self.interval.as_secs_f64() / active_users.max(1) as f64) as u64;
                grant.max(1)
            }
            None => 0,
        }
    }

    /// Operations granted to one active slot per interval.
    #[must_use]
    pub fn op_grant(&self, active_users: usize) -> u64 {
        match self.ops_per_second {
            Some(rate) => {
                let grant =
                    (rate as f64 * self.interval.as_secs_f64() / active_users.max(1) as f64) as u64;
                grant.max(1)
            }
            None => 0,
        }
    }

    /// Parses `throttle.*` directives out of a config file body.
    pub fn parse(text: &str) -> Result<Self, ThrottleConfigError> {
        let mut config = Self::default();
        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut words = trimmed.split_ascii_whitespace();
            let Some(directive) = words.next() else {
                continue;
            };
            let Some(name) = directive.strip_prefix("throttle.") else {
                continue;
            };
            let args: Vec<&str> = words.collect();
            config.apply(line, name, &args)?;
        }
        Ok(config)
    }

    fn apply(&mut self, line: usize, name: &str, args: &[&str]) -> Result<(), ThrottleConfigError> {
        let invalid = |detail: String| ThrottleConfigError::Invalid {
            line,
            directive: format!("throttle.{name}"),
            detail,
        };

        match name {
            "byterate" => {
                let value = args.first().ok_or_else(|| invalid("missing rate".into()))?;
                self.bytes_per_second = Some(parse_rate(value).map_err(invalid)?);
            }
            "oprate" => {
                let value = args.first().ok_or_else(|| invalid("missing rate".into()))?;
                self.ops_per_second = Some(parse_rate(value).map_err(invalid)?);
            }
            "concurrency" => {
                let value = args.first().ok_or_else(|| invalid("missing count".into()))?;
                let count: u32 = value
                    .parse()
                    .map_err(|_| invalid(format!("unparsable count {value:?}")))?;
                if count == 0 {
                    return Err(invalid("concurrency must be positive".into()));
                }
                self.concurrency_limit = Some(count);
            }
            "interval" => {
                let value = args.first().ok_or_else(|| invalid("missing seconds".into()))?;
                let seconds: u64 = value
                    .parse()
                    .map_err(|_| invalid(format!("unparsable seconds {value:?}")))?;
                if seconds == 0 {
                    return Err(invalid("interval must be positive".into()));
                }
                self.interval = Duration::from_secs(seconds);
            }
            "loadshed" => {
                if args.len() < 2 {
                    return Err(invalid("expected <host:port> <frequency>".into()));
                }
                if !args[0].contains(':') {
                    return Err(invalid(format!("{:?} is not host:port", args[0])));
                }
                let frequency: u32 = args[1]
                    .parse()
                    .map_err(|_| invalid(format!("unparsable frequency {:?}", args[1])))?;
                if !(1..=100).contains(&frequency) {
                    return Err(invalid(format!("frequency {frequency} outside 1..=100")));
                }
                self.loadshed = Some(LoadShed {
                    host: args[0].to_owned(),
                    frequency,
                });
            }
            "files" => {
                let value = args.first().ok_or_else(|| invalid("missing count".into()))?;
                self.max_open_files = Some(
                    value
                        .parse()
                        .map_err(|_| invalid(format!("unparsable count {value:?}")))?,
                );
            }
            "connections" => {
                let value = args.first().ok_or_else(|| invalid("missing count".into()))?;
                self.max_connections = Some(
                    value
                        .parse()
                        .map_err(|_| invalid(format!("unparsable count {value:?}")))?,
                );
            }
            other => {
                return Err(ThrottleConfigError::Invalid {
                    line,
                    directive: format!("throttle.{other}"),
                    detail: "unknown directive".into(),
                });
            }
        }
        Ok(())
    }
}

/// Parses a rate with an optional binary `k/m/g` suffix.
fn parse_rate(input: &str) -> Result<u64, String> {
    let input = input.trim();
    let (digits, multiplier) = match input.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('k') => (&input[..input.len() - 1], 1u64 << 10),
        Some('m') => (&input[..input.len() - 1], 1u64 << 20),
        Some('g') => (&input[..input.len() - 1], 1u64 << 30),
        _ => (input, 1),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("unparsable rate {input:?}"))?;
    if value == 0 {
        return Err("rate must be positive".to_owned());
    }
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("rate {input:?} overflows"))
}
