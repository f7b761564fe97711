//! `pfc.*` directive parsing.
//!
//! The cache is configured from a line-oriented text file shared with other
//! components; only directives with the `pfc.` prefix are consumed here and
//! foreign prefixes are skipped. Size arguments accept binary `k/m/g/t`
//! suffixes, time arguments accept `s/m/h`, and the disk-usage watermarks
//! accept either absolute sizes or fractions of the partition.

use std::time::Duration;

use thiserror::Error;

/// Smallest accepted block size.
pub const MIN_BLOCK_SIZE: u64 = 4 * 1024;
/// Largest accepted block size.
pub const MAX_BLOCK_SIZE: u64 = 512 * 1024 * 1024;
/// Block sizes must be a multiple of this.
pub const BLOCK_ALIGN: u64 = 4 * 1024;

/// Why the configuration was rejected.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A directive had the wrong shape.
    #[error("line {line}: {directive}: {detail}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// Offending directive.
        directive: String,
        /// What was wrong.
        detail: String,
    },
    /// A value failed validation.
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

/// A threshold given either as bytes or as a fraction of the partition.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Threshold {
    /// Absolute byte count.
    Bytes(u64),
    /// Fraction of total space, in (0, 1).
    Fraction(f64),
}

impl Threshold {
    /// Resolves the threshold against a partition of `total` bytes.
    #[must_use]
    pub fn resolve(&self, total: u64) -> u64 {
        match *self {
            Self::Bytes(bytes) => bytes,
            Self::Fraction(fraction) => (total as f64 * fraction) as u64,
        }
    }
}

/// Checksum policy selected by `pfc.cschk`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CkSumPolicy {
    /// Verify against cache-side checksums.
    pub cache: bool,
    /// Verify against network-side checksums.
    pub net: bool,
    /// Require TLS-grade integrity on the wire.
    pub tls: bool,
}

impl CkSumPolicy {
    /// True when no verification is requested.
    #[must_use]
    pub const fn is_off(&self) -> bool {
        !self.cache && !self.net
    }
}

/// Lifetime policy for files whose checksum was never verified.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum UvKeep {
    /// Keep them under normal LRU rules.
    #[default]
    Lru,
    /// Purge them outright once older than the given age.
    MaxAge(Duration),
}

/// Disk-usage policy for the purge loop.
#[derive(Clone, Debug, PartialEq)]
pub struct DiskUsage {
    /// Purge target: usage is brought below this.
    pub low_watermark: Threshold,
    /// Purge trigger: exceeding this starts a purge.
    pub high_watermark: Threshold,
    /// Optional file-count triggers (baseline, nominal, max).
    pub file_counts: Option<(u64, u64, u64)>,
    /// Purge cadence.
    pub purge_interval: Duration,
    /// Age after which cold files are purged regardless of pressure.
    pub purge_cold_age: Option<Duration>,
    /// Cold-file purging runs every this many purge cycles.
    pub purge_cold_period: u32,
}

impl Default for DiskUsage {
    fn default() -> Self {
        Self {
            low_watermark: Threshold::Fraction(0.90),
            high_watermark: Threshold::Fraction(0.95),
            file_counts: None,
            purge_interval: Duration::from_secs(300),
            purge_cold_age: None,
            purge_cold_period: 10,
        }
    }
}

/// Full cache configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheConfig {
    /// Block size for newly cached files.
    pub block_size: u64,
    /// RAM budget for resident blocks.
    pub ram_bytes: u64,
    /// Disk usage / purge policy.
    pub disk_usage: DiskUsage,
    /// Maximum blocks prefetched ahead per file; 0 disables prefetch.
    pub prefetch_max_blocks: u32,
    /// Writer queue depth, in blocks.
    pub write_queue_blocks: usize,
    /// Writer pool size.
    pub writer_threads: usize,
    /// Checksum policy.
    pub cschk: CkSumPolicy,
    /// Unverified-checksum lifetime.
    pub uvkeep: UvKeep,
    /// OSS space name for data files.
    pub data_space: String,
    /// OSS space name for cinfo sidecars.
    pub meta_space: String,
    /// Trace verbosity, 0..=4.
    pub trace_level: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 1024 * 1024,
            ram_bytes: 1024 * 1024 * 1024,
            disk_usage: DiskUsage::default(),
            prefetch_max_blocks: 10,
            write_queue_blocks: 64,
            writer_threads: 4,
            cschk: CkSumPolicy::default(),
            uvkeep: UvKeep::default(),
            data_space: "data".to_owned(),
            meta_space: "meta".to_owned(),
            trace_level: 1,
        }
    }
}

impl CacheConfig {
    /// Defaults used when the cache runs inside a client process.
    #[must_use]
    pub fn client_defaults() -> Self {
        Self {
            ram_bytes: 256 * 1024 * 1024,
            ..Self::default()
        }
    }

    /// Parses `pfc.*` directives out of a config file body.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut words = line.split_ascii_whitespace();
            let Some(directive) = words.next() else {
                continue;
            };
            let Some(name) = directive.strip_prefix("pfc.") else {
                // Directives for other components share the file.
                continue;
            };
            let args: Vec<&str> = words.collect();
            config.apply(line_no, name, &args)?;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, line: usize, name: &str, args: &[&str]) -> Result<(), ConfigError> {
        let malformed = |detail: String| ConfigError::Malformed {
            line,
            directive: format!("pfc.{name}"),
            detail,
        };
        let invalid = |detail: String| ConfigError::Invalid {
            line,
            directive: format!("pfc.{name}"),
            detail,
        };

        match name {
            "blocksize" => {
                let value = args.first().ok_or_else(|| malformed("missing size".into()))?;
                let mut size = parse_size(value).map_err(|e| invalid(e))?;
                if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size) {
                    return Err(invalid(format!(
                        "block size {size} outside {MIN_BLOCK_SIZE}..{MAX_BLOCK_SIZE}"
                    )));
                }
                if size % BLOCK_ALIGN != 0 {
                    // Round up to the 4 KiB boundary like the reference
                    // configuration does.
                    size = (size / BLOCK_ALIGN + 1) * BLOCK_ALIGN;
                }
                self.block_size = size;
            }
            "ram" => {
                let value = args.first().ok_or_else(|| malformed("missing size".into()))?;
                self.ram_bytes = parse_size(value).map_err(|e| invalid(e))?;
            }
            "diskusage" => self.apply_diskusage(line, args)?,
            "prefetch" => {
                let value = args.first().ok_or_else(|| malformed("missing count".into()))?;
                self.prefetch_max_blocks = value
                    .parse()
                    .map_err(|_| invalid(format!("unparsable count {value:?}")))?;
            }
            "writequeue" => {
                if args.len() < 2 {
                    return Err(malformed("expected <blocks> <threads>".into()));
                }
                self.write_queue_blocks = args[0]
                    .parse()
                    .map_err(|_| invalid(format!("unparsable depth {:?}", args[0])))?;
                self.writer_threads = args[1]
                    .parse()
                    .map_err(|_| invalid(format!("unparsable thread count {:?}", args[1])))?;
                if self.writer_threads == 0 {
                    return Err(invalid("writer thread count must be positive".into()));
                }
            }
            "cschk" => self.apply_cschk(line, args)?,
            "spaces" => {
                if args.len() < 2 {
                    return Err(malformed("expected <data> <meta>".into()));
                }
                self.data_space = args[0].to_owned();
                self.meta_space = args[1].to_owned();
            }
            "trace" => {
                let value = args.first().ok_or_else(|| malformed("missing level".into()))?;
                self.trace_level = match *value {
                    "none" => 0,
                    "error" => 1,
                    "warning" => 2,
                    "info" => 3,
                    "debug" | "dump" => 4,
                    other => other
                        .parse()
                        .map_err(|_| invalid(format!("unknown trace level {other:?}")))?,
                };
            }
            other => {
                return Err(ConfigError::Malformed {
                    line,
                    directive: format!("pfc.{other}"),
                    detail: "unknown directive".into(),
                });
            }
        }
        Ok(())
    }

    fn apply_diskusage(&mut self, line: usize, args: &[&str]) -> Result<(), ConfigError> {
        let malformed = |detail: String| ConfigError::Malformed {
            line,
            directive: "pfc.diskusage".to_owned(),
            detail,
        };
        let invalid = |detail: String| ConfigError::Invalid {
            line,
            directive: "pfc.diskusage".to_owned(),
            detail,
        };

        if args.len() < 2 {
            return Err(malformed("requires at least two arguments".into()));
        }
        self.disk_usage.low_watermark = parse_threshold(args[0]).map_err(|e| invalid(e))?;
        self.disk_usage.high_watermark = parse_threshold(args[1]).map_err(|e| invalid(e))?;

        let mut at = 2;
        while at < args.len() {
            match args[at] {
                "files" => {
                    if args.len() - at - 1 < 3 {
                        return Err(malformed("files requires three arguments".into()));
                    }
                    let baseline = parse_size(args[at + 1]).map_err(|e| invalid(e))?;
                    let nominal = parse_size(args[at + 2]).map_err(|e| invalid(e))?;
                    let max = parse_size(args[at + 3]).map_err(|e| invalid(e))?;
                    if !(baseline < nominal && nominal < max) {
                        return Err(invalid(
                            "files should have baseline < nominal < max".into(),
                        ));
                    }
                    self.disk_usage.file_counts = Some((baseline, nominal, max));
                    at += 4;
                }
                "purgeinterval" => {
                    let value = args
                        .get(at + 1)
                        .ok_or_else(|| malformed("purgeinterval requires a value".into()))?;
                    let seconds = parse_time_seconds(value).map_err(|e| invalid(e))?;
                    if !(60..=3600).contains(&seconds) {
                        return Err(invalid(format!(
                            "purgeinterval {seconds}s outside 60..3600"
                        )));
                    }
                    self.disk_usage.purge_interval = Duration::from_secs(seconds);
                    at += 2;
                }
                "purgecoldfiles" => {
                    if args.len() - at - 1 < 2 {
                        return Err(malformed("purgecoldfiles requires age and period".into()));
                    }
                    let age = parse_time_seconds(args[at + 1]).map_err(|e| invalid(e))?;
                    if !(3600..=3600 * 24 * 360).contains(&age) {
                        return Err(invalid(format!("cold-file age {age}s out of range")));
                    }
                    let period: u32 = args[at + 2]
                        .parse()
                        .map_err(|_| invalid(format!("unparsable period {:?}", args[at + 2])))?;
                    if !(1..=1000).contains(&period) {
                        return Err(invalid(format!("cold-file period {period} out of range")));
                    }
                    self.disk_usage.purge_cold_age = Some(Duration::from_secs(age));
                    self.disk_usage.purge_cold_period = period;
                    at += 3;
                }
                other => {
                    return Err(malformed(format!("unknown diskusage token {other:?}")));
                }
            }
        }
        Ok(())
    }

    fn apply_cschk(&mut self, line: usize, args: &[&str]) -> Result<(), ConfigError> {
        let invalid = |detail: String| ConfigError::Invalid {
            line,
            directive: "pfc.cschk".to_owned(),
            detail,
        };
        if args.is_empty() {
            return Err(ConfigError::Malformed {
                line,
                directive: "pfc.cschk".to_owned(),
                detail: "parameter not specified".into(),
            });
        }

        let mut at = 0;
        while at < args.len() {
            match args[at] {
                "off" => self.cschk = CkSumPolicy::default(),
                "cache" => self.cschk.cache = true,
                "nocache" => self.cschk.cache = false,
                "net" => self.cschk.net = true,
                "nonet" => self.cschk.net = false,
                "tls" => self.cschk.tls = true,
                "notls" => self.cschk.tls = false,
                "uvkeep" => {
                    let value = args
                        .get(at + 1)
                        .ok_or_else(|| invalid("uvkeep value not specified".into()))?;
                    self.uvkeep = if *value == "lru" {
                        UvKeep::Lru
                    } else {
                        let seconds = parse_time_seconds(value).map_err(|e| invalid(e))?;
                        UvKeep::MaxAge(Duration::from_secs(seconds))
                    };
                    at += 1;
                }
                other => return Err(invalid(format!("invalid cschk option {other:?}"))),
            }
            at += 1;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let err = |detail: String| ConfigError::Invalid {
            line: 0,
            directive: "pfc.diskusage".to_owned(),
            detail,
        };
        match (self.disk_usage.low_watermark, self.disk_usage.high_watermark) {
            (Threshold::Bytes(lwm), Threshold::Bytes(hwm)) if lwm >= hwm => {
                return Err(err("should have lowWatermark < highWatermark".into()));
            }
            (Threshold::Fraction(lwm), Threshold::Fraction(hwm)) if lwm >= hwm => {
                return Err(err("should have lowWatermark < highWatermark".into()));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Parses a size with an optional binary `k/m/g/t` suffix.
pub fn parse_size(input: &str) -> Result<u64, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty size".to_owned());
    }
    let (digits, multiplier) = match input.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('k') => (&input[..input.len() - 1], 1u64 << 10),
        Some('m') => (&input[..input.len() - 1], 1u64 << 20),
        Some('g') => (&input[..input.len() - 1], 1u64 << 30),
        Some('t') => (&input[..input.len() - 1], 1u64 << 40),
        _ => (input, 1),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("unparsable size {input:?}"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size {input:?} overflows"))
}

/// Parses a time in seconds with an optional `s/m/h` suffix.
pub fn parse_time_seconds(input: &str) -> Result<u64, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty time".to_owned());
    }
    let (digits, multiplier) = match input.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('s') => (&input[..input.len() - 1], 1u64),
        Some('m') => (&input[..input.len() - 1], 60),
        Some('h') => (&input[..input.len() - 1], 3600),
        _ => (input, 1),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("unparsable time {input:?}"))?;
    Ok(value * multiplier)
}

/// Parses a watermark: a fraction in (0, 1) when given with a decimal
/// point, a size otherwise.
pub fn parse_threshold(input: &str) -> Result<Threshold, String> {
    if input.contains('.') {
        let fraction: f64 = input
            .parse()
            .map_err(|_| format!("unparsable fraction {input:?}"))?;
        if !(0.0..1.0).contains(&fraction) || fraction == 0.0 {
            return Err(format!("fraction {input:?} outside (0, 1)"));
        }
        return Ok(Threshold::Fraction(fraction));
    }
    parse_size(input).map(Threshold::Bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = CacheConfig::default();
        assert_eq!(config.block_size, 1024 * 1024);
        assert_eq!(config.prefetch_max_blocks, 10);
        assert_eq!(config.writer_threads, 4);
        assert_eq!(config.disk_usage.purge_interval, Duration::from_secs(300));
        assert_eq!(CacheConfig::client_defaults().ram_bytes, 256 * 1024 * 1024);
    }

    #[test]
    fn parses_a_full_stanza() {
        let text = "\
# proxy file cache
pfc.blocksize 4m
pfc.ram 2g
pfc.diskusage 0.80 0.90 purgeinterval 120 purgecoldfiles 24h 5
pfc.prefetch 16
pfc.writequeue 128 8
pfc.cschk cache net uvkeep 7200
pfc.spaces public metapublic
pfc.trace info
throttle.byterate 100m
http.cert /etc/tls/cert.pem
";
        let config = CacheConfig::parse(text).expect("valid config");
        assert_eq!(config.block_size, 4 << 20);
        assert_eq!(config.ram_bytes, 2 << 30);
        assert_eq!(config.disk_usage.low_watermark, Threshold::Fraction(0.80));
        assert_eq!(config.disk_usage.high_watermark, Threshold::Fraction(0.90));
        assert_eq!(config.disk_usage.purge_interval, Duration::from_secs(120));
        assert_eq!(
            config.disk_usage.purge_cold_age,
            Some(Duration::from_secs(24 * 3600))
        );
        assert_eq!(config.disk_usage.purge_cold_period, 5);
        assert_eq!(config.prefetch_max_blocks, 16);
        assert_eq!(config.write_queue_blocks, 128);
        assert_eq!(config.writer_threads, 8);
        assert!(config.cschk.cache && config.cschk.net && !config.cschk.tls);
        assert_eq!(config.uvkeep, UvKeep::MaxAge(Duration::from_secs(7200)));
        assert_eq!(config.data_space, "public");
        assert_eq!(config.meta_space, "metapublic");
        assert_eq!(config.trace_level, 3);
    }

    #[test]
    fn misaligned_blocksize_rounds_up() {
        let config = CacheConfig::parse("pfc.blocksize 5000\n").expect("aligned up");
        assert_eq!(config.block_size, 8192);
        let config = CacheConfig::parse("pfc.blocksize 8193\n").expect("aligned up");
        assert_eq!(config.block_size, 12288);
    }

    #[test]
    fn blocksize_range_is_enforced() {
        assert!(CacheConfig::parse("pfc.blocksize 1k\n").is_err());
        assert!(CacheConfig::parse("pfc.blocksize 1t\n").is_err());
        let config = CacheConfig::parse("pfc.blocksize 64k\n").unwrap();
        assert_eq!(config.block_size, 64 * 1024);
    }

    #[test]
    fn watermark_order_is_validated() {
        let err = CacheConfig::parse("pfc.diskusage 0.95 0.90\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = CacheConfig::parse("pfc.diskusage 200g 100g\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn purgeinterval_is_clamped_to_range() {
        assert!(CacheConfig::parse("pfc.diskusage 0.8 0.9 purgeinterval 10\n").is_err());
        assert!(CacheConfig::parse("pfc.diskusage 0.8 0.9 purgeinterval 2h\n").is_err());
        let config = CacheConfig::parse("pfc.diskusage 0.8 0.9 purgeinterval 10m\n").unwrap();
        assert_eq!(config.disk_usage.purge_interval, Duration::from_secs(600));
    }

    #[test]
    fn files_triple_must_ascend() {
        assert!(
            CacheConfig::parse("pfc.diskusage 0.8 0.9 files 10g 5g 20g\n").is_err()
        );
        let config =
            CacheConfig::parse("pfc.diskusage 0.8 0.9 files 5g 10g 20g\n").unwrap();
        assert_eq!(
            config.disk_usage.file_counts,
            Some((5 << 30, 10 << 30, 20 << 30))
        );
    }

    #[test]
    fn unknown_pfc_directive_is_an_error_but_foreign_prefixes_pass() {
        assert!(CacheConfig::parse("pfc.nosuch 1\n").is_err());
        assert!(CacheConfig::parse("ofs.osslib /x.so\n").is_ok());
        assert!(CacheConfig::parse("http.secretkey hunter2\n").is_ok());
    }

    #[test]
    fn size_suffixes_are_binary() {
        assert_eq!(parse_size("3k").unwrap(), 3 * 1024);
        assert_eq!(parse_size("2M").unwrap(), 2 << 20);
        assert_eq!(parse_size("1g").unwrap(), 1 << 30);
        assert_eq!(parse_size("7").unwrap(), 7);
        assert!(parse_size("x").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn cschk_off_resets_and_uvkeep_lru_parses() {
        let config = CacheConfig::parse("pfc.cschk cache net off uvkeep lru\n").unwrap();
        assert!(config.cschk.is_off());
        assert_eq!(config.uvkeep, UvKeep::Lru);
    }
}
