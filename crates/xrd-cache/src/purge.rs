//! Watermark-driven purge.
//!
//! A cycle reads disk usage from the OSS, and when the high watermark is
//! crossed removes the least valuable files until usage falls below the
//! low watermark. Files with expired unverified checksums go first,
//! then (on the configured cadence) files colder than the cold-file age,
//! then plain LRU by last recorded access. Attached files are never
//! purged.

use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::cache::CacheShared;
use crate::cinfo::{CInfo, CkSumState};
use crate::config::{CacheConfig, UvKeep};
use crate::dirstate::{DirState, DirUsage};
use crate::error::CacheResult;
use crate::oss::{Oss, Space, read_all, walk};

/// Outcome of one purge cycle.
#[derive(Clone, Copy, Debug, Default)]
pub struct PurgeStats {
    /// cinfo sidecars examined.
    pub scanned_files: usize,
    /// Files removed from the cache.
    pub removed_files: usize,
    /// Data bytes released.
    pub removed_bytes: u64,
}

struct Candidate {
    path: String,
    last_access: i64,
    size: u64,
    uvkeep_expired: bool,
    cold: bool,
}

/// Runs one purge cycle.
pub fn run_cycle(
    oss: &dyn Oss,
    config: &CacheConfig,
    dirstate: &Mutex<DirState>,
    is_active: &dyn Fn(&str) -> bool,
    now: i64,
    cycle: u32,
) -> CacheResult<PurgeStats> {
    let usage = oss.stat_vs()?;
    let total = usage.total_bytes;
    let mut used = usage.used_bytes();
    let hwm = config.disk_usage.high_watermark.resolve(total);
    let lwm = config.disk_usage.low_watermark.resolve(total);

    let cold_age = config.disk_usage.purge_cold_age;
    let cold_due = cold_age.is_some()
        && config.disk_usage.purge_cold_period > 0
        && cycle % config.disk_usage.purge_cold_period == 0;
    let uvkeep_age = match config.uvkeep {
        UvKeep::MaxAge(age) => Some(age.as_secs() as i64),
        UvKeep::Lru => None,
    };

    let over_pressure = used > hwm;
    if !over_pressure && !cold_due && uvkeep_age.is_none() {
        return Ok(PurgeStats::default());
    }

    let mut stats = PurgeStats::default();
    let mut candidates = Vec::new();

    for meta_path in walk(oss, Space::Meta, "/")? {
        let Some(path) = meta_path.strip_suffix(".cinfo") else {
            continue;
        };
        stats.scanned_files += 1;

        let info = match read_all(oss, Space::Meta, &meta_path)
            .ok()
            .and_then(|bytes| CInfo::deserialize(&bytes).ok())
        {
            Some(info) => info,
            None => {
                // A sidecar that does not parse invalidates the cached
                // copy outright.
                warn!(path, "corrupt cinfo found by purge, removing");
                remove_file(oss, dirstate, path, 0, &mut stats);
                continue;
            }
        };

        if is_active(path) {
            continue;
        }

        let size = oss
            .stat(Space::Data, path)
            .map(|stat| stat.size)
            .unwrap_or_else(|_| info.bits_set() * info.block_size());

        let uvkeep_expired = uvkeep_age.is_some_and(|age| {
            info.cksum_state() == CkSumState::Unverified && now - info.creation_time() > age
        });
        let cold =
            cold_due && cold_age.is_some_and(|age| now - info.last_access_time() > age.as_secs() as i64);

        candidates.push(Candidate {
            path: path.to_owned(),
            last_access: info.last_access_time(),
            size,
            uvkeep_expired,
            cold,
        });
    }

    // Unverified-too-long and cold files go regardless of pressure.
    let (forced, mut by_lru): (Vec<Candidate>, Vec<Candidate>) = candidates
        .into_iter()
        .partition(|c| c.uvkeep_expired || c.cold);
    for candidate in forced {
        debug!(path = %candidate.path, uvkeep = candidate.uvkeep_expired, "forced purge");
        remove_file(oss, dirstate, &candidate.path, candidate.size, &mut stats);
        used = used.saturating_sub(candidate.size);
    }

    if used > hwm {
        by_lru.sort_by_key(|c| c.last_access);
        for candidate in by_lru {
            if used <= lwm {
                break;
            }
            remove_file(oss, dirstate, &candidate.path, candidate.size, &mut stats);
            used = used.saturating_sub(candidate.size);
        }
    }

    if stats.removed_files > 0 {
        info!(
            removed = stats.removed_files,
            bytes = stats.removed_bytes,
            used_after = used,
            "purge released space"
        );
    }
    Ok(stats)
}

fn remove_file(
    oss: &dyn Oss,
    dirstate: &Mutex<DirState>,
    path: &str,
    size: u64,
    stats: &mut PurgeStats,
) {
    if let Err(err) = oss.unlink(Space::Data, path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path, %err, "purge could not remove data file");
            return;
        }
    }
    if let Err(err) = oss.unlink(Space::Meta, &CacheShared::meta_path(path)) {
        warn!(path, %err, "purge could not remove cinfo");
    }
    stats.removed_files += 1;
    stats.removed_bytes += size;

    let mut dirstate = dirstate.lock().expect("dirstate lock poisoned");
    dirstate.apply(
        path,
        &DirUsage {
            files_removed: 1,
            st_blocks_removed: size.div_ceil(512),
            ..DirUsage::default()
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cinfo::AccessRecord;
    use crate::config::Threshold;
    use crate::oss::{LocalOss, OssFile, OssStat, StatVs, write_all};
    use std::io;
    use std::sync::Arc;

    /// LocalOss with a scripted partition size.
    struct FixedVs {
        inner: LocalOss,
        total: u64,
        free: u64,
    }

    impl Oss for FixedVs {
        fn open(&self, space: Space, path: &str) -> io::Result<Box<dyn OssFile>> {
            self.inner.open(space, path)
        }
        fn create(&self, space: Space, path: &str) -> io::Result<Box<dyn OssFile>> {
            self.inner.create(space, path)
        }
        fn stat(&self, space: Space, path: &str) -> io::Result<OssStat> {
            self.inner.stat(space, path)
        }
        fn unlink(&self, space: Space, path: &str) -> io::Result<()> {
            self.inner.unlink(space, path)
        }
        fn readdir(&self, space: Space, path: &str) -> io::Result<Vec<String>> {
            self.inner.readdir(space, path)
        }
        fn stat_vs(&self) -> io::Result<StatVs> {
            Ok(StatVs {
                total_bytes: self.total,
                free_bytes: self.free,
            })
        }
    }

    fn seeded(total: u64, free: u64) -> (tempfile::TempDir, Arc<FixedVs>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let inner = LocalOss::new(dir.path().join("data"), dir.path().join("meta")).unwrap();
        (
            dir,
            Arc::new(FixedVs {
                inner,
                total,
                free,
            }),
        )
    }

    fn seed_file(oss: &dyn Oss, path: &str, size: u64, last_access: i64) {
        write_all(oss, Space::Data, path, &vec![0u8; size as usize]).unwrap();
        let mut info = CInfo::new(4096, size, last_access - 10);
        for block in 0..info.n_blocks() {
            info.set_bit(block);
        }
        info.record_access(AccessRecord {
            attach_time: last_access - 5,
            detach_time: last_access,
            ..AccessRecord::default()
        });
        write_all(
            oss,
            Space::Meta,
            &CacheShared::meta_path(path),
            &info.serialize(),
        )
        .unwrap();
    }

    fn config(lwm: f64, hwm: f64) -> CacheConfig {
        let mut config = CacheConfig::default();
        config.disk_usage.low_watermark = Threshold::Fraction(lwm);
        config.disk_usage.high_watermark = Threshold::Fraction(hwm);
        config
    }

    #[test]
    fn below_watermark_removes_nothing() {
        let (_dir, oss) = seeded(1000, 900); // 10% used
        seed_file(oss.as_ref(), "/a", 100, 1000);
        let dirstate = Mutex::new(DirState::new());
        let stats = run_cycle(oss.as_ref(), &config(0.8, 0.9), &dirstate, &|_| false, 2000, 1)
            .unwrap();
        assert_eq!(stats.removed_files, 0);
        assert!(oss.stat(Space::Data, "/a").is_ok());
    }

    #[test]
    fn purge_is_lru_ordered_and_stops_at_low_watermark() {
        // 1000-byte partition, 950 used; LWM 0.5, HWM 0.9.
        let (_dir, oss) = seeded(1000, 50);
        seed_file(oss.as_ref(), "/old", 300, 100);
        seed_file(oss.as_ref(), "/mid", 300, 500);
        seed_file(oss.as_ref(), "/new", 300, 900);

        let dirstate = Mutex::new(DirState::new());
        let stats = run_cycle(oss.as_ref(), &config(0.5, 0.9), &dirstate, &|_| false, 2000, 1)
            .unwrap();

        // 950 -> remove /old (650) -> remove /mid (350) -> below 500.
        assert_eq!(stats.removed_files, 2);
        assert!(oss.stat(Space::Data, "/old").is_err());
        assert!(oss.stat(Space::Data, "/mid").is_err());
        assert!(oss.stat(Space::Data, "/new").is_ok());

        let usage = dirstate.lock().unwrap().usage_at("/").unwrap();
        assert_eq!(usage.files_removed, 2);
    }

    #[test]
    fn attached_files_are_skipped() {
        let (_dir, oss) = seeded(1000, 50);
        seed_file(oss.as_ref(), "/pinned", 500, 100);
        seed_file(oss.as_ref(), "/loose", 400, 200);

        let dirstate = Mutex::new(DirState::new());
        let stats = run_cycle(
            oss.as_ref(),
            &config(0.5, 0.9),
            &dirstate,
            &|path| path == "/pinned",
            2000,
            1,
        )
        .unwrap();

        assert_eq!(stats.removed_files, 1);
        assert!(oss.stat(Space::Data, "/pinned").is_ok());
        assert!(oss.stat(Space::Data, "/loose").is_err());
    }

    #[test]
    fn corrupt_cinfo_is_removed_on_sight() {
        let (_dir, oss) = seeded(1000, 50);
        write_all(oss.as_ref(), Space::Data, "/bad", b"bytes").unwrap();
        write_all(oss.as_ref(), Space::Meta, "/bad.cinfo", b"not a sidecar").unwrap();

        let dirstate = Mutex::new(DirState::new());
        let stats = run_cycle(oss.as_ref(), &config(0.5, 0.9), &dirstate, &|_| false, 2000, 1)
            .unwrap();
        assert_eq!(stats.removed_files, 1);
        assert!(oss.stat(Space::Data, "/bad").is_err());
        assert!(oss.stat(Space::Meta, "/bad.cinfo").is_err());
    }

    #[test]
    fn expired_unverified_files_go_regardless_of_pressure() {
        // Plenty of free space: only the uvkeep rule can trigger removal.
        let (_dir, oss) = seeded(1_000_000, 900_000);
        write_all(oss.as_ref(), Space::Data, "/stale", &vec![0u8; 100]).unwrap();
        let mut info = CInfo::new(4096, 100, 0); // created at epoch
        info.set_cksum_state(CkSumState::Unverified);
        write_all(
            oss.as_ref(),
            Space::Meta,
            "/stale.cinfo",
            &info.serialize(),
        )
        .unwrap();

        let mut config = config(0.5, 0.9);
        config.uvkeep = UvKeep::MaxAge(std::time::Duration::from_secs(3600));

        let dirstate = Mutex::new(DirState::new());
        let stats = run_cycle(oss.as_ref(), &config, &dirstate, &|_| false, 10_000, 1).unwrap();
        assert_eq!(stats.removed_files, 1);
        assert!(oss.stat(Space::Data, "/stale").is_err());
    }

    #[test]
    fn cold_files_purge_only_on_their_cadence() {
        let (_dir, oss) = seeded(1_000_000, 900_000);
        seed_file(oss.as_ref(), "/cold", 100, 100);

        let mut config = config(0.5, 0.9);
        config.disk_usage.purge_cold_age = Some(std::time::Duration::from_secs(3600));
        config.disk_usage.purge_cold_period = 5;

        let dirstate = Mutex::new(DirState::new());
        // Cycle 3: not on the cadence, nothing happens.
        let stats =
            run_cycle(oss.as_ref(), &config, &dirstate, &|_| false, 100_000, 3).unwrap();
        assert_eq!(stats.removed_files, 0);

        // Cycle 5: cadence hit, the cold file goes.
        let stats =
            run_cycle(oss.as_ref(), &config, &dirstate, &|_| false, 100_000, 5).unwrap();
        assert_eq!(stats.removed_files, 1);
    }
}
