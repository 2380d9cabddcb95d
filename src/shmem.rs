//! The shared coverage maps the fuzzer reads after every iteration.
//!
//! The fuzzer allocates one SysV shared-memory segment and passes its id
//! down through [`SHM_ENV_VAR`]. The proxy attaches it once at startup and
//! never remaps. The segment starts with the trace map; when
//! [`PERF_MAP_ENV_VAR`] is set, a second fixed-size region of performance
//! counters follows directly after it. [`CoverageMaps`] hands the two
//! regions out as separate slices so nothing downstream does pointer
//! arithmetic across the boundary.

use core::{
    ops::{Deref, DerefMut},
    ptr, slice,
};
use std::env;

use libc::{c_void, shmat, shmdt};

use crate::Error;

/// Environment variable holding the shared memory segment id, as set by
/// AFL-style fuzzers for their target.
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";

/// Environment variable toggling the performance map relay.
pub const PERF_MAP_ENV_VAR: &str = "JQF_PERF_MAP";

/// Size of the coverage trace map, in bytes.
pub const MAP_SIZE: usize = 1 << 16;

/// Size of the optional performance map, in 4-byte words.
pub const PERF_MAP_SIZE: usize = 1 << 14;

/// An existing SysV shared memory mapping, attached by id.
///
/// Unlike a mapping we create ourselves, the segment stays owned by the
/// fuzzer: `Drop` only detaches, it never removes the segment.
#[derive(Debug)]
pub struct UnixShMem {
    id: i32,
    map: *mut u8,
    map_size: usize,
}

impl UnixShMem {
    /// Attach the existing shared memory mapping identified by `id`.
    ///
    /// The segment must be at least `map_size` bytes, which `shmat` cannot
    /// check for us; the fuzzer guarantees it by the protocol contract.
    pub fn attach(id: i32, map_size: usize) -> Result<Self, Error> {
        // # Safety
        // shmat with a null address lets the kernel pick the mapping slot.
        let map = unsafe { shmat(id, ptr::null(), 0) } as *mut u8;

        if ptr::addr_eq(map, ptr::null_mut::<u8>().wrapping_sub(1)) || map.is_null() {
            return Err(Error::last_os_error(format!(
                "Failed to attach the shared mapping with id {id}"
            )));
        }

        Ok(Self { id, map, map_size })
    }

    /// The shared memory id this mapping was attached from.
    #[must_use]
    pub fn id(&self) -> i32 {
        self.id
    }
}

impl Deref for UnixShMem {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.map, self.map_size) }
    }
}

impl DerefMut for UnixShMem {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.map, self.map_size) }
    }
}

impl Drop for UnixShMem {
    fn drop(&mut self) {
        // Detach only. The fuzzer created the segment and removes it.
        unsafe {
            shmdt(self.map as *mut c_void);
        }
    }
}

/// The trace map and the optional perf map, carved out of one backing
/// store as two independently addressable regions.
///
/// Generic over the backing store so tests can run against a plain
/// `Vec<u8>` instead of an attached segment.
#[derive(Debug)]
pub struct CoverageMaps<SHM = UnixShMem> {
    shmem: SHM,
    use_perf_map: bool,
}

impl CoverageMaps<UnixShMem> {
    /// Resolve the segment id from [`SHM_ENV_VAR`] and attach it.
    ///
    /// A missing or non-numeric id is a configuration error. The perf map
    /// is enabled iff [`PERF_MAP_ENV_VAR`] is present in the environment.
    pub fn from_env() -> Result<Self, Error> {
        let shm_str = env::var(SHM_ENV_VAR).map_err(|_| {
            Error::illegal_argument(format!(
                "Error getting the id of the coverage map from env var {SHM_ENV_VAR}"
            ))
        })?;
        let shm_id: i32 = shm_str.parse().map_err(|_| {
            Error::illegal_argument(format!(
                "Non-numeric shared memory id in {SHM_ENV_VAR}: {shm_str}"
            ))
        })?;
        let use_perf_map = env::var_os(PERF_MAP_ENV_VAR).is_some();

        let map_size = if use_perf_map {
            MAP_SIZE + PERF_MAP_SIZE * 4
        } else {
            MAP_SIZE
        };
        let shmem = UnixShMem::attach(shm_id, map_size)?;

        Self::new(shmem, use_perf_map)
    }
}

impl<SHM> CoverageMaps<SHM>
where
    SHM: DerefMut<Target = [u8]>,
{
    /// Wrap a backing store, checking it is large enough for the regions
    /// it has to hold.
    pub fn new(shmem: SHM, use_perf_map: bool) -> Result<Self, Error> {
        let needed = if use_perf_map {
            MAP_SIZE + PERF_MAP_SIZE * 4
        } else {
            MAP_SIZE
        };
        if shmem.len() < needed {
            return Err(Error::illegal_argument(format!(
                "Coverage backing store too small: got {} bytes, need {needed}",
                shmem.len()
            )));
        }
        Ok(Self {
            shmem,
            use_perf_map,
        })
    }

    /// The trace map region.
    pub fn trace_map(&mut self) -> &mut [u8] {
        &mut self.shmem[..MAP_SIZE]
    }

    /// The perf map region, right after the trace map, if enabled.
    pub fn perf_map(&mut self) -> Option<&mut [u8]> {
        if self.use_perf_map {
            Some(&mut self.shmem[MAP_SIZE..MAP_SIZE + PERF_MAP_SIZE * 4])
        } else {
            None
        }
    }

    /// Whether the perf map relay is enabled.
    #[must_use]
    pub fn uses_perf_map(&self) -> bool {
        self.use_perf_map
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn trace_map_spans_the_front_of_the_store() {
        let mut maps = CoverageMaps::new(vec![0_u8; MAP_SIZE], false).unwrap();
        assert_eq!(maps.trace_map().len(), MAP_SIZE);
        maps.trace_map()[0] = 0xff;
        maps.trace_map()[MAP_SIZE - 1] = 0x01;
        assert!(maps.perf_map().is_none());
    }

    #[test]
    fn perf_map_follows_the_trace_map() {
        let mut maps =
            CoverageMaps::new(vec![0_u8; MAP_SIZE + PERF_MAP_SIZE * 4], true).unwrap();
        maps.trace_map().fill(0xaa);
        maps.perf_map().unwrap().fill(0xbb);
        assert_eq!(maps.trace_map()[MAP_SIZE - 1], 0xaa);
        assert_eq!(maps.perf_map().unwrap().len(), PERF_MAP_SIZE * 4);
        assert_eq!(maps.perf_map().unwrap()[0], 0xbb);
    }

    #[test]
    fn undersized_store_is_rejected() {
        assert!(CoverageMaps::new(vec![0_u8; MAP_SIZE - 1], false).is_err());
        // Large enough without the perf map, too small with it.
        assert!(CoverageMaps::new(vec![0_u8; MAP_SIZE], true).is_err());
    }

    #[test]
    #[serial]
    fn missing_env_var_is_a_config_error() {
        env::remove_var(SHM_ENV_VAR);
        assert!(matches!(
            CoverageMaps::from_env(),
            Err(Error::IllegalArgument(_))
        ));
    }

    #[test]
    #[serial]
    fn non_numeric_env_var_is_a_config_error() {
        env::set_var(SHM_ENV_VAR, "not-a-shm-id");
        let res = CoverageMaps::from_env();
        env::remove_var(SHM_ENV_VAR);
        assert!(matches!(res, Err(Error::IllegalArgument(_))));
    }

    #[test]
    #[serial]
    #[cfg(target_os = "linux")]
    fn attach_to_a_real_segment() {
        let os_id = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                MAP_SIZE,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };
        assert!(os_id >= 0, "shmget failed - check OS shm limits");

        {
            let mut maps =
                CoverageMaps::new(UnixShMem::attach(os_id, MAP_SIZE).unwrap(), false).unwrap();
            maps.trace_map().fill(0x41);
            assert_eq!(maps.trace_map()[MAP_SIZE / 2], 0x41);
        }

        // The proxy side must not have removed the segment on detach.
        let again = UnixShMem::attach(os_id, MAP_SIZE).unwrap();
        assert_eq!(again[MAP_SIZE / 2], 0x41);
        drop(again);

        unsafe {
            libc::shmctl(os_id, libc::IPC_RMID, core::ptr::null_mut());
        }
    }
}
