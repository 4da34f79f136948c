//! Per-tier arena mappings.
//!
//! Each memory tier owns exactly one contiguous mapping, selected by the
//! tier's backing kind. Arenas are created once at cache construction,
//! never resized, and unmapped on drop. File-backed and dax arenas persist
//! their bytes across restarts; the slab layout inside them is implicit
//! (slab index = offset / slab size).

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use memmap2::MmapMut;
use tracing::debug;

/// The backing kind of one memory tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierBacking {
    /// Anonymous DRAM, optionally bound to a NUMA node (Linux only).
    Anonymous { numa_node: Option<u32> },
    /// A regular file, created or grown to the tier size.
    File { path: PathBuf },
    /// POSIX shared memory object (`shm_open`).
    PosixShm { name: String },
    /// System V shared memory segment (`shmget`).
    SysvShm { key: i32 },
    /// A dax character device mapped directly.
    Dax { path: PathBuf },
}

#[derive(Debug)]
enum Mapping {
    /// Raw `mmap` owned by us; unmapped with `munmap`.
    Raw,
    /// File mapping owned by memmap2; unmapped on drop of the map.
    File(#[allow(dead_code)] MmapMut),
    /// System V attachment; detached with `shmdt`.
    Sysv,
}

/// One contiguous mapping backing a tier.
#[derive(Debug)]
pub struct Arena {
    ptr: NonNull<u8>,
    len: usize,
    mapping: Mapping,
}

// Safety: the arena is raw memory that never moves until drop; access
// discipline for the bytes is imposed by the slab allocator and the item
// layer above it.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Map `len` bytes with the given backing.
    ///
    /// `len` must be non-zero; callers round it to a whole number of slabs
    /// before mapping.
    pub fn create(backing: &TierBacking, len: usize) -> io::Result<Self> {
        assert!(len > 0, "arena size must be non-zero");
        let arena = match backing {
            TierBacking::Anonymous { numa_node } => Self::map_anonymous(len, *numa_node),
            TierBacking::File { path } => Self::map_file(path, len),
            TierBacking::PosixShm { name } => Self::map_posix_shm(name, len),
            TierBacking::SysvShm { key } => Self::map_sysv_shm(*key, len),
            TierBacking::Dax { path } => Self::map_dax(path, len),
        }?;
        debug!(len, ?backing, "mapped tier arena");
        Ok(arena)
    }

    /// Base address of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the mapping is empty. Arenas never are; present for
    /// completeness of the slice-like surface.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `ptr` points into this mapping.
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self.ptr.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.len
    }

    fn map_anonymous(len: usize, numa_node: Option<u32>) -> io::Result<Self> {
        // SAFETY: anonymous mapping with no fixed address; the kernel picks
        // the placement and we own the result until munmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        if let Some(node) = numa_node {
            bind_to_node(ptr, len, node)?;
        }
        Ok(Self {
            ptr: NonNull::new(ptr as *mut u8).expect("mmap returned non-null"),
            len,
            mapping: Mapping::Raw,
        })
    }

    fn map_file(path: &Path, len: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < len as u64 {
            file.set_len(len as u64)?;
        }
        // SAFETY: the file stays open for the lifetime of the map and no
        // other code in this process truncates it.
        let mmap = unsafe { memmap2::MmapOptions::new().len(len).map_mut(&file)? };
        let ptr = NonNull::new(mmap.as_ptr() as *mut u8).expect("mmap returned non-null");
        Ok(Self {
            ptr,
            len,
            mapping: Mapping::File(mmap),
        })
    }

    fn map_posix_shm(name: &str, len: usize) -> io::Result<Self> {
        let cname = CString::new(name.to_owned())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "shm name contains NUL"))?;
        // SAFETY: shm_open with a valid C string; the fd is closed below
        // once the mapping is established.
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd is a valid shm object we just opened.
        let rc = unsafe { libc::ftruncate(fd, len as libc::off_t) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid.
            unsafe { libc::close(fd) };
            return Err(err);
        }
        // SAFETY: shared mapping over the shm fd; the object persists
        // independently of the fd, which we close right after.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // SAFETY: fd is valid.
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: NonNull::new(ptr as *mut u8).expect("mmap returned non-null"),
            len,
            mapping: Mapping::Raw,
        })
    }

    fn map_sysv_shm(key: i32, len: usize) -> io::Result<Self> {
        // SAFETY: shmget/shmat with a caller-chosen key; the attachment is
        // detached on drop.
        let id = unsafe { libc::shmget(key, len, libc::IPC_CREAT | 0o600) };
        if id < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: id names the segment created above.
        let ptr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if ptr as isize == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: NonNull::new(ptr as *mut u8).expect("shmat returned non-null"),
            len,
            mapping: Mapping::Sysv,
        })
    }

    fn map_dax(path: &Path, len: usize) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();

        // Prefer a synchronous mapping on dax so stores reach the device
        // without msync; fall back to a plain shared mapping where the
        // kernel or device refuses MAP_SYNC.
        #[cfg(target_os = "linux")]
        {
            // SAFETY: shared mapping over the dax fd held open below.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED_VALIDATE | libc::MAP_SYNC,
                    fd,
                    0,
                )
            };
            if ptr != libc::MAP_FAILED {
                return Ok(Self {
                    ptr: NonNull::new(ptr as *mut u8).expect("mmap returned non-null"),
                    len,
                    mapping: Mapping::Raw,
                });
            }
            debug!(path = %path.display(), "MAP_SYNC unavailable, falling back to MAP_SHARED");
        }

        // SAFETY: shared mapping over the dax fd; the mapping outlives the
        // fd once established.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: NonNull::new(ptr as *mut u8).expect("mmap returned non-null"),
            len,
            mapping: Mapping::Raw,
        })
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        match self.mapping {
            Mapping::Raw => {
                // SAFETY: we own the mapping and nothing references it past
                // this point (the allocator owning us is being dropped).
                let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
                debug_assert_eq!(rc, 0, "munmap failed");
            }
            Mapping::Sysv => {
                // SAFETY: the attachment was made in map_sysv_shm.
                let rc = unsafe { libc::shmdt(self.ptr.as_ptr().cast()) };
                debug_assert_eq!(rc, 0, "shmdt failed");
            }
            Mapping::File(_) => {
                // memmap2 unmaps on drop.
            }
        }
    }
}

/// Bind freshly mapped pages to a NUMA node with `mbind`.
#[cfg(target_os = "linux")]
fn bind_to_node(ptr: *mut libc::c_void, len: usize, node: u32) -> io::Result<()> {
    const MPOL_BIND: libc::c_int = 2;
    if node >= 64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "numa node out of range",
        ));
    }
    let nodemask: libc::c_ulong = 1 << node;
    // SAFETY: ptr/len describe the mapping created by the caller; the
    // nodemask covers a single node below the mask width we pass.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            ptr,
            len,
            MPOL_BIND,
            &nodemask as *const libc::c_ulong,
            64usize,
            0usize,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn bind_to_node(_ptr: *mut libc::c_void, _len: usize, _node: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "NUMA binding is Linux-only",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_arena_is_usable() {
        let arena = Arena::create(&TierBacking::Anonymous { numa_node: None }, 1 << 20).unwrap();
        assert_eq!(arena.len(), 1 << 20);
        assert!(arena.contains(arena.as_ptr()));
        // SAFETY: in-bounds write to freshly mapped private memory.
        unsafe {
            arena.as_ptr().write(0xab);
            assert_eq!(arena.as_ptr().read(), 0xab);
            let last = arena.as_ptr().add(arena.len() - 1);
            last.write(0xcd);
            assert_eq!(last.read(), 0xcd);
        }
        let outside = (arena.as_ptr() as usize + arena.len()) as *const u8;
        assert!(!arena.contains(outside));
    }

    #[test]
    fn file_arena_persists_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tier0");
        {
            let arena = Arena::create(&TierBacking::File { path: path.clone() }, 1 << 16).unwrap();
            // SAFETY: in-bounds write to the file mapping.
            unsafe { arena.as_ptr().add(4096).write(0x5a) };
        }
        let arena = Arena::create(&TierBacking::File { path }, 1 << 16).unwrap();
        // SAFETY: in-bounds read of the remapped file.
        let b = unsafe { arena.as_ptr().add(4096).read() };
        assert_eq!(b, 0x5a);
    }
}
