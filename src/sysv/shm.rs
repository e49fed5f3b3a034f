//! Named shared-memory regions, backed by remote memory blocks.
//!
//! The SysV server owns the naming and lifetime of regions; the bytes
//! themselves live in the RMem pool and clients reach them directly
//! through their own RMem stubs and page caches. A region starts empty and
//! gets its backing on the first `ftruncate`.

use crate::config::{RMEM_BLOCK_SIZE, SHM_MAX};
use crate::msg::{name_is_valid, Errno};
use crate::rmem::client::RmemClient;
use crate::rmem::{RPage, RMEM_NULL};
use crate::sysv::{O_CREAT, O_EXCL};
use log::{debug, warn};

pub struct ShmRegion {
    name: String,
    mode: u32,
    blocks: Vec<RPage>,
    refcount: u32,
    unlinked: bool,
}

impl ShmRegion {
    pub fn first_page(&self) -> RPage {
        self.blocks.first().copied().unwrap_or(RMEM_NULL)
    }

    pub fn size_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }
}

pub struct ShmManager {
    regions: Vec<Option<ShmRegion>>,
}

impl Default for ShmManager {
    fn default() -> Self {
        ShmManager::new()
    }
}

impl ShmManager {
    pub fn new() -> ShmManager {
        ShmManager {
            regions: (0..SHM_MAX).map(|_| None).collect(),
        }
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.regions.iter().position(|r| {
            matches!(r, Some(region) if region.name == name && !region.unlinked)
        })
    }

    fn region_mut(&mut self, shmid: i32) -> Result<&mut ShmRegion, Errno> {
        if shmid < 0 || shmid as usize >= SHM_MAX {
            return Err(Errno::Einval);
        }
        self.regions[shmid as usize].as_mut().ok_or(Errno::Einval)
    }

    pub fn region(&self, shmid: i32) -> Result<&ShmRegion, Errno> {
        if shmid < 0 || shmid as usize >= SHM_MAX {
            return Err(Errno::Einval);
        }
        self.regions[shmid as usize].as_ref().ok_or(Errno::Einval)
    }

    /// Creates a region, or opens the existing one unless `O_EXCL` asked
    /// for exclusivity. Returns `(shmid, first page)`.
    pub fn create(
        &mut self,
        name: &str,
        oflags: i32,
        mode: u32,
    ) -> Result<(i32, RPage), Errno> {
        name_is_valid(name)?;
        if let Some(i) = self.find(name) {
            if oflags & O_EXCL != 0 {
                return Err(Errno::Eexist);
            }
            let region = self.regions[i].as_mut().unwrap();
            region.refcount += 1;
            return Ok((i as i32, region.first_page()));
        }

        let free = self
            .regions
            .iter()
            .position(|r| r.is_none())
            .ok_or(Errno::Eagain)?;
        self.regions[free] = Some(ShmRegion {
            name: name.to_string(),
            mode,
            blocks: Vec::new(),
            refcount: 1,
            unlinked: false,
        });
        debug!("[shm] create name={name} shmid={free} mode={mode:o}");
        Ok((free as i32, RMEM_NULL))
    }

    /// Opens an existing region. Returns `(shmid, first page)`.
    pub fn open(&mut self, name: &str, oflags: i32) -> Result<(i32, RPage), Errno> {
        name_is_valid(name)?;
        match self.find(name) {
            Some(i) => {
                let region = self.regions[i].as_mut().unwrap();
                region.refcount += 1;
                Ok((i as i32, region.first_page()))
            }
            None if oflags & O_CREAT != 0 => self.create(name, oflags & !O_EXCL, 0),
            None => Err(Errno::Enoent),
        }
    }

    /// Drops one reference; a region both unlinked and unreferenced gives
    /// its blocks back to remote memory.
    pub fn close(&mut self, rmem: &RmemClient, shmid: i32) -> Result<(), Errno> {
        let region = self.region_mut(shmid)?;
        if region.refcount == 0 {
            return Err(Errno::Einval);
        }
        region.refcount -= 1;
        if region.refcount == 0 && region.unlinked {
            let region = self.regions[shmid as usize].take().unwrap();
            release_blocks(rmem, &region);
        }
        Ok(())
    }

    /// Removes the name. The region lives on until the last close.
    pub fn unlink(&mut self, rmem: &RmemClient, name: &str) -> Result<(), Errno> {
        name_is_valid(name)?;
        let i = self.find(name).ok_or(Errno::Enoent)?;
        let region = self.regions[i].as_mut().unwrap();
        region.unlinked = true;
        debug!("[shm] unlink name={name} shmid={i}");
        if region.refcount == 0 {
            let region = self.regions[i].take().unwrap();
            release_blocks(rmem, &region);
        }
        Ok(())
    }

    /// Grows an empty region to `size` bytes of RMem backing and returns
    /// the first page. Regions cannot be resized once backed.
    pub fn ftruncate(
        &mut self,
        rmem: &RmemClient,
        shmid: i32,
        size: u64,
    ) -> Result<RPage, Errno> {
        let nblocks = (size as usize + RMEM_BLOCK_SIZE - 1) / RMEM_BLOCK_SIZE;
        let region = self.region_mut(shmid)?;
        if !region.blocks.is_empty() {
            return Err(Errno::Ebusy);
        }
        let mut blocks = Vec::with_capacity(nblocks);
        for _ in 0..nblocks {
            match rmem.alloc() {
                Ok(page) => blocks.push(page),
                Err(err) => {
                    // Roll the partial allocation back before failing.
                    for &page in &blocks {
                        let _ = rmem.free(page);
                    }
                    warn!("[shm] ftruncate shmid={shmid} failed: {err}");
                    return Err(err.errno().unwrap_or(Errno::Enomem));
                }
            }
        }
        let region = self.region_mut(shmid)?;
        region.blocks = blocks;
        debug!(
            "[shm] ftruncate shmid={shmid} size={size} -> {} blocks at {}",
            region.size_blocks(),
            region.first_page()
        );
        Ok(region.first_page())
    }
}

fn release_blocks(rmem: &RmemClient, region: &ShmRegion) {
    for &page in &region.blocks {
        if let Err(err) = rmem.free(page) {
            warn!("[shm] leaking page {page}: {err}");
        }
    }
}
