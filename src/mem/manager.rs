use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::debug;

use super::backing::{self, BackingStore};
use super::frames::FrameTable;
use super::{parse_logical_addr, MemResult, MemoryError, PageId};
use crate::exec::process::Process;

/// Symbol-table segment: 32 two-byte slots in `[0, 64)`.
pub const MAX_SYMBOLS: usize = 32;
pub const SYMBOL_SEGMENT_BYTES: usize = 2 * MAX_SYMBOLS;

/// Why a variable could not be allocated. The first two degrade the
/// declaring instruction to a logged no-op; the last carries a real memory
/// fault out of the zero-initialization write.
#[derive(Debug, PartialEq)]
pub enum VarAllocError {
    SymbolTableFull,
    ProcessMemoryFull,
    Memory(MemoryError),
}

/// Resolves a pid to its process so eviction can flip the owner's valid
/// bits. Non-owning: the scheduler keeps the registry, we only borrow it.
type OwnerLookup = Box<dyn Fn(u64) -> Option<Arc<Process>> + Send + Sync>;

/// Owns the frame pool and the backing store; services every translation,
/// fault, eviction and deallocation in the emulator.
///
/// Lock order is per-process page state, then the frame table, then the
/// backing store / FIFO queue. The fault path is serialized by its own
/// mutex so two faulting cores cannot claim the same free frame.
pub struct MemoryManager {
    frame_size: usize,
    frames: Mutex<FrameTable>,
    backing: Mutex<BackingStore>,
    fifo: Mutex<VecDeque<usize>>,
    owners: Mutex<HashMap<usize, u64>>,
    fault_lock: Mutex<()>,
    owner_lookup: RwLock<Option<OwnerLookup>>,
    paged_in: AtomicU64,
    paged_out: AtomicU64,
    snapshot_path: std::path::PathBuf,
}

impl MemoryManager {
    pub fn new(
        total_bytes: usize,
        frame_size: usize,
        backing_log: &Path,
        snapshot_path: &Path,
    ) -> MemoryManager {
        MemoryManager {
            frame_size,
            frames: Mutex::new(FrameTable::new(total_bytes, frame_size)),
            backing: Mutex::new(BackingStore::new(frame_size, backing_log)),
            fifo: Mutex::new(VecDeque::new()),
            owners: Mutex::new(HashMap::new()),
            fault_lock: Mutex::new(()),
            owner_lookup: RwLock::new(None),
            paged_in: AtomicU64::new(0),
            paged_out: AtomicU64::new(0),
            snapshot_path: snapshot_path.to_path_buf(),
        }
    }

    pub fn set_owner_lookup(&self, lookup: OwnerLookup) {
        *self.owner_lookup.write().unwrap() = Some(lookup);
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn total_frames(&self) -> usize {
        self.frames.lock().unwrap().total_frames()
    }

    pub fn total_bytes(&self) -> usize {
        self.frames.lock().unwrap().total_bytes()
    }

    pub fn used_frames(&self) -> usize {
        self.frames.lock().unwrap().used_frames()
    }

    pub fn paged_in(&self) -> u64 {
        self.paged_in.load(Ordering::Acquire)
    }

    pub fn paged_out(&self) -> u64 {
        self.paged_out.load(Ordering::Acquire)
    }

    /// Records the process's logical address space and registers zero pages
    /// in the backing store. Admission is lazy: no physical frame is claimed
    /// here, so this cannot fail for lack of capacity.
    pub fn allocate(&self, proc: &Process, requested_bytes: usize) {
        let pages_required = (requested_bytes + self.frame_size - 1) / self.frame_size;
        {
            let mut ps = proc.page_state();
            ps.allocated_bytes = requested_bytes;
            for i in 0..pages_required {
                ps.page_table.insert(i, None);
                ps.valid_bits.insert(i, false);
            }
        }
        {
            let mut bs = self.backing.lock().unwrap();
            for i in 0..pages_required {
                bs.create_zeroed(PageId { pid: proc.pid(), page: i });
            }
        }
        debug!(
            "allocated {} bytes ({} pages) for pid {}",
            requested_bytes, pages_required, proc.pid()
        );
    }

    /// Assigns the next aligned slot in the symbol-table segment to `name`
    /// and zero-initializes it. Redeclaring an existing name returns its
    /// current address.
    pub fn allocate_variable(&self, proc: &Process, name: &str) -> Result<String, VarAllocError> {
        let addr = {
            let mut ps = proc.page_state();
            if let Some(existing) = ps.symbol_table.get(name) {
                return Ok(existing.clone());
            }
            if ps.symbol_table.len() >= MAX_SYMBOLS {
                return Err(VarAllocError::SymbolTableFull);
            }
            let offset = 2 * ps.symbol_table.len();
            if offset >= ps.allocated_bytes {
                return Err(VarAllocError::ProcessMemoryFull);
            }
            let addr = format!("0x{:X}", offset);
            ps.symbol_table.insert(name.to_string(), addr.clone());
            addr
        };
        self.write(proc, &addr, 0).map_err(VarAllocError::Memory)?;
        Ok(addr)
    }

    /// Reads the 16-bit word at a logical address. The word's high byte is
    /// taken from the next logical byte when it is still in range; the last
    /// byte of the address space reads as a low-byte-only word.
    pub fn read(&self, proc: &Process, logical: &str) -> MemResult<u16> {
        let (addr, allocated) = self.check_addr(proc, logical)?;
        let lo = self.access_byte(proc, addr, None)?;
        let hi = if addr + 1 < allocated {
            self.access_byte(proc, addr + 1, None)?
        } else {
            0
        };
        Ok(u16::from_le_bytes([lo, hi]))
    }

    /// Writes a 16-bit word at a logical address; the high byte is dropped
    /// when the address names the last allocated byte.
    pub fn write(&self, proc: &Process, logical: &str, value: u16) -> MemResult<()> {
        let (addr, allocated) = self.check_addr(proc, logical)?;
        let [lo, hi] = value.to_le_bytes();
        self.access_byte(proc, addr, Some(lo))?;
        if addr + 1 < allocated {
            self.access_byte(proc, addr + 1, Some(hi))?;
        }
        Ok(())
    }

    /// Releases everything a finished process held: resident frames, FIFO
    /// entries for those frames, owner records, and backing-store pages.
    /// Serialized against the fault path so replacement never sees a frame
    /// mid-teardown.
    pub fn deallocate(&self, pid: u64) {
        let _serial = self.fault_lock.lock().unwrap();
        let freed = self.frames.lock().unwrap().free_frames_of(pid);
        if !freed.is_empty() {
            let freed: HashSet<usize> = freed.into_iter().collect();
            self.fifo.lock().unwrap().retain(|f| !freed.contains(f));
        }
        self.owners.lock().unwrap().retain(|_, owner| *owner != pid);
        self.backing.lock().unwrap().remove_pages_of(pid);
        debug!("deallocated pid {}", pid);
    }

    /// Writes the vmstat snapshot file.
    pub fn snapshot(&self) {
        backing::write_snapshot(
            &self.snapshot_path,
            self.total_frames(),
            self.paged_in(),
            self.paged_out(),
        );
    }

    /// Bounds-checks a logical address string. An address that fails to
    /// parse or names a byte at or past `allocated_bytes` is a violation.
    fn check_addr(&self, proc: &Process, logical: &str) -> MemResult<(usize, usize)> {
        let allocated = proc.page_state().allocated_bytes;
        match parse_logical_addr(logical) {
            Some(a) if a < allocated => Ok((a, allocated)),
            _ => Err(MemoryError::AccessViolation(logical.to_string())),
        }
    }

    /// Resolves one logical byte to its resident frame and reads or writes
    /// it. Retries after servicing a fault: an eviction racing in between
    /// flips the valid bit back off, and the retry observes that instead of
    /// touching a stale frame index.
    fn access_byte(&self, proc: &Process, byte_addr: usize, store: Option<u8>) -> MemResult<u8> {
        let page = byte_addr / self.frame_size;
        let offset = byte_addr % self.frame_size;
        loop {
            {
                let mut ps = proc.page_state();
                let resident = matches!(ps.valid_bits.get(&page).copied(), Some(true));
                if resident {
                    if let Some(Some(frame)) = ps.page_table.get(&page).copied() {
                        let mut ft = self.frames.lock().unwrap();
                        return Ok(match store {
                            Some(b) => {
                                ft.write_byte(frame, offset, b);
                                b
                            }
                            None => ft.read_byte(frame, offset),
                        });
                    }
                    // valid bit without a frame index is stale state
                    ps.valid_bits.insert(page, false);
                }
            }
            self.handle_fault(proc, page)?;
        }
    }

    /// Demand-pages one logical page in, evicting the FIFO victim when the
    /// pool is full. Serialized so concurrent faults cannot double-claim a
    /// frame.
    fn handle_fault(&self, proc: &Process, page: usize) -> MemResult<()> {
        let _serial = self.fault_lock.lock().unwrap();

        let pid = proc.pid();
        let id = PageId { pid, page };

        let frame = match self.frames.lock().unwrap().find_free() {
            Some(f) => f,
            None => {
                let victim = self.fifo.lock().unwrap().pop_front();
                match victim {
                    Some(v) => {
                        self.evict(v);
                        v
                    }
                    None => return Err(MemoryError::OutOfMemory),
                }
            }
        };

        let bytes = self.backing.lock().unwrap().load(&id);
        {
            let mut ps = proc.page_state();
            let mut ft = self.frames.lock().unwrap();
            ft.install(frame, id, &bytes);
            ps.page_table.insert(page, Some(frame));
            ps.valid_bits.insert(page, true);
        }
        self.owners.lock().unwrap().insert(frame, pid);
        self.fifo.lock().unwrap().push_back(frame);
        self.paged_in.fetch_add(1, Ordering::AcqRel);
        debug!("paged in {} -> frame {}", id, frame);
        Ok(())
    }

    /// Pushes a resident page out to the backing store and clears its frame.
    /// The owner's valid bit goes down first so any concurrent translation
    /// re-faults instead of reading the dying frame.
    fn evict(&self, frame: usize) {
        let id = match self.frames.lock().unwrap().tag_at(frame) {
            Some(id) => id,
            None => return,
        };
        let owner = self.lookup_owner(id.pid);

        let payload = {
            match &owner {
                Some(p) => {
                    let mut ps = p.page_state();
                    ps.valid_bits.insert(id.page, false);
                    ps.page_table.insert(id.page, None);
                    let mut ft = self.frames.lock().unwrap();
                    let payload = ft.dump(frame);
                    ft.clear(frame);
                    payload
                }
                None => {
                    let mut ft = self.frames.lock().unwrap();
                    let payload = ft.dump(frame);
                    ft.clear(frame);
                    payload
                }
            }
        };

        {
            let mut bs = self.backing.lock().unwrap();
            bs.store(id, payload.clone());
            bs.log_eviction(id, owner.as_ref().map(|p| p.name()), frame, &payload);
        }
        self.owners.lock().unwrap().remove(&frame);
        self.paged_out.fetch_add(1, Ordering::AcqRel);
        debug!("paged out {} from frame {}", id, frame);
    }

    fn lookup_owner(&self, pid: u64) -> Option<Arc<Process>> {
        let guard = self.owner_lookup.read().unwrap();
        guard.as_ref().and_then(|f| f(pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::process::Process;
    use crate::tick::TickSource;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("osim-mgr-test-{}-{}", std::process::id(), name));
        p
    }

    fn manager(total: usize, frame: usize, tag: &str) -> Arc<MemoryManager> {
        Arc::new(MemoryManager::new(
            total,
            frame,
            &temp_path(&format!("{}-bs.txt", tag)),
            &temp_path(&format!("{}-vm.txt", tag)),
        ))
    }

    fn process(pid: u64, mm: &Arc<MemoryManager>, bytes: usize) -> Arc<Process> {
        let p = Process::new(pid, format!("p{}", pid), Arc::clone(mm), TickSource::new());
        mm.allocate(&p, bytes);
        p
    }

    #[test]
    fn write_then_read_round_trip() {
        let mm = manager(64, 16, "rt");
        let p = process(1, &mm, 64);
        mm.write(&p, "0x10", 1234).unwrap();
        assert_eq!(1234, mm.read(&p, "0x10").unwrap());
    }

    #[test]
    fn bounds_check() {
        let mm = manager(64, 16, "bounds");
        let p = process(1, &mm, 64);
        // last byte is readable, first byte past the space is not
        assert!(mm.read(&p, "0x3F").is_ok());
        assert_eq!(
            Err(MemoryError::AccessViolation("0x40".into())),
            mm.read(&p, "0x40")
        );
        assert_eq!(
            Err(MemoryError::AccessViolation("0x80".into())),
            mm.write(&p, "0x80", 5)
        );
        assert_eq!(
            Err(MemoryError::AccessViolation("junk".into())),
            mm.read(&p, "junk")
        );
        assert_eq!(
            Err(MemoryError::AccessViolation("-4".into())),
            mm.read(&p, "-4")
        );
    }

    #[test]
    fn violation_leaves_paging_counters_alone() {
        let mm = manager(64, 16, "count");
        let p = process(1, &mm, 64);
        let _ = mm.write(&p, "0x80", 5);
        assert_eq!(0, mm.paged_in());
        assert_eq!(0, mm.paged_out());
    }

    #[test]
    fn variable_slots_are_aligned_and_capped() {
        let mm = manager(4096, 16, "vars");
        let p = process(1, &mm, 1024);
        for i in 0..MAX_SYMBOLS {
            let addr = mm.allocate_variable(&p, &format!("v{}", i)).unwrap();
            assert_eq!(format!("0x{:X}", 2 * i), addr);
        }
        assert_eq!(
            Err(VarAllocError::SymbolTableFull),
            mm.allocate_variable(&p, "overflow")
        );
        // re-declaring keeps the original slot
        assert_eq!("0x0", mm.allocate_variable(&p, "v0").unwrap());
    }

    #[test]
    fn small_process_runs_out_of_variable_room() {
        let mm = manager(4096, 16, "tiny");
        // an 8-byte space backs only four 2-byte slots
        let q = process(2, &mm, 8);
        for i in 0..4 {
            mm.allocate_variable(&q, &format!("v{}", i)).unwrap();
        }
        assert_eq!(
            Err(VarAllocError::ProcessMemoryFull),
            mm.allocate_variable(&q, "v4")
        );
    }

    #[test]
    fn fifo_eviction_preserves_contents() {
        // F = 4 frames of 16 bytes; three 32-byte processes cannot all fit
        let mm = manager(64, 16, "evict");
        let p1 = process(1, &mm, 32);
        let p2 = process(2, &mm, 32);
        let p3 = process(3, &mm, 32);

        // registry so eviction can reach the owners
        let procs: Vec<Arc<Process>> = vec![p1.clone(), p2.clone(), p3.clone()];
        let lookup = {
            let procs = procs.clone();
            move |pid: u64| procs.iter().find(|p| p.pid() == pid).cloned()
        };
        mm.set_owner_lookup(Box::new(lookup));

        mm.write(&p1, "0x2", 11).unwrap();
        mm.write(&p1, "0x12", 12).unwrap();
        mm.write(&p2, "0x2", 21).unwrap();
        mm.write(&p2, "0x12", 22).unwrap();
        assert_eq!(4, mm.paged_in());
        assert_eq!(0, mm.paged_out());

        // p3 touches both of its pages: the two oldest frames (p1's) go out
        mm.write(&p3, "0x2", 31).unwrap();
        mm.write(&p3, "0x12", 32).unwrap();
        assert_eq!(6, mm.paged_in());
        assert_eq!(2, mm.paged_out());
        {
            let ps = p1.page_state();
            assert_eq!(Some(&false), ps.valid_bits.get(&0));
            assert_eq!(Some(&false), ps.valid_bits.get(&1));
        }

        // refault p1: contents are byte-identical
        assert_eq!(11, mm.read(&p1, "0x2").unwrap());
        assert_eq!(12, mm.read(&p1, "0x12").unwrap());
        assert!(mm.paged_out() >= 2);
    }

    #[test]
    fn out_of_memory_when_no_frames_exist() {
        let mm = manager(0, 16, "oom");
        let p = process(1, &mm, 64);
        assert_eq!(Err(MemoryError::OutOfMemory), mm.read(&p, "0x0"));
    }

    #[test]
    fn deallocate_purges_frames_and_fifo() {
        let mm = manager(64, 16, "dealloc");
        let p1 = process(1, &mm, 32);
        let p2 = process(2, &mm, 32);
        mm.write(&p1, "0x0", 1).unwrap();
        mm.write(&p1, "0x10", 2).unwrap();
        mm.write(&p2, "0x0", 3).unwrap();
        assert_eq!(3, mm.used_frames());

        mm.deallocate(p1.pid());
        assert_eq!(1, mm.used_frames());

        // the freed frames are reusable and the FIFO holds no stale entries:
        // filling the pool evicts p2's page last, not a cleared frame
        let p3 = process(3, &mm, 64);
        let lookup = {
            let procs = vec![p2.clone(), p3.clone()];
            move |pid: u64| procs.iter().find(|p| p.pid() == pid).cloned()
        };
        mm.set_owner_lookup(Box::new(lookup));
        for page in 0..4 {
            mm.write(&p3, &format!("0x{:X}", page * 16), 7).unwrap();
        }
        // 4 frames for p3 forced exactly one eviction: p2's resident page
        assert_eq!(1, mm.paged_out());
        assert_eq!(Some(&false), p2.page_state().valid_bits.get(&0));
    }

    #[test]
    fn resident_pages_and_frame_tags_agree() {
        let mm = manager(64, 16, "tags");
        let p1 = process(1, &mm, 32);
        let p2 = process(2, &mm, 32);
        mm.write(&p1, "0x0", 1).unwrap();
        mm.write(&p1, "0x10", 2).unwrap();
        mm.write(&p2, "0x0", 3).unwrap();

        // every valid page maps to exactly one frame tagged for it
        let mut seen = std::collections::HashSet::new();
        for p in [&p1, &p2] {
            let ps = p.page_state();
            for (page, valid) in &ps.valid_bits {
                if !*valid {
                    continue;
                }
                let frame = ps.page_table[page].expect("valid page without frame");
                assert!(seen.insert(frame), "frame {} mapped twice", frame);
                let ft = mm.frames.lock().unwrap();
                assert_eq!(
                    Some(PageId { pid: p.pid(), page: *page }),
                    ft.tag_at(frame)
                );
            }
        }
        assert_eq!(3, seen.len());
        assert!(mm.paged_out() <= mm.paged_in());
    }

    #[test]
    fn snapshot_file_contents() {
        let path = temp_path("snap-vm.txt");
        let mm = Arc::new(MemoryManager::new(
            64,
            16,
            &temp_path("snap-bs.txt"),
            &path,
        ));
        let p = process(1, &mm, 64);
        mm.write(&p, "0x0", 9).unwrap();
        mm.snapshot();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("Frames: 4"));
        assert!(text.contains("Paged In: 1"));
        assert!(text.contains("Paged Out: 0"));
        let _ = std::fs::remove_file(&path);
    }
}
