use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::warn;

use super::PageId;

/// Disk-like page store. Pages are created zero-filled when a process is
/// admitted, overwritten on eviction, and dropped when the process exits.
/// Evictions additionally append a human-readable record to a text log;
/// the emulator never reads that file back.
pub struct BackingStore {
    frame_size: usize,
    pages: HashMap<PageId, Vec<u8>>,
    log_path: PathBuf,
}

impl BackingStore {
    pub fn new(frame_size: usize, log_path: &Path) -> BackingStore {
        BackingStore {
            frame_size,
            pages: HashMap::new(),
            log_path: log_path.to_path_buf(),
        }
    }

    /// Registers a zero page for `id` unless one already exists.
    pub fn create_zeroed(&mut self, id: PageId) {
        self.pages.entry(id).or_insert_with(|| vec![0; self.frame_size]);
    }

    pub fn store(&mut self, id: PageId, bytes: Vec<u8>) {
        self.pages.insert(id, bytes);
    }

    /// Page contents for `id`; a page that was never written back reads as
    /// zeroes.
    pub fn load(&self, id: &PageId) -> Vec<u8> {
        match self.pages.get(id) {
            Some(bytes) => bytes.clone(),
            None => vec![0; self.frame_size],
        }
    }

    pub fn contains(&self, id: &PageId) -> bool {
        self.pages.contains_key(id)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn remove_pages_of(&mut self, pid: u64) {
        self.pages.retain(|id, _| id.pid != pid);
    }

    /// Appends one eviction record. Initializes the file with a banner when
    /// it does not exist yet.
    pub fn log_eviction(
        &self,
        id: PageId,
        owner_name: Option<&str>,
        source_frame: usize,
        payload: &[u8],
    ) {
        let fresh = !self.log_path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path);
        let mut out = match file {
            Ok(f) => f,
            Err(e) => {
                warn!("cannot open backing store log {}: {}", self.log_path.display(), e);
                return;
            }
        };

        let mut rec = String::new();
        if fresh {
            rec.push_str("========== BACKING STORE EVICTION LOG ==========\n");
        }
        let stamp = Local::now().format("%m/%d/%Y %I:%M:%S %p");
        rec.push_str(&format!("\n--- eviction at {} ---\n", stamp));
        rec.push_str(&format!("evicted page     : {}\n", id));
        match owner_name {
            Some(name) => rec.push_str(&format!("owner process    : {} (pid {})\n", name, id.pid)),
            None => rec.push_str(&format!("owner process    : unknown (pid {})\n", id.pid)),
        }
        rec.push_str(&format!("logical page     : {}\n", id.page));
        rec.push_str(&format!("evicted from     : frame {}\n", source_frame));
        rec.push_str("payload          :");
        for (i, b) in payload.iter().enumerate() {
            if i % 16 == 0 {
                rec.push_str("\n  ");
            }
            rec.push_str(&format!("{:02X} ", b));
        }
        rec.push('\n');

        if let Err(e) = out.write_all(rec.as_bytes()) {
            warn!("cannot append to backing store log: {}", e);
        }
    }
}

/// Overwrites the vmstat snapshot file with the current paging totals.
pub fn write_snapshot(path: &Path, total_frames: usize, paged_in: u64, paged_out: u64) {
    let body = format!(
        "Frames: {}\nPaged In: {}\nPaged Out: {}\n",
        total_frames, paged_in, paged_out
    );
    if let Err(e) = std::fs::write(path, body) {
        warn!("cannot write snapshot {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("osim-backing-test-{}-{}", std::process::id(), name));
        p
    }

    #[test]
    fn missing_page_reads_zeroed() {
        let store = BackingStore::new(16, &temp_path("zero"));
        let id = PageId { pid: 1, page: 0 };
        assert_eq!(vec![0u8; 16], store.load(&id));
        assert!(!store.contains(&id));
    }

    #[test]
    fn store_load_round_trip() {
        let mut store = BackingStore::new(16, &temp_path("rt"));
        let id = PageId { pid: 3, page: 2 };
        let bytes: Vec<u8> = (0u8..16).collect();
        store.store(id, bytes.clone());
        assert_eq!(bytes, store.load(&id));
    }

    #[test]
    fn removal_by_owner() {
        let mut store = BackingStore::new(16, &temp_path("rm"));
        store.create_zeroed(PageId { pid: 1, page: 0 });
        store.create_zeroed(PageId { pid: 1, page: 1 });
        store.create_zeroed(PageId { pid: 2, page: 0 });
        store.remove_pages_of(1);
        assert_eq!(1, store.page_count());
        assert!(store.contains(&PageId { pid: 2, page: 0 }));
    }

    #[test]
    fn eviction_log_written_with_header() {
        let path = temp_path("log");
        let _ = std::fs::remove_file(&path);
        let store = BackingStore::new(16, &path);
        store.log_eviction(PageId { pid: 5, page: 1 }, Some("p5"), 2, &[0xAB; 16]);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("BACKING STORE EVICTION LOG"));
        assert!(text.contains("5:1"));
        assert!(text.contains("p5"));
        assert!(text.contains("frame 2"));
        assert!(text.contains("AB"));
        let _ = std::fs::remove_file(&path);
    }
}
