use super::PageId;

/// The physical frame pool: a flat byte array carved into fixed-size frames,
/// each tagged with the logical page resident in it (or nothing). All access
/// goes through the MemoryManager, which serializes it behind one mutex.
pub struct FrameTable {
    frame_size: usize,
    data: Vec<u8>,
    tags: Vec<Option<PageId>>,
    valid: Vec<bool>,
}

impl FrameTable {
    pub fn new(total_bytes: usize, frame_size: usize) -> FrameTable {
        let total_frames = total_bytes / frame_size;
        FrameTable {
            frame_size,
            data: vec![0; total_frames * frame_size],
            tags: vec![None; total_frames],
            valid: vec![false; total_frames],
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn total_frames(&self) -> usize {
        self.tags.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn used_frames(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }

    /// Lowest-index free frame, if any. Ascending scan is the tie-break rule.
    pub fn find_free(&self) -> Option<usize> {
        self.valid.iter().position(|v| !v)
    }

    pub fn tag_at(&self, index: usize) -> Option<PageId> {
        self.tags.get(index).copied().flatten()
    }

    /// Installs a page's bytes into a frame and makes it resident.
    pub fn install(&mut self, index: usize, page: PageId, bytes: &[u8]) {
        let base = index * self.frame_size;
        let n = bytes.len().min(self.frame_size);
        self.data[base..base + n].copy_from_slice(&bytes[..n]);
        for b in &mut self.data[base + n..base + self.frame_size] {
            *b = 0;
        }
        self.tags[index] = Some(page);
        self.valid[index] = true;
    }

    /// Copies a frame's payload out, e.g. ahead of eviction.
    pub fn dump(&self, index: usize) -> Vec<u8> {
        let base = index * self.frame_size;
        self.data[base..base + self.frame_size].to_vec()
    }

    pub fn clear(&mut self, index: usize) {
        let base = index * self.frame_size;
        for b in &mut self.data[base..base + self.frame_size] {
            *b = 0;
        }
        self.tags[index] = None;
        self.valid[index] = false;
    }

    pub fn read_byte(&self, index: usize, offset: usize) -> u8 {
        self.data[index * self.frame_size + offset]
    }

    pub fn write_byte(&mut self, index: usize, offset: usize, value: u8) {
        self.data[index * self.frame_size + offset] = value;
    }

    /// Clears every frame owned by `pid` and returns the freed indices so the
    /// caller can purge its FIFO queue in the same breath.
    pub fn free_frames_of(&mut self, pid: u64) -> Vec<usize> {
        let mut freed = Vec::new();
        for i in 0..self.tags.len() {
            if matches!(self.tags[i], Some(tag) if tag.pid == pid) {
                self.clear(i);
                freed.push(i);
            }
        }
        freed
    }
}
