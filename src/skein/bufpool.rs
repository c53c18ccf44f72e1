use bytes::BytesMut;

const CLASSES: [usize; 3] = [4 * 1024, 64 * 1024, 1024 * 1024];

/// Per-class cap on retained buffers; anything past this is dropped.
const MAX_PER_CLASS: usize = 32;

/// Size-classed free lists for transfer buffers. Copy loops churn through
/// short-lived buffers at a high rate; recycling them keeps the allocator
/// out of the hot path.
pub struct BufPool {
    classes: [std::sync::Mutex<Vec<BytesMut>>; 3],
}

impl Default for BufPool {
    fn default() -> Self {
        Self {
            classes: [
                std::sync::Mutex::new(Vec::new()),
                std::sync::Mutex::new(Vec::new()),
                std::sync::Mutex::new(Vec::new()),
            ],
        }
    }
}

impl BufPool {
    /// Get an empty buffer with capacity for at least `len` bytes. Requests
    /// above the largest class fall through to a plain allocation.
    pub fn get(&self, len: usize) -> BytesMut {
        match CLASSES.iter().position(|&c| len <= c) {
            Some(i) => {
                let mut free = self.classes[i].lock().unwrap_or_else(|e| e.into_inner());
                free.pop().unwrap_or_else(|| BytesMut::with_capacity(CLASSES[i]))
            }
            None => BytesMut::with_capacity(len),
        }
    }

    /// Return a buffer to its class. Oddly sized or surplus buffers are
    /// simply dropped.
    pub fn put(&self, mut buf: BytesMut) {
        let Some(i) = CLASSES.iter().position(|&c| buf.capacity() == c) else {
            return;
        };
        buf.clear();
        let mut free = self.classes[i].lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < MAX_PER_CLASS {
            free.push(buf);
        }
    }
}
