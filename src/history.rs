//! Sliding-window history used as a preset deflate dictionary.
//!
//! Each direction of a context-takeover connection owns one [`HistoryDict`].
//! The live bytes are always kept contiguous at the front of the buffer so
//! they can be handed to the deflate engine as a single dictionary slice.

/// A bounded byte window holding the most recent uncompressed message bytes.
#[derive(Debug, Clone)]
pub struct HistoryDict {
    buf: Box<[u8]>,
    head: usize,
}

impl HistoryDict {
    /// Creates a window of `1 << window_bits` bytes.
    pub fn new(window_bits: u8) -> Self {
        Self::with_capacity(1usize << window_bits)
    }

    pub fn with_capacity(size: usize) -> Self {
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
            head: 0,
        }
    }

    /// Appends `data`, evicting the oldest bytes when the window is full.
    pub fn write(&mut self, data: &[u8]) {
        let window = self.buf.len();
        let n = data.len();

        if n >= window {
            self.buf.copy_from_slice(&data[n - window..]);
            self.head = window;
        } else if n > window - self.head {
            // keep the newest `window - n` bytes, then append
            let keep = window - n;
            self.buf.copy_within(self.head - keep..self.head, 0);
            self.buf[keep..].copy_from_slice(data);
            self.head = window;
        } else {
            self.buf[self.head..self.head + n].copy_from_slice(data);
            self.head += n;
        }
    }

    /// The live window, oldest byte first.
    #[inline]
    pub fn get(&self) -> &[u8] {
        &self.buf[..self.head]
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == 0
    }

    pub fn clear(&mut self) {
        self.head = 0;
    }
}
