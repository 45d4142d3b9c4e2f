//! Fixed-capacity ring buffer backing the per-track signal windows.
//!
//! Storage is allocated once at construction; a push overwrites the oldest
//! slot once the buffer is full, so memory per track stays bounded no matter
//! how long the track lives.

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<T>,
    capacity: usize,
    /// Index of the oldest element.
    head: usize,
    len: usize,
}

impl<T: Copy + Default> RingBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![T::default(); capacity],
            capacity,
            head: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, value: T) {
        let tail = (self.head + self.len) % self.capacity;
        self.slots[tail] = value;
        if self.len == self.capacity {
            self.head = (self.head + 1) % self.capacity;
        } else {
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len).map(move |i| self.slots[(self.head + i) % self.capacity])
    }

}

impl RingBuffer<f32> {
    pub fn mean(&self) -> Option<f32> {
        (self.len > 0).then(|| self.iter().sum::<f32>() / self.len as f32)
    }
}

impl RingBuffer<(f32, f32)> {
    /// Population variance of the x and y components.
    pub fn variance_xy(&self) -> Option<(f32, f32)> {
        if self.len == 0 {
            return None;
        }
        let n = self.len as f32;
        let (sx, sy) = self.iter().fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
        let (mx, my) = (sx / n, sy / n);
        let (vx, vy) = self.iter().fold((0.0, 0.0), |(ax, ay), (x, y)| {
            (ax + (x - mx).powi(2), ay + (y - my).powi(2))
        });
        Some((vx / n, vy / n))
    }
}
