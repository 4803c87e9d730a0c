/// Fixed-capacity smoothing history. Overwrites the oldest sample once full.
#[derive(Debug, Clone)]
pub struct RingBuffer<const N: usize> {
    samples: [f64; N],
    next: usize,
    len: usize,
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RingBuffer<N> {
    pub fn new() -> Self {
        Self {
            samples: [0.0; N],
            next: 0,
            len: 0,
        }
    }

    pub fn append(&mut self, v: f64) {
        if N == 0 {
            return;
        }
        self.samples[self.next] = v;
        self.next = (self.next + 1) % N;
        self.len = (self.len + 1).min(N);
    }

    pub fn average(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        self.samples[..self.len].iter().sum::<f64>() / self.len as f64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn clear(&mut self) {
        self.next = 0;
        self.len = 0;
    }
}
