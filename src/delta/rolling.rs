/// Adler-32 style weak checksum over a sliding window.
///
/// Two 16-bit sums (a, b) packed into a u32; sliding by one byte is O(1).
const MOD_ADLER: u32 = 65521;

#[derive(Debug, Clone, Copy)]
pub struct WeakChecksum {
    a: u32,
    b: u32,
    window: u32,
}

impl WeakChecksum {
    /// Checksum of `block`; the window size is the block length.
    pub fn over(block: &[u8]) -> Self {
        // Sum in u64 and reduce once at the end.
        let mut a: u64 = 1;
        let mut b: u64 = 0;
        for &byte in block {
            a += byte as u64;
            b += a;
        }
        Self {
            a: (a % MOD_ADLER as u64) as u32,
            b: (b % MOD_ADLER as u64) as u32,
            window: block.len() as u32,
        }
    }

    /// Slide the window one byte: drop `outgoing` from the front, append `incoming`.
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        let out = outgoing as u32;
        let inc = incoming as u32;

        self.a = (self.a + MOD_ADLER - out + inc) % MOD_ADLER;
        self.b = (self.b + MOD_ADLER - 1 + self.a - (out * self.window) % MOD_ADLER) % MOD_ADLER;
    }

    pub fn value(&self) -> u32 {
        (self.b << 16) | self.a
    }
}
