//! Block padding to hide exact packet sizes. PKCS#7-style: every pad byte holds the pad length.

/// Target block sizes, smallest first.
pub const BLOCK_SIZES: [usize; 4] = [256, 512, 1024, 2048];

/// Largest pad a single trailing length byte can describe.
const MAX_PAD: usize = 255;

/// Smallest block strictly larger than `len`, or `len` itself when none fits.
pub fn optimal_block_size(len: usize) -> usize {
    BLOCK_SIZES
        .iter()
        .copied()
        .find(|&b| b > len)
        .unwrap_or(len)
}

/// Pad `data` up to `target`. Returns the input unchanged when the gap is 0 or above 255.
pub fn pad(mut data: Vec<u8>, target: usize) -> Vec<u8> {
    let needed = target.saturating_sub(data.len());
    if needed == 0 || needed > MAX_PAD {
        return data;
    }
    data.resize(target, needed as u8);
    data
}

/// Strip padding. Input whose tail is not a well-formed pad is returned as-is.
pub fn unpad(data: &[u8]) -> &[u8] {
    let Some(&last) = data.last() else {
        return data;
    };
    let n = last as usize;
    if n == 0 || n > data.len() {
        return data;
    }
    let (body, tail) = data.split_at(data.len() - n);
    if tail.iter().all(|&b| b == last) {
        body
    } else {
        data
    }
}
