/// Rolling payload checksum: `h = ((h << 3) ^ (h >> 5)) ^ byte`, folded from 0.
pub fn checksum(bytes: &[u8]) -> u32 {
  bytes
    .iter()
    .fold(0u32, |h, &byte| ((h << 3) ^ (h >> 5)) ^ u32::from(byte))
}
