use smallvec::SmallVec;

/// Byte buffer that stays on the stack for short keys.
pub type SmallBuff = SmallVec<[u8; 64]>;

pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(a, b)| a == b).count()
}

pub fn concat(prefix: &[u8], rest: &[u8]) -> SmallBuff {
    let mut out = SmallBuff::with_capacity(prefix.len() + rest.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(rest);
    out
}
