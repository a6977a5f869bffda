//! Jenkins lookup3 hash
//!
//! Prepared-statement handles are a 32-bit non-cryptographic hash of the SQL
//! text, so every process transforming or applying the same SQL file computes
//! bit-identical handles. The applier prepares each handle once per session
//! and rebinds it on every subsequent EXECUTE.

/// Seed shared by every producer and consumer of statement handles
pub const STATEMENT_HASH_SEED: u32 = 5381;

#[inline]
fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(4);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(6);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(8);
    *b = b.wrapping_add(*a);
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(16);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(19);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(4);
    *b = b.wrapping_add(*a);
}

#[inline]
fn final_mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(14));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(11));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(25));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(16));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(4));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(14));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(24));
}

/// lookup3 `hashlittle` over a byte slice, reading the key one byte at a
/// time so the result does not depend on host alignment or endianness.
pub fn hash_bytes(data: &[u8], seed: u32) -> u32 {
    let mut a = 0xdead_beefu32
        .wrapping_add(data.len() as u32)
        .wrapping_add(seed);
    let mut b = a;
    let mut c = a;

    let mut k = data;
    while k.len() > 12 {
        a = a.wrapping_add(u32::from_le_bytes([k[0], k[1], k[2], k[3]]));
        b = b.wrapping_add(u32::from_le_bytes([k[4], k[5], k[6], k[7]]));
        c = c.wrapping_add(u32::from_le_bytes([k[8], k[9], k[10], k[11]]));
        mix(&mut a, &mut b, &mut c);
        k = &k[12..];
    }

    if k.is_empty() {
        return c;
    }

    // tail, at most 12 bytes
    for (i, &byte) in k.iter().enumerate() {
        let shifted = (byte as u32) << ((i % 4) * 8);
        match i / 4 {
            0 => a = a.wrapping_add(shifted),
            1 => b = b.wrapping_add(shifted),
            _ => c = c.wrapping_add(shifted),
        }
    }
    final_mix(&mut a, &mut b, &mut c);
    c
}

/// Render the handle for a SQL statement: 8 lowercase hex digits
pub fn statement_handle(sql: &str) -> String {
    format!("{:08x}", hash_bytes(sql.as_bytes(), STATEMENT_HASH_SEED))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_across_calls() {
        let sql = "INSERT INTO \"public\".\"t\" (id, x) overriding system value VALUES ($1, $2)";
        assert_eq!(statement_handle(sql), statement_handle(sql));
        assert_eq!(
            hash_bytes(sql.as_bytes(), STATEMENT_HASH_SEED),
            hash_bytes(sql.as_bytes(), STATEMENT_HASH_SEED)
        );
    }

    #[test]
    fn handle_is_eight_lowercase_hex_digits() {
        for sql in ["", "x", "SELECT 1", &"y".repeat(100)] {
            let handle = statement_handle(sql);
            assert_eq!(handle.len(), 8);
            assert!(handle.chars().all(|c| c.is_ascii_hexdigit()));
            assert_eq!(handle, handle.to_lowercase());
        }
    }

    #[test]
    fn distinct_statements_get_distinct_handles() {
        let a = statement_handle("DELETE FROM \"public\".\"t\" WHERE id = $1");
        let b = statement_handle("DELETE FROM \"public\".\"u\" WHERE id = $1");
        assert_ne!(a, b);
    }

    #[test]
    fn seed_changes_the_hash() {
        let data = b"TRUNCATE ONLY \"public\".\"t\"";
        assert_ne!(hash_bytes(data, 0), hash_bytes(data, STATEMENT_HASH_SEED));
    }

    #[test]
    fn block_boundaries() {
        // lengths around the 12-byte mixing block
        for len in [11usize, 12, 13, 24, 25] {
            let data = vec![0xa5u8; len];
            let h1 = hash_bytes(&data, STATEMENT_HASH_SEED);
            let h2 = hash_bytes(&data, STATEMENT_HASH_SEED);
            assert_eq!(h1, h2);
        }
    }
}
