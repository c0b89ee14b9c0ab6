//! Byte-exact comparison and equality partitioning.
//!
//! No hashing anywhere: a whole-file compare is mandatory before any clone.
//! Reads go through `pread` so shared read-only handles keep their offsets.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

/// Compare two same-length files block by block.
///
/// A short read (concurrent truncate slipping past the lock) compares
/// unequal rather than erroring; the stability recheck exists to make that
/// impossible, this is the backstop.
pub fn contents_equal(a: &File, b: &File, len: u64, block: usize) -> io::Result<bool> {
    let mut buf_a = vec![0u8; block];
    let mut buf_b = vec![0u8; block];
    let mut offset: u64 = 0;

    while offset < len {
        let want = usize::try_from((len - offset).min(block as u64)).unwrap_or(block);
        let got_a = read_full_at(a, &mut buf_a[..want], offset)?;
        let got_b = read_full_at(b, &mut buf_b[..want], offset)?;
        if got_a != got_b || buf_a[..got_a] != buf_b[..got_b] {
            return Ok(false);
        }
        if got_a == 0 {
            return Ok(false);
        }
        offset += got_a as u64;
    }
    Ok(true)
}

/// `read_at` until the buffer is full or EOF.
fn read_full_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<usize> {
    let mut total = 0;
    while !buf.is_empty() {
        match file.read_at(buf, offset) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                offset += n as u64;
                buf = &mut buf[n..];
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Reduce a class to equality sub-classes.
///
/// Greedy partition by pairwise comparison: each item is compared against
/// the representative of every existing sub-class and joins the first match,
/// otherwise it seeds a new one. A candidate that mismatches the first
/// reference therefore still gets compared against later ones; mismatch
/// drops it from a pairing, never from the whole class. Input order is
/// preserved, so the first member of each sub-class is the canonical
/// reference.
pub fn partition_equal<T, E>(
    items: Vec<T>,
    mut eq: impl FnMut(&T, &T) -> Result<bool, E>,
) -> Result<Vec<Vec<T>>, E> {
    let mut groups: Vec<Vec<T>> = Vec::new();
    'outer: for item in items {
        for group in &mut groups {
            if eq(&group[0], &item)? {
                group.push(item);
                continue 'outer;
            }
        }
        groups.push(vec![item]);
    }
    Ok(groups)
}
