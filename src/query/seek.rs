//! Locating a starting offset for a query (spec.md section 4.5): a coarse
//! binary search across file-start timestamps, then an in-file scan driven
//! by the module's own `load`.

use crate::module::ModuleOps;
use crate::packet::Timestamp;

/// Picks the file whose recorded start timestamp is at or before
/// `target_secs`, from a list of per-file start timestamps sorted
/// ascending by file name (spec.md section 4.5 step 3, "binary search
/// across coarse file-name-derived timestamps").
pub fn file_containing(file_starts: &[u64], target_secs: u64) -> Option<usize> {
    if file_starts.is_empty() {
        return None;
    }
    match file_starts.binary_search(&target_secs) {
        Ok(i) => Some(i),
        Err(0) => Some(0),
        Err(i) => Some(i - 1),
    }
}

/// Steps forward through `buf` via `ops.load`, returning the byte offset of
/// the first record whose timestamp is at or past `target`. Returns `None`
/// both on reaching the end of `buf` and on a `load` failure (sync loss);
/// callers distinguish the two by checking whether they were already at
/// the buffer's end.
pub fn scan_to_timestamp(buf: &[u8], target: Timestamp, ops: &dyn ModuleOps) -> Option<usize> {
    let mut pos = 0;
    while pos < buf.len() {
        match ops.load(&buf[pos..]) {
            Some((size, ts)) if size > 0 => {
                if ts >= target {
                    return Some(pos);
                }
                pos += size;
            }
            _ => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_containing_picks_the_file_at_or_before_hint() {
        let starts = [0u64, 100, 200, 300];
        assert_eq!(file_containing(&starts, 0), Some(0));
        assert_eq!(file_containing(&starts, 150), Some(1));
        assert_eq!(file_containing(&starts, 300), Some(3));
        assert_eq!(file_containing(&starts, 999), Some(3));
    }

    #[test]
    fn file_containing_empty_list_is_none() {
        assert_eq!(file_containing(&[], 10), None);
    }
}
