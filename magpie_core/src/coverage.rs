//! Coverage sets: offsets touched in each instrumented module, with the
//! set algebra the coordinator needs and a little-endian binary codec
//! used by both the checkpoint file and the server protocol.

use crate::codec::{read_u32, read_u64, write_u32, write_u64};
use crate::{HashMap, HashSet};
use std::io::{self, Read, Write};
use thiserror::Error;

/// One instrumented location in the target.
pub type Offset = u64;

const MAX_MODULES: u32 = 1 << 16;
const MAX_OFFSETS_PER_MODULE: u64 = 1 << 28;
const MAX_MODULE_NAME: u32 = 4096;

#[derive(Debug, Error)]
pub enum CoverageDecodeError {
    #[error("coverage data truncated or unreadable")]
    Io(#[from] io::Error),
    #[error("module name is not valid utf-8")]
    BadModuleName,
    #[error("unreasonable module count: {0}")]
    TooManyModules(u32),
    #[error("unreasonable offset count for module {0}: {1}")]
    TooManyOffsets(String, u64),
}

/// A set of coverage offsets, partitioned by module. Empty per-module
/// sets are never retained, so `is_empty` means "no offsets at all".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coverage {
    modules: HashMap<String, HashSet<Offset>>,
}

impl Coverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, module: &str, offset: Offset) {
        self.modules
            .entry(module.to_string())
            .or_default()
            .insert(offset);
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn num_offsets(&self) -> usize {
        self.modules.values().map(|s| s.len()).sum()
    }

    pub fn modules(&self) -> impl Iterator<Item = (&str, &HashSet<Offset>)> {
        self.modules.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn offsets(&self, module: &str) -> Option<&HashSet<Offset>> {
        self.modules.get(module)
    }

    /// Union `other` into `self`.
    pub fn merge(&mut self, other: &Coverage) {
        for (module, offsets) in other.modules.iter() {
            if offsets.is_empty() {
                continue;
            }
            self.modules
                .entry(module.clone())
                .or_default()
                .extend(offsets.iter().copied());
        }
    }

    /// Offsets present in both `self` and `other`.
    pub fn intersection(&self, other: &Coverage) -> Coverage {
        let mut out = Coverage::new();
        for (module, offsets) in self.modules.iter() {
            if let Some(theirs) = other.modules.get(module) {
                let common: HashSet<Offset> = offsets.intersection(theirs).copied().collect();
                if !common.is_empty() {
                    out.modules.insert(module.clone(), common);
                }
            }
        }
        out
    }

    /// Offsets present in `self` but not in `other`.
    pub fn difference(&self, other: &Coverage) -> Coverage {
        let mut out = Coverage::new();
        for (module, offsets) in self.modules.iter() {
            let remaining: HashSet<Offset> = match other.modules.get(module) {
                Some(theirs) => offsets.difference(theirs).copied().collect(),
                None => offsets.clone(),
            };
            if !remaining.is_empty() {
                out.modules.insert(module.clone(), remaining);
            }
        }
        out
    }

    /// True iff every offset of `other` is also in `self`.
    pub fn contains(&self, other: &Coverage) -> bool {
        for (module, offsets) in other.modules.iter() {
            match self.modules.get(module) {
                Some(ours) => {
                    if !offsets.is_subset(ours) {
                        return false;
                    }
                }
                None => {
                    if !offsets.is_empty() {
                        return false;
                    }
                }
            }
        }
        true
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u32(w, self.modules.len() as u32)?;
        for (module, offsets) in self.modules.iter() {
            write_u32(w, module.len() as u32)?;
            w.write_all(module.as_bytes())?;
            write_u64(w, offsets.len() as u64)?;
            for offset in offsets.iter() {
                write_u64(w, *offset)?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, CoverageDecodeError> {
        let num_modules = read_u32(r)?;
        if num_modules > MAX_MODULES {
            return Err(CoverageDecodeError::TooManyModules(num_modules));
        }
        let mut out = Coverage::new();
        for _ in 0..num_modules {
            let name_len = read_u32(r)?;
            if name_len > MAX_MODULE_NAME {
                return Err(CoverageDecodeError::BadModuleName);
            }
            let mut name = vec![0u8; name_len as usize];
            r.read_exact(&mut name)?;
            let name =
                String::from_utf8(name).map_err(|_| CoverageDecodeError::BadModuleName)?;
            let num_offsets = read_u64(r)?;
            if num_offsets > MAX_OFFSETS_PER_MODULE {
                return Err(CoverageDecodeError::TooManyOffsets(name, num_offsets));
            }
            let mut offsets = HashSet::with_capacity(num_offsets as usize);
            for _ in 0..num_offsets {
                offsets.insert(read_u64(r)?);
            }
            if !offsets.is_empty() {
                out.modules.insert(name, offsets);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn cov(pairs: &[(&str, &[u64])]) -> Coverage {
        let mut c = Coverage::new();
        for (module, offsets) in pairs {
            for offset in offsets.iter() {
                c.insert(module, *offset);
            }
        }
        c
    }

    #[test]
    fn merge_unions_offsets() {
        let mut a = cov(&[("t", &[1, 2])]);
        let b = cov(&[("t", &[2, 3]), ("u", &[7])]);
        a.merge(&b);
        assert_eq!(a, cov(&[("t", &[1, 2, 3]), ("u", &[7])]));
    }

    #[test]
    fn intersection_drops_empty_modules() {
        let a = cov(&[("t", &[1, 2]), ("u", &[5])]);
        let b = cov(&[("t", &[2, 3]), ("v", &[9])]);
        let i = a.intersection(&b);
        assert_eq!(i, cov(&[("t", &[2])]));
        assert!(i.offsets("u").is_none());
    }

    #[test]
    fn difference_is_left_minus_right() {
        let a = cov(&[("t", &[1, 2, 3])]);
        let b = cov(&[("t", &[2])]);
        assert_eq!(a.difference(&b), cov(&[("t", &[1, 3])]));
        assert!(b.difference(&a).is_empty());
    }

    #[test]
    fn contains_is_superset() {
        let a = cov(&[("t", &[1, 2, 3]), ("u", &[4])]);
        let b = cov(&[("t", &[1, 3])]);
        assert!(a.contains(&b));
        assert!(!b.contains(&a));
        assert!(a.contains(&Coverage::new()));
    }

    #[test]
    fn variable_is_total_minus_stable() {
        // offsets seen in at least one run but not all
        let total = cov(&[("t", &[1, 2, 3, 4])]);
        let stable = cov(&[("t", &[1, 2])]);
        assert_eq!(total.difference(&stable), cov(&[("t", &[3, 4])]));
    }

    #[test]
    fn codec_round_trip() {
        let c = cov(&[("target", &[0, 1, 0xdead_beef]), ("libm.so", &[42])]);
        let mut buf = Vec::new();
        c.write_to(&mut buf).unwrap();
        let back = Coverage::read_from(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(c, back);
    }

    #[test]
    fn decode_rejects_garbage_counts() {
        let mut buf = Vec::new();
        crate::codec::write_u32(&mut buf, u32::MAX).unwrap();
        assert!(matches!(
            Coverage::read_from(&mut Cursor::new(&buf)),
            Err(CoverageDecodeError::TooManyModules(_))
        ));
    }
}
