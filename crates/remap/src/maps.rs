//! Parsing of the process's own memory-map listing.
//!
//! Every line of `/proc/self/maps` describes one mapping:
//!
//! ```text
//! 7ac49c2000-7ac4a26000 r--p 00000000 fd:05 1245       /apex/com.android.runtime/bin/linker64
//! ```
//!
//! Fields are separated by runs of whitespace whose width varies between
//! kernels, so they are taken positionally after tokenizing.  The path is
//! everything after the inode and may itself contain spaces (`... (deleted)`).
//!
//! ## Line length
//!
//! Lines are read through a bounded buffer of [`MAX_LINE`] bytes.  A longer
//! line is not reassembled: its record is built from the first
//! `MAX_LINE - 1` bytes and the rest of the line is dropped, so a path living
//! under a very deep mount namespace comes back truncated.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::ops::BitOr;

use libc::c_int;
use log::debug;

/// Location of the self memory-map listing.
pub const SELF_MAPS: &str = "/proc/self/maps";

/// Size of the line buffer, including room for a terminator.
pub const MAX_LINE: usize = 512;

/// Access permissions of a mapping.
///
/// Only read/write/execute are modeled; the private/shared letter is kept
/// separately on [`MapRecord::shared`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Perms(u8);

impl Perms {
    pub const NONE: Perms = Perms(0);
    pub const READ: Perms = Perms(1);
    pub const WRITE: Perms = Perms(1 << 1);
    pub const EXEC: Perms = Perms(1 << 2);

    /// Decode a permission field such as `r-xp`.
    ///
    /// Each of `r`, `w` and `x` sets its bit when present anywhere in the
    /// field; a missing letter leaves the bit clear.
    pub fn parse(field: &str) -> Perms {
        let mut perms = Perms::NONE;
        if field.contains('r') {
            perms = perms | Perms::READ;
        }
        if field.contains('w') {
            perms = perms | Perms::WRITE;
        }
        if field.contains('x') {
            perms = perms | Perms::EXEC;
        }
        perms
    }

    pub fn contains(self, other: Perms) -> bool {
        self.0 & other.0 == other.0
    }

    /// The equivalent `PROT_*` flags for `mmap`/`mprotect`.
    pub fn to_prot(self) -> c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Perms::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Perms::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Perms::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

impl BitOr for Perms {
    type Output = Perms;

    fn bitor(self, rhs: Perms) -> Perms {
        Perms(self.0 | rhs.0)
    }
}

impl fmt::Display for Perms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |bit: Perms, c: char| if self.contains(bit) { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(Perms::READ, 'r'),
            flag(Perms::WRITE, 'w'),
            flag(Perms::EXEC, 'x')
        )
    }
}

impl fmt::Debug for Perms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Perms({})", self)
    }
}

/// One entry of the memory-map listing.
///
/// Records are snapshots: by the time one is used, another thread may have
/// mapped or unmapped the range.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MapRecord {
    /// First address of the half-open range `[start, end)`.
    pub start: usize,
    pub end: usize,
    /// Offset into the backing file.
    pub offset: u64,
    pub perms: Perms,
    /// `s` in the permission field rather than `p`.
    pub shared: bool,
    /// Device as reported, e.g. `fd:05`.
    pub device: String,
    /// Zero for anonymous mappings.
    pub inode: u64,
    /// Backing path, empty for anonymous mappings.
    pub path: String,
}

impl MapRecord {
    /// Parse a single listing line.
    ///
    /// Never fails: a field that is missing or does not parse keeps its
    /// default value, and whatever could be read is still returned.  A record
    /// with an empty path simply never matches a name filter.
    pub fn parse(line: &str) -> MapRecord {
        let mut record = MapRecord::default();
        let line = line.trim_end_matches(['\n', '\r']);

        let (range, rest) = next_field(line);
        if let Some((start, end)) = range.split_once('-') {
            record.start = usize::from_str_radix(start, 16).unwrap_or(0);
            record.end = usize::from_str_radix(end, 16).unwrap_or(0);
        }

        let (perms, rest) = next_field(rest);
        record.perms = Perms::parse(perms);
        record.shared = perms.contains('s');

        let (offset, rest) = next_field(rest);
        record.offset = u64::from_str_radix(offset, 16).unwrap_or(0);

        let (device, rest) = next_field(rest);
        record.device = device.to_string();

        let (inode, rest) = next_field(rest);
        record.inode = inode.parse().unwrap_or(0);

        record.path = rest.trim().to_string();
        record
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn is_anonymous(&self) -> bool {
        self.inode == 0
    }
}

/// Split off the next whitespace-delimited token.
fn next_field(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], &s[i..]),
        None => (s, ""),
    }
}

/// Take a fresh snapshot of the self memory-map listing.
///
/// If the listing cannot be opened the result is empty: callers read that as
/// "nothing mapped", not as an error.
pub fn read_maps() -> Vec<MapRecord> {
    match File::open(SELF_MAPS) {
        Ok(file) => read_maps_from(BufReader::new(file)),
        Err(err) => {
            debug!("cannot open {}: {}", SELF_MAPS, err);
            Vec::new()
        }
    }
}

/// Parse every line of a listing.  A read error ends the listing early.
pub fn read_maps_from<R: BufRead>(mut reader: R) -> Vec<MapRecord> {
    let mut records = Vec::new();
    let mut line = Vec::with_capacity(MAX_LINE);
    loop {
        match read_bounded_line(&mut reader, &mut line) {
            Ok(true) => records.push(MapRecord::parse(&String::from_utf8_lossy(&line))),
            Ok(false) => break,
            Err(err) => {
                debug!("maps listing ended early: {}", err);
                break;
            }
        }
    }
    records
}

/// Read at most `MAX_LINE - 1` bytes of the next line into `line`, dropping
/// whatever remains of an overlong line.  Returns `false` at end of input.
fn read_bounded_line<R: BufRead>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<bool> {
    line.clear();
    let n = reader
        .by_ref()
        .take((MAX_LINE - 1) as u64)
        .read_until(b'\n', line)?;
    if n == 0 {
        return Ok(false);
    }
    if line.last() != Some(&b'\n') {
        discard_rest_of_line(reader)?;
    }
    Ok(true)
}

fn discard_rest_of_line<R: BufRead>(reader: &mut R) -> io::Result<()> {
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(());
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(i) => {
                reader.consume(i + 1);
                return Ok(());
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }
}

/// Every record of a fresh listing whose path contains `name`.
///
/// An empty `name` matches every record; callers should pass the last path
/// component of the module they are looking for.
pub fn find(name: &str) -> Vec<MapRecord> {
    find_in(read_maps(), name)
}

/// Filter `records` down to those whose path contains `name`, keeping the
/// listing order.
pub fn find_in<I>(records: I, name: &str) -> Vec<MapRecord>
where
    I: IntoIterator<Item = MapRecord>,
{
    records
        .into_iter()
        .filter(|record| record.path.contains(name))
        .collect()
}

/// The mapping that currently contains `addr`, if any.
pub fn find_containing(addr: usize) -> Option<MapRecord> {
    read_maps().into_iter().find(|record| record.contains(addr))
}
