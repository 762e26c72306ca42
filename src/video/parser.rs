//! Incremental H.264 Annex-B access-unit framing
//!
//! Input arrives as arbitrary byte ranges. NAL units are split on start
//! codes and grouped into access units using the boundary rules of
//! H.264 section 7.4.1.2.3: an AUD, SPS, PPS, SEI or reserved 14..=18 NAL
//! after a coded slice starts a new unit, as does a slice whose
//! `first_mb_in_slice` is zero.

use smallvec::SmallVec;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Bytes kept when no start code has been seen yet (a split start code)
const SYNC_TAIL: usize = 3;

/// NAL unit type from the header byte
pub fn nal_type(header: u8) -> u8 {
    header & 0x1f
}

fn is_vcl(kind: u8) -> bool {
    matches!(kind, 1 | 5)
}

/// Whether a NAL with this header begins a new access unit once a slice
/// has been seen; `None` while too few header bytes are known
fn starts_access_unit(header: &[u8]) -> Option<bool> {
    let kind = nal_type(*header.first()?);
    match kind {
        6..=9 | 14..=18 => Some(true),
        // first_mb_in_slice is ue(v); a leading 1 bit encodes zero
        1 | 5 => header.get(1).map(|b| b & 0x80 != 0),
        _ => Some(false),
    }
}

/// Splits an Annex-B byte stream into access units
#[derive(Debug, Default)]
pub struct AccessUnitParser {
    /// Unconsumed input, starting at a start code once synced
    pending: Vec<u8>,
    /// Offset in `pending` where the next start-code search resumes
    scan_from: usize,
    /// Access unit being assembled, NALs prefixed with 4-byte start codes
    current: Vec<u8>,
    current_has_slice: bool,
    nal_count: u64,
}

impl AccessUnitParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume bytes, returning every access unit completed by them
    pub fn push(&mut self, data: &[u8]) -> SmallVec<[Vec<u8>; 2]> {
        let mut units = SmallVec::new();
        self.pending.extend_from_slice(data);

        let Some(first) = find_start_code(&self.pending, 0) else {
            // Not synced; keep a possible partial start code only
            let keep = self.pending.len().min(SYNC_TAIL);
            self.pending.drain(..self.pending.len() - keep);
            self.scan_from = 0;
            return units;
        };
        if first.0 > 0 {
            self.pending.drain(..first.0);
            self.scan_from = 0;
        }

        let mut nal_start = find_start_code(&self.pending, 0).map_or(0, |(_, payload)| payload);
        let mut search = self.scan_from.max(nal_start);
        let mut consumed = 0;

        while let Some((code, payload)) = find_start_code(&self.pending, search) {
            let nal = trim_trailing_zeros(&self.pending[nal_start..code]);
            if !nal.is_empty() {
                let nal = nal.to_vec();
                self.accept(&nal, &mut units);
            }
            consumed = code;
            nal_start = payload;
            search = payload;
        }

        // Close the current unit as soon as the next NAL's header shows a boundary
        if self.current_has_slice
            && starts_access_unit(&self.pending[nal_start..]) == Some(true)
        {
            if let Some(unit) = self.take_current() {
                units.push(unit);
            }
        }

        if consumed > 0 {
            self.pending.drain(..consumed);
        }
        // Resume just before the end so a start code split across pushes is found
        self.scan_from = self.pending.len().saturating_sub(SYNC_TAIL);
        units
    }

    /// Complete the stream, emitting whatever remains
    pub fn flush(&mut self) -> SmallVec<[Vec<u8>; 2]> {
        let mut units = SmallVec::new();
        if let Some((_, payload)) = find_start_code(&self.pending, 0) {
            let nal = trim_trailing_zeros(&self.pending[payload..]).to_vec();
            if !nal.is_empty() {
                self.accept(&nal, &mut units);
            }
        }
        self.pending.clear();
        self.scan_from = 0;

        if let Some(unit) = self.take_current() {
            units.push(unit);
        }
        units
    }

    /// Discard all buffered input
    pub fn reset(&mut self) {
        self.pending.clear();
        self.scan_from = 0;
        self.current.clear();
        self.current_has_slice = false;
    }

    /// NAL units seen since creation
    pub fn nal_count(&self) -> u64 {
        self.nal_count
    }

    fn accept(&mut self, nal: &[u8], units: &mut SmallVec<[Vec<u8>; 2]>) {
        self.nal_count += 1;
        if self.current_has_slice && starts_access_unit(nal) == Some(true) {
            if let Some(unit) = self.take_current() {
                units.push(unit);
            }
        }
        self.current.extend_from_slice(&START_CODE);
        self.current.extend_from_slice(nal);
        if is_vcl(nal_type(nal[0])) {
            self.current_has_slice = true;
        }
    }

    fn take_current(&mut self) -> Option<Vec<u8>> {
        self.current_has_slice = false;
        if self.current.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.current))
        }
    }
}

/// Find `00 00 01` at or after `from`; returns (code offset, payload offset)
///
/// A preceding zero (4-byte start code) is left with the previous NAL and
/// trimmed from it as trailing zero bytes.
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    if data.len() < 3 || from > data.len() - 3 {
        return None;
    }
    data[from..]
        .windows(3)
        .position(|w| w == [0, 0, 1])
        .map(|i| (from + i, from + i + 3))
}

fn trim_trailing_zeros(nal: &[u8]) -> &[u8] {
    let end = nal.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &nal[..end]
}
