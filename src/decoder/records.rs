//! Line scanner for EDIGEO record files.
//!
//! Every EDIGEO file (THF, SCD, GEO, QAL, VEC) is a sequence of lines of the
//! form:
//!
//! ```text
//! RTYSA03:PAR
//! ^^^      ^^^
//! tag      value
//!    ^^ nature + format chars
//!      ^^ declared value length
//! ```
//!
//! The scanner yields borrowed `(tag, value)` pairs — no allocation per
//! token. It tolerates CR/LF line endings, empty records, trailing
//! whitespace and lines whose length field is absent or wrong (the value is
//! taken up to the end of the line in that case). Unknown tags are yielded
//! as-is; filtering happens in the callers.
//!
//! On top of the scanner sits a block iterator: a block starts at an `RTY`
//! record (whose value names the block type: `PNO`, `PAR`, `PFE`, `FEA`,
//! `LNK`, `QUP`, …) and runs until the next `RTY`. The block identifier is
//! the value of its `RID` record.

/// One scanned record: a 3-letter tag and its raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub tag: &'a str,
    pub value: &'a str,
}

/// Lazily scans `input` into records.
pub fn scan(input: &str) -> impl Iterator<Item = Record<'_>> {
    input.lines().filter_map(|line| {
        let line = line.trim_end_matches(['\r', ' ', '\t']);
        if line.is_empty() {
            return None;
        }
        let colon = line.find(':')?;
        if colon < 3 {
            return None;
        }
        Some(Record {
            tag: &line[..3],
            value: &line[colon + 1..],
        })
    })
}

/// A contiguous run of records introduced by one `RTY` record.
#[derive(Debug)]
pub struct Block<'a> {
    /// Block type: the `RTY` value (`PNO`, `PAR`, `PFE`, `FEA`, `LNK`, …).
    pub kind: &'a str,
    /// Block identifier: the `RID` value, empty if the block has none.
    pub id: &'a str,
    /// Every record of the block except the leading `RTY`.
    pub records: Vec<Record<'a>>,
}

/// Groups the records of `input` into `RTY`-delimited blocks.
///
/// Records appearing before the first `RTY` (file headers) are dropped.
pub fn blocks(input: &str) -> Vec<Block<'_>> {
    let mut out: Vec<Block> = Vec::new();

    for record in scan(input) {
        if record.tag == "RTY" {
            out.push(Block {
                kind: record.value.trim(),
                id: "",
                records: Vec::new(),
            });
            continue;
        }
        let Some(block) = out.last_mut() else {
            continue;
        };
        if record.tag == "RID" && block.id.is_empty() {
            block.id = record.value.trim();
        } else {
            block.records.push(record);
        }
    }

    out
}

/// Parses an EDIGEO composite reference: `SID;GID;TYPE;ID`.
///
/// Only the last two components are meaningful downstream: the referenced
/// block type and its identifier.
pub fn parse_reference(value: &str) -> (String, String) {
    let mut parts = value.splitn(5, ';').skip(2);
    let rty = parts.next().unwrap_or("").trim().to_string();
    let rid = parts.next().unwrap_or("").trim().to_string();
    (rty, rid)
}

/// Parses a coordinate record value: `+X;+Y;` with an optional third
/// (elevation) component, which is ignored.
pub fn parse_coordinate(value: &str) -> Option<(f64, f64)> {
    let mut parts = value.split(';');
    let x = parse_number(parts.next()?)?;
    let y = parse_number(parts.next()?)?;
    Some((x, y))
}

/// Parses an EDIGEO numeric token. The format allows a leading `+` and a
/// trailing orphan decimal point (`+1895.`).
pub fn parse_number(raw: &str) -> Option<f64> {
    let v = raw.trim().trim_start_matches('+');
    if v.is_empty() {
        return None;
    }
    let v = v.strip_suffix('.').unwrap_or(v);
    v.parse::<f64>().ok()
}
