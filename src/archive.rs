//! Archive reader: one `.tar.bz2` per cadastral sheet.
//!
//! An EDIGEO sheet travels as a bzip2-compressed tar whose members are
//! classified purely by filename extension (case-insensitive): one THF
//! descriptor, one SCD semantic schema, one GEO coordinate reference, one
//! QAL quality file and zero or more VEC vector files. Everything else
//! (DIC, GEN, …) is ignored. Decompression is streamed — the tar entries
//! are read once, in order, without landing on disk.

use std::io::Read;
use std::path::Path;

use bzip2::read::BzDecoder;
use tar::Archive;

use crate::error::DecodeError;

/// The role-tagged byte buffers of one sheet.
#[derive(Debug, Default)]
pub struct SheetBundle {
    /// Transfer descriptor (encoding, dates).
    pub thf: Vec<u8>,
    /// Semantic schema (object kinds, attribute descriptors).
    pub scd: Vec<u8>,
    /// Coordinate reference declaration.
    pub geo: Vec<u8>,
    /// Quality metadata; may legitimately be empty.
    pub qal: Vec<u8>,
    /// Vector files carrying primitives and feature objects.
    pub vec: Vec<Vec<u8>>,
}

/// Reads and classifies the members of a sheet archive.
///
/// # Errors
///
/// [`DecodeError::ArchiveIo`] if the file cannot be read or the tar stream
/// is corrupt; [`DecodeError::MissingMember`] if THF, SCD or GEO is absent.
/// A missing QAL is tolerated and a sheet without VEC members simply decodes
/// to an empty feature set.
pub fn read_sheet(path: &Path) -> Result<SheetBundle, DecodeError> {
    let file = std::fs::File::open(path)?;
    let mut tar = Archive::new(BzDecoder::new(file));

    let mut bundle = SheetBundle::default();
    let mut seen = (false, false, false);

    for entry in tar.entries()? {
        let mut entry = entry?;
        let member = entry.path()?.to_string_lossy().into_owned();
        let Some(ext) = member.rsplit('.').next() else {
            continue;
        };

        match ext.to_ascii_uppercase().as_str() {
            "THF" => {
                entry.read_to_end(&mut bundle.thf)?;
                seen.0 = true;
            }
            "SCD" => {
                entry.read_to_end(&mut bundle.scd)?;
                seen.1 = true;
            }
            "GEO" => {
                entry.read_to_end(&mut bundle.geo)?;
                seen.2 = true;
            }
            "QAL" => {
                entry.read_to_end(&mut bundle.qal)?;
            }
            "VEC" => {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                bundle.vec.push(buf);
            }
            _ => {}
        }
    }

    if !seen.0 {
        return Err(DecodeError::MissingMember("THF"));
    }
    if !seen.1 {
        return Err(DecodeError::MissingMember("SCD"));
    }
    if !seen.2 {
        return Err(DecodeError::MissingMember("GEO"));
    }

    Ok(bundle)
}
