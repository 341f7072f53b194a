//! Read one named sheet out of an `.xlsx` label schema workbook.
//!
//! The workbook is a ZIP of SpreadsheetML parts. The sheet name is resolved
//! through `xl/workbook.xml` and its relationships part to the worksheet
//! entry, shared strings are loaded once, and cells are keyed by their `r`
//! reference. Cells are held sparsely, so a stray cell far from the data
//! costs one entry rather than a grid up to it.
//!
//! The first non-empty row is the header. Data rows whose cells are all
//! empty are dropped, as are columns that are empty in every row.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::Path;

use quick_xml::events::{BytesStart, Event};

use crate::error::CuratorError;

/// Maximum decompressed bytes to read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Maximum cells kept per sheet.
const MAX_CELLS_PER_SHEET: usize = 500_000;
/// Last column (`XFD`) and last row of a worksheet, zero-based.
const MAX_COLUMN: usize = 16_383;
const MAX_ROW: usize = 1_048_575;

/// Non-empty cells keyed by row, then column. Gaps cost nothing.
type SparseCells = BTreeMap<usize, BTreeMap<usize, String>>;

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

/// A parsed sheet: header names plus data rows of equal width.
#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Sheet {
    fn column_index(&self, header: &str) -> Result<usize, CuratorError> {
        self.headers
            .iter()
            .position(|h| h.trim() == header.trim())
            .ok_or_else(|| CuratorError::Sheet(format!("no column named '{}'", header)))
    }

    /// Values of two header-named columns, row by row.
    pub fn column_pairs(
        &self,
        left: &str,
        right: &str,
    ) -> Result<Vec<(String, String)>, CuratorError> {
        let l = self.column_index(left)?;
        let r = self.column_index(right)?;
        Ok(self
            .rows
            .iter()
            .map(|row| (row[l].clone(), row[r].clone()))
            .collect())
    }
}

pub fn read_sheet_file(path: &Path, sheet_name: &str) -> Result<Sheet, CuratorError> {
    let bytes = std::fs::read(path)
        .map_err(|e| CuratorError::Sheet(format!("{}: {}", path.display(), e)))?;
    read_sheet(&bytes, sheet_name)
}

pub fn read_sheet(bytes: &[u8], sheet_name: &str) -> Result<Sheet, CuratorError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(sheet_err)?;
    let entry = sheet_entry(&mut archive, sheet_name)?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let xml = read_zip_entry_bounded(&mut archive, &entry, MAX_XML_ENTRY_BYTES)?;
    let cells = read_cells(&xml, &shared_strings)?;
    Ok(tidy(cells))
}

fn sheet_err(e: impl std::fmt::Display) -> CuratorError {
    CuratorError::Sheet(e.to_string())
}

fn read_zip_entry_bounded(
    archive: &mut Archive<'_>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, CuratorError> {
    let entry = archive.by_name(name).map_err(sheet_err)?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(sheet_err)?;
    if out.len() as u64 >= max_bytes {
        return Err(CuratorError::Sheet(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

fn attr(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        (a.key.local_name().as_ref() == local)
            .then(|| a.unescape_value().ok().map(|v| v.into_owned()))
            .flatten()
    })
}

/// Map a sheet name to its worksheet entry path inside the archive.
fn sheet_entry(archive: &mut Archive<'_>, sheet_name: &str) -> Result<String, CuratorError> {
    let workbook = read_zip_entry_bounded(archive, "xl/workbook.xml", MAX_XML_ENTRY_BYTES)?;
    let mut available = Vec::new();
    let mut rel_id = None;
    let mut reader = quick_xml::Reader::from_reader(workbook.as_slice());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                let name = attr(&e, b"name").unwrap_or_default();
                if name == sheet_name {
                    rel_id = attr(&e, b"id");
                }
                available.push(name);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(sheet_err(e)),
            _ => {}
        }
        buf.clear();
    }

    let rel_id = rel_id.ok_or_else(|| {
        CuratorError::Sheet(format!(
            "no sheet named '{}' (available: {})",
            sheet_name,
            available.join(", ")
        ))
    })?;

    let rels = read_zip_entry_bounded(archive, "xl/_rels/workbook.xml.rels", MAX_XML_ENTRY_BYTES)?;
    let mut reader = quick_xml::Reader::from_reader(rels.as_slice());
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e))
                if e.local_name().as_ref() == b"Relationship"
                    && attr(&e, b"Id").as_deref() == Some(rel_id.as_str()) =>
            {
                let target = attr(&e, b"Target").unwrap_or_default();
                return Ok(match target.strip_prefix('/') {
                    Some(absolute) => absolute.to_string(),
                    None => format!("xl/{}", target),
                });
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(sheet_err(e)),
            _ => {}
        }
        buf.clear();
    }
    Err(CuratorError::Sheet(format!(
        "sheet '{}' has no worksheet part",
        sheet_name
    )))
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, CuratorError> {
    // Workbooks with only numeric cells carry no shared strings part.
    if archive.index_for_name("xl/sharedStrings.xml").is_none() {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().map_err(sheet_err)?);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.push(current.take().unwrap_or_default()),
                b"t" => in_t = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(sheet_err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Split a cell reference like `AB12` into zero-based (row, column).
///
/// Malformed references yield `None`; references past `XFD1048576` are
/// rejected.
fn parse_cell_ref(reference: &str) -> Result<Option<(usize, usize)>, CuratorError> {
    let Some(split) = reference.find(|c: char| c.is_ascii_digit()) else {
        return Ok(None);
    };
    let (letters, digits) = reference.split_at(split);
    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_uppercase()) {
        return Ok(None);
    }
    let out_of_range =
        || CuratorError::Sheet(format!("cell {} is outside the worksheet grid", reference));

    let mut col = 0usize;
    for c in letters.chars() {
        col = col
            .checked_mul(26)
            .and_then(|v| v.checked_add(c as usize - 'A' as usize + 1))
            .filter(|&v| v <= MAX_COLUMN + 1)
            .ok_or_else(out_of_range)?;
    }
    let Ok(row) = digits.parse::<usize>() else {
        return if digits.chars().all(|c| c.is_ascii_digit()) {
            Err(out_of_range())
        } else {
            Ok(None)
        };
    };
    match row.checked_sub(1) {
        None => Ok(None),
        Some(r) if r > MAX_ROW => Err(out_of_range()),
        Some(r) => Ok(Some((r, col - 1))),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum CellKind {
    Shared,
    Inline,
    Plain,
}

fn read_cells(xml: &[u8], shared_strings: &[String]) -> Result<SparseCells, CuratorError> {
    let mut cells = SparseCells::new();
    let mut count = 0usize;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut row_idx = 0usize;
    let mut next_col = 0usize;
    let mut pos = (0usize, 0usize);
    let mut kind = CellKind::Plain;
    let mut in_value = false;
    let mut value = String::new();

    loop {
        if count >= MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => {
                    if let Some(r) = attr(&e, b"r").and_then(|r| r.parse::<usize>().ok()) {
                        if r > MAX_ROW + 1 {
                            return Err(CuratorError::Sheet(format!(
                                "row {} is outside the worksheet grid",
                                r
                            )));
                        }
                        row_idx = r.saturating_sub(1);
                    }
                    next_col = 0;
                }
                b"c" => {
                    pos = attr(&e, b"r")
                        .map(|r| parse_cell_ref(&r))
                        .transpose()?
                        .flatten()
                        .unwrap_or((row_idx, next_col));
                    next_col = pos.1 + 1;
                    kind = match attr(&e, b"t").as_deref() {
                        Some("s") => CellKind::Shared,
                        Some("inlineStr") => CellKind::Inline,
                        _ => CellKind::Plain,
                    };
                    value.clear();
                }
                b"v" => in_value = true,
                b"t" if kind == CellKind::Inline => in_value = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"c" => {
                let p = attr(&e, b"r")
                    .map(|r| parse_cell_ref(&r))
                    .transpose()?
                    .flatten()
                    .unwrap_or((row_idx, next_col));
                next_col = p.1 + 1;
            }
            Ok(Event::Text(te)) if in_value => {
                value.push_str(&te.unescape().map_err(sheet_err)?);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let text = match kind {
                        CellKind::Shared => value
                            .trim()
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared_strings.get(i).cloned())
                            .unwrap_or_default(),
                        CellKind::Inline | CellKind::Plain => value.clone(),
                    };
                    if !text.trim().is_empty() {
                        let (r, c) = pos;
                        if cells.entry(r).or_default().insert(c, text.trim().to_string()).is_none() {
                            count += 1;
                        }
                    }
                }
                b"row" => row_idx += 1,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(sheet_err(e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(cells)
}

/// Dense rows over only the columns that hold a value somewhere.
fn tidy(cells: SparseCells) -> Sheet {
    let keep: Vec<usize> = cells
        .values()
        .flat_map(|row| row.keys().copied())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut rows: Vec<Vec<String>> = cells
        .into_values()
        .filter(|row| !row.is_empty())
        .map(|mut row| {
            keep.iter()
                .map(|c| row.remove(c).unwrap_or_default())
                .collect()
        })
        .collect();
    if rows.is_empty() {
        return Sheet {
            headers: Vec::new(),
            rows: Vec::new(),
        };
    }

    let headers = rows.remove(0);
    Sheet { headers, rows }
}
